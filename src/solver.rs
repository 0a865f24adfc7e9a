use std::path::PathBuf;
use std::time::Duration;

use crate::archive::{package_results, ArchiveError};
use crate::task::{CancelHandle, LogBuffer, ProcessTask, TaskError, TaskOutcome};
use crate::workspace::RunWorkspace;

/// Launches the external hyperelastic BVP solver inside a session workspace.
///
/// The solver reads `params.csv` and `geometry.msh` from its working
/// directory and writes `turgor.xdmf`, optionally `turgor.h5`, and a
/// `plot.png` preview. The same paths are also exported as environment
/// variables so a solver does not have to rely on its cwd.
pub struct SolverRunner {
    command: Vec<String>,
    timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct SolveReport {
    pub outcome: TaskOutcome,
    /// Rendered preview, only when the run succeeded and produced one
    pub plot: Option<PathBuf>,
    pub archive: Option<PathBuf>,
}

impl SolverRunner {
    pub fn new(command: Vec<String>, timeout: Option<Duration>) -> Self {
        Self { command, timeout }
    }

    /// Runs the solver to completion. Output lines are appended to `log` as
    /// they arrive; packaging only starts after the process has exited.
    pub async fn run(
        &self,
        workspace: &RunWorkspace,
        log: &LogBuffer,
        cancel: &CancelHandle,
    ) -> Result<SolveReport, SolverError> {
        workspace
            .clear_solver_outputs()
            .map_err(|e| SolverError::IoError(e.to_string()))?;

        let task = ProcessTask::from_command_line("solver", &self.command)?
            .current_dir(workspace.path())
            .env("PYVISTA_OFF_SCREEN", "true")
            .env("DISPLAY", "")
            .env("TURGOLAB_PARAMS", workspace.params_path().to_string_lossy())
            .env("TURGOLAB_MESH", workspace.mesh_path().to_string_lossy())
            .env("TURGOLAB_OUTPUT_DIR", workspace.path().to_string_lossy())
            .timeout(self.timeout);

        tracing::info!("Starting solver in workspace {}", workspace.id());
        let outcome = task.run(log, cancel).await;

        if !outcome.succeeded() {
            tracing::error!(
                "Solver did not succeed ({:?}, exit code {:?})",
                outcome.state,
                outcome.exit_code
            );
            return Ok(SolveReport {
                outcome,
                plot: None,
                archive: None,
            });
        }

        let plot_path = workspace.plot_path();
        let plot = plot_path.is_file().then_some(plot_path);
        if plot.is_none() {
            tracing::info!("Solver produced no plot image");
        }

        let archive = package_results(
            &workspace.field_path(),
            &workspace.companion_path(),
            &workspace.archive_path(),
        )?;

        Ok(SolveReport {
            outcome,
            plot,
            archive: Some(archive),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SolverError {
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Packaging failed: {0}")]
    Packaging(#[from] ArchiveError),
    #[error(transparent)]
    Task(#[from] TaskError),
}
