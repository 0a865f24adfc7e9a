use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::validate_scale;
use crate::task::{CancelHandle, LogBuffer, ProcessTask, TaskError, TaskOutcome};
use crate::workspace::RunWorkspace;

/// gmsh wrapper producing a 2D mesh in the legacy MSH 2 format.
pub struct MeshGenerator {
    /// gmsh program, optionally preceded by an interpreter
    command: Vec<String>,
    timeout: Option<Duration>,
}

impl MeshGenerator {
    pub fn new(command: Vec<String>, timeout: Option<Duration>) -> Self {
        Self { command, timeout }
    }

    /// `gmsh <geo> -2 -format msh2 -clscale <scale> -o <mesh>`
    pub fn gmsh_args(geometry: &Path, scale: f64, output: &Path) -> Vec<String> {
        vec![
            geometry.to_string_lossy().to_string(),
            "-2".to_string(),
            "-format".to_string(),
            "msh2".to_string(),
            "-clscale".to_string(),
            scale.to_string(),
            "-o".to_string(),
            output.to_string_lossy().to_string(),
        ]
    }

    /// Meshes `geometry` into the workspace mesh file. A returned outcome that
    /// did not succeed carries gmsh's captured output.
    pub async fn generate(
        &self,
        workspace: &RunWorkspace,
        geometry: &Path,
        scale: f64,
        cancel: &CancelHandle,
    ) -> Result<TaskOutcome, MeshError> {
        validate_scale(scale).map_err(MeshError::ValidationError)?;
        if !geometry.is_file() {
            return Err(MeshError::GeometryNotFound(geometry.to_path_buf()));
        }

        workspace
            .clear_mesh_outputs()
            .map_err(|e| MeshError::IoError(e.to_string()))?;

        let mesh_path = workspace.mesh_path();
        tracing::info!(
            "Generating mesh from {:?} (scale {}) into {:?}",
            geometry,
            scale,
            mesh_path
        );

        let task = ProcessTask::from_command_line("gmsh", &self.command)?
            .args(Self::gmsh_args(geometry, scale, &mesh_path))
            .current_dir(workspace.path())
            .timeout(self.timeout);
        let log = LogBuffer::new();
        let outcome = task.run(&log, cancel).await;

        if outcome.succeeded() && !mesh_path.is_file() {
            tracing::error!("gmsh exited cleanly but wrote no mesh at {:?}", mesh_path);
            return Err(MeshError::MissingOutput(mesh_path));
        }
        Ok(outcome)
    }
}

/// Runs the rasterizer script that renders the workspace mesh to a PNG.
pub struct MeshPreviewer {
    command: Vec<String>,
    timeout: Option<Duration>,
}

impl MeshPreviewer {
    pub fn new(command: Vec<String>, timeout: Option<Duration>) -> Self {
        Self { command, timeout }
    }

    pub async fn render(
        &self,
        workspace: &RunWorkspace,
        cancel: &CancelHandle,
    ) -> Result<(TaskOutcome, Option<PathBuf>), MeshError> {
        let mesh_path = workspace.mesh_path();
        if !mesh_path.is_file() {
            return Err(MeshError::MeshNotReady);
        }

        workspace
            .clear_preview()
            .map_err(|e| MeshError::IoError(e.to_string()))?;

        let task = ProcessTask::from_command_line("mesh-preview", &self.command)?
            .current_dir(workspace.path())
            .env("PYVISTA_OFF_SCREEN", "true")
            .env("DISPLAY", "")
            .timeout(self.timeout);
        let log = LogBuffer::new();
        let outcome = task.run(&log, cancel).await;

        let preview = workspace.mesh_preview_path();
        let image = (outcome.succeeded() && preview.is_file()).then_some(preview);
        if outcome.succeeded() && image.is_none() {
            tracing::warn!("Preview script succeeded but produced no image");
        }
        Ok((outcome, image))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Geometry file not found: {0:?}")]
    GeometryNotFound(PathBuf),
    #[error("No mesh has been generated yet")]
    MeshNotReady,
    #[error("Mesh generator reported success but wrote no file at {0:?}")]
    MissingOutput(PathBuf),
    #[error("IO error: {0}")]
    IoError(String),
    #[error(transparent)]
    Task(#[from] TaskError),
}
