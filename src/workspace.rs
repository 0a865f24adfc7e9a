use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use uuid::Uuid;

pub const PARAMS_FILE: &str = "params.csv";
pub const MESH_FILE: &str = "geometry.msh";
pub const MESH_PREVIEW_FILE: &str = "mesh_preview.png";
pub const FIELD_FILE: &str = "turgor.xdmf";
pub const COMPANION_FILE: &str = "turgor.h5";
pub const PLOT_FILE: &str = "plot.png";
pub const ARCHIVE_FILE: &str = "turgor_output.zip";

/// Run-scoped working directory. External tools run with this directory as
/// their cwd, so their fixed file names never collide across sessions. The
/// directory is removed when the workspace is dropped.
#[derive(Debug)]
pub struct RunWorkspace {
    id: Uuid,
    dir: TempDir,
}

impl RunWorkspace {
    pub fn create(root: &Path) -> Result<Self, WorkspaceError> {
        fs::create_dir_all(root).map_err(|e| {
            WorkspaceError::IoError(format!("Failed to create work root {:?}: {}", root, e))
        })?;

        let id = Uuid::new_v4();
        let dir = tempfile::Builder::new()
            .prefix(&format!("turgolab_{}_", id.simple()))
            .tempdir_in(root)
            .map_err(|e| WorkspaceError::IoError(format!("Failed to create workspace: {}", e)))?;

        tracing::info!("Created workspace {} at {:?}", id, dir.path());
        Ok(Self { id, dir })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn params_path(&self) -> PathBuf {
        self.file(PARAMS_FILE)
    }

    pub fn mesh_path(&self) -> PathBuf {
        self.file(MESH_FILE)
    }

    pub fn mesh_preview_path(&self) -> PathBuf {
        self.file(MESH_PREVIEW_FILE)
    }

    pub fn field_path(&self) -> PathBuf {
        self.file(FIELD_FILE)
    }

    pub fn companion_path(&self) -> PathBuf {
        self.file(COMPANION_FILE)
    }

    pub fn plot_path(&self) -> PathBuf {
        self.file(PLOT_FILE)
    }

    pub fn archive_path(&self) -> PathBuf {
        self.file(ARCHIVE_FILE)
    }

    /// Removes mesh artifacts from earlier runs so a failed generation cannot
    /// leave a stale mesh behind.
    pub fn clear_mesh_outputs(&self) -> Result<(), WorkspaceError> {
        remove_if_exists(&self.mesh_path())?;
        remove_if_exists(&self.mesh_preview_path())
    }

    pub fn clear_preview(&self) -> Result<(), WorkspaceError> {
        remove_if_exists(&self.mesh_preview_path())
    }

    /// Removes solver outputs and the previous archive before a new solve.
    pub fn clear_solver_outputs(&self) -> Result<(), WorkspaceError> {
        for path in [
            self.field_path(),
            self.companion_path(),
            self.plot_path(),
            self.archive_path(),
        ] {
            remove_if_exists(&path)?;
        }
        Ok(())
    }
}

fn remove_if_exists(path: &Path) -> Result<(), WorkspaceError> {
    match fs::remove_file(path) {
        Ok(()) => {
            tracing::debug!("Removed stale artifact {:?}", path);
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(WorkspaceError::IoError(format!(
            "Failed to remove {:?}: {}",
            path, e
        ))),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("IO error: {0}")]
    IoError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspaces_are_isolated_and_removed_on_drop() {
        let root = tempfile::tempdir().unwrap();
        let a = RunWorkspace::create(root.path()).unwrap();
        let b = RunWorkspace::create(root.path()).unwrap();

        assert_ne!(a.id(), b.id());
        assert_ne!(a.path(), b.path());
        assert!(a.mesh_path().starts_with(a.path()));

        let a_path = a.path().to_path_buf();
        drop(a);
        assert!(!a_path.exists());
        assert!(b.path().exists());
    }

    #[test]
    fn clearing_solver_outputs_leaves_inputs() {
        let root = tempfile::tempdir().unwrap();
        let ws = RunWorkspace::create(root.path()).unwrap();
        for path in [
            ws.params_path(),
            ws.mesh_path(),
            ws.field_path(),
            ws.companion_path(),
            ws.plot_path(),
            ws.archive_path(),
        ] {
            fs::write(path, b"x").unwrap();
        }

        ws.clear_solver_outputs().unwrap();

        assert!(ws.params_path().exists());
        assert!(ws.mesh_path().exists());
        assert!(!ws.field_path().exists());
        assert!(!ws.companion_path().exists());
        assert!(!ws.plot_path().exists());
        assert!(!ws.archive_path().exists());

        // nothing left to remove is not an error
        ws.clear_solver_outputs().unwrap();
    }

    #[test]
    fn clearing_mesh_outputs_removes_mesh_and_preview() {
        let root = tempfile::tempdir().unwrap();
        let ws = RunWorkspace::create(root.path()).unwrap();
        fs::write(ws.mesh_path(), b"$MeshFormat").unwrap();
        fs::write(ws.mesh_preview_path(), b"png").unwrap();

        ws.clear_mesh_outputs().unwrap();
        assert!(!ws.mesh_path().exists());
        assert!(!ws.mesh_preview_path().exists());
    }
}
