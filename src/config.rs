use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_ANATOMESHR_URL: &str = "https://anatomeshr.serve.scilifelab.se/app/anatomeshr";

/// Runtime configuration, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    /// gmsh executable
    pub gmsh_path: String,
    /// Program and arguments of the BVP solver script
    pub solver_command: Vec<String>,
    /// Program and arguments of the mesh rasterizer
    pub preview_command: Vec<String>,
    /// Geometry used when a session never uploaded one
    pub default_geometry: PathBuf,
    /// Parent directory of all session workspaces
    pub work_root: PathBuf,
    pub mesh_timeout: Option<Duration>,
    pub preview_timeout: Option<Duration>,
    pub solver_timeout: Option<Duration>,
    /// Idle sessions older than this are dropped with their workspace
    pub session_ttl: Option<Duration>,
    pub anatomeshr_url: String,
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        let gmsh_path = std::env::var("GMSH_PATH").unwrap_or_else(|_| {
            // Prefer a repo-local gmsh binary if present
            if Path::new("./bin/gmsh").exists() {
                "./bin/gmsh".to_string()
            } else {
                "gmsh".to_string()
            }
        });

        // Subprocesses run from the session workspace, so relative paths would break.
        let gmsh_path = absolutize(&gmsh_path);

        let default_geometry = std::env::var("TURGOLAB_DEFAULT_GEOMETRY")
            .unwrap_or_else(|_| "./geometry.geo".to_string());

        Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8085),
            gmsh_path,
            solver_command: command_from_env("TURGOLAB_SOLVER_CMD", "python3 turgor.py"),
            preview_command: command_from_env("TURGOLAB_PREVIEW_CMD", "python3 plot_mesh.py"),
            default_geometry: PathBuf::from(absolutize(&default_geometry)),
            work_root: std::env::var("TURGOLAB_WORK_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| std::env::temp_dir().join("turgolab_work")),
            mesh_timeout: timeout_from_env("TURGOLAB_MESH_TIMEOUT_SECS", Some(600)),
            preview_timeout: timeout_from_env("TURGOLAB_PREVIEW_TIMEOUT_SECS", Some(300)),
            solver_timeout: timeout_from_env("TURGOLAB_SOLVER_TIMEOUT_SECS", None),
            session_ttl: timeout_from_env("TURGOLAB_SESSION_TTL_SECS", Some(24 * 60 * 60)),
            anatomeshr_url: std::env::var("ANATOMESHR_URL")
                .unwrap_or_else(|_| DEFAULT_ANATOMESHR_URL.to_string()),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn absolutize(path: &str) -> String {
    std::fs::canonicalize(path)
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_else(|_| path.to_string())
}

fn command_from_env(var: &str, default: &str) -> Vec<String> {
    let raw = std::env::var(var).unwrap_or_else(|_| default.to_string());
    parse_command(&raw).unwrap_or_else(|| {
        tracing::warn!("{} has unbalanced quotes, using {:?}", var, default);
        parse_command(default).unwrap_or_default()
    })
}

/// Splits a command line with shell quoting rules. Relative words naming an
/// existing file are resolved against the current directory so they still
/// work from inside a workspace; options and absolute paths pass through.
pub fn parse_command(raw: &str) -> Option<Vec<String>> {
    let words = shlex::split(raw)?;
    Some(
        words
            .into_iter()
            .map(|word| {
                let path = Path::new(&word);
                if !word.starts_with('-') && path.is_relative() && path.is_file() {
                    absolutize(&word)
                } else {
                    word
                }
            })
            .collect(),
    )
}

/// `0` or an unparsable value disables the limit.
fn timeout_from_env(var: &str, default_secs: Option<u64>) -> Option<Duration> {
    match std::env::var(var) {
        Ok(v) => v
            .parse::<u64>()
            .ok()
            .filter(|&secs| secs > 0)
            .map(Duration::from_secs),
        Err(_) => default_secs.map(Duration::from_secs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_command_keeps_bare_program_names() {
        let cmd = parse_command("python3   -u").unwrap();
        assert_eq!(cmd, vec!["python3".to_string(), "-u".to_string()]);
    }

    #[test]
    fn parse_command_keeps_quoted_paths_with_spaces() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("my solver.sh");
        std::fs::write(&script, "exit 0\n").unwrap();

        let cmd = parse_command(&format!("sh '{}' --out=/tmp/x", script.display())).unwrap();
        assert_eq!(cmd.len(), 3);
        assert_eq!(Path::new(&cmd[1]), script.as_path());
        assert_eq!(cmd[2], "--out=/tmp/x");
    }

    #[test]
    fn parse_command_resolves_relative_files_only() {
        // Cargo runs unit tests from the package root
        let cmd = parse_command("cat Cargo.toml src no/such/file").unwrap();
        assert!(Path::new(&cmd[1]).is_absolute());
        assert!(cmd[1].ends_with("Cargo.toml"));
        assert_eq!(cmd[2], "src");
        assert_eq!(cmd[3], "no/such/file");
    }

    #[test]
    fn parse_command_rejects_unbalanced_quotes() {
        assert!(parse_command("python3 'turgor.py").is_none());
    }
}
