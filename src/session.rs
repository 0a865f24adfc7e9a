use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::models::ViewState;
use crate::params::ParameterStore;
use crate::solver::SolverRunner;
use crate::task::{CancelHandle, LogBuffer, TaskState};
use crate::workspace::{RunWorkspace, WorkspaceError};

/// Final or in-progress status of a solve job.
#[derive(Debug, Clone)]
pub struct JobStatus {
    pub state: TaskState,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
    pub plot: Option<PathBuf>,
    pub archive: Option<PathBuf>,
}

impl JobStatus {
    fn pending() -> Self {
        Self {
            state: TaskState::Pending,
            exit_code: None,
            error_message: None,
            plot: None,
            archive: None,
        }
    }
}

/// A solver run owned by one session.
pub struct SolveJob {
    id: Uuid,
    status: Arc<StdMutex<JobStatus>>,
    log: LogBuffer,
    cancel: CancelHandle,
}

impl SolveJob {
    /// Starts the solver on the runtime and returns immediately.
    pub fn spawn(runner: Arc<SolverRunner>, workspace: Arc<RunWorkspace>) -> Self {
        let job = Self {
            id: Uuid::new_v4(),
            status: Arc::new(StdMutex::new(JobStatus::pending())),
            log: LogBuffer::new(),
            cancel: CancelHandle::new(),
        };

        let status = job.status.clone();
        let log = job.log.clone();
        let cancel = job.cancel.clone();
        let job_id = job.id;

        update(&status, |s| s.state = TaskState::Running);
        tokio::spawn(async move {
            let result = runner.run(&workspace, &log, &cancel).await;
            update(&status, |s| match result {
                Ok(report) => {
                    s.state = report.outcome.state;
                    s.exit_code = report.outcome.exit_code;
                    s.plot = report.plot;
                    s.archive = report.archive;
                    if !report.outcome.succeeded() {
                        s.error_message = Some(match report.outcome.state {
                            TaskState::TimedOut => "Simulation timed out".to_string(),
                            TaskState::Cancelled => "Simulation cancelled".to_string(),
                            _ => "Simulation failed with errors. See output above.".to_string(),
                        });
                    }
                }
                Err(e) => {
                    tracing::error!("Solve job {} failed: {}", job_id, e);
                    s.state = TaskState::Failed;
                    s.error_message = Some(e.to_string());
                }
            });
            tracing::info!("Solve job {} finished", job_id);
        });

        job
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn status(&self) -> JobStatus {
        self.status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn log(&self) -> &LogBuffer {
        &self.log
    }

    pub fn is_active(&self) -> bool {
        !self.status().state.is_finished()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

fn update(status: &StdMutex<JobStatus>, f: impl FnOnce(&mut JobStatus)) {
    let mut guard = status
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    f(&mut guard);
}

/// Mesh generation or preview running outside the session lock.
struct ActiveStep {
    name: &'static str,
    cancel: CancelHandle,
    done: Arc<AtomicBool>,
}

/// Held by the request running a step; the step counts as finished once
/// this is dropped, even if the request is abandoned.
pub struct StepGuard {
    cancel: CancelHandle,
    done: Arc<AtomicBool>,
}

impl StepGuard {
    pub fn cancel_handle(&self) -> &CancelHandle {
        &self.cancel
    }
}

impl Drop for StepGuard {
    fn drop(&mut self) {
        self.done.store(true, Ordering::SeqCst);
    }
}

/// One user's run: workspace, inputs, view state and the current solve.
pub struct Session {
    id: Uuid,
    created_at: DateTime<Utc>,
    workspace: Arc<RunWorkspace>,
    geometry: Option<PathBuf>,
    pub view: ViewState,
    solve: Option<SolveJob>,
    step: Option<ActiveStep>,
}

impl Session {
    pub fn new(workspace: RunWorkspace) -> Self {
        Self {
            id: workspace.id(),
            created_at: Utc::now(),
            workspace: Arc::new(workspace),
            geometry: None,
            view: ViewState::default(),
            solve: None,
            step: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn workspace(&self) -> &Arc<RunWorkspace> {
        &self.workspace
    }

    pub fn parameter_store(&self) -> ParameterStore {
        ParameterStore::new(self.workspace.params_path())
    }

    /// Uploaded geometry, or `default` when none was uploaded.
    pub fn geometry_or<'a>(&'a self, default: &'a Path) -> &'a Path {
        self.geometry.as_deref().unwrap_or(default)
    }

    pub fn set_geometry(&mut self, path: Option<PathBuf>) {
        self.view.geometry = path
            .as_ref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().to_string());
        self.geometry = path;
    }

    pub fn solve(&self) -> Option<&SolveJob> {
        self.solve.as_ref()
    }

    pub fn is_solving(&self) -> bool {
        self.solve.as_ref().is_some_and(SolveJob::is_active)
    }

    /// Name of the mesh step currently running, if any.
    pub fn active_step(&self) -> Option<&'static str> {
        self.step
            .as_ref()
            .filter(|step| !step.done.load(Ordering::SeqCst))
            .map(|step| step.name)
    }

    pub fn is_busy(&self) -> bool {
        self.is_solving() || self.active_step().is_some()
    }

    /// Fails while the solver is reading the workspace inputs.
    pub fn ensure_inputs_writable(&self) -> Result<(), SessionError> {
        if self.is_solving() {
            return Err(SessionError::SolveInProgress(self.id));
        }
        Ok(())
    }

    /// Marks a mesh step as running. Only one step runs at a time, and
    /// `mesh` additionally waits for the solver to finish with the mesh file.
    pub fn begin_step(&mut self, name: &'static str) -> Result<StepGuard, SessionError> {
        if let Some(running) = self.active_step() {
            return Err(SessionError::StepInProgress(self.id, running));
        }
        if name == "mesh" {
            self.ensure_inputs_writable()?;
        }
        let guard = StepGuard {
            cancel: CancelHandle::new(),
            done: Arc::new(AtomicBool::new(false)),
        };
        self.step = Some(ActiveStep {
            name,
            cancel: guard.cancel.clone(),
            done: guard.done.clone(),
        });
        Ok(guard)
    }

    /// Cancels the running mesh step. Returns false when nothing was running.
    pub fn cancel_step(&self) -> bool {
        match &self.step {
            Some(step) if !step.done.load(Ordering::SeqCst) => {
                step.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Starts a solve unless one is still running or the mesh is being rebuilt.
    pub fn start_solve(&mut self, runner: Arc<SolverRunner>) -> Result<&SolveJob, SessionError> {
        if self.is_solving() {
            return Err(SessionError::SolveInProgress(self.id));
        }
        if let Some(running) = self.active_step() {
            return Err(SessionError::StepInProgress(self.id, running));
        }
        self.view.plot_displayed = false;
        self.view.result_available = false;
        let job = SolveJob::spawn(runner, self.workspace.clone());
        tracing::info!("Session {} started solve job {}", self.id, job.id());
        Ok(&*self.solve.insert(job))
    }

    /// Folds the solve job's outcome into the view state.
    pub fn sync_view(&mut self) {
        if let Some(job) = &self.solve {
            let status = job.status();
            if status.state.is_finished() {
                self.view.result_available = status.archive.is_some();
                if status.plot.is_some() {
                    self.view.plot_displayed = true;
                }
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(job) = &self.solve {
            job.cancel();
        }
        self.cancel_step();
    }
}

struct SessionEntry {
    session: Arc<Mutex<Session>>,
    last_seen: StdMutex<Instant>,
}

impl SessionEntry {
    fn touch(&self) {
        *self
            .last_seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .elapsed()
    }
}

/// All live sessions, keyed by id. Sessions idle for longer than the TTL
/// are dropped, together with their workspace, when new ones are created.
#[derive(Clone)]
pub struct SessionStore {
    root: PathBuf,
    ttl: Option<Duration>,
    sessions: Arc<RwLock<HashMap<Uuid, SessionEntry>>>,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>, ttl: Option<Duration>) -> Self {
        Self {
            root: root.into(),
            ttl,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn create(&self) -> Result<Arc<Mutex<Session>>, SessionError> {
        if let Some(ttl) = self.ttl {
            self.evict_idle(ttl).await;
        }
        let workspace = RunWorkspace::create(&self.root)?;
        let session = Session::new(workspace);
        let id = session.id();
        let handle = Arc::new(Mutex::new(session));
        let entry = SessionEntry {
            session: handle.clone(),
            last_seen: StdMutex::new(Instant::now()),
        };
        self.sessions.write().await.insert(id, entry);
        Ok(handle)
    }

    pub async fn get(&self, id: Uuid) -> Result<Arc<Mutex<Session>>, SessionError> {
        let sessions = self.sessions.read().await;
        let entry = sessions.get(&id).ok_or(SessionError::NotFound(id))?;
        entry.touch();
        Ok(entry.session.clone())
    }

    /// Drops sessions not accessed for `max_idle`, skipping any that are in
    /// use or still running a step or solve. Returns how many were dropped.
    pub async fn evict_idle(&self, max_idle: Duration) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|id, entry| {
            if entry.idle_for() < max_idle {
                return true;
            }
            let keep = match entry.session.try_lock() {
                Ok(session) => session.is_busy(),
                Err(_) => true,
            };
            if !keep {
                tracing::info!("Expiring idle session {}", id);
            }
            keep
        });
        before - sessions.len()
    }

    pub async fn remove(&self, id: Uuid) -> Result<(), SessionError> {
        let removed = self.sessions.write().await.remove(&id);
        if removed.is_none() {
            return Err(SessionError::NotFound(id));
        }
        tracing::info!("Removed session {}", id);
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session {0} not found")]
    NotFound(Uuid),
    #[error("A simulation is already running in session {0}")]
    SolveInProgress(Uuid),
    #[error("A {1} step is already running in session {0}")]
    StepInProgress(Uuid, &'static str),
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
}
