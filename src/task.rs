//! Cancellable, timeout-bounded external process execution.
//!
//! Every external tool (gmsh, the preview script, the solver) runs through
//! [`ProcessTask`]. Standard output and standard error share a single pipe so
//! the captured log keeps the exact interleaving the process produced.

use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl TaskState {
    pub fn is_finished(&self) -> bool {
        !matches!(self, TaskState::Pending | TaskState::Running)
    }
}

/// Append-only line log shared between a running task and its observers.
#[derive(Debug, Clone, Default)]
pub struct LogBuffer {
    lines: Arc<Mutex<Vec<String>>>,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, line: impl Into<String>) {
        self.lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(line.into());
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Lines at index `from` and later.
    pub fn since(&self, from: usize) -> Vec<String> {
        let lines = self
            .lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        lines.get(from..).map(|s| s.to_vec()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cancellation signal for a task; clones share the same flag.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskOutcome {
    pub state: TaskState,
    pub exit_code: Option<i32>,
    pub log: Vec<String>,
    pub duration_ms: u64,
}

impl TaskOutcome {
    pub fn succeeded(&self) -> bool {
        self.state == TaskState::Succeeded
    }

    /// Captured output as a single block of text.
    pub fn output_text(&self) -> String {
        self.log.join("\n")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("No program configured for {0}")]
    EmptyCommand(String),
}

/// Kills the whole process group of a task when told to, or when the run
/// is abandoned before the process has exited.
struct ProcessGroup<'a> {
    pgid: Option<u32>,
    label: &'a str,
}

impl<'a> ProcessGroup<'a> {
    fn new(pgid: Option<u32>, label: &'a str) -> Self {
        Self { pgid, label }
    }

    fn release(&mut self) {
        self.pgid = None;
    }

    fn kill(&mut self) {
        let Some(pgid) = self.pgid.take() else {
            return;
        };
        #[cfg(unix)]
        {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;
            if let Err(e) = killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
                tracing::warn!("[{}] failed to kill process group {}: {}", self.label, pgid, e);
            }
        }
        #[cfg(not(unix))]
        tracing::debug!("[{}] no process group to kill for {}", self.label, pgid);
    }
}

impl Drop for ProcessGroup<'_> {
    fn drop(&mut self) {
        self.kill();
    }
}

enum Finish {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

/// One invocation of an external program.
#[derive(Debug, Clone)]
pub struct ProcessTask {
    label: String,
    program: String,
    args: Vec<String>,
    current_dir: Option<PathBuf>,
    envs: Vec<(String, String)>,
    timeout: Option<Duration>,
}

impl ProcessTask {
    pub fn new(label: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            envs: Vec::new(),
            timeout: None,
        }
    }

    /// Builds a task from `[program, args...]`.
    pub fn from_command_line(label: &str, command: &[String]) -> Result<Self, TaskError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| TaskError::EmptyCommand(label.to_string()))?;
        Ok(Self::new(label, program.clone()).args(args.iter().cloned()))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    /// Runs the program to completion, appending each output line to `log`
    /// as soon as it is read.
    pub async fn run(&self, log: &LogBuffer, cancel: &CancelHandle) -> TaskOutcome {
        let started = Instant::now();

        // Subscribe before checking so a cancel issued in between is not lost.
        let mut cancel_rx = cancel.subscribe();
        if cancel.is_cancelled() {
            return self.outcome(TaskState::Cancelled, None, log, started);
        }

        let (reader, writer) = match std::io::pipe() {
            Ok(pipe) => pipe,
            Err(e) => return self.launch_failure(e, log, started),
        };
        let writer_err = match writer.try_clone() {
            Ok(w) => w,
            Err(e) => return self.launch_failure(e, log, started),
        };

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(writer)
            .stderr(writer_err)
            .kill_on_drop(true);
        // Own process group, so wrapper scripts can be killed along with their children
        #[cfg(unix)]
        command.process_group(0);
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }
        for (key, value) in &self.envs {
            command.env(key, value);
        }

        tracing::info!(
            "[{}] running: {} {} (cwd: {:?})",
            self.label,
            self.program,
            self.args.join(" "),
            self.current_dir
        );

        let spawned = command.spawn();
        // The command still holds the write ends; the reader only sees EOF once they are gone.
        drop(command);
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => return self.launch_failure(e, log, started),
        };
        let mut group = ProcessGroup::new(child.id(), &self.label);

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let label = self.label.clone();
        std::thread::spawn(move || {
            let mut reader = BufReader::new(reader);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf)
                            .trim_end_matches(['\n', '\r'])
                            .to_string();
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!("[{}] output stream error: {}", label, e);
                        break;
                    }
                }
            }
        });

        let deadline = self.timeout.map(|t| tokio::time::Instant::now() + t);
        let expiry = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(expiry);

        let mut stream_open = true;
        let finish = loop {
            tokio::select! {
                line = rx.recv(), if stream_open => match line {
                    Some(line) => {
                        tracing::debug!("[{}] {}", self.label, line);
                        log.push(line);
                    }
                    None => stream_open = false,
                },
                status = child.wait(), if !stream_open => break Finish::Exited(status),
                _ = &mut expiry => break Finish::TimedOut,
                Ok(()) = cancel_rx.changed() => {
                    if *cancel_rx.borrow_and_update() {
                        break Finish::Cancelled;
                    }
                }
            }
        };

        let timed_out = matches!(finish, Finish::TimedOut);
        if matches!(finish, Finish::Exited(_)) {
            group.release();
        }
        match finish {
            Finish::Exited(Ok(status)) => {
                let state = if status.success() {
                    tracing::info!("[{}] finished with {}", self.label, status);
                    TaskState::Succeeded
                } else {
                    tracing::error!("[{}] exited with {}", self.label, status);
                    TaskState::Failed
                };
                self.outcome(state, status.code(), log, started)
            }
            Finish::Exited(Err(e)) => {
                tracing::error!("[{}] failed waiting for process: {}", self.label, e);
                log.push(format!("failed waiting for {}: {}", self.program, e));
                self.outcome(TaskState::Failed, None, log, started)
            }
            Finish::TimedOut | Finish::Cancelled => {
                group.kill();
                if let Err(e) = child.start_kill() {
                    tracing::debug!("[{}] process already gone: {}", self.label, e);
                }
                let status = child.wait().await.ok();
                while let Ok(line) = rx.try_recv() {
                    log.push(line);
                }
                let state = if timed_out {
                    let secs = self.timeout.map(|t| t.as_secs_f64()).unwrap_or_default();
                    tracing::warn!("[{}] timed out after {:.1}s", self.label, secs);
                    log.push(format!("{} timed out after {:.1}s", self.program, secs));
                    TaskState::TimedOut
                } else {
                    tracing::warn!("[{}] cancelled", self.label);
                    log.push(format!("{} cancelled", self.program));
                    TaskState::Cancelled
                };
                self.outcome(state, status.and_then(|s| s.code()), log, started)
            }
        }
    }

    fn launch_failure(&self, err: std::io::Error, log: &LogBuffer, started: Instant) -> TaskOutcome {
        tracing::error!("[{}] failed to launch {}: {}", self.label, self.program, err);
        log.push(format!("failed to launch {}: {}", self.program, err));
        self.outcome(TaskState::Failed, None, log, started)
    }

    fn outcome(
        &self,
        state: TaskState,
        exit_code: Option<i32>,
        log: &LogBuffer,
        started: Instant,
    ) -> TaskOutcome {
        TaskOutcome {
            state,
            exit_code,
            log: log.snapshot(),
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}
