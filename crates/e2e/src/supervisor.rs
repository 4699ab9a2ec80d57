//! Driver process supervision - launch, crash detection and shutdown

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{E2eError, E2eResult};
use crate::failure::FatalReporter;

/// What to launch
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub executable: PathBuf,
    pub args: Vec<String>,
    /// Added on top of the inherited environment
    pub env: Vec<(String, String)>,
    /// Time between SIGTERM and a forced kill on shutdown
    pub shutdown_grace: Duration,
}

/// Lifecycle of the supervised process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Exited {
        code: Option<i32>,
        /// Whether a shutdown was requested before the exit
        requested: bool,
    },
}

impl ProcessState {
    pub fn is_exited(&self) -> bool {
        matches!(self, ProcessState::Exited { .. })
    }
}

/// Handle to a supervised driver process
///
/// The child itself is owned by a watcher task. The handle only holds the
/// cancellation token and a view of the process state.
#[derive(Clone)]
pub struct ProcessHandle {
    pid: u32,
    executable: String,
    cancel: CancellationToken,
    state: watch::Receiver<ProcessState>,
}

pub struct ProcessSupervisor;

impl ProcessSupervisor {
    /// Launch the process and start watching it for crashes
    ///
    /// Any exit that is not preceded by [`ProcessHandle::shutdown`] is
    /// reported on `fatal` as [`E2eError::Crash`].
    pub fn start(spec: LaunchSpec, fatal: FatalReporter) -> E2eResult<ProcessHandle> {
        let executable = spec.executable.display().to_string();

        let mut cmd = Command::new(&spec.executable);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| E2eError::Launch {
            executable: executable.clone(),
            reason: e.to_string(),
        })?;

        let pid = child.id().ok_or_else(|| E2eError::Launch {
            executable: executable.clone(),
            reason: "process exited before it could be watched".to_string(),
        })?;
        info!("{} started, pid = {}", executable, pid);

        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(ProcessState::Running);

        tokio::spawn(watch_process(
            child,
            pid,
            executable.clone(),
            spec.shutdown_grace,
            cancel.clone(),
            state_tx,
            fatal,
        ));

        Ok(ProcessHandle {
            pid,
            executable,
            cancel,
            state: state_rx,
        })
    }
}

/// Process-exit watcher task
async fn watch_process(
    mut child: Child,
    pid: u32,
    executable: String,
    grace: Duration,
    cancel: CancellationToken,
    state: watch::Sender<ProcessState>,
    fatal: FatalReporter,
) {
    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => terminate(&mut child, pid, grace).await,
        status = child.wait() => status,
    };

    // Checked after the wait: a shutdown racing the exit is never a crash
    let requested = cancel.is_cancelled();

    let code = match &outcome {
        Ok(status) => status.code(),
        Err(_) => None,
    };
    let _ = state.send(ProcessState::Exited { code, requested });

    if requested {
        return;
    }

    let status = describe(&outcome);
    error!("{} crashed: {}", executable, status);
    fatal.report(E2eError::Crash { pid, status });
}

/// SIGTERM, give the process `grace` to leave, then kill it
async fn terminate(child: &mut Child, pid: u32, grace: Duration) -> std::io::Result<ExitStatus> {
    info!("Stopping driver (pid: {})", pid);

    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            warn!("SIGTERM to {} failed: {}", pid, e);
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!("Driver (pid: {}) still running after {:?}, killing it", pid, grace);
            child.kill().await?;
            child.wait().await
        }
    }
}

fn describe(outcome: &std::io::Result<ExitStatus>) -> String {
    match outcome {
        Ok(status) => status.to_string(),
        Err(e) => format!("wait failed: {}", e),
    }
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        self.state.borrow().clone()
    }

    /// Ask the process to stop; does not wait
    pub fn request_shutdown(&self) {
        self.cancel.cancel();
    }

    /// Wait until the process has exited, however that happened
    pub async fn wait_exit(&self) -> ProcessState {
        let mut rx = self.state.clone();
        let state = match rx.wait_for(ProcessState::is_exited).await {
            Ok(state) => state.clone(),
            // Watcher gone without publishing; treat as exited
            Err(_) => ProcessState::Exited {
                code: None,
                requested: self.cancel.is_cancelled(),
            },
        };
        state
    }

    /// Cancel the process and wait for it to exit; safe to call repeatedly
    pub async fn shutdown(&self) -> ProcessState {
        self.request_shutdown();
        info!("Waiting on {}", self.executable);
        let state = self.wait_exit().await;
        match &state {
            ProcessState::Exited { code: Some(0), .. } => {
                info!("{} exited cleanly", self.executable)
            }
            ProcessState::Exited { code, .. } => {
                warn!("{} wait result: exit code {:?}", self.executable, code)
            }
            ProcessState::Running => {}
        }
        state
    }
}
