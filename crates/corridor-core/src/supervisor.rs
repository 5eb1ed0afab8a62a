//! Supervision of the external Xray process.
//!
//! A single [`ProcessSupervisor`] owns the one tracked child process. It
//! launches the binary with `run -c <config>`, retries launches that fail or
//! exit during startup, and stops the process with a graceful signal followed
//! by a forced kill.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Tracing target for output forwarded from the child process.
pub const XRAY_LOG_TARGET: &str = "xray";

#[cfg(target_os = "windows")]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// How long stderr of a process that died during startup is drained.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Error types for process launches.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    /// The binary could not be spawned at all.
    #[error("failed to spawn {path:?}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The process terminated within the startup grace period.
    #[error("process exited during startup with {status}")]
    ExitedEarly { status: ExitStatus, stderr: String },

    /// Every attempt failed.
    #[error("launch failed after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: Box<LaunchError>,
    },
}

/// Timing and retry policy of the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Launch attempts before giving up.
    pub max_attempts: u32,
    /// Backoff unit; the wait after attempt `n` is `n * backoff_step`.
    pub backoff_step: Duration,
    /// Liveness poll delay after spawning.
    pub startup_grace: Duration,
    /// Time allowed for graceful exit before a forced kill.
    pub stop_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_step: Duration::from_secs(1),
            startup_grace: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(3),
        }
    }
}

/// Details of a successfully launched process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub binary: PathBuf,
    pub config: PathBuf,
    pub pid: Option<u32>,
    pub launched_at: DateTime<Utc>,
}

struct SupervisedProcess {
    child: Child,
    info: ProcessInfo,
}

/// Owner of the single supervised Xray process.
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    process: Mutex<Option<SupervisedProcess>>,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            process: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Launches `binary run -c config`, retrying failed launches.
    ///
    /// Any process already tracked is stopped first, so at most one child
    /// exists at a time.
    pub async fn start(&self, config: &Path, binary: &Path) -> Result<ProcessInfo, LaunchError> {
        let mut guard = self.process.lock().await;
        if let Some(previous) = guard.take() {
            tracing::info!("Stopping previous Xray process before restart");
            terminate(previous, self.config.stop_timeout).await;
        }

        let attempts = self.config.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            tracing::info!(
                "Starting Xray (attempt {}/{}): {:?} run -c {:?}",
                attempt,
                attempts,
                binary,
                config
            );

            match self.launch(config, binary).await {
                Ok(process) => {
                    let info = process.info.clone();
                    tracing::info!("Xray started with pid {:?}", info.pid);
                    *guard = Some(process);
                    return Ok(info);
                }
                Err(e) => {
                    match &e {
                        LaunchError::ExitedEarly { status, stderr } => {
                            tracing::error!("Xray exited during startup with {}", status);
                            if !stderr.trim().is_empty() {
                                tracing::error!("Xray stderr: {}", stderr.trim());
                            }
                        }
                        other => tracing::error!("Xray launch failed: {}", other),
                    }
                    last_error = Some(e);
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.config.backoff_step * attempt).await;
            }
        }

        let last = last_error.unwrap_or_else(|| LaunchError::Spawn {
            path: binary.to_path_buf(),
            source: std::io::Error::other("no launch attempted"),
        });
        tracing::error!(
            "critical: Xray failed to start after {} attempts, continuing without VPN",
            attempts
        );
        Err(LaunchError::Exhausted {
            attempts,
            last: Box::new(last),
        })
    }

    async fn launch(&self, config: &Path, binary: &Path) -> Result<SupervisedProcess, LaunchError> {
        let mut command = Command::new(binary);
        command
            .arg("run")
            .arg("-c")
            .arg(config)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(target_os = "windows")]
        command.creation_flags(CREATE_NO_WINDOW);

        let mut child = command.spawn().map_err(|source| LaunchError::Spawn {
            path: binary.to_path_buf(),
            source,
        })?;

        tokio::time::sleep(self.config.startup_grace).await;

        match child.try_wait() {
            Ok(None) => {}
            Ok(Some(status)) => {
                let stderr = match child.stderr.take() {
                    Some(pipe) => drain(pipe).await,
                    None => String::new(),
                };
                return Err(LaunchError::ExitedEarly { status, stderr });
            }
            Err(source) => {
                return Err(LaunchError::Spawn {
                    path: binary.to_path_buf(),
                    source,
                })
            }
        }

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr));
        }

        let info = ProcessInfo {
            binary: binary.to_path_buf(),
            config: config.to_path_buf(),
            pid: child.id(),
            launched_at: Utc::now(),
        };

        Ok(SupervisedProcess { child, info })
    }

    /// Whether the tracked process is still running.
    ///
    /// A process found to have exited is logged and forgotten.
    pub async fn is_alive(&self) -> bool {
        let mut guard = self.process.lock().await;
        let Some(process) = guard.as_mut() else {
            return false;
        };

        match process.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                tracing::error!(
                    "Xray process {:?} exited unexpectedly with {}",
                    process.info.pid,
                    status
                );
                *guard = None;
                false
            }
            Err(e) => {
                tracing::error!("Failed to poll Xray process: {}", e);
                *guard = None;
                false
            }
        }
    }

    /// Details of the tracked process, if any.
    pub async fn current(&self) -> Option<ProcessInfo> {
        self.process.lock().await.as_ref().map(|p| p.info.clone())
    }

    /// Stops the tracked process. Does nothing when none is running.
    pub async fn stop(&self) {
        let process = self.process.lock().await.take();
        if let Some(process) = process {
            terminate(process, self.config.stop_timeout).await;
        }
    }

    /// Polls liveness every `interval` so crashes are logged promptly.
    ///
    /// The task ends once the supervisor is dropped.
    pub fn spawn_watchdog(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let supervisor: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(supervisor) = supervisor.upgrade() else {
                    break;
                };
                supervisor.is_alive().await;
            }
            tracing::debug!("Xray watchdog finished");
        })
    }
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new(SupervisorConfig::default())
    }
}

/// Graceful termination followed by a forced kill after `timeout`.
async fn terminate(mut process: SupervisedProcess, timeout: Duration) {
    let pid = process.info.pid;

    if let Ok(Some(status)) = process.child.try_wait() {
        tracing::debug!("Xray process {:?} already exited with {}", pid, status);
        return;
    }

    request_exit(&mut process.child);

    match tokio::time::timeout(timeout, process.child.wait()).await {
        Ok(Ok(status)) => tracing::info!("Xray process {:?} stopped with {}", pid, status),
        Ok(Err(e)) => tracing::warn!("Failed to wait for Xray process {:?}: {}", pid, e),
        Err(_) => {
            tracing::warn!("Xray process {:?} did not exit in {:?}, killing", pid, timeout);
            if let Err(e) = process.child.kill().await {
                tracing::error!("Failed to kill Xray process {:?}: {}", pid, e);
            }
        }
    }
}

#[cfg(unix)]
fn request_exit(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            tracing::warn!("Failed to send SIGTERM to {}: {}", pid, e);
        }
    }
}

#[cfg(not(unix))]
fn request_exit(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        tracing::warn!("Failed to terminate Xray process: {}", e);
    }
}

async fn drain<R: AsyncRead + Unpin>(mut pipe: R) -> String {
    let mut buffer = Vec::new();
    let _ = tokio::time::timeout(STDERR_DRAIN_TIMEOUT, pipe.read_to_end(&mut buffer)).await;
    String::from_utf8_lossy(&buffer).into_owned()
}

async fn forward_output<R: AsyncRead + Unpin>(pipe: R) {
    let mut lines = BufReader::new(pipe).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(target: XRAY_LOG_TARGET, "{}", line);
    }
}
