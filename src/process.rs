//! Supervised Copilot CLI child process.
//!
//! Spawns the CLI with piped stdio, forwards stderr to debug logging while
//! retaining a tail for startup diagnostics, exposes the exit status as a
//! watch channel, and supports graceful / forced termination.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout, Command};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{CopilotError, Result};

/// Number of stderr lines retained for startup-failure diagnostics.
const STDERR_RING_CAPACITY: usize = 100;

/// How long a graceful termination waits before escalating to a kill.
const GRACEFUL_EXIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Exit state of the supervised child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExitState {
    Running,
    /// The child exited; carries the exit code when the platform reports one.
    Exited(Option<i32>),
}

pub(crate) struct SpawnOptions {
    pub(crate) binary: PathBuf,
    pub(crate) args: Vec<String>,
    pub(crate) env: HashMap<String, String>,
    pub(crate) working_dir: Option<PathBuf>,
}

/// Handle to a supervised CLI child process.
pub(crate) struct CliProcess {
    pid: Option<u32>,
    exit_rx: watch::Receiver<ExitState>,
    kill_token: CancellationToken,
    stderr_ring: Arc<Mutex<VecDeque<String>>>,
    stdout: Option<ChildStdout>,
    stdin: Option<ChildStdin>,
}

impl CliProcess {
    /// Spawn the CLI with piped stdin/stdout/stderr and a merged
    /// environment. Explicit pipes also keep GUI hosts from opening a
    /// console window for the child.
    pub(crate) fn spawn(options: SpawnOptions) -> Result<Self> {
        let mut command = Command::new(&options.binary);
        command
            .args(&options.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in &options.env {
            command.env(key, value);
        }
        if let Some(dir) = &options.working_dir {
            command.current_dir(dir);
        }

        debug!("Spawning Copilot CLI: {:?} {:?}", options.binary, options.args);
        let mut child = command.spawn().map_err(|source| CopilotError::Startup {
            message: format!("could not spawn `{}`: {source}", options.binary.display()),
            stderr: None,
        })?;

        let pid = child.id();
        let stdout = child.stdout.take();
        let stdin = child.stdin.take();
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| CopilotError::startup("child stderr unavailable"))?;

        let stderr_ring = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_RING_CAPACITY)));
        let ring = Arc::clone(&stderr_ring);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("copilot stderr: {line}");
                let mut ring = ring.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                if ring.len() == STDERR_RING_CAPACITY {
                    ring.pop_front();
                }
                ring.push_back(line);
            }
        });

        let (exit_tx, exit_rx) = watch::channel(ExitState::Running);
        let kill_token = CancellationToken::new();
        let wait_token = kill_token.clone();
        tokio::spawn(async move {
            let state = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => ExitState::Exited(status.code()),
                    Err(error) => {
                        warn!("Failed to wait for Copilot CLI: {error}");
                        ExitState::Exited(None)
                    }
                },
                _ = wait_token.cancelled() => {
                    let _ = child.start_kill();
                    match child.wait().await {
                        Ok(status) => ExitState::Exited(status.code()),
                        Err(_) => ExitState::Exited(None),
                    }
                }
            };
            let _ = exit_tx.send(state);
        });

        Ok(Self {
            pid,
            exit_rx,
            kill_token,
            stderr_ring,
            stdout,
            stdin,
        })
    }

    /// Take the child's stdio pipes for the transport. Available once.
    pub(crate) fn take_stdio(&mut self) -> Result<(ChildStdout, ChildStdin)> {
        let stdout = self
            .stdout
            .take()
            .ok_or_else(|| CopilotError::startup("child stdout unavailable"))?;
        let stdin = self
            .stdin
            .take()
            .ok_or_else(|| CopilotError::startup("child stdin unavailable"))?;
        Ok((stdout, stdin))
    }

    /// Take the child's stdout for port-announcement parsing (TCP mode).
    pub(crate) fn take_stdout(&mut self) -> Result<ChildStdout> {
        self.stdout
            .take()
            .ok_or_else(|| CopilotError::startup("child stdout unavailable"))
    }

    /// Watch channel reporting the child's exit.
    pub(crate) fn exit_watch(&self) -> watch::Receiver<ExitState> {
        self.exit_rx.clone()
    }

    /// Current exit state without waiting.
    pub(crate) fn exit_state(&self) -> ExitState {
        *self.exit_rx.borrow()
    }

    /// The captured tail of the child's stderr, newline-joined.
    pub(crate) fn stderr_tail(&self) -> String {
        let ring = self
            .stderr_ring
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        ring.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    /// Ask the child to exit gracefully (SIGTERM on unix), escalating to a
    /// kill if it is still running after a grace period.
    pub(crate) async fn terminate_graceful(&self) {
        if matches!(self.exit_state(), ExitState::Exited(_)) {
            return;
        }

        #[cfg(unix)]
        if let Some(pid) = self.pid {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
        #[cfg(not(unix))]
        {
            self.kill_token.cancel();
        }

        let mut exit_rx = self.exit_rx.clone();
        let graceful = tokio::time::timeout(GRACEFUL_EXIT_TIMEOUT, async {
            while !matches!(*exit_rx.borrow(), ExitState::Exited(_)) {
                if exit_rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;

        if graceful.is_err() {
            debug!("Copilot CLI did not exit after SIGTERM, killing");
            self.terminate_forced().await;
        }
    }

    /// Kill the child immediately and wait for the exit status.
    pub(crate) async fn terminate_forced(&self) {
        self.kill_token.cancel();
        let mut exit_rx = self.exit_rx.clone();
        let _ = tokio::time::timeout(GRACEFUL_EXIT_TIMEOUT, async {
            while !matches!(*exit_rx.borrow(), ExitState::Exited(_)) {
                if exit_rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;
    }
}

/// Read the child's stdout until it announces the TCP port, racing the
/// child's exit. Returns the announced port.
pub(crate) async fn wait_for_port_announcement(
    stdout: ChildStdout,
    mut exit_rx: watch::Receiver<ExitState>,
    timeout: Duration,
    stderr_tail: impl Fn() -> String,
) -> Result<u16> {
    let mut lines = BufReader::new(stdout).lines();

    let read_port = async {
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let trimmed = line.trim();
                    debug!("Copilot CLI output: {trimmed}");
                    if let Some(port_str) = trimmed.strip_prefix("Copilot CLI listening on port ") {
                        match port_str.trim().parse::<u16>() {
                            Ok(port) if port > 0 => return Ok(port),
                            _ => {
                                return Err(CopilotError::startup(format!(
                                    "failed to parse announced port: {port_str}"
                                )))
                            }
                        }
                    }
                }
                // Stdout closed without an announcement: let the exit
                // branch (or the timeout) produce the diagnostic, which
                // carries the exit code and stderr tail.
                Ok(None) => std::future::pending::<()>().await,
                Err(error) => return Err(CopilotError::Io(error)),
            }
        }
    };

    let exited = async {
        loop {
            if let ExitState::Exited(code) = *exit_rx.borrow() {
                return code;
            }
            if exit_rx.changed().await.is_err() {
                return None;
            }
        }
    };

    tokio::select! {
        biased;
        port = read_port => port,
        code = exited => Err(CopilotError::Startup {
            message: format!(
                "CLI exited{} before announcing a port",
                code.map(|c| format!(" with code {c}")).unwrap_or_default()
            ),
            stderr: Some(stderr_tail()),
        }),
        _ = tokio::time::sleep(timeout) => Err(CopilotError::Startup {
            message: format!("timed out after {timeout:?} waiting for port announcement"),
            stderr: Some(stderr_tail()),
        }),
    }
}
