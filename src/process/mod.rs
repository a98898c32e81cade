//! Agent process supervisor.
//!
//! Spawns the agent with:
//! - `kill_on_drop(true)` so an abandoned child never outlives its client.
//! - Optional `env_clear()` + a safe variable allowlist.
//! - A monitor task that exclusively owns the [`Child`], observes its exit and
//!   carries out terminate/kill requests.
//! - A stderr pump that forwards agent diagnostics to `tracing` and keeps the
//!   most recent lines for error messages.
//!
//! Nothing outside this module touches the raw process handle; callers hold an
//! [`AgentProcess`], which talks to the monitor over a channel.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::{Result, RpcError};

/// Number of agent stderr lines retained for diagnostics.
pub const STDERR_TAIL_LINES: usize = 50;

/// How long to wait for the exit after a kill has been issued.
const KILL_WAIT: Duration = Duration::from_secs(5);

// ── Environment allowlist ────────────────────────────────────────────────────

/// Environment variables inherited by the agent when `inherit_env` is off.
///
/// Every other variable from the caller's environment is stripped via
/// `env_clear()` before the child is launched.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "RUST_LOG",
    "LANG",
    "TMPDIR",
    // Windows-specific variables.
    "USERPROFILE",
    "SystemRoot",
    "TEMP",
    "TMP",
    "USERNAME",
    "APPDATA",
    "LOCALAPPDATA",
    "COMSPEC",
];

// ── Configuration ────────────────────────────────────────────────────────────

/// Everything needed to launch one agent process.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Executable name or path.
    pub program: String,
    /// Full argument list.
    pub args: Vec<String>,
    /// Working directory.
    pub cwd: Option<PathBuf>,
    /// Keep the caller's environment instead of the allowlist.
    pub inherit_env: bool,
    /// Extra variables set on the child.
    pub env: Vec<(String, String)>,
    /// Pipe stdin to the client; `false` attaches it to null.
    pub pipe_stdin: bool,
}

impl SpawnConfig {
    /// Launch parameters for talking to `agent` over stdio.
    #[must_use]
    pub fn stdio(agent: &AgentConfig) -> Self {
        Self {
            program: agent.program.clone(),
            args: agent.args.clone(),
            cwd: agent.cwd.clone(),
            inherit_env: agent.inherit_env,
            env: agent
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            pipe_stdin: true,
        }
    }

    /// Launch parameters for an agent serving TCP; `port > 0` is passed as
    /// `--port <port>`.
    #[must_use]
    pub fn tcp(agent: &AgentConfig, port: u16) -> Self {
        let mut config = Self::stdio(agent);
        config.pipe_stdin = false;
        if port > 0 {
            config.args.push("--port".into());
            config.args.push(port.to_string());
        }
        config
    }
}

// ── Exit information ─────────────────────────────────────────────────────────

/// How the agent process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, absent when terminated by a signal.
    pub code: Option<i32>,
    /// Human-readable description.
    pub reason: String,
}

/// Requests carried out by the monitor task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessSignal {
    Terminate,
    Kill,
}

/// Pipes handed to the transport layer.
#[derive(Debug)]
pub struct AgentStdio {
    /// Agent stdin; `None` when the agent serves a socket instead.
    pub stdin: Option<ChildStdin>,
    /// Agent stdout.
    pub stdout: ChildStdout,
}

// ── Process handle ───────────────────────────────────────────────────────────

/// Handle to a running agent process.
///
/// Dropping the handle kills the process.
#[derive(Debug)]
pub struct AgentProcess {
    client_id: String,
    pid: Option<u32>,
    control: mpsc::UnboundedSender<ProcessSignal>,
    exit: watch::Receiver<Option<ProcessExit>>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    monitor: JoinHandle<()>,
}

/// Spawn an agent process.
///
/// Must be called from within a tokio runtime: the monitor and stderr pump
/// tasks are spawned immediately.
///
/// # Errors
///
/// - `RpcError::Launch("failed to spawn agent …")` if the OS spawn fails
///   (executable missing, permission denied, bad working directory).
/// - `RpcError::Launch("failed to capture agent …")` if a pipe is missing.
pub fn spawn_agent(config: &SpawnConfig, client_id: &str) -> Result<(AgentProcess, AgentStdio)> {
    let mut cmd = Command::new(&config.program);
    cmd.args(&config.args);

    if !config.inherit_env {
        cmd.env_clear();
        for &key in ALLOWED_ENV_VARS {
            if let Ok(val) = std::env::var(key) {
                cmd.env(key, val);
            }
        }
    }
    for (key, val) in &config.env {
        cmd.env(key, val);
    }

    if let Some(cwd) = &config.cwd {
        cmd.current_dir(cwd);
    }

    let stdin_mode = if config.pipe_stdin {
        std::process::Stdio::piped()
    } else {
        std::process::Stdio::null()
    };
    cmd.stdin(stdin_mode)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|err| {
        RpcError::Launch(format!("failed to spawn agent '{}': {err}", config.program))
    })?;

    let stdin = child.stdin.take();
    if config.pipe_stdin && stdin.is_none() {
        return Err(RpcError::Launch("failed to capture agent stdin".into()));
    }
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| RpcError::Launch("failed to capture agent stdout".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| RpcError::Launch("failed to capture agent stderr".into()))?;

    let pid = child.id();
    info!(client_id, pid, program = %config.program, "agent process spawned");

    let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
    pump_stderr(client_id.to_owned(), stderr, Arc::clone(&stderr_tail));

    let (control, control_rx) = mpsc::unbounded_channel();
    let (exit_tx, exit) = watch::channel(None);
    let monitor = monitor_exit(client_id.to_owned(), child, control_rx, exit_tx);

    Ok((
        AgentProcess {
            client_id: client_id.to_owned(),
            pid,
            control,
            exit,
            stderr_tail,
            monitor,
        },
        AgentStdio { stdin, stdout },
    ))
}

impl AgentProcess {
    /// OS process id, if it was known at spawn time.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit information once the process has ended.
    #[must_use]
    pub fn exit_status(&self) -> Option<ProcessExit> {
        self.exit.borrow().clone()
    }

    /// Resolve when the process has exited.
    pub async fn wait_for_exit(&self) -> ProcessExit {
        let mut exit = self.exit.clone();
        let observed = exit
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|guard| guard.clone());
        observed.unwrap_or_else(|| ProcessExit {
            code: None,
            reason: "process monitor stopped".into(),
        })
    }

    /// Ask the process to terminate and wait up to `grace` for it to exit,
    /// escalating to a kill afterwards.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Transport` if the process is still alive after the
    /// kill.
    pub async fn stop(&self, grace: Duration) -> Result<ProcessExit> {
        if let Some(exit) = self.exit_status() {
            return Ok(exit);
        }

        let _ = self.control.send(ProcessSignal::Terminate);
        if let Ok(exit) = tokio::time::timeout(grace, self.wait_for_exit()).await {
            return Ok(exit);
        }

        warn!(
            client_id = self.client_id,
            ?grace,
            "agent did not exit within grace period, killing"
        );
        let _ = self.control.send(ProcessSignal::Kill);
        tokio::time::timeout(KILL_WAIT, self.wait_for_exit())
            .await
            .map_err(|_| RpcError::Transport("agent process did not exit after kill".into()))
    }

    /// Kill the process without waiting.
    ///
    /// Safe to call any number of times, including after the process exited.
    pub fn force_stop(&self) {
        // The monitor may already be gone; that means the process is too.
        let _ = self.control.send(ProcessSignal::Kill);
    }

    /// Most recent agent stderr lines, oldest first.
    #[must_use]
    pub fn stderr_tail(&self) -> Vec<String> {
        self.stderr_tail
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Whether the monitor task has finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.monitor.is_finished()
    }
}

// ── Port announcement ────────────────────────────────────────────────────────

/// Wait for a TCP-serving agent to print `listening on port <N>` on stdout.
///
/// Once the port is found the rest of stdout is drained to `tracing` so the
/// agent never blocks on a full pipe.
///
/// # Errors
///
/// - `RpcError::Launch("startup timeout …")` when nothing matches in time.
/// - `RpcError::Launch("agent exited before announcing its port")` on EOF.
pub async fn await_port_announcement(
    client_id: &str,
    stdout: ChildStdout,
    timeout: Duration,
) -> Result<u16> {
    let pattern = Regex::new(r"(?i)listening on port (\d+)")
        .map_err(|err| RpcError::Launch(format!("invalid port pattern: {err}")))?;
    let mut lines = BufReader::new(stdout).lines();

    let scan = async {
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    debug!(client_id, stream = "stdout", "{line}");
                    if let Some(port) = pattern
                        .captures(&line)
                        .and_then(|caps| caps.get(1))
                        .and_then(|m| m.as_str().parse::<u16>().ok())
                    {
                        return Ok(port);
                    }
                }
                Ok(None) => {
                    return Err(RpcError::Launch(
                        "agent exited before announcing its port".into(),
                    ));
                }
                Err(err) => {
                    return Err(RpcError::Launch(format!(
                        "failed to read agent stdout: {err}"
                    )));
                }
            }
        }
    };

    let port = tokio::time::timeout(timeout, scan).await.map_err(|_| {
        RpcError::Launch(format!(
            "startup timeout: agent did not announce its port within {timeout:?}"
        ))
    })??;

    info!(client_id, port, "agent announced tcp port");

    let client_id = client_id.to_owned();
    tokio::spawn(async move {
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(client_id, stream = "stdout", "{line}");
        }
    });

    Ok(port)
}

// ── Background tasks ─────────────────────────────────────────────────────────

/// Forward agent stderr to `tracing`, keeping the last lines in `tail`.
fn pump_stderr(
    client_id: String,
    stderr: ChildStderr,
    tail: Arc<Mutex<VecDeque<String>>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    debug!(client_id, stream = "stderr", "{line}");
                    let mut tail = tail.lock().unwrap_or_else(PoisonError::into_inner);
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                Ok(None) => break,
                Err(err) => {
                    debug!(client_id, %err, "stderr pump stopped");
                    break;
                }
            }
        }
    })
}

/// Own `child` until it exits, applying terminate/kill requests.
///
/// When every [`AgentProcess`] handle is gone the child is killed.
fn monitor_exit(
    client_id: String,
    mut child: Child,
    mut control: mpsc::UnboundedReceiver<ProcessSignal>,
    exit_tx: watch::Sender<Option<ProcessExit>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut control_open = true;

        let status = loop {
            tokio::select! {
                status = child.wait() => break status,

                signal = control.recv(), if control_open => match signal {
                    Some(ProcessSignal::Terminate) => terminate(&client_id, &mut child),
                    Some(ProcessSignal::Kill) => {
                        debug!(client_id, "monitor: killing agent process");
                        if let Err(err) = child.start_kill() {
                            debug!(client_id, %err, "monitor: kill failed");
                        }
                    }
                    None => {
                        control_open = false;
                        debug!(client_id, "monitor: handle dropped, killing agent process");
                        let _ = child.start_kill();
                    }
                },
            }
        };

        let exit = match status {
            Ok(status) => ProcessExit {
                code: status.code(),
                reason: describe_exit(&status),
            },
            Err(err) => {
                warn!(client_id, %err, "error waiting for agent child process");
                ProcessExit {
                    code: None,
                    reason: format!("wait error: {err}"),
                }
            }
        };

        info!(client_id, code = exit.code, reason = exit.reason, "agent process exited");
        exit_tx.send_replace(Some(exit));
    })
}

/// Request a graceful exit: `SIGTERM` on Unix, a kill elsewhere.
#[cfg(unix)]
fn terminate(client_id: &str, child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    debug!(client_id, pid, "monitor: sending SIGTERM");
    if let Err(err) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        debug!(client_id, %err, "monitor: SIGTERM failed");
    }
}

#[cfg(not(unix))]
fn terminate(client_id: &str, child: &mut Child) {
    debug!(client_id, "monitor: terminating agent process");
    let _ = child.start_kill();
}

#[cfg(unix)]
fn describe_exit(status: &std::process::ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;

    match (status.code(), status.signal()) {
        (Some(code), _) => format!("process exited with code {code}"),
        (None, Some(signal)) => format!("process terminated by signal {signal}"),
        (None, None) => "process terminated".to_owned(),
    }
}

#[cfg(not(unix))]
fn describe_exit(status: &std::process::ExitStatus) -> String {
    status.code().map_or_else(
        || "process terminated".to_owned(),
        |code| format!("process exited with code {code}"),
    )
}
