//! Child process launching
//!
//! The supervisor talks to OS processes only through [`Launcher`] and
//! [`ChildProcess`], so its state machine can be driven by a fake in tests.

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs::OpenOptions;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tenantmux_common::{Error, Result};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::debug;

/// Everything needed to spawn one instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub tenant_id: String,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub log_path: PathBuf,
    pub port: u16,
}

impl LaunchSpec {
    pub fn command_line(&self) -> String {
        format!("{} {}", self.program, self.args.join(" "))
    }
}

/// How a child process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(sig)) => write!(f, "signal {}", sig),
            (None, None) => write!(f, "unknown exit"),
        }
    }
}

/// A spawned child owned by exactly one supervisor task
#[async_trait]
pub trait ChildProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Wait for exit. Must be cancel safe: it is raced against other events
    /// and called again afterwards.
    async fn wait(&mut self) -> Result<ExitInfo>;

    /// Ask the process to exit (SIGTERM)
    fn terminate(&mut self) -> Result<()>;

    /// SIGKILL and reap
    async fn kill(&mut self) -> Result<()>;
}

/// Spawns children and probes their ports
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn spawn(&self, spec: &LaunchSpec) -> Result<Box<dyn ChildProcess>>;

    /// One TCP connect attempt against the instance port
    async fn probe(&self, port: u16, timeout: Duration) -> bool;
}

/// Launcher for real OS processes
#[derive(Debug, Default, Clone)]
pub struct OsLauncher;

impl OsLauncher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Launcher for OsLauncher {
    async fn spawn(&self, spec: &LaunchSpec) -> Result<Box<dyn ChildProcess>> {
        if let Some(parent) = spec.log_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let stdout = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&spec.log_path)?;
        let stderr = stdout.try_clone()?;

        debug!(tenant_id = %spec.tenant_id, "Spawning: {}", spec.command_line());

        let child = Command::new(&spec.program)
            .args(&spec.args)
            .current_dir(&spec.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Spawn(format!("{}: {}", spec.program, e)))?;

        Ok(Box::new(OsChild { child }))
    }

    async fn probe(&self, port: u16, timeout: Duration) -> bool {
        matches!(
            tokio::time::timeout(timeout, TcpStream::connect(("127.0.0.1", port))).await,
            Ok(Ok(_))
        )
    }
}

struct OsChild {
    child: Child,
}

#[async_trait]
impl ChildProcess for OsChild {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> Result<ExitInfo> {
        let status = self.child.wait().await?;
        Ok(ExitInfo {
            code: status.code(),
            signal: status.signal(),
        })
    }

    fn terminate(&mut self) -> Result<()> {
        match self.child.id() {
            Some(pid) => kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
                .map_err(|e| Error::Internal(format!("SIGTERM {}: {}", pid, e))),
            // Already reaped
            None => Ok(()),
        }
    }

    async fn kill(&mut self) -> Result<()> {
        self.child.kill().await?;
        Ok(())
    }
}

/// Whether a pid refers to a live process
pub fn is_process_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// SIGKILL a pid we no longer hold a handle for
pub fn kill_pid(pid: u32) -> Result<()> {
    kill(Pid::from_raw(pid as i32), Signal::SIGKILL)
        .map_err(|e| Error::Internal(format!("SIGKILL {}: {}", pid, e)))
}
