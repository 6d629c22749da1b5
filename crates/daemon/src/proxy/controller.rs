//! Proxy process control

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tenantmux_common::{Error, Result};
use tokio::process::Command;
use tracing::debug;

/// Validates and reloads the reverse proxy
#[async_trait]
pub trait ProxyController: Send + Sync {
    /// Check a candidate config file without activating it.
    /// Fails with [`Error::ValidationFailed`].
    async fn validate(&self, candidate: &Path) -> Result<()>;

    /// Make the proxy pick up the active config file
    async fn reload(&self) -> Result<()>;
}

/// Controls a system nginx through its command line
#[derive(Debug, Clone)]
pub struct NginxController {
    binary: String,
    reload_args: Vec<String>,
    timeout: Duration,
}

impl NginxController {
    pub fn new(binary: impl Into<String>, reload_args: Vec<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            reload_args,
            timeout,
        }
    }

    /// Minimal main config that includes the candidate as an http-level file
    fn harness(candidate: &Path, prefix: &Path) -> String {
        format!(
            "pid {prefix}/nginx.pid;\nerror_log stderr;\nevents {{}}\nhttp {{\n    include {candidate};\n}}\n",
            prefix = prefix.display(),
            candidate = candidate.display(),
        )
    }

    async fn run(&self, args: &[String]) -> Result<std::process::Output> {
        debug!("Running {} {}", self.binary, args.join(" "));
        let child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Spawn(format!("{}: {}", self.binary, e)))?;

        tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| Error::Timeout {
                seconds: self.timeout.as_secs(),
            })?
            .map_err(Error::from)
    }
}

#[async_trait]
impl ProxyController for NginxController {
    async fn validate(&self, candidate: &Path) -> Result<()> {
        let candidate = std::fs::canonicalize(candidate)?;
        let prefix = tempfile::TempDir::new()?;
        let main_conf = prefix.path().join("nginx.conf");
        tokio::fs::write(&main_conf, Self::harness(&candidate, prefix.path())).await?;

        let args = vec![
            "-t".to_string(),
            "-q".to_string(),
            "-e".to_string(),
            "stderr".to_string(),
            "-p".to_string(),
            prefix.path().display().to_string(),
            "-c".to_string(),
            main_conf.display().to_string(),
        ];
        let output = self.run(&args).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::ValidationFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    async fn reload(&self) -> Result<()> {
        let output = self.run(&self.reload_args).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::ReloadFailed {
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Controller whose verdicts are set by the test
    #[derive(Default)]
    pub struct FakeController {
        pub reject: AtomicBool,
        /// Fail this many upcoming reloads
        pub failing_reloads: AtomicUsize,
        pub validations: AtomicUsize,
        pub reloads: AtomicUsize,
        /// Content of every file passed to validate
        pub validated: Mutex<Vec<String>>,
    }

    impl FakeController {
        pub fn reload_count(&self) -> usize {
            self.reloads.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProxyController for FakeController {
        async fn validate(&self, candidate: &Path) -> Result<()> {
            self.validations.fetch_add(1, Ordering::SeqCst);
            self.validated
                .lock()
                .push(std::fs::read_to_string(candidate)?);
            if self.reject.load(Ordering::SeqCst) {
                return Err(Error::ValidationFailed("unknown directive".to_string()));
            }
            Ok(())
        }

        async fn reload(&self) -> Result<()> {
            self.reloads.fetch_add(1, Ordering::SeqCst);
            let failing = self.failing_reloads.load(Ordering::SeqCst);
            if failing > 0 {
                self.failing_reloads.store(failing - 1, Ordering::SeqCst);
                return Err(Error::ReloadFailed {
                    detail: "signal process started".to_string(),
                });
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_harness_includes_candidate() {
        let harness = NginxController::harness(Path::new("/tmp/x.conf"), Path::new("/tmp/p"));
        assert!(harness.contains("include /tmp/x.conf;"));
        assert!(harness.contains("events {}"));
        tenantmux_common::nginx::parse(&harness).unwrap();
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let candidate = tmp.path().join("c.conf");
        std::fs::write(&candidate, "").unwrap();
        let controller = NginxController::new(
            "/nonexistent/nginx",
            vec!["-s".into(), "reload".into()],
            Duration::from_secs(5),
        );
        assert!(matches!(
            controller.validate(&candidate).await,
            Err(Error::Spawn(_))
        ));
        assert!(matches!(controller.reload().await, Err(Error::Spawn(_))));
    }
}
