//! Application installation
//!
//! Prepares an instance's data directories and makes sure the application's
//! dependencies are present in its app directory.

use crate::config::AppConfig;
use crate::state::InstanceStore;
use std::process::Stdio;
use std::time::Duration;
use tenantmux_common::{types::*, Error, Result};
use tokio::process::Command;
use tracing::{info, warn};

/// Bytes of installer output kept in the failure message
const OUTPUT_TAIL: usize = 2048;

pub struct Installer {
    store: InstanceStore,
    app: AppConfig,
}

impl Installer {
    pub fn new(store: InstanceStore, app: AppConfig) -> Self {
        Self { store, app }
    }

    /// Install an instance.
    ///
    /// Ends in `installed`, or `failed` with the reason recorded as the
    /// instance fault.
    pub async fn install(&self, tenant_id: &str) -> Result<InstallStatus> {
        self.store.begin_install(tenant_id)?;
        let instance = self.store.get(tenant_id)?;
        info!(tenant_id, app_dir = %instance.app_dir.display(), "Installing instance");

        match self.prepare(&instance).await {
            Ok(()) => {
                self.store
                    .set_install_status(tenant_id, InstallStatus::Installed)?;
                self.store.clear_fault(tenant_id)?;
                info!(tenant_id, "Instance installed");
                Ok(InstallStatus::Installed)
            }
            Err(e) => {
                warn!(tenant_id, "Install failed: {}", e);
                self.store
                    .set_install_status(tenant_id, InstallStatus::Failed)?;
                self.store.set_fault(tenant_id, &e.to_string())?;
                Err(e)
            }
        }
    }

    async fn prepare(&self, instance: &Instance) -> Result<()> {
        tokio::fs::create_dir_all(instance.app_data_dir()).await?;
        if let Some(logs) = instance.log_path().parent() {
            tokio::fs::create_dir_all(logs).await?;
        }

        if !instance.app_dir.is_dir() {
            return Err(Error::InstallFailed(format!(
                "app directory {} does not exist",
                instance.app_dir.display()
            )));
        }
        let entry = instance.app_dir.join(&self.app.entry_file);
        if !entry.is_file() {
            return Err(Error::BinaryMissing(entry.display().to_string()));
        }

        let deps = instance.app_dir.join(&self.app.dependency_dir);
        if deps.is_dir() {
            return Ok(());
        }
        self.run_install_command(instance).await?;
        if !deps.is_dir() {
            return Err(Error::DependenciesMissing(deps.display().to_string()));
        }
        Ok(())
    }

    async fn run_install_command(&self, instance: &Instance) -> Result<()> {
        let Some((program, args)) = self.app.install_command.split_first() else {
            return Err(Error::InstallFailed(
                "no install command configured".to_string(),
            ));
        };
        let timeout = Duration::from_secs(self.app.install_timeout_secs.max(1));

        info!(
            tenant_id = %instance.tenant_id,
            "Running {}",
            self.app.install_command.join(" ")
        );
        let child = Command::new(program)
            .args(args)
            .current_dir(&instance.app_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::InstallFailed(format!("{}: {}", program, e)))?;

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| Error::Timeout {
                seconds: timeout.as_secs(),
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let mut start = stderr.len().saturating_sub(OUTPUT_TAIL);
            while !stderr.is_char_boundary(start) {
                start += 1;
            }
            let tail = &stderr[start..];
            return Err(Error::InstallFailed(format!(
                "{} exited with {}: {}",
                program,
                output.status,
                tail.trim()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortConfig;
    use tempfile::TempDir;
    use tenantmux_common::Database;

    fn setup(install_command: Vec<&str>) -> (TempDir, InstanceStore, Installer) {
        let tmp = TempDir::new().unwrap();
        let app_dir = tmp.path().join("app");
        std::fs::create_dir_all(&app_dir).unwrap();
        std::fs::write(app_dir.join("server.js"), "").unwrap();

        let store = InstanceStore::new(
            Database::open_memory().unwrap(),
            PortConfig {
                range_start: 9000,
                range_end: 9010,
                reserved: vec![],
            },
        );
        store
            .create("alice", 9000, tmp.path().join("alice"), app_dir)
            .unwrap();

        let app = AppConfig {
            install_command: install_command.into_iter().map(String::from).collect(),
            install_timeout_secs: 30,
            ..AppConfig::default()
        };
        let installer = Installer::new(store.clone(), app);
        (tmp, store, installer)
    }

    #[tokio::test]
    async fn test_install_runs_command_and_creates_dirs() {
        let (tmp, store, installer) = setup(vec!["mkdir", "node_modules"]);
        let status = installer.install("alice").await.unwrap();
        assert_eq!(status, InstallStatus::Installed);

        let instance = store.get("alice").unwrap();
        assert_eq!(instance.install_status, InstallStatus::Installed);
        assert!(instance.fault.is_none());
        assert!(tmp.path().join("alice/app-data").is_dir());
        assert!(tmp.path().join("alice/logs").is_dir());
        assert!(tmp.path().join("app/node_modules").is_dir());
    }

    #[tokio::test]
    async fn test_concurrent_install_rejected() {
        let (_tmp, store, installer) = setup(vec!["sh", "-c", "sleep 1 && mkdir node_modules"]);
        let (first, second) = tokio::join!(installer.install("alice"), installer.install("alice"));

        assert_eq!(first.unwrap(), InstallStatus::Installed);
        assert!(matches!(second, Err(Error::InstanceActive { .. })));
        assert_eq!(
            store.get("alice").unwrap().install_status,
            InstallStatus::Installed
        );
    }

    #[tokio::test]
    async fn test_install_failure_recorded() {
        let (_tmp, store, installer) = setup(vec!["false"]);
        let err = installer.install("alice").await.unwrap_err();
        assert!(matches!(err, Error::InstallFailed(_)));

        let instance = store.get("alice").unwrap();
        assert_eq!(instance.install_status, InstallStatus::Failed);
        assert!(instance.fault.is_some());
    }

    #[tokio::test]
    async fn test_install_skips_command_when_dependencies_present() {
        let (tmp, _store, installer) = setup(vec!["/nonexistent/npm"]);
        std::fs::create_dir_all(tmp.path().join("app/node_modules")).unwrap();
        assert_eq!(
            installer.install("alice").await.unwrap(),
            InstallStatus::Installed
        );
    }

    #[tokio::test]
    async fn test_missing_entry_file() {
        let (tmp, store, installer) = setup(vec!["true"]);
        std::fs::remove_file(tmp.path().join("app/server.js")).unwrap();
        assert!(matches!(
            installer.install("alice").await,
            Err(Error::BinaryMissing(_))
        ));
        assert_eq!(
            store.get("alice").unwrap().install_status,
            InstallStatus::Failed
        );
    }
}
