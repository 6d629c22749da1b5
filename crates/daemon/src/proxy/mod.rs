//! Reverse-proxy configuration management
//!
//! The manager is the single writer of the active proxy config file. Both
//! regeneration and repair go through the same activation sequence:
//!
//! 1. write `<active>.candidate`
//! 2. validate the candidate (rejected: delete it, active untouched)
//! 3. keep a copy of the active file
//! 4. rename the candidate over the active file
//! 5. reload; on failure rename the copy back and reload again

pub mod controller;
pub mod repair;
pub mod synth;

pub use controller::{NginxController, ProxyController};
pub use synth::{ProxyRoute, Rendered, Synthesizer};

use crate::config::ProxyConfig;
use crate::state::InstanceStore;
use repair::{DuplicateDirective, StaleUpstream};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tenantmux_common::{types::*, Error, Result};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pause after a route change so bursts of transitions cause one reload
const SYNC_DEBOUNCE: Duration = Duration::from_millis(250);

/// Result of a regeneration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum SyncReport {
    /// Rendered text equals the active file; nothing reloaded
    Unchanged { snapshot_hash: String },
    Activated {
        config_id: i64,
        snapshot_hash: String,
        routes: usize,
    },
}

/// Result of a repair pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairReport {
    pub path: PathBuf,
    pub duplicates_removed: Vec<DuplicateDirective>,
    pub stale_upstreams: Vec<StaleUpstream>,
    pub dry_run: bool,
    /// Whether the file on disk was replaced
    pub written: bool,
    pub backup_path: Option<PathBuf>,
}

/// Current proxy config state for operators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyStatus {
    pub path: PathBuf,
    pub active: Option<GeneratedConfig>,
    pub current_snapshot_hash: String,
    pub in_sync: bool,
    pub routes: Vec<ProxyRoute>,
}

/// Owns the active proxy config file
pub struct ProxyManager {
    store: InstanceStore,
    synth: Synthesizer,
    controller: Arc<dyn ProxyController>,
    active_path: PathBuf,
    default_title: String,
    root_port: Option<u16>,
    write_lock: Mutex<()>,
}

impl ProxyManager {
    pub fn new(
        store: InstanceStore,
        cfg: &ProxyConfig,
        original_title: &str,
        controller: Arc<dyn ProxyController>,
    ) -> Self {
        Self {
            store,
            synth: Synthesizer::new(cfg.clone(), original_title),
            controller,
            active_path: cfg.active_config_path.clone(),
            default_title: cfg.site_title.clone(),
            root_port: cfg.root_upstream_port(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn active_path(&self) -> &Path {
        &self.active_path
    }

    /// Branding override, else the configured default
    pub fn site_title(&self) -> Result<String> {
        Ok(self
            .store
            .site_title()?
            .unwrap_or_else(|| self.default_title.clone()))
    }

    pub fn render(&self) -> Result<Rendered> {
        let instances = self.store.list()?;
        self.synth.render(&instances, &self.site_title()?)
    }

    pub async fn status(&self) -> Result<ProxyStatus> {
        let rendered = self.render()?;
        let on_disk = read_optional(&self.active_path).await?;
        Ok(ProxyStatus {
            path: self.active_path.clone(),
            active: self.store.db().active_config()?,
            in_sync: on_disk.as_deref() == Some(rendered.text.as_str()),
            current_snapshot_hash: rendered.snapshot_hash,
            routes: rendered.routes,
        })
    }

    /// Render from the store and activate if the text changed
    pub async fn regenerate(&self) -> Result<SyncReport> {
        let _guard = self.write_lock.lock().await;
        let rendered = self.render()?;

        let on_disk = read_optional(&self.active_path).await?;
        if on_disk.as_deref() == Some(rendered.text.as_str()) {
            debug!(hash = %rendered.snapshot_hash, "Proxy config unchanged");
            return Ok(SyncReport::Unchanged {
                snapshot_hash: rendered.snapshot_hash,
            });
        }

        let db = self.store.db();
        let path = self.active_path.display().to_string();
        let id = db.insert_generated_config(&rendered.snapshot_hash, &path, false)?;
        if let Err(e) = self.activate(&self.active_path, &rendered.text, None).await {
            // A reload failure means the candidate already passed validation
            let recorded = match e {
                Error::ReloadFailed { .. } => db.mark_config_validated(id),
                _ => Ok(()),
            }
            .and_then(|()| db.mark_config_failed(id, &e.to_string()));
            if let Err(db_err) = recorded {
                error!(config_id = id, "Failed to record rollback reason: {}", db_err);
            }
            return Err(e);
        }
        db.mark_config_validated(id)?;
        db.mark_config_active(id)?;

        info!(
            config_id = id,
            hash = %rendered.snapshot_hash,
            routes = rendered.routes.len(),
            "Activated proxy config"
        );
        Ok(SyncReport::Activated {
            config_id: id,
            snapshot_hash: rendered.snapshot_hash,
            routes: rendered.routes.len(),
        })
    }

    /// Repair the active config file
    pub async fn repair(&self, dry_run: bool) -> Result<RepairReport> {
        let path = self.active_path.clone();
        self.repair_file(&path, dry_run).await
    }

    /// Remove duplicate directives from `path` and report stale upstreams
    pub async fn repair_file(&self, path: &Path, dry_run: bool) -> Result<RepairReport> {
        let _guard = self.write_lock.lock().await;
        let original = tokio::fs::read_to_string(path).await?;

        let mut live: HashSet<u16> = self.store.running()?.iter().map(|i| i.port).collect();
        live.extend(self.root_port);
        let analysis = repair::analyze(&original, &live)?;

        for stale in &analysis.stale_upstreams {
            warn!(
                block = %stale.block,
                line = stale.line,
                port = stale.port,
                "Upstream {} matches no running instance",
                stale.target
            );
        }

        let mut report = RepairReport {
            path: path.to_path_buf(),
            duplicates_removed: analysis.duplicates.clone(),
            stale_upstreams: analysis.stale_upstreams.clone(),
            dry_run,
            written: false,
            backup_path: None,
        };
        if analysis.is_clean() || dry_run {
            return Ok(report);
        }

        let repaired = analysis.apply(&original);
        let backup = backup_path(path).await?;
        self.activate(path, &repaired, Some(&backup)).await?;

        info!(
            path = %path.display(),
            removed = analysis.duplicates.len(),
            backup = %backup.display(),
            "Repaired proxy config"
        );
        report.written = true;
        report.backup_path = Some(backup);
        Ok(report)
    }

    /// Validate `text`, swap it in at `path` and reload, restoring the
    /// previous file if the reload fails.
    ///
    /// With `keep_backup` the previous file is kept at that path afterwards.
    async fn activate(&self, path: &Path, text: &str, keep_backup: Option<&Path>) -> Result<()> {
        let candidate = sibling(path, "candidate");
        tokio::fs::write(&candidate, text).await?;

        if let Err(e) = self.controller.validate(&candidate).await {
            let _ = tokio::fs::remove_file(&candidate).await;
            warn!(path = %path.display(), "Candidate proxy config rejected: {}", e);
            return Err(match e {
                Error::ValidationFailed(_) => e,
                other => Error::ValidationFailed(other.to_string()),
            });
        }

        let rollback = keep_backup
            .map(Path::to_path_buf)
            .unwrap_or_else(|| sibling(path, "rollback"));
        let had_previous = tokio::fs::try_exists(path).await?;
        if had_previous {
            tokio::fs::copy(path, &rollback).await?;
        }
        tokio::fs::rename(&candidate, path).await?;

        match self.controller.reload().await {
            Ok(()) => {
                if had_previous && keep_backup.is_none() {
                    let _ = tokio::fs::remove_file(&rollback).await;
                }
                Ok(())
            }
            Err(e) => {
                error!(path = %path.display(), "Proxy reload failed, rolling back: {}", e);
                self.restore(path, &rollback, had_previous, keep_backup.is_some())
                    .await?;
                if let Err(again) = self.controller.reload().await {
                    error!("Reload after rollback also failed: {}", again);
                }
                Err(match e {
                    Error::ReloadFailed { .. } => e,
                    other => Error::ReloadFailed {
                        detail: other.to_string(),
                    },
                })
            }
        }
    }

    async fn restore(&self, path: &Path, saved: &Path, had_previous: bool, keep_saved: bool) -> Result<()> {
        if !had_previous {
            tokio::fs::remove_file(path).await?;
            return Ok(());
        }
        if keep_saved {
            // The backup stays; restore through a temp copy so the swap is still a rename
            let tmp = sibling(path, "restore");
            tokio::fs::copy(saved, &tmp).await?;
            tokio::fs::rename(&tmp, path).await?;
        } else {
            tokio::fs::rename(saved, path).await?;
        }
        Ok(())
    }

    /// Regenerate on every route change and on a fixed interval until
    /// `cancel` fires
    pub async fn run_sync(
        self: Arc<Self>,
        changes: Arc<Notify>,
        interval: Duration,
        cancel: CancellationToken,
    ) {
        info!("Proxy sync started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = changes.notified() => tokio::time::sleep(SYNC_DEBOUNCE).await,
                _ = tokio::time::sleep(interval) => {}
            }
            if cancel.is_cancelled() {
                break;
            }
            match self.regenerate().await {
                Ok(SyncReport::Activated { routes, .. }) => {
                    debug!("Proxy sync activated config with {} routes", routes)
                }
                Ok(SyncReport::Unchanged { .. }) => {}
                Err(e) => error!(kind = %e.kind(), "Proxy sync failed: {}", e),
            }
        }
        info!("Proxy sync stopped");
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// Fresh backup path; never reuses an existing file
async fn backup_path(path: &Path) -> Result<PathBuf> {
    let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S%.3f").to_string();
    let mut backup = sibling(path, &format!("bak.{}", stamp));
    let mut n = 1;
    while tokio::fs::try_exists(&backup).await? {
        backup = sibling(path, &format!("bak.{}.{}", stamp, n));
        n += 1;
    }
    Ok(backup)
}

async fn read_optional(path: &Path) -> Result<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::controller::fake::FakeController;
    use super::*;
    use crate::config::PortConfig;
    use crate::supervisor::SupervisorToken;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;
    use tenantmux_common::Database;

    struct Fixture {
        tmp: TempDir,
        store: InstanceStore,
        controller: Arc<FakeController>,
        manager: ProxyManager,
    }

    impl Fixture {
        fn active(&self) -> PathBuf {
            self.tmp.path().join("tenantmux.conf")
        }

        fn running(&self, tenant: &str) {
            let port = self.store.allocate_port().unwrap();
            self.store
                .create(tenant, port, self.tmp.path().join(tenant), self.tmp.path().join("app"))
                .unwrap();
            let token = SupervisorToken::for_tests();
            self.store
                .set_observed_state(&token, tenant, ObservedState::Running)
                .unwrap();
        }

        fn leftovers(&self) -> Vec<String> {
            let mut names: Vec<String> = std::fs::read_dir(self.tmp.path())
                .unwrap()
                .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
                .filter(|n| n.starts_with("tenantmux.conf."))
                .collect();
            names.sort();
            names
        }
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let mut cfg = ProxyConfig::default();
        cfg.active_config_path = tmp.path().join("tenantmux.conf");
        let ports = PortConfig {
            range_start: 8001,
            range_end: 8099,
            reserved: vec![],
        };
        let store = InstanceStore::new(Database::open_memory().unwrap(), ports);
        let controller = Arc::new(FakeController::default());
        let manager = ProxyManager::new(store.clone(), &cfg, "SillyTavern", controller.clone());
        Fixture {
            tmp,
            store,
            controller,
            manager,
        }
    }

    #[tokio::test]
    async fn test_regenerate_activates_then_skips_unchanged() {
        let fx = fixture();
        fx.running("alice");

        let report = fx.manager.regenerate().await.unwrap();
        assert!(matches!(report, SyncReport::Activated { routes: 1, .. }));
        assert_eq!(fx.controller.reload_count(), 1);
        let text = std::fs::read_to_string(fx.active()).unwrap();
        assert!(text.contains("/alice/app/"));
        assert!(fx.leftovers().is_empty());

        let active = fx.store.db().active_config().unwrap().unwrap();
        assert!(active.validated && active.active);

        let again = fx.manager.regenerate().await.unwrap();
        assert!(matches!(again, SyncReport::Unchanged { .. }));
        assert_eq!(fx.controller.reload_count(), 1);
        assert!(fx.manager.status().await.unwrap().in_sync);
    }

    #[tokio::test]
    async fn test_status_decodes_from_json() {
        let fx = fixture();
        fx.running("alice");
        fx.manager.regenerate().await.unwrap();

        let status = fx.manager.status().await.unwrap();
        let json = serde_json::to_string(&status).unwrap();
        let decoded: ProxyStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.routes, status.routes);
        assert_eq!(decoded.routes[0].tenant_id, "alice");
        assert!(decoded.in_sync);
    }

    #[tokio::test]
    async fn test_rejected_candidate_leaves_active_untouched() {
        let fx = fixture();
        fx.running("alice");
        fx.manager.regenerate().await.unwrap();
        let before = std::fs::read(fx.active()).unwrap();

        fx.running("bob");
        fx.controller.reject.store(true, Ordering::SeqCst);
        let err = fx.manager.regenerate().await.unwrap_err();
        assert!(matches!(err, Error::ValidationFailed(_)));

        assert_eq!(std::fs::read(fx.active()).unwrap(), before);
        assert_eq!(fx.controller.reload_count(), 1);
        assert!(fx.leftovers().is_empty());
        let configs = fx.store.db().list_generated_configs(10).unwrap();
        assert_eq!(configs.iter().filter(|c| c.active).count(), 1);
        assert!(!configs[0].validated);
        assert!(configs[0].rollback_reason.is_some());
    }

    #[tokio::test]
    async fn test_reload_failure_restores_exact_previous_file() {
        let fx = fixture();
        fx.running("alice");
        fx.manager.regenerate().await.unwrap();
        let before = std::fs::read(fx.active()).unwrap();
        let active_before = fx.store.db().active_config().unwrap();

        fx.running("bob");
        fx.controller.failing_reloads.store(1, Ordering::SeqCst);
        let err = fx.manager.regenerate().await.unwrap_err();
        assert!(matches!(err, Error::ReloadFailed { .. }));
        assert!(matches!(
            OperationOutcome::from(&err),
            OperationOutcome::RolledBack { .. }
        ));

        assert_eq!(std::fs::read(fx.active()).unwrap(), before);
        // Failed reload, then the reload of the restored file
        assert_eq!(fx.controller.reload_count(), 3);
        assert_eq!(fx.store.db().active_config().unwrap(), active_before);
        assert!(fx.leftovers().is_empty());

        let failed = &fx.store.db().list_generated_configs(1).unwrap()[0];
        assert!(!failed.active);
        assert!(failed.validated);
        assert_eq!(failed.rollback_reason.as_deref(), Some(err.to_string().as_str()));
    }

    #[tokio::test]
    async fn test_reload_failure_without_previous_removes_file() {
        let fx = fixture();
        fx.controller.failing_reloads.store(1, Ordering::SeqCst);
        assert!(fx.manager.regenerate().await.is_err());
        assert!(!fx.active().exists());
    }

    #[tokio::test]
    async fn test_branding_change_regenerates() {
        let fx = fixture();
        fx.running("alice");
        fx.manager.regenerate().await.unwrap();

        fx.store.set_site_title(Some("Night Owls")).unwrap();
        let report = fx.manager.regenerate().await.unwrap();
        assert!(matches!(report, SyncReport::Activated { .. }));
        let text = std::fs::read_to_string(fx.active()).unwrap();
        assert!(text.contains("<title>Night Owls</title>"));
    }

    const TRIPLED: &str = "server {\n    listen 80;\n\n    location ^~ /alice/app/ {\n        proxy_pass http://127.0.0.1:8001;\n        proxy_set_header Host $host;\n        proxy_set_header Host $host;\n        proxy_set_header Host $host;\n    }\n\n    location ^~ /bob/app/ {\n        proxy_pass http://127.0.0.1:8002;\n    }\n}\n";

    #[tokio::test]
    async fn test_repair_removes_duplicates_and_keeps_backup() {
        let fx = fixture();
        fx.running("alice");
        fx.running("bob");
        std::fs::write(fx.active(), TRIPLED).unwrap();

        let report = fx.manager.repair(false).await.unwrap();
        assert_eq!(report.duplicates_removed.len(), 2);
        assert!(report.written);
        assert!(report.stale_upstreams.is_empty());

        let repaired = std::fs::read_to_string(fx.active()).unwrap();
        assert_eq!(repaired.matches("proxy_set_header Host $host;").count(), 1);
        let bob = &TRIPLED[TRIPLED.find("    location ^~ /bob/app/").unwrap()..];
        assert!(repaired.ends_with(bob));

        let backup = report.backup_path.unwrap();
        assert_eq!(std::fs::read_to_string(backup).unwrap(), TRIPLED);
        assert_eq!(fx.controller.reload_count(), 1);
    }

    #[tokio::test]
    async fn test_back_to_back_repairs_keep_every_backup() {
        let fx = fixture();
        fx.running("alice");
        fx.running("bob");

        std::fs::write(fx.active(), TRIPLED).unwrap();
        let first = fx.manager.repair(false).await.unwrap().backup_path.unwrap();
        std::fs::write(fx.active(), TRIPLED).unwrap();
        let second = fx.manager.repair(false).await.unwrap().backup_path.unwrap();

        assert_ne!(first, second);
        assert_eq!(std::fs::read_to_string(first).unwrap(), TRIPLED);
        assert_eq!(std::fs::read_to_string(second).unwrap(), TRIPLED);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_sync_stops_on_cancel() {
        let fx = fixture();
        let manager = Arc::new(fx.manager);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(manager.clone().run_sync(
            Arc::new(Notify::new()),
            Duration::from_secs(5),
            cancel.clone(),
        ));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sync loop should stop on cancel")
            .unwrap();
        assert_eq!(fx.controller.reload_count(), 0);
    }

    #[tokio::test]
    async fn test_repair_dry_run_and_stale_warning() {
        let fx = fixture();
        fx.running("alice");
        std::fs::write(fx.active(), TRIPLED).unwrap();

        let report = fx.manager.repair(true).await.unwrap();
        assert!(!report.written);
        assert_eq!(report.duplicates_removed.len(), 2);
        // bob is not running, so 8002 is stale
        assert_eq!(report.stale_upstreams.len(), 1);
        assert_eq!(report.stale_upstreams[0].port, 8002);
        assert_eq!(std::fs::read_to_string(fx.active()).unwrap(), TRIPLED);
        assert_eq!(fx.controller.reload_count(), 0);
    }

    #[tokio::test]
    async fn test_repair_rolls_back_on_reload_failure() {
        let fx = fixture();
        std::fs::write(fx.active(), TRIPLED).unwrap();
        fx.controller.failing_reloads.store(1, Ordering::SeqCst);

        let err = fx.manager.repair(false).await.unwrap_err();
        assert!(matches!(err, Error::ReloadFailed { .. }));
        assert_eq!(std::fs::read_to_string(fx.active()).unwrap(), TRIPLED);
    }
}
