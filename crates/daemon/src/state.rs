//! Instance record store
//!
//! Single owner of desired and observed instance state. Observed-state
//! writes require a [`SupervisorToken`], which only the supervisor can mint.

use crate::config::{validate_site_title, DaemonConfig, PortConfig};
use crate::supervisor::SupervisorToken;
use std::path::PathBuf;
use tenantmux_common::{
    db::Database, types::*, Error, Result,
};
use tracing::{debug, info};

const SITE_TITLE_KEY: &str = "site_title";

/// Durable store for tenant instances
#[derive(Clone)]
pub struct InstanceStore {
    db: Database,
    ports: PortConfig,
}

impl InstanceStore {
    /// Open the store described by the daemon config
    pub fn open(config: &DaemonConfig) -> Result<Self> {
        let db = Database::open(config.db_path())?;
        Ok(Self::new(db, config.ports.clone()))
    }

    pub fn new(db: Database, ports: PortConfig) -> Self {
        Self { db, ports }
    }

    /// Get database
    pub fn db(&self) -> &Database {
        &self.db
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Get an instance by tenant id
    pub fn get(&self, tenant_id: &str) -> Result<Instance> {
        self.db
            .get_instance(tenant_id)?
            .ok_or_else(|| Error::NotFound(tenant_id.to_string()))
    }

    /// List all instances, ascending by tenant id
    pub fn list(&self) -> Result<Vec<Instance>> {
        self.db.list_instances()
    }

    /// Instances the supervisor has confirmed running
    pub fn running(&self) -> Result<Vec<Instance>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(Instance::is_running)
            .collect())
    }

    // ========================================================================
    // Provisioning
    // ========================================================================

    /// Reserve a free port from the pool
    pub fn allocate_port(&self) -> Result<u16> {
        self.db
            .allocate_port(self.ports.range(), &self.ports.reserved_set())
    }

    /// Give back a port reserved by [`allocate_port`](Self::allocate_port)
    pub fn release_port(&self, port: u16) -> Result<()> {
        self.db.release_port(port)?;
        Ok(())
    }

    /// Create an instance record with install_status=not_installed
    pub fn create(
        &self,
        tenant_id: &str,
        port: u16,
        data_dir: PathBuf,
        app_dir: PathBuf,
    ) -> Result<Instance> {
        validate_tenant_id(tenant_id)?;
        if !self.ports.is_assignable(port) {
            return Err(Error::PortOutOfPool(port));
        }

        let now = chrono::Utc::now().timestamp();
        let instance = Instance {
            tenant_id: tenant_id.to_string(),
            port,
            data_dir,
            app_dir,
            install_status: InstallStatus::NotInstalled,
            desired_state: DesiredState::Stopped,
            observed_state: ObservedState::Stopped,
            restart_count: 0,
            last_restart_at: None,
            pid: None,
            fault: None,
            created_at: now,
            updated_at: now,
        };

        self.db.insert_instance(&instance)?;
        info!(tenant_id, port, "Created instance");
        Ok(instance)
    }

    /// Allocate a port and create the record; the reservation is released
    /// if the record cannot be created.
    pub fn provision(&self, tenant_id: &str, data_dir: PathBuf, app_dir: PathBuf) -> Result<Instance> {
        validate_tenant_id(tenant_id)?;
        let port = self.allocate_port()?;
        match self.create(tenant_id, port, data_dir, app_dir) {
            Ok(instance) => Ok(instance),
            Err(e) => {
                self.release_port(port)?;
                Err(e)
            }
        }
    }

    /// Remove a stopped instance record
    pub fn delete(&self, tenant_id: &str) -> Result<()> {
        let instance = self.get(tenant_id)?;
        if instance.observed_state != ObservedState::Stopped
            || instance.desired_state != DesiredState::Stopped
        {
            return Err(Error::InstanceActive {
                tenant: tenant_id.to_string(),
                state: instance.observed_state.to_string(),
            });
        }
        self.db.delete_instance(tenant_id)?;
        info!(tenant_id, "Deleted instance record");
        Ok(())
    }

    // ========================================================================
    // Operator-owned fields
    // ========================================================================

    pub fn set_desired_state(&self, tenant_id: &str, state: DesiredState) -> Result<()> {
        debug!(tenant_id, desired = %state, "Desired state change");
        self.db.set_desired_state(tenant_id, state)
    }

    pub fn set_install_status(&self, tenant_id: &str, status: InstallStatus) -> Result<()> {
        debug!(tenant_id, install_status = %status, "Install status change");
        self.db.set_install_status(tenant_id, status)
    }

    /// Claim the instance for an install.
    ///
    /// Fails with `InstanceActive` while the instance is not stopped or
    /// another install is in progress.
    pub fn begin_install(&self, tenant_id: &str) -> Result<()> {
        if self.db.begin_install(tenant_id)? {
            debug!(tenant_id, "Install status change to installing");
            return Ok(());
        }
        let instance = self.get(tenant_id)?;
        let state = if instance.install_status == InstallStatus::Installing {
            InstallStatus::Installing.to_string()
        } else {
            instance.observed_state.to_string()
        };
        Err(Error::InstanceActive {
            tenant: tenant_id.to_string(),
            state,
        })
    }

    /// Fail installs a previous daemon left in `installing`
    pub fn fail_interrupted_installs(&self) -> Result<usize> {
        self.db
            .fail_interrupted_installs("install interrupted by daemon restart")
    }

    pub fn set_fault(&self, tenant_id: &str, fault: &str) -> Result<()> {
        self.db.set_fault(tenant_id, Some(fault))
    }

    pub fn clear_fault(&self, tenant_id: &str) -> Result<()> {
        self.db.set_fault(tenant_id, None)
    }

    // ========================================================================
    // Supervisor-owned fields
    // ========================================================================

    pub fn set_observed_state(
        &self,
        _token: &SupervisorToken,
        tenant_id: &str,
        state: ObservedState,
    ) -> Result<()> {
        self.db.set_observed_state(tenant_id, state)
    }

    pub fn set_pid(&self, _token: &SupervisorToken, tenant_id: &str, pid: Option<u32>) -> Result<()> {
        self.db.set_pid(tenant_id, pid)
    }

    /// Count a restart and return the new restart_count
    pub fn record_restart(&self, _token: &SupervisorToken, tenant_id: &str) -> Result<u32> {
        self.db
            .record_restart(tenant_id, chrono::Utc::now().timestamp())
    }

    pub fn reset_restart_count(&self, _token: &SupervisorToken, tenant_id: &str) -> Result<()> {
        self.db.reset_restart_count(tenant_id)
    }

    /// Forget every observed state; used once at supervisor startup
    pub fn reset_observed_states(&self, _token: &SupervisorToken) -> Result<usize> {
        self.db.reset_observed_states()
    }

    // ========================================================================
    // Settings
    // ========================================================================

    /// Branding override, if an operator set one
    pub fn site_title(&self) -> Result<Option<String>> {
        self.db.kv_get(SITE_TITLE_KEY)
    }

    /// Set or clear the branding override
    pub fn set_site_title(&self, title: Option<&str>) -> Result<()> {
        match title {
            Some(title) => {
                validate_site_title(title)?;
                self.db.kv_set(SITE_TITLE_KEY, title)
            }
            None => self.db.kv_delete(SITE_TITLE_KEY),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn store(range_start: u16, range_end: u16) -> InstanceStore {
        let ports = PortConfig {
            range_start,
            range_end,
            reserved: vec![],
        };
        InstanceStore::new(Database::open_memory().unwrap(), ports)
    }

    fn dirs(tenant: &str) -> (PathBuf, PathBuf) {
        (PathBuf::from(format!("/data/{tenant}")), PathBuf::from("/opt/app"))
    }

    #[test]
    fn test_create_and_get() {
        let store = store(9000, 9010);
        let (data, app) = dirs("alice");
        let created = store.create("alice", 9000, data, app).unwrap();
        assert_eq!(created.install_status, InstallStatus::NotInstalled);
        assert_eq!(store.get("alice").unwrap(), created);
        assert!(matches!(store.get("nobody"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_create_rejects_bad_input() {
        let store = store(9000, 9010);
        let (data, app) = dirs("x");
        assert!(matches!(
            store.create("../etc", 9000, data.clone(), app.clone()),
            Err(Error::InvalidTenantId(_))
        ));
        assert!(matches!(
            store.create("alice", 80, data, app),
            Err(Error::PortOutOfPool(80))
        ));
    }

    #[test]
    fn test_provision_releases_port_on_conflict() {
        let store = store(9000, 9001);
        let (data, app) = dirs("alice");
        let alice = store.provision("alice", data.clone(), app.clone()).unwrap();
        assert_eq!(alice.port, 9000);

        // Same data dir: record creation fails and the reservation is given back
        assert!(matches!(
            store.provision("bob", data, app.clone()),
            Err(Error::DuplicateDataDir(_))
        ));
        let (data, _) = dirs("carol");
        assert_eq!(store.provision("carol", data, app).unwrap().port, 9001);
    }

    #[test]
    fn test_pool_exhausted() {
        let store = store(9000, 9000);
        store.allocate_port().unwrap();
        assert!(matches!(store.allocate_port(), Err(Error::PoolExhausted)));
    }

    #[test]
    fn test_concurrent_allocation_never_duplicates() {
        let store = Arc::new(store(10000, 10199));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                (0..25)
                    .map(|_| store.allocate_port().unwrap())
                    .collect::<Vec<_>>()
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for port in handle.join().unwrap() {
                assert!(seen.insert(port), "port {port} handed out twice");
            }
        }
        assert_eq!(seen.len(), 200);
        assert!(matches!(store.allocate_port(), Err(Error::PoolExhausted)));
    }

    #[test]
    fn test_delete_requires_stopped() {
        let store = store(9000, 9010);
        let (data, app) = dirs("alice");
        store.create("alice", 9000, data, app).unwrap();
        store.set_desired_state("alice", DesiredState::Running).unwrap();
        assert!(matches!(
            store.delete("alice"),
            Err(Error::InstanceActive { .. })
        ));

        store.set_desired_state("alice", DesiredState::Stopped).unwrap();
        store.delete("alice").unwrap();
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_site_title_setting() {
        let store = store(9000, 9010);
        assert_eq!(store.site_title().unwrap(), None);
        store.set_site_title(Some("My Tavern")).unwrap();
        assert_eq!(store.site_title().unwrap().as_deref(), Some("My Tavern"));
        store.set_site_title(None).unwrap();
        assert_eq!(store.site_title().unwrap(), None);

        assert!(store.set_site_title(Some("$host")).is_err());
        assert!(store.set_site_title(Some("  ")).is_err());
    }

    #[test]
    fn test_persists_across_reopen() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("state.db");
        let ports = PortConfig {
            range_start: 9000,
            range_end: 9010,
            reserved: vec![],
        };
        {
            let store = InstanceStore::new(Database::open(&path).unwrap(), ports.clone());
            let (data, app) = dirs("alice");
            store.provision("alice", data, app).unwrap();
        }
        let store = InstanceStore::new(Database::open(&path).unwrap(), ports);
        assert_eq!(store.get("alice").unwrap().port, 9000);
    }
}
