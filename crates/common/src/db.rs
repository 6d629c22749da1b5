//! SQLite database for tenantmux state persistence

use crate::types::{DesiredState, GeneratedConfig, InstallStatus, Instance, ObservedState};
use crate::{Error, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const INSTANCE_COLUMNS: &str = "tenant_id, port, data_dir, app_dir, install_status, desired_state, \
     observed_state, restart_count, last_restart_at, pid, fault, created_at, updated_at";

/// Database wrapper for state persistence
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        info!("Opened database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            -- One row per tenant instance
            CREATE TABLE IF NOT EXISTS instances (
                tenant_id TEXT PRIMARY KEY,
                port INTEGER NOT NULL UNIQUE,
                data_dir TEXT NOT NULL UNIQUE,
                app_dir TEXT NOT NULL,
                install_status TEXT NOT NULL DEFAULT 'not_installed',
                desired_state TEXT NOT NULL DEFAULT 'stopped',
                observed_state TEXT NOT NULL DEFAULT 'stopped',
                restart_count INTEGER NOT NULL DEFAULT 0,
                last_restart_at INTEGER,
                pid INTEGER,
                fault TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            -- Ports handed out by allocate_port but not yet bound to an instance
            CREATE TABLE IF NOT EXISTS port_reservations (
                port INTEGER PRIMARY KEY,
                reserved_at INTEGER NOT NULL
            );

            -- Rendered proxy configurations
            CREATE TABLE IF NOT EXISTS generated_configs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                generated_at INTEGER NOT NULL,
                snapshot_hash TEXT NOT NULL,
                validated INTEGER NOT NULL DEFAULT 0,
                active INTEGER NOT NULL DEFAULT 0,
                path TEXT NOT NULL,
                rollback_reason TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_generated_configs_active ON generated_configs(active);

            -- Key-value store for misc state
            CREATE TABLE IF NOT EXISTS kv_store (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    // ========================================================================
    // Instances
    // ========================================================================

    /// Insert a new instance, consuming any reservation held for its port.
    pub fn insert_instance(&self, instance: &Instance) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let data_dir = path_str(&instance.data_dir);

        let tenant_taken: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM instances WHERE tenant_id = ?1)",
            params![instance.tenant_id],
            |row| row.get(0),
        )?;
        if tenant_taken {
            return Err(Error::DuplicateTenant(instance.tenant_id.clone()));
        }

        let port_taken: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM instances WHERE port = ?1)",
            params![instance.port],
            |row| row.get(0),
        )?;
        if port_taken {
            return Err(Error::DuplicatePort(instance.port));
        }

        let dir_taken: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM instances WHERE data_dir = ?1)",
            params![data_dir],
            |row| row.get(0),
        )?;
        if dir_taken {
            return Err(Error::DuplicateDataDir(data_dir));
        }

        tx.execute(
            &format!(
                "INSERT INTO instances ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                INSTANCE_COLUMNS
            ),
            params![
                instance.tenant_id,
                instance.port,
                data_dir,
                path_str(&instance.app_dir),
                instance.install_status.as_str(),
                instance.desired_state.as_str(),
                instance.observed_state.as_str(),
                instance.restart_count,
                instance.last_restart_at,
                instance.pid,
                instance.fault,
                instance.created_at,
                instance.updated_at,
            ],
        )?;
        tx.execute(
            "DELETE FROM port_reservations WHERE port = ?1",
            params![instance.port],
        )?;
        tx.commit()?;

        debug!("Inserted instance {} on port {}", instance.tenant_id, instance.port);
        Ok(())
    }

    /// Get an instance by tenant id
    pub fn get_instance(&self, tenant_id: &str) -> Result<Option<Instance>> {
        let conn = self.conn.lock();

        let row = conn
            .query_row(
                &format!("SELECT {} FROM instances WHERE tenant_id = ?1", INSTANCE_COLUMNS),
                params![tenant_id],
                RawInstance::from_row,
            )
            .optional()?;

        row.map(RawInstance::parse).transpose()
    }

    /// List all instances ordered by tenant id
    pub fn list_instances(&self) -> Result<Vec<Instance>> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM instances ORDER BY tenant_id ASC",
            INSTANCE_COLUMNS
        ))?;
        let rows = stmt.query_map([], RawInstance::from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?.parse()?);
        }
        Ok(results)
    }

    pub fn set_desired_state(&self, tenant_id: &str, state: DesiredState) -> Result<()> {
        self.update_instance(
            tenant_id,
            "desired_state = ?1",
            params![state.as_str(), now(), tenant_id],
        )
    }

    pub fn set_observed_state(&self, tenant_id: &str, state: ObservedState) -> Result<()> {
        self.update_instance(
            tenant_id,
            "observed_state = ?1",
            params![state.as_str(), now(), tenant_id],
        )
    }

    pub fn set_install_status(&self, tenant_id: &str, status: InstallStatus) -> Result<()> {
        self.update_instance(
            tenant_id,
            "install_status = ?1",
            params![status.as_str(), now(), tenant_id],
        )
    }

    /// Move a stopped, not-installing instance to `installing`.
    ///
    /// Returns false when another install holds it or the instance is not stopped.
    pub fn begin_install(&self, tenant_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE instances SET install_status = 'installing', updated_at = ?1
             WHERE tenant_id = ?2 AND install_status != 'installing' AND observed_state = 'stopped'",
            params![now(), tenant_id],
        )?;
        Ok(rows > 0)
    }

    /// Fail every install left in `installing`; returns how many rows changed
    pub fn fail_interrupted_installs(&self, fault: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE instances SET install_status = 'failed', fault = ?1, updated_at = ?2
             WHERE install_status = 'installing'",
            params![fault, now()],
        )?;
        Ok(rows)
    }

    pub fn set_fault(&self, tenant_id: &str, fault: Option<&str>) -> Result<()> {
        self.update_instance(tenant_id, "fault = ?1", params![fault, now(), tenant_id])
    }

    pub fn set_pid(&self, tenant_id: &str, pid: Option<u32>) -> Result<()> {
        self.update_instance(tenant_id, "pid = ?1", params![pid, now(), tenant_id])
    }

    /// Bump the restart counter and return its new value
    pub fn record_restart(&self, tenant_id: &str, at: i64) -> Result<u32> {
        let conn = self.conn.lock();
        let count: Option<u32> = conn
            .query_row(
                "UPDATE instances SET restart_count = restart_count + 1, last_restart_at = ?1, updated_at = ?2
                 WHERE tenant_id = ?3 RETURNING restart_count",
                params![at, now(), tenant_id],
                |row| row.get(0),
            )
            .optional()?;
        count.ok_or_else(|| Error::NotFound(tenant_id.to_string()))
    }

    pub fn reset_restart_count(&self, tenant_id: &str) -> Result<()> {
        self.update_instance(
            tenant_id,
            "restart_count = 0, last_restart_at = ?1",
            params![None::<i64>, now(), tenant_id],
        )
    }

    /// Mark every instance stopped; returns how many rows changed
    pub fn reset_observed_states(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE instances SET observed_state = 'stopped', updated_at = ?1 WHERE observed_state != 'stopped'",
            params![now()],
        )?;
        Ok(rows)
    }

    /// Delete an instance row
    pub fn delete_instance(&self, tenant_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM instances WHERE tenant_id = ?1", params![tenant_id])?;

        if rows > 0 {
            debug!("Deleted instance {}", tenant_id);
        }
        Ok(rows > 0)
    }

    /// `assignment` uses ?1 for its value; ?2 is updated_at and ?3 the tenant id.
    fn update_instance(
        &self,
        tenant_id: &str,
        assignment: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<()> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            &format!(
                "UPDATE instances SET {}, updated_at = ?2 WHERE tenant_id = ?3",
                assignment
            ),
            params,
        )?;
        if rows == 0 {
            return Err(Error::NotFound(tenant_id.to_string()));
        }
        Ok(())
    }

    // ========================================================================
    // Port pool
    // ========================================================================

    /// Pick the lowest free port in `range` and reserve it in one transaction.
    pub fn allocate_port(&self, range: RangeInclusive<u16>, excluded: &HashSet<u16>) -> Result<u16> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut used: HashSet<u16> = HashSet::new();
        {
            let mut stmt = tx.prepare("SELECT port FROM instances UNION SELECT port FROM port_reservations")?;
            let rows = stmt.query_map([], |row| row.get::<_, u16>(0))?;
            for port in rows {
                used.insert(port?);
            }
        }

        let port = range
            .into_iter()
            .find(|p| !used.contains(p) && !excluded.contains(p))
            .ok_or(Error::PoolExhausted)?;

        tx.execute(
            "INSERT INTO port_reservations (port, reserved_at) VALUES (?1, ?2)",
            params![port, now()],
        )?;
        tx.commit()?;

        debug!("Reserved port {}", port);
        Ok(port)
    }

    /// Drop a reservation that will not be used
    pub fn release_port(&self, port: u16) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM port_reservations WHERE port = ?1", params![port])?;
        Ok(rows > 0)
    }

    // ========================================================================
    // Generated proxy configs
    // ========================================================================

    pub fn insert_generated_config(&self, snapshot_hash: &str, path: &str, validated: bool) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO generated_configs (generated_at, snapshot_hash, validated, active, path)
             VALUES (?1, ?2, ?3, 0, ?4)",
            params![now(), snapshot_hash, validated, path],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn mark_config_validated(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE generated_configs SET validated = 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    /// Record why a generated config was rolled back
    pub fn mark_config_failed(&self, id: i64, reason: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE generated_configs SET rollback_reason = ?1 WHERE id = ?2",
            params![reason, id],
        )?;
        Ok(())
    }

    /// Make `id` the only active config
    pub fn mark_config_active(&self, id: i64) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("UPDATE generated_configs SET active = 0 WHERE active = 1", [])?;
        let rows = tx.execute("UPDATE generated_configs SET active = 1 WHERE id = ?1", params![id])?;
        if rows == 0 {
            return Err(Error::Internal(format!("generated config {} vanished", id)));
        }
        tx.commit()?;
        Ok(())
    }

    pub fn active_config(&self) -> Result<Option<GeneratedConfig>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, generated_at, snapshot_hash, validated, active, path, rollback_reason
                 FROM generated_configs WHERE active = 1",
                [],
                generated_config_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_generated_configs(&self, limit: usize) -> Result<Vec<GeneratedConfig>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, generated_at, snapshot_hash, validated, active, path, rollback_reason
             FROM generated_configs ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], generated_config_from_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    // ========================================================================
    // Key-value store
    // ========================================================================

    /// Set a key-value pair
    pub fn kv_set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "INSERT OR REPLACE INTO kv_store (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key, value, now()],
        )?;

        Ok(())
    }

    /// Get a value by key
    pub fn kv_get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();

        let value = conn
            .query_row(
                "SELECT value FROM kv_store WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        Ok(value)
    }

    /// Delete a key
    pub fn kv_delete(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM kv_store WHERE key = ?1", params![key])?;
        Ok(())
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn generated_config_from_row(row: &Row<'_>) -> rusqlite::Result<GeneratedConfig> {
    Ok(GeneratedConfig {
        id: row.get(0)?,
        generated_at: row.get(1)?,
        source_instance_snapshot_hash: row.get(2)?,
        validated: row.get(3)?,
        active: row.get(4)?,
        path: row.get(5)?,
        rollback_reason: row.get(6)?,
    })
}

/// Raw database row before parsing
struct RawInstance {
    tenant_id: String,
    port: u16,
    data_dir: String,
    app_dir: String,
    install_status: String,
    desired_state: String,
    observed_state: String,
    restart_count: u32,
    last_restart_at: Option<i64>,
    pid: Option<u32>,
    fault: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl RawInstance {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            tenant_id: row.get(0)?,
            port: row.get(1)?,
            data_dir: row.get(2)?,
            app_dir: row.get(3)?,
            install_status: row.get(4)?,
            desired_state: row.get(5)?,
            observed_state: row.get(6)?,
            restart_count: row.get(7)?,
            last_restart_at: row.get(8)?,
            pid: row.get(9)?,
            fault: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
        })
    }

    fn parse(self) -> Result<Instance> {
        Ok(Instance {
            tenant_id: self.tenant_id,
            port: self.port,
            data_dir: PathBuf::from(self.data_dir),
            app_dir: PathBuf::from(self.app_dir),
            install_status: self.install_status.parse()?,
            desired_state: self.desired_state.parse()?,
            observed_state: self.observed_state.parse()?,
            restart_count: self.restart_count,
            last_restart_at: self.last_restart_at,
            pid: self.pid,
            fault: self.fault,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(tenant: &str, port: u16) -> Instance {
        let now = now();
        Instance {
            tenant_id: tenant.to_string(),
            port,
            data_dir: PathBuf::from(format!("/srv/tenants/{}", tenant)),
            app_dir: PathBuf::from("/srv/app"),
            install_status: InstallStatus::NotInstalled,
            desired_state: DesiredState::Stopped,
            observed_state: ObservedState::Stopped,
            restart_count: 0,
            last_restart_at: None,
            pid: None,
            fault: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_instance_crud() {
        let db = Database::open_memory().unwrap();

        db.insert_instance(&instance("alice", 9001)).unwrap();
        let got = db.get_instance("alice").unwrap().unwrap();
        assert_eq!(got.port, 9001);
        assert_eq!(got.install_status, InstallStatus::NotInstalled);

        db.set_desired_state("alice", DesiredState::Running).unwrap();
        db.set_observed_state("alice", ObservedState::Starting).unwrap();
        db.set_fault("alice", Some("boom")).unwrap();
        let got = db.get_instance("alice").unwrap().unwrap();
        assert_eq!(got.desired_state, DesiredState::Running);
        assert_eq!(got.observed_state, ObservedState::Starting);
        assert_eq!(got.fault.as_deref(), Some("boom"));

        assert_eq!(db.record_restart("alice", 100).unwrap(), 1);
        assert_eq!(db.record_restart("alice", 101).unwrap(), 2);
        db.reset_restart_count("alice").unwrap();
        assert_eq!(db.get_instance("alice").unwrap().unwrap().restart_count, 0);

        assert_eq!(db.reset_observed_states().unwrap(), 1);
        assert!(db.delete_instance("alice").unwrap());
        assert!(db.get_instance("alice").unwrap().is_none());
        assert!(matches!(
            db.set_desired_state("alice", DesiredState::Running),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_duplicates_rejected() {
        let db = Database::open_memory().unwrap();
        db.insert_instance(&instance("alice", 9001)).unwrap();

        assert!(matches!(
            db.insert_instance(&instance("alice", 9002)),
            Err(Error::DuplicateTenant(_))
        ));
        assert!(matches!(
            db.insert_instance(&instance("bob", 9001)),
            Err(Error::DuplicatePort(9001))
        ));

        let mut shared_dir = instance("carol", 9003);
        shared_dir.data_dir = PathBuf::from("/srv/tenants/alice");
        assert!(matches!(
            db.insert_instance(&shared_dir),
            Err(Error::DuplicateDataDir(_))
        ));
    }

    #[test]
    fn test_allocate_port_skips_used_and_excluded() {
        let db = Database::open_memory().unwrap();
        db.insert_instance(&instance("alice", 9000)).unwrap();

        let excluded: HashSet<u16> = [9001].into_iter().collect();
        let first = db.allocate_port(9000..=9003, &excluded).unwrap();
        assert_eq!(first, 9002);
        let second = db.allocate_port(9000..=9003, &excluded).unwrap();
        assert_eq!(second, 9003);
        assert!(matches!(
            db.allocate_port(9000..=9003, &excluded),
            Err(Error::PoolExhausted)
        ));

        assert!(db.release_port(9003).unwrap());
        assert_eq!(db.allocate_port(9000..=9003, &excluded).unwrap(), 9003);
    }

    #[test]
    fn test_single_active_config() {
        let db = Database::open_memory().unwrap();
        let a = db.insert_generated_config("aaa", "/etc/nginx/x.conf", true).unwrap();
        let b = db.insert_generated_config("bbb", "/etc/nginx/x.conf", true).unwrap();

        db.mark_config_active(a).unwrap();
        db.mark_config_active(b).unwrap();

        let active: Vec<_> = db
            .list_generated_configs(10)
            .unwrap()
            .into_iter()
            .filter(|c| c.active)
            .collect();
        assert_eq!(active.len(), 1);
        assert_eq!(db.active_config().unwrap().unwrap().source_instance_snapshot_hash, "bbb");
    }

    #[test]
    fn test_rollback_reason_recorded() {
        let db = Database::open_memory().unwrap();
        let id = db.insert_generated_config("aaa", "/etc/nginx/x.conf", false).unwrap();
        db.mark_config_failed(id, "nginx reload failed").unwrap();

        let configs = db.list_generated_configs(10).unwrap();
        assert_eq!(configs[0].rollback_reason.as_deref(), Some("nginx reload failed"));
        assert!(!configs[0].active);
    }

    #[test]
    fn test_begin_install_is_exclusive() {
        let db = Database::open_memory().unwrap();
        db.insert_instance(&instance("alice", 9001)).unwrap();

        assert!(db.begin_install("alice").unwrap());
        assert!(!db.begin_install("alice").unwrap());
        assert!(!db.begin_install("nobody").unwrap());

        assert_eq!(db.fail_interrupted_installs("interrupted").unwrap(), 1);
        let got = db.get_instance("alice").unwrap().unwrap();
        assert_eq!(got.install_status, InstallStatus::Failed);
        assert_eq!(got.fault.as_deref(), Some("interrupted"));

        db.set_observed_state("alice", ObservedState::Running).unwrap();
        assert!(!db.begin_install("alice").unwrap());
    }

    #[test]
    fn test_kv() {
        let db = Database::open_memory().unwrap();
        db.kv_set("site_title", "Tavern").unwrap();
        assert_eq!(db.kv_get("site_title").unwrap().as_deref(), Some("Tavern"));
        db.kv_delete("site_title").unwrap();
        assert!(db.kv_get("site_title").unwrap().is_none());
    }
}
