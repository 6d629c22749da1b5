//! Diagnostics
//!
//! Read-only inspection of instances, ports and the proxy configuration.
//! Nothing here mutates the store.

use crate::config::AppConfig;
use crate::proxy::ProxyController;
use crate::state::InstanceStore;
use crate::supervisor::Supervisor;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::{Read, Seek, SeekFrom};
use std::net::TcpListener;
use std::path::Path;
use std::sync::Arc;
use tenantmux_common::{nginx, types::*, Error, Result};
use tracing::debug;

/// Bytes read from the end of a log when tailing
const TAIL_WINDOW: u64 = 256 * 1024;

/// Lines scanned for error markers in health reports
const ERROR_SCAN_LINES: usize = 200;

/// Error lines kept in health reports
const ERROR_KEEP_LINES: usize = 20;

/// Who holds a TCP port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "owner", rename_all = "snake_case")]
pub enum PortOwnership {
    Free,
    OwnedByPid { pid: u32, tenant_id: String },
    OwnedByOtherProcess { pid: Option<u32> },
}

/// Proxy config check result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConfigValidity {
    Valid,
    SyntaxError { detail: String },
}

/// Point-in-time health report for one instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceHealth {
    pub tenant_id: String,
    pub port: u16,
    pub install_status: InstallStatus,
    pub installed: bool,
    pub entry_present: bool,
    pub dependencies_present: bool,
    pub port_bound: bool,
    pub process_state: ObservedState,
    pub desired_state: DesiredState,
    pub pid: Option<u32>,
    pub pid_alive: bool,
    pub restart_count: u32,
    pub fault: Option<String>,
    pub recent_error_log_lines: Vec<String>,
}

/// Whether something is bound on `port` (any interface)
pub fn port_is_bound(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).is_err()
}

/// Read-only diagnostic queries
pub struct Diagnostics {
    store: InstanceStore,
    supervisor: Supervisor,
    app: AppConfig,
    controller: Arc<dyn ProxyController>,
}

impl Diagnostics {
    pub fn new(
        store: InstanceStore,
        supervisor: Supervisor,
        app: AppConfig,
        controller: Arc<dyn ProxyController>,
    ) -> Self {
        Self {
            store,
            supervisor,
            app,
            controller,
        }
    }

    pub fn check_instance_health(&self, tenant_id: &str) -> Result<InstanceHealth> {
        let instance = self.store.get(tenant_id)?;
        let entry_present = instance.app_dir.join(&self.app.entry_file).is_file();
        let dependencies_present = instance.app_dir.join(&self.app.dependency_dir).is_dir();
        let recent_error_log_lines = error_lines(&tail_file(&instance.log_path(), ERROR_SCAN_LINES)?);

        Ok(InstanceHealth {
            installed: instance.install_status == InstallStatus::Installed,
            entry_present,
            dependencies_present,
            port_bound: port_is_bound(instance.port),
            pid_alive: instance
                .pid
                .map(crate::launcher::is_process_alive)
                .unwrap_or(false),
            tenant_id: instance.tenant_id,
            port: instance.port,
            install_status: instance.install_status,
            process_state: instance.observed_state,
            desired_state: instance.desired_state,
            pid: instance.pid,
            restart_count: instance.restart_count,
            fault: instance.fault,
            recent_error_log_lines,
        })
    }

    /// Attribute a bound port to a supervised instance or a foreign process.
    ///
    /// The `/proc` scan runs on the blocking pool.
    pub async fn check_port_ownership(&self, port: u16) -> Result<PortOwnership> {
        let (holder, bound) = tokio::task::spawn_blocking(move || {
            let holder = listening_pid(port);
            let bound = holder.is_some() || port_is_bound(port);
            (holder, bound)
        })
        .await
        .map_err(|e| Error::Internal(format!("port scan task failed: {}", e)))?;
        if !bound {
            return Ok(PortOwnership::Free);
        }

        let supervised = self.supervisor.supervised_pids()?;
        if let Some(pid) = holder {
            if let Some((tenant_id, _)) = supervised.iter().find(|(_, p)| *p == pid) {
                return Ok(PortOwnership::OwnedByPid {
                    pid,
                    tenant_id: tenant_id.clone(),
                });
            }
        }
        Ok(PortOwnership::OwnedByOtherProcess { pid: holder })
    }

    /// Structural parse, then the proxy's own validator
    pub async fn check_proxy_config_validity(&self, path: &Path) -> ConfigValidity {
        let text = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(e) => {
                return ConfigValidity::SyntaxError {
                    detail: format!("{}: {}", path.display(), e),
                }
            }
        };
        if let Err(e) = nginx::parse(&text) {
            return ConfigValidity::SyntaxError {
                detail: e.to_string(),
            };
        }
        match self.controller.validate(path).await {
            Ok(()) => ConfigValidity::Valid,
            Err(e) => ConfigValidity::SyntaxError {
                detail: e.to_string(),
            },
        }
    }

    /// Last `lines` lines of the instance log
    pub fn tail_log(&self, tenant_id: &str, lines: usize) -> Result<Vec<String>> {
        let instance = self.store.get(tenant_id)?;
        tail_file(&instance.log_path(), lines)
    }
}

/// Last `lines` lines of a file; a missing file has no lines
pub fn tail_file(path: &Path, lines: usize) -> Result<Vec<String>> {
    let mut file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let len = file.metadata()?.len();
    let start = len.saturating_sub(TAIL_WINDOW);
    file.seek(SeekFrom::Start(start))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    let text = String::from_utf8_lossy(&buf);

    let mut all: Vec<&str> = text.lines().collect();
    // First line is probably cut in half
    if start > 0 && !all.is_empty() {
        all.remove(0);
    }
    let skip = all.len().saturating_sub(lines);
    Ok(all[skip..].iter().map(|s| s.to_string()).collect())
}

fn error_lines(lines: &[String]) -> Vec<String> {
    let mut hits: Vec<String> = lines
        .iter()
        .filter(|line| {
            let lower = line.to_ascii_lowercase();
            lower.contains("error") || lower.contains("exception") || lower.contains("err!")
        })
        .cloned()
        .collect();
    let skip = hits.len().saturating_sub(ERROR_KEEP_LINES);
    hits.drain(..skip);
    hits
}

/// Pid of the process listening on `port`, via /proc
pub fn listening_pid(port: u16) -> Option<u32> {
    let inodes = listening_inodes(port);
    if inodes.is_empty() {
        return None;
    }
    socket_owner(&inodes)
}

fn listening_inodes(port: u16) -> HashSet<u64> {
    let mut inodes = HashSet::new();
    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        let Ok(content) = std::fs::read_to_string(table) else {
            continue;
        };
        inodes.extend(parse_listening_inodes(&content, port));
    }
    inodes
}

/// Socket inodes in LISTEN state on `port` from a /proc/net/tcp table
fn parse_listening_inodes(table: &str, port: u16) -> Vec<u64> {
    const TCP_LISTEN: &str = "0A";
    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let local = fields.get(1)?;
            let state = fields.get(3)?;
            let inode = fields.get(9)?;
            let (_, port_hex) = local.rsplit_once(':')?;
            let local_port = u16::from_str_radix(port_hex, 16).ok()?;
            if local_port != port || *state != TCP_LISTEN {
                return None;
            }
            inode.parse().ok()
        })
        .filter(|inode| *inode != 0)
        .collect()
}

fn socket_owner(inodes: &HashSet<u64>) -> Option<u32> {
    let procs = std::fs::read_dir("/proc").ok()?;
    for entry in procs.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        // Other users' fds are unreadable without privileges
        let Ok(fds) = std::fs::read_dir(entry.path().join("fd")) else {
            continue;
        };
        for fd in fds.flatten() {
            let Ok(target) = std::fs::read_link(fd.path()) else {
                continue;
            };
            let target = target.to_string_lossy();
            if let Some(inode) = target
                .strip_prefix("socket:[")
                .and_then(|s| s.strip_suffix(']'))
                .and_then(|s| s.parse::<u64>().ok())
            {
                if inodes.contains(&inode) {
                    debug!(pid, inode, "Resolved socket owner");
                    return Some(pid);
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    const TCP_TABLE: &str = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 0100007F:1F41 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 55123 1 0000000000000000 100 0 0 10 0
   1: 0100007F:1F41 0100007F:D2F0 01 00000000:00000000 00:00000000 00000000  1000        0 55999 1 0000000000000000 20 4 30 10 -1
   2: 00000000:0016 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 1234 1 0000000000000000 100 0 0 10 0
";

    #[test]
    fn test_parse_listening_inodes() {
        // 0x1F41 = 8001; only the LISTEN row counts
        assert_eq!(parse_listening_inodes(TCP_TABLE, 8001), vec![55123]);
        assert_eq!(parse_listening_inodes(TCP_TABLE, 22), vec![1234]);
        assert!(parse_listening_inodes(TCP_TABLE, 9000).is_empty());
    }

    #[test]
    fn test_port_is_bound() {
        let listener = TcpListener::bind("0.0.0.0:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(port_is_bound(port));
        drop(listener);
        assert!(!port_is_bound(port));
    }

    #[test]
    fn test_listening_pid_finds_self() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        if std::path::Path::new("/proc/net/tcp").exists() {
            assert_eq!(listening_pid(port), Some(std::process::id()));
        }
    }

    fn diagnostics(tmp: &TempDir) -> Diagnostics {
        use crate::config::{PortConfig, SupervisorConfig};
        use crate::launcher::fake::FakeLauncher;
        use crate::proxy::controller::fake::FakeController;

        let store = InstanceStore::new(
            tenantmux_common::Database::open_memory().unwrap(),
            PortConfig {
                range_start: 1024,
                range_end: 65535,
                reserved: vec![],
            },
        );
        store
            .create("alice", 9000, tmp.path().join("alice"), tmp.path().join("app"))
            .unwrap();
        let supervisor = Supervisor::new(
            store.clone(),
            FakeLauncher::healthy(),
            AppConfig::default(),
            SupervisorConfig::default(),
        );
        Diagnostics::new(
            store,
            supervisor,
            AppConfig::default(),
            Arc::new(FakeController::default()),
        )
    }

    #[tokio::test]
    async fn test_port_ownership_attributes_foreign_listener() {
        let tmp = TempDir::new().unwrap();
        let diag = diagnostics(&tmp);

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let owner = diag.check_port_ownership(port).await.unwrap();
        match owner {
            PortOwnership::OwnedByOtherProcess { pid } => {
                if std::path::Path::new("/proc/net/tcp").exists() {
                    assert_eq!(pid, Some(std::process::id()));
                }
            }
            other => panic!("unexpected owner {:?}", other),
        }

        drop(listener);
        assert_eq!(
            diag.check_port_ownership(port).await.unwrap(),
            PortOwnership::Free
        );
    }

    #[test]
    fn test_tail_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("app.log");
        assert!(tail_file(&path, 10).unwrap().is_empty());

        let mut f = std::fs::File::create(&path).unwrap();
        for i in 0..50 {
            writeln!(f, "line {i}").unwrap();
        }
        let tail = tail_file(&path, 3).unwrap();
        assert_eq!(tail, vec!["line 47", "line 48", "line 49"]);
        assert_eq!(tail_file(&path, 500).unwrap().len(), 50);
    }

    #[test]
    fn test_error_lines_filter() {
        let lines: Vec<String> = [
            "Listening on 8001",
            "Error: EADDRINUSE",
            "npm ERR! missing script",
            "UnhandledPromiseRejection: Exception in handler",
            "ok",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(error_lines(&lines).len(), 3);
    }
}
