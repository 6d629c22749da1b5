//! Daemon configuration

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;
use tenantmux_common::{Error, Result};

const MAX_SITE_TITLE_LEN: usize = 200;

/// Check a site title before it is rendered into a `sub_filter` string,
/// where nginx would expand `$` as a variable.
pub fn validate_site_title(title: &str) -> Result<()> {
    if title.trim().is_empty()
        || title.len() > MAX_SITE_TITLE_LEN
        || title.chars().any(|c| c == '$' || c.is_control())
    {
        return Err(Error::InvalidConfig(format!(
            "site title must be 1-{} printable characters without '$'",
            MAX_SITE_TITLE_LEN
        )));
    }
    Ok(())
}

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Store directory path (database, rollback files)
    pub store_path: PathBuf,

    /// Parent directory of per-tenant data directories
    pub data_root: PathBuf,

    /// Operator API listen address
    pub api_listen: String,

    /// If set, mutating API calls require `x-tenantmux-admin-token`
    pub admin_token: Option<String>,

    /// Instance port pool
    pub ports: PortConfig,

    /// Hosted application layout
    pub app: AppConfig,

    /// Process supervision policy
    pub supervisor: SupervisorConfig,

    /// Reverse proxy configuration
    pub proxy: ProxyConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let store_path = tenantmux_common::default_store_path();
        Self {
            data_root: store_path.join("tenants"),
            store_path,
            api_listen: "127.0.0.1:7780".to_string(),
            admin_token: None,
            ports: PortConfig::default(),
            app: AppConfig::default(),
            supervisor: SupervisorConfig::default(),
            proxy: ProxyConfig::default(),
        }
    }
}

/// Port pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    /// First port handed to instances
    pub range_start: u16,

    /// Last port handed to instances (inclusive)
    pub range_end: u16,

    /// Ports used by platform services; never allocated even if in range
    pub reserved: Vec<u16>,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            range_start: 8001,
            range_end: 8999,
            reserved: vec![8080, 8443],
        }
    }
}

impl PortConfig {
    pub fn range(&self) -> RangeInclusive<u16> {
        self.range_start..=self.range_end
    }

    pub fn reserved_set(&self) -> HashSet<u16> {
        self.reserved.iter().copied().collect()
    }

    /// Whether `port` may be assigned to an instance
    pub fn is_assignable(&self, port: u16) -> bool {
        self.range().contains(&port) && !self.reserved.contains(&port)
    }
}

/// Hosted application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Interpreter used to run the entry file
    pub runtime: String,

    /// Entry file relative to the app directory
    pub entry_file: String,

    /// Dependency directory relative to the app directory
    pub dependency_dir: String,

    /// Default installed application directory for new instances
    pub app_dir: PathBuf,

    /// Command (run in the app dir) that installs dependencies
    pub install_command: Vec<String>,

    /// Install command timeout
    pub install_timeout_secs: u64,

    /// Page title emitted by the application, replaced with the site title
    pub original_title: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            runtime: "node".to_string(),
            entry_file: "server.js".to_string(),
            dependency_dir: "node_modules".to_string(),
            app_dir: PathBuf::from("/opt/tenantmux/app"),
            install_command: vec![
                "npm".to_string(),
                "install".to_string(),
                "--omit=dev".to_string(),
            ],
            install_timeout_secs: 600,
            original_title: "SillyTavern".to_string(),
        }
    }
}

/// Supervision policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Budget for the child to accept TCP connections after spawn
    pub health_timeout_secs: u64,

    /// Delay between health probe attempts
    pub health_probe_interval_ms: u64,

    /// First restart delay
    pub backoff_base_secs: u64,

    /// Upper bound on the restart delay
    pub backoff_cap_secs: u64,

    /// Running this long resets the restart counter
    pub stable_after_secs: u64,

    /// Crashes allowed inside `restart_window_secs` before giving up
    pub restart_ceiling: u32,

    /// Rolling window for `restart_ceiling`
    pub restart_window_secs: u64,

    /// SIGTERM grace period before SIGKILL
    pub stop_grace_secs: u64,

    /// Reconciliation loop period
    pub reconcile_interval_secs: u64,

    /// Concurrent start (spawn + health probe) limit
    pub max_concurrent_starts: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            health_timeout_secs: 10,
            health_probe_interval_ms: 250,
            backoff_base_secs: 2,
            backoff_cap_secs: 60,
            stable_after_secs: 300,
            restart_ceiling: 10,
            restart_window_secs: 600,
            stop_grace_secs: 10,
            reconcile_interval_secs: 5,
            max_concurrent_starts: 4,
        }
    }
}

impl SupervisorConfig {
    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    pub fn health_probe_interval(&self) -> Duration {
        Duration::from_millis(self.health_probe_interval_ms.max(1))
    }

    pub fn stable_after(&self) -> Duration {
        Duration::from_secs(self.stable_after_secs)
    }

    pub fn restart_window(&self) -> Duration {
        Duration::from_secs(self.restart_window_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }

    /// Delay before restart number `restart_count` (1-based)
    pub fn backoff_delay(&self, restart_count: u32) -> Duration {
        let exp = restart_count.saturating_sub(1).min(31);
        let secs = self
            .backoff_base_secs
            .saturating_mul(1u64 << exp)
            .min(self.backoff_cap_secs);
        Duration::from_secs(secs)
    }
}

/// Reverse proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// File nginx includes; only the synthesizer and repair write it
    pub active_config_path: PathBuf,

    /// nginx binary
    pub nginx_binary: String,

    /// Arguments that make nginx reload its configuration
    pub reload_args: Vec<String>,

    /// Timeout for validate / reload commands
    pub command_timeout_secs: u64,

    /// `listen` value of the generated server block
    pub listen: String,

    /// `server_name` of the generated server block
    pub server_name: String,

    /// Default site title injected into proxied HTML
    pub site_title: String,

    /// Upstream for the root platform app (`/`)
    pub root_upstream: Option<String>,

    /// Root directory searched for static assets
    pub static_root: Option<PathBuf>,

    /// `try_files` search list for the static fallback
    pub static_search_paths: Vec<String>,

    /// Body returned by the access-denied catch-all
    pub deny_message: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            active_config_path: PathBuf::from("/etc/nginx/conf.d/tenantmux.conf"),
            nginx_binary: "nginx".to_string(),
            reload_args: vec!["-s".to_string(), "reload".to_string()],
            command_timeout_secs: 10,
            listen: "80".to_string(),
            server_name: "_".to_string(),
            site_title: "tenantmux".to_string(),
            root_upstream: Some("127.0.0.1:8080".to_string()),
            static_root: Some(PathBuf::from("/opt/tenantmux/public")),
            static_search_paths: vec![
                "$uri".to_string(),
                "$uri/".to_string(),
                "/index.html".to_string(),
            ],
            deny_message: Some("Access denied".to_string()),
        }
    }
}

impl ProxyConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs.max(1))
    }

    /// Port of the root upstream, used when checking for stale upstreams
    pub fn root_upstream_port(&self) -> Option<u16> {
        self.root_upstream
            .as_deref()
            .and_then(|u| u.rsplit(':').next())
            .and_then(|p| p.parse().ok())
    }
}

impl DaemonConfig {
    /// Load configuration from file
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject settings the daemon cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.ports.range_start > self.ports.range_end {
            return Err(Error::InvalidConfig(format!(
                "port range {}..={} is empty",
                self.ports.range_start, self.ports.range_end
            )));
        }
        if self.supervisor.restart_ceiling == 0 {
            return Err(Error::InvalidConfig(
                "supervisor.restart_ceiling must be at least 1".to_string(),
            ));
        }
        if self.supervisor.max_concurrent_starts == 0 {
            return Err(Error::InvalidConfig(
                "supervisor.max_concurrent_starts must be at least 1".to_string(),
            ));
        }
        if let Some(root) = self.proxy.root_upstream_port() {
            if self.ports.is_assignable(root) {
                return Err(Error::InvalidConfig(format!(
                    "proxy.root_upstream port {} lies inside the instance pool",
                    root
                )));
            }
        }
        validate_site_title(&self.proxy.site_title).map_err(|e| match e {
            Error::InvalidConfig(msg) => Error::InvalidConfig(format!("proxy.site_title: {}", msg)),
            other => other,
        })?;
        Ok(())
    }

    /// Get the database path
    pub fn db_path(&self) -> PathBuf {
        self.store_path.join("state.db")
    }

    /// Per-tenant data directory
    pub fn tenant_data_dir(&self, tenant_id: &str) -> PathBuf {
        self.data_root.join(tenant_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_delay_is_capped_exponential() {
        let cfg = SupervisorConfig::default();
        assert_eq!(cfg.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(cfg.backoff_delay(2), Duration::from_secs(4));
        assert_eq!(cfg.backoff_delay(5), Duration::from_secs(32));
        assert_eq!(cfg.backoff_delay(6), Duration::from_secs(60));
        assert_eq!(cfg.backoff_delay(200), Duration::from_secs(60));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let cfg: DaemonConfig = toml::from_str(
            r#"
            api_listen = "0.0.0.0:9000"

            [ports]
            range_start = 20000
            range_end = 20010

            [supervisor]
            restart_ceiling = 3
            "#,
        )
        .unwrap();

        assert_eq!(cfg.api_listen, "0.0.0.0:9000");
        assert_eq!(cfg.ports.range(), 20000..=20010);
        assert_eq!(cfg.supervisor.restart_ceiling, 3);
        assert_eq!(cfg.supervisor.backoff_cap_secs, 60);
        assert_eq!(cfg.app.entry_file, "server.js");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_root_upstream_in_pool() {
        let mut cfg = DaemonConfig::default();
        cfg.proxy.root_upstream = Some("127.0.0.1:8500".to_string());
        assert!(cfg.validate().is_err());

        cfg.proxy.root_upstream = Some("127.0.0.1:8080".to_string());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unsafe_site_title() {
        let mut cfg = DaemonConfig::default();
        cfg.proxy.site_title = "$host".to_string();
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));

        cfg.proxy.site_title = "line\nbreak".to_string();
        assert!(cfg.validate().is_err());

        cfg.proxy.site_title = String::new();
        assert!(cfg.validate().is_err());

        cfg.proxy.site_title = "My Tavern".to_string();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_reserved_ports_not_assignable() {
        let ports = PortConfig::default();
        assert!(ports.is_assignable(8001));
        assert!(!ports.is_assignable(8080));
        assert!(!ports.is_assignable(9500));
    }
}
