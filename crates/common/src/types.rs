//! Core types for tenantmux

use crate::error::{Error, ErrorKind};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Longest accepted tenant id.
pub const MAX_TENANT_ID_LEN: usize = 63;

/// Application install status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallStatus {
    NotInstalled,
    Installing,
    Installed,
    Failed,
}

impl Default for InstallStatus {
    fn default() -> Self {
        Self::NotInstalled
    }
}

/// What the operator wants the instance to be doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    Stopped,
    Running,
}

impl Default for DesiredState {
    fn default() -> Self {
        Self::Stopped
    }
}

/// What the supervisor has confirmed about the OS process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservedState {
    Stopped,
    Starting,
    Running,
    Crashed,
    RestartBackoff,
}

impl Default for ObservedState {
    fn default() -> Self {
        Self::Stopped
    }
}

macro_rules! string_enum {
    ($ty:ty { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $ty {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant),)+
                    other => Err(Error::Internal(format!(
                        "unknown {} value '{}'",
                        stringify!($ty),
                        other
                    ))),
                }
            }
        }
    };
}

string_enum!(InstallStatus {
    NotInstalled => "not_installed",
    Installing => "installing",
    Installed => "installed",
    Failed => "failed",
});

string_enum!(DesiredState {
    Stopped => "stopped",
    Running => "running",
});

string_enum!(ObservedState {
    Stopped => "stopped",
    Starting => "starting",
    Running => "running",
    Crashed => "crashed",
    RestartBackoff => "restart_backoff",
});

/// One tenant's application instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub tenant_id: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub app_dir: PathBuf,
    pub install_status: InstallStatus,
    pub desired_state: DesiredState,
    pub observed_state: ObservedState,
    pub restart_count: u32,
    pub last_restart_at: Option<i64>,
    /// Last known child pid, kept so a restarted daemon can clean up orphans
    pub pid: Option<u32>,
    /// Persistent fault; while set the reconciler leaves the instance alone
    pub fault: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Instance {
    /// Directory handed to the application as `--dataRoot`
    pub fn app_data_dir(&self) -> PathBuf {
        self.data_dir.join("app-data")
    }

    /// Captured stdout/stderr of the child
    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join("logs").join("app.log")
    }

    pub fn is_running(&self) -> bool {
        self.observed_state == ObservedState::Running
    }
}

/// Check a tenant id against the safe identifier charset.
///
/// Tenant ids end up in URL paths and filesystem paths, so anything outside
/// `[a-z0-9][a-z0-9_-]*` is refused rather than escaped.
pub fn validate_tenant_id(id: &str) -> Result<(), Error> {
    let mut chars = id.chars();
    let first_ok = chars
        .next()
        .map(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        .unwrap_or(false);
    let rest_ok = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');

    if first_ok && rest_ok && id.len() <= MAX_TENANT_ID_LEN {
        Ok(())
    } else {
        Err(Error::InvalidTenantId(id.to_string()))
    }
}

/// Metadata row for a rendered proxy configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedConfig {
    pub id: i64,
    pub generated_at: i64,
    pub source_instance_snapshot_hash: String,
    pub validated: bool,
    pub active: bool,
    pub path: String,
    /// Set when activation failed and the previous config was restored
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_reason: Option<String>,
}

/// Result of a mutating operator action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum OperationOutcome {
    Applied {
        detail: String,
    },
    Rejected {
        kind: ErrorKind,
        reason: String,
    },
    RolledBack {
        reason: String,
    },
}

impl OperationOutcome {
    pub fn applied(detail: impl Into<String>) -> Self {
        Self::Applied {
            detail: detail.into(),
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

impl From<&Error> for OperationOutcome {
    fn from(e: &Error) -> Self {
        match e {
            Error::ReloadFailed { .. } => Self::RolledBack {
                reason: e.to_string(),
            },
            _ => Self::Rejected {
                kind: e.kind(),
                reason: e.to_string(),
            },
        }
    }
}

/// Body of every mutating API response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResponse {
    #[serde(flatten)]
    pub outcome: OperationOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<Instance>,
}

impl ActionResponse {
    pub fn applied(detail: impl Into<String>, instance: Option<Instance>) -> Self {
        Self {
            outcome: OperationOutcome::applied(detail),
            instance,
        }
    }
}
