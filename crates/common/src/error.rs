//! Error types for tenantmux

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using tenantmux Error
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error classes surfaced to operators and used to decide whether a
/// failure may be retried automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Conflict,
    PreconditionFailed,
    ExternalFailure,
    ExhaustedRetries,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::NotFound => write!(f, "not_found"),
            ErrorKind::Conflict => write!(f, "conflict"),
            ErrorKind::PreconditionFailed => write!(f, "precondition_failed"),
            ErrorKind::ExternalFailure => write!(f, "external_failure"),
            ErrorKind::ExhaustedRetries => write!(f, "exhausted_retries"),
            ErrorKind::Internal => write!(f, "internal"),
        }
    }
}

/// tenantmux error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Instance not found: {0}")]
    NotFound(String),

    #[error("Tenant {0} already exists")]
    DuplicateTenant(String),

    #[error("Port {0} is already assigned to another instance")]
    DuplicatePort(u16),

    #[error("Data directory {0} is already owned by another instance")]
    DuplicateDataDir(String),

    #[error("Invalid tenant id '{0}': expected [a-z0-9][a-z0-9_-]{{0,62}}")]
    InvalidTenantId(String),

    #[error("Port {0} is outside the instance pool or reserved for the platform")]
    PortOutOfPool(u16),

    #[error("No free port left in the instance pool")]
    PoolExhausted,

    #[error("Port {port} is already bound by another process")]
    PortConflict { port: u16 },

    #[error("Application is not installed for {0}")]
    AppNotInstalled(String),

    #[error("Application entry file missing: {0}")]
    BinaryMissing(String),

    #[error("Application dependencies missing: {0}")]
    DependenciesMissing(String),

    #[error("Instance {tenant} is {state}; stop it first")]
    InstanceActive { tenant: String, state: String },

    #[error("Failed to spawn process: {0}")]
    Spawn(String),

    #[error("Health probe on port {port} timed out after {seconds}s")]
    HealthTimeout { port: u16, seconds: u64 },

    #[error("Install failed: {0}")]
    InstallFailed(String),

    #[error("Proxy config validation failed: {0}")]
    ValidationFailed(String),

    #[error("Proxy reload failed ({detail}); previous config restored")]
    ReloadFailed { detail: String },

    #[error("Platform route template missing: {0}")]
    TemplateMissing(String),

    #[error("Proxy config parse error at line {line}: {message}")]
    ConfigParse { line: usize, message: String },

    #[error("Restart ceiling reached: {crashes} crashes within {window_secs}s")]
    RestartCeiling { crashes: u32, window_secs: u64 },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Operation timeout after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Classify the error for retry decisions and operator output.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::DuplicateTenant(_)
            | Error::DuplicatePort(_)
            | Error::DuplicateDataDir(_)
            | Error::PortConflict { .. }
            | Error::InstanceActive { .. } => ErrorKind::Conflict,
            Error::InvalidTenantId(_)
            | Error::PortOutOfPool(_)
            | Error::PoolExhausted
            | Error::AppNotInstalled(_)
            | Error::BinaryMissing(_)
            | Error::DependenciesMissing(_)
            | Error::TemplateMissing(_)
            | Error::InvalidConfig(_) => ErrorKind::PreconditionFailed,
            Error::Spawn(_)
            | Error::HealthTimeout { .. }
            | Error::InstallFailed(_)
            | Error::ValidationFailed(_)
            | Error::ReloadFailed { .. }
            | Error::ConfigParse { .. }
            | Error::Timeout { .. } => ErrorKind::ExternalFailure,
            Error::RestartCeiling { .. } => ErrorKind::ExhaustedRetries,
            Error::Io(_) | Error::Database(_) | Error::Serialization(_) | Error::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Whether the supervisor may retry the failed action on its own.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::ExternalFailure
    }
}
