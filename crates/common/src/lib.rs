//! tenantmux Common Library
//!
//! Shared types, persistence and the nginx configuration model used by the
//! tenantmux daemon and CLI.

pub mod db;
pub mod error;
pub mod nginx;
pub mod types;

// Re-export commonly used types
pub use db::Database;
pub use error::{Error, ErrorKind, Result};
pub use types::*;

/// tenantmux version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default store path
pub fn default_store_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".tenantmux")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
