//! CLI Commands

pub mod branding;
pub mod diag;
pub mod instance;
pub mod proxy;
