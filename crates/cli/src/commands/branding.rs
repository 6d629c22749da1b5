//! Branding Commands

use anyhow::Result;
use clap::Subcommand;

use crate::client::DaemonClient;
use crate::commands::instance::report;
use crate::output::{print_structured, OutputFormat};

#[derive(Subcommand)]
pub enum BrandingCommands {
    /// Show the site title injected into tenant pages
    Get,

    /// Set the site title
    Set {
        /// New title
        title: String,
    },

    /// Go back to the configured default title
    Reset,
}

pub async fn execute(cmd: BrandingCommands, client: DaemonClient, format: OutputFormat) -> Result<()> {
    match cmd {
        BrandingCommands::Get => {
            let title = client.branding().await?;
            if !print_structured(&serde_json::json!({ "site_title": title }), format) {
                println!("{}", title.unwrap_or_default());
            }
        }
        BrandingCommands::Set { title } => {
            report(client.set_branding(Some(&title)).await?, format);
        }
        BrandingCommands::Reset => {
            report(client.set_branding(None).await?, format);
        }
    }
    Ok(())
}
