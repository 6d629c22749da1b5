//! Proxy Commands

use anyhow::Result;
use clap::Subcommand;
use colored::Colorize;
use serde::Serialize;
use serde_json::Value;

use crate::client::DaemonClient;
use crate::commands::instance::{display_value, report};
use crate::output::{print_fields, print_list, print_structured, print_success, print_warning, OutputFormat, TableDisplay};

#[derive(Subcommand)]
pub enum ProxyCommands {
    /// Show the active proxy configuration and its routes
    Status,

    /// Check the active config file
    Validate,

    /// Render, validate and activate the config for the running set
    Regenerate,

    /// Remove duplicate directives from the active config
    Repair {
        /// Report findings without touching the file
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Serialize)]
struct RouteDisplay {
    tenant_id: String,
    path_prefix: String,
    upstream: String,
    websocket: bool,
}

impl From<&Value> for RouteDisplay {
    fn from(v: &Value) -> Self {
        Self {
            tenant_id: display_value(&v["tenant_id"]),
            path_prefix: display_value(&v["path_prefix"]),
            upstream: format!(
                "{}:{}",
                display_value(&v["upstream_host"]),
                display_value(&v["upstream_port"])
            ),
            websocket: v["websocket_upgrade"].as_bool().unwrap_or(false),
        }
    }
}

impl TableDisplay for RouteDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Tenant", "Path", "Upstream", "WebSocket"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.tenant_id.clone(),
            self.path_prefix.clone(),
            self.upstream.clone(),
            if self.websocket { "yes" } else { "no" }.to_string(),
        ]
    }
}

pub async fn execute(cmd: ProxyCommands, client: DaemonClient, format: OutputFormat) -> Result<()> {
    match cmd {
        ProxyCommands::Status => {
            let status = client.proxy_status().await?;
            if print_structured(&status, format) {
                return Ok(());
            }
            let active = &status["active"];
            print_fields(
                &[
                    ("Path", display_value(&status["path"])),
                    ("Active config", display_value(&active["id"])),
                    ("Active snapshot", display_value(&active["source_instance_snapshot_hash"])),
                    ("Current snapshot", display_value(&status["current_snapshot_hash"])),
                    (
                        "In sync",
                        if status["in_sync"].as_bool().unwrap_or(false) {
                            "yes".green().to_string()
                        } else {
                            "no".red().to_string()
                        },
                    ),
                ],
                format,
            );
            let routes: Vec<RouteDisplay> = status["routes"]
                .as_array()
                .map(|r| r.iter().map(RouteDisplay::from).collect())
                .unwrap_or_default();
            println!();
            print_list(&routes, format);
        }

        ProxyCommands::Validate => {
            let validity = client.proxy_validate().await?;
            if print_structured(&validity, format) {
                return Ok(());
            }
            match validity["status"].as_str() {
                Some("valid") => print_success("Proxy config is valid"),
                _ => print_warning(&format!(
                    "Proxy config is invalid: {}",
                    display_value(&validity["detail"])
                )),
            }
        }

        ProxyCommands::Regenerate => {
            report(client.proxy_regenerate().await?, format);
        }

        ProxyCommands::Repair { dry_run } => {
            let result = client.proxy_repair(dry_run).await?;
            if print_structured(&result, format) {
                return Ok(());
            }
            let duplicates = result["duplicates_removed"].as_array().cloned().unwrap_or_default();
            let stale = result["stale_upstreams"].as_array().cloned().unwrap_or_default();

            for d in &duplicates {
                println!(
                    "  {} {} at line {} (kept line {}) in {}",
                    if dry_run { "would remove" } else { "removed" }.yellow(),
                    display_value(&d["directive"]),
                    display_value(&d["line"]),
                    display_value(&d["kept_line"]),
                    display_value(&d["block"]),
                );
            }
            for s in &stale {
                print_warning(&format!(
                    "{} at line {} points at port {} with no running instance",
                    display_value(&s["target"]),
                    display_value(&s["line"]),
                    display_value(&s["port"]),
                ));
            }

            if duplicates.is_empty() && stale.is_empty() {
                print_success("No duplicate directives found");
            } else if result["written"].as_bool().unwrap_or(false) {
                print_success(&format!(
                    "Repaired; backup at {}",
                    display_value(&result["backup_path"])
                ));
            }
        }
    }

    Ok(())
}
