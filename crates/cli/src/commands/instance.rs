//! Instance Commands

use anyhow::Result;
use clap::Subcommand;
use serde::Serialize;
use tenantmux_common::{ActionResponse, Instance, OperationOutcome};

use crate::client::DaemonClient;
use crate::output::{
    print_fields, print_item, print_list, print_structured, print_success, print_warning,
    OutputFormat, TableDisplay,
};

#[derive(Subcommand)]
pub enum InstanceCommands {
    /// List all instances
    List,

    /// Show one instance
    Get {
        /// Tenant ID
        tenant: String,
    },

    /// Provision a new instance
    Create {
        /// Tenant ID
        tenant: String,

        /// Application directory (defaults to the daemon's app.app_dir)
        #[arg(long)]
        app_dir: Option<String>,
    },

    /// Stop and remove an instance, releasing its port
    Delete {
        /// Tenant ID
        tenant: String,
    },

    /// Install the application for an instance
    Install {
        /// Tenant ID
        tenant: String,
    },

    /// Start an instance
    Start {
        /// Tenant ID
        tenant: String,

        /// Wait until the health probe passes
        #[arg(short, long)]
        wait: bool,
    },

    /// Stop an instance gracefully
    Stop {
        /// Tenant ID
        tenant: String,
    },

    /// Stop then start an instance
    Restart {
        /// Tenant ID
        tenant: String,
    },

    /// Kill an instance immediately
    Kill {
        /// Tenant ID
        tenant: String,
    },

    /// Show the tail of an instance's log
    Logs {
        /// Tenant ID
        tenant: String,

        /// Number of lines
        #[arg(short = 'n', long, default_value = "100")]
        lines: usize,
    },

    /// Health report for an instance
    Diagnose {
        /// Tenant ID
        tenant: String,
    },
}

/// Instance display wrapper for serialization
#[derive(Serialize)]
pub struct InstanceDisplay {
    pub tenant_id: String,
    pub port: u16,
    pub install: String,
    pub desired: String,
    pub observed: String,
    pub restarts: u32,
    pub pid: Option<u32>,
    pub fault: Option<String>,
}

impl From<Instance> for InstanceDisplay {
    fn from(i: Instance) -> Self {
        Self {
            tenant_id: i.tenant_id,
            port: i.port,
            install: i.install_status.to_string(),
            desired: i.desired_state.to_string(),
            observed: i.observed_state.to_string(),
            restarts: i.restart_count,
            pid: i.pid,
            fault: i.fault,
        }
    }
}

impl TableDisplay for InstanceDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Tenant", "Port", "Install", "Desired", "Observed", "Restarts", "PID", "Fault"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.tenant_id.clone(),
            self.port.to_string(),
            self.install.clone(),
            self.desired.clone(),
            self.observed.clone(),
            self.restarts.to_string(),
            self.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
            self.fault.clone().unwrap_or_default(),
        ]
    }
}

/// Report an action response the way every lifecycle command does
pub fn report(resp: ActionResponse, format: OutputFormat) {
    if print_structured(&resp, format) {
        return;
    }
    match resp.outcome {
        OperationOutcome::Applied { detail } => print_success(&detail),
        OperationOutcome::Rejected { reason, .. } => print_warning(&reason),
        OperationOutcome::RolledBack { reason } => print_warning(&format!("rolled back: {}", reason)),
    }
    if let Some(instance) = resp.instance {
        print_item(&InstanceDisplay::from(instance), format);
    }
}

pub async fn execute(cmd: InstanceCommands, client: DaemonClient, format: OutputFormat) -> Result<()> {
    match cmd {
        InstanceCommands::List => {
            let instances = client.list_instances().await?;
            let displays: Vec<InstanceDisplay> =
                instances.into_iter().map(InstanceDisplay::from).collect();
            print_list(&displays, format);
        }

        InstanceCommands::Get { tenant } => {
            let instance = client.get_instance(&tenant).await?;
            print_item(&InstanceDisplay::from(instance), format);
        }

        InstanceCommands::Create { tenant, app_dir } => {
            report(client.create_instance(&tenant, app_dir.as_deref()).await?, format);
        }

        InstanceCommands::Delete { tenant } => {
            report(client.delete_instance(&tenant).await?, format);
        }

        InstanceCommands::Install { tenant } => {
            report(client.instance_action(&tenant, "install", false).await?, format);
        }

        InstanceCommands::Start { tenant, wait } => {
            report(client.instance_action(&tenant, "start", wait).await?, format);
        }

        InstanceCommands::Stop { tenant } => {
            report(client.instance_action(&tenant, "stop", false).await?, format);
        }

        InstanceCommands::Restart { tenant } => {
            report(client.instance_action(&tenant, "restart", false).await?, format);
        }

        InstanceCommands::Kill { tenant } => {
            report(client.instance_action(&tenant, "kill", false).await?, format);
        }

        InstanceCommands::Logs { tenant, lines } => {
            let lines = client.logs(&tenant, lines).await?;
            if !print_structured(&lines, format) {
                for line in lines {
                    println!("{}", line);
                }
            }
        }

        InstanceCommands::Diagnose { tenant } => {
            let health = client.diagnostics(&tenant).await?;
            if print_structured(&health, format) {
                return Ok(());
            }
            let fields: Vec<(&str, String)> = health
                .as_object()
                .map(|obj| {
                    obj.iter()
                        .filter(|(k, _)| k.as_str() != "recent_error_log_lines")
                        .map(|(k, v)| (k.as_str(), display_value(v)))
                        .collect()
                })
                .unwrap_or_default();
            print_fields(&fields, format);

            if let Some(errors) = health["recent_error_log_lines"].as_array() {
                if !errors.is_empty() {
                    println!();
                    println!("Recent errors:");
                    for e in errors {
                        println!("  {}", display_value(e));
                    }
                }
            }
        }
    }

    Ok(())
}

/// Render a JSON value without quotes around plain strings
pub fn display_value(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => "-".to_string(),
        other => other.to_string(),
    }
}
