//! Diagnostic Commands

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;

use crate::client::DaemonClient;
use crate::commands::instance::display_value;
use crate::output::{print_list, print_structured, print_success, state_colored, OutputFormat, TableDisplay};

/// Report which process holds a port
pub async fn port(client: DaemonClient, port: u16, format: OutputFormat) -> Result<()> {
    let owner = client.port_owner(port).await?;
    if print_structured(&owner, format) {
        return Ok(());
    }
    match owner["owner"].as_str() {
        Some("free") => println!("Port {} is free", port),
        Some("owned_by_pid") => println!(
            "Port {} is held by {} (pid {})",
            port,
            display_value(&owner["tenant_id"]),
            display_value(&owner["pid"])
        ),
        _ => println!(
            "Port {} is held by a process tenantmux does not supervise (pid {})",
            port,
            display_value(&owner["pid"])
        ),
    }
    Ok(())
}

#[derive(Serialize)]
struct DriftDisplay {
    tenant_id: String,
    desired: String,
    observed: String,
    fault: String,
}

impl From<&Value> for DriftDisplay {
    fn from(v: &Value) -> Self {
        Self {
            tenant_id: display_value(&v["tenant_id"]),
            desired: display_value(&v["desired"]),
            observed: display_value(&v["observed"]),
            fault: v["fault"].as_str().unwrap_or_default().to_string(),
        }
    }
}

impl TableDisplay for DriftDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Tenant", "Desired", "Observed", "Fault"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.tenant_id.clone(),
            self.desired.clone(),
            self.observed.clone(),
            self.fault.clone(),
        ]
    }
}

/// List instances that have not converged
pub async fn drift(client: DaemonClient, format: OutputFormat) -> Result<()> {
    let reports = client.drift().await?;
    let displays: Vec<DriftDisplay> = reports.iter().map(DriftDisplay::from).collect();
    if print_structured(&reports, format) {
        return Ok(());
    }
    if displays.is_empty() {
        print_success("All instances have converged");
        return Ok(());
    }
    print_list(&displays, format);
    Ok(())
}

/// Daemon health summary
pub async fn status(client: DaemonClient, format: OutputFormat) -> Result<()> {
    let health = client.health().await?;
    if print_structured(&health, format) {
        return Ok(());
    }
    print_success(&format!(
        "Daemon v{} is running at {}",
        display_value(&health["version"]),
        client.addr()
    ));
    println!(
        "   {} instances, {} {}",
        display_value(&health["instances"]),
        display_value(&health["running"]),
        state_colored("running")
    );
    Ok(())
}
