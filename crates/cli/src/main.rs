//! tenantmux CLI - Main Entry Point
//!
//! Talks to the daemon's operator API to manage tenant instances, the
//! generated proxy config and site branding.

use clap::{Parser, Subcommand};

mod client;
mod commands;
mod output;

use commands::{branding, diag, instance, proxy};

/// tenantmux CLI - per-tenant instance supervisor
#[derive(Parser)]
#[command(name = "tenantmux")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Daemon API address
    #[arg(long, env = "TENANTMUX_SERVER", default_value = "http://127.0.0.1:7780", global = true)]
    server: String,

    /// Admin token for mutating calls
    #[arg(long, env = "TENANTMUX_ADMIN_TOKEN", global = true, hide_env_values = true)]
    token: Option<String>,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage tenant instances
    #[command(subcommand)]
    Instance(instance::InstanceCommands),

    /// Manage the generated reverse-proxy config
    #[command(subcommand)]
    Proxy(proxy::ProxyCommands),

    /// Site title injected into tenant pages
    #[command(subcommand)]
    Branding(branding::BrandingCommands),

    /// Show which process holds a port
    Port {
        /// Port number
        port: u16,
    },

    /// List instances whose observed state differs from desired
    Drift,

    /// Check daemon status
    Status,

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .init();

    let client = client::DaemonClient::new(&cli.server, cli.token);
    tracing::debug!("Using daemon at {}", client.addr());

    let result = match cli.command {
        Commands::Instance(cmd) => instance::execute(cmd, client, cli.format).await,
        Commands::Proxy(cmd) => proxy::execute(cmd, client, cli.format).await,
        Commands::Branding(cmd) => branding::execute(cmd, client, cli.format).await,
        Commands::Port { port } => diag::port(client, port, cli.format).await,
        Commands::Drift => diag::drift(client, cli.format).await,
        Commands::Status => diag::status(client, cli.format).await,
        Commands::Version => {
            println!("tenantmux CLI v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    };

    if let Err(e) = result {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}
