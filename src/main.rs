mod api;
mod client;
mod commands;
mod config;
mod domain;
mod probe;
mod provisioner;
mod reconciler;
mod scrape;
mod server;
#[cfg(test)]
mod testing;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use commands::OutputFormat;
use config::LogFormat;
use domain::node::OsFamily;

#[derive(Parser)]
#[command(
    name = "fleetwatch",
    version,
    about = "Node exporter fleet registry, health checker and Prometheus scrape-config reconciler"
)]
struct Cli {
    /// Path to config file (default: ~/.config/fleetwatch/config.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true, value_enum, default_value = "table")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the fleetwatch daemon (REST + GraphQL + reconciler)
    Daemon {
        /// HTTP listen address (overrides config)
        #[arg(long)]
        http_addr: Option<String>,

        /// Log level (overrides config)
        #[arg(long)]
        log_level: Option<String>,

        /// Log format (overrides config)
        #[arg(long, value_enum)]
        log_format: Option<LogFormat>,
    },

    /// Manage nodes through a running daemon
    Nodes {
        /// Daemon base URL
        #[arg(long, global = true, default_value = client::DEFAULT_BASE_URL)]
        url: String,

        #[command(subcommand)]
        command: commands::nodes::NodesCommands,
    },

    /// Run one reconciliation pass against the local registry
    Reconcile,

    /// Probe an address once and print the health result
    Check {
        /// IP address or hostname
        address: String,

        /// Operating system family, selects the default management port
        #[arg(long, default_value = "linux")]
        os: OsFamily,

        #[arg(long)]
        management_port: Option<u16>,

        #[arg(long)]
        metrics_port: Option<u16>,

        /// Only check the metrics endpoint
        #[arg(long)]
        skip_transport: bool,
    },

    /// List static targets in the scrape config
    Targets {
        /// Only jobs managed by fleetwatch
        #[arg(long)]
        managed: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Daemon {
            http_addr,
            log_level,
            log_format,
        } => commands::daemon::run(http_addr, log_level, log_format, cli.config.clone()),
        Commands::Nodes { url, command } => commands::nodes::run(&url, cli.format, command),
        Commands::Reconcile => commands::reconcile::run(cli.format, config),
        Commands::Check {
            address,
            os,
            management_port,
            metrics_port,
            skip_transport,
        } => commands::check::run(
            &address,
            os,
            management_port,
            metrics_port,
            skip_transport,
            cli.format,
            config,
        ),
        Commands::Targets { managed } => commands::targets::run(managed, cli.format, config),
    }
}
