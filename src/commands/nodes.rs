//! `fleetwatch nodes`: manage the fleet through a running daemon.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use clap::Subcommand;
use colored::Colorize;

use super::{print_json, status_label, OutputFormat};
use crate::client::FleetwatchClient;
use crate::domain::node::{CredentialsRef, Node, NodeSpec, OsFamily};
use crate::domain::types::HealthResult;

#[derive(Subcommand)]
pub enum NodesCommands {
    /// Daemon health and status counts
    Status,
    /// List registered nodes
    List,
    /// Register a node; provisioning continues in the daemon
    Add {
        /// IP address or hostname
        address: String,

        /// Operating system family (linux or windows)
        #[arg(long, default_value = "linux")]
        os: OsFamily,

        /// Display name (defaults to the address)
        #[arg(long)]
        name: Option<String>,

        /// Management port (defaults to 22 on Linux, 5985 on Windows)
        #[arg(long)]
        management_port: Option<u16>,

        /// Exporter port
        #[arg(long)]
        metrics_port: Option<u16>,

        /// Scrape label as key=value (repeatable)
        #[arg(long = "label", value_parser = parse_label)]
        labels: Vec<(String, String)>,

        /// Opaque credentials handle passed to the provisioner
        #[arg(long)]
        credentials: Option<String>,
    },
    /// Delete a node; its scrape job is removed on the next pass
    Delete { id: String },
    /// Show the last health check of a node
    Health { id: String },
    /// Retry provisioning of a node in ERROR or stuck in PENDING/PROVISIONING
    Reprovision { id: String },
    /// Ask the daemon to run a reconciliation pass now
    Sync,
}

pub fn run(url: &str, format: OutputFormat, command: NodesCommands) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_async(url, format, command))
}

async fn run_async(url: &str, format: OutputFormat, command: NodesCommands) -> Result<()> {
    let client = FleetwatchClient::new(url)?;

    match command {
        NodesCommands::Status => {
            let health = client.health().await?;
            match format {
                OutputFormat::Json => print_json(&health),
                OutputFormat::Table => {
                    println!(
                        "{} fleetwatch {} at {}",
                        "ok".green().bold(),
                        health.version,
                        url
                    );
                    println!(
                        "  nodes: {}  online: {}  degraded: {}  error: {}",
                        health.nodes,
                        health.online.to_string().green(),
                        health.degraded.to_string().yellow(),
                        health.error.to_string().red()
                    );
                    Ok(())
                }
            }
        }
        NodesCommands::List => {
            let nodes = client.list_nodes().await?;
            match format {
                OutputFormat::Json => print_json(&nodes),
                OutputFormat::Table => {
                    print_nodes(&nodes);
                    Ok(())
                }
            }
        }
        NodesCommands::Add {
            address,
            os,
            name,
            management_port,
            metrics_port,
            labels,
            credentials,
        } => {
            let spec = NodeSpec {
                display_name: name,
                address,
                os_family: os,
                management_port,
                metrics_port,
                labels: labels.into_iter().collect::<BTreeMap<_, _>>(),
                credentials: credentials.map(CredentialsRef::new),
            };
            let node = client.add_node(&spec).await?;
            match format {
                OutputFormat::Json => print_json(&node),
                OutputFormat::Table => {
                    println!(
                        "{} Registered {} as {} ({})",
                        "ok".green().bold(),
                        node.target().bold(),
                        node.id,
                        status_label(node.status)
                    );
                    Ok(())
                }
            }
        }
        NodesCommands::Delete { id } => {
            client.delete_node(&id).await?;
            if format == OutputFormat::Table {
                println!("{} Deleted node {}", "ok".green().bold(), id);
            }
            Ok(())
        }
        NodesCommands::Health { id } => {
            let health = client.node_health(&id).await?;
            match format {
                OutputFormat::Json => print_json(&health),
                OutputFormat::Table => {
                    match health {
                        Some(h) => print_health(&h),
                        None => println!("{} node {} has not been probed yet", "::".blue().bold(), id),
                    }
                    Ok(())
                }
            }
        }
        NodesCommands::Reprovision { id } => {
            let node = client.reprovision(&id).await?;
            match format {
                OutputFormat::Json => print_json(&node),
                OutputFormat::Table => {
                    println!(
                        "{} Provisioning of {} restarted",
                        ">>".blue().bold(),
                        node.target().bold()
                    );
                    Ok(())
                }
            }
        }
        NodesCommands::Sync => {
            let report = client.reconcile().await?;
            match format {
                OutputFormat::Json => print_json(&report),
                OutputFormat::Table => {
                    super::reconcile::print_report(&report, None);
                    Ok(())
                }
            }
        }
    }
}

fn parse_label(raw: &str) -> Result<(String, String)> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.trim().to_string()))
        }
        _ => bail!("label must be key=value, got '{}'", raw),
    }
}

fn print_nodes(nodes: &[Node]) {
    if nodes.is_empty() {
        println!("{} No nodes registered", "::".blue().bold());
        return;
    }

    println!(
        "{:<38} {:<24} {:<24} {:<14} {}",
        "ID".bold(),
        "NAME".bold(),
        "TARGET".bold(),
        "STATUS".bold(),
        "LAST ERROR".bold()
    );
    for node in nodes {
        println!(
            "{:<38} {:<24} {:<24} {:<14} {}",
            node.id,
            node.display_name,
            node.target(),
            status_label(node.status),
            node.last_error.as_deref().unwrap_or("").dimmed()
        );
    }
}

pub(crate) fn print_health(health: &HealthResult) {
    let verdict = if health.online {
        "online".green().bold()
    } else {
        "offline".red().bold()
    };
    println!("{} {}", "health:".bold(), verdict);
    println!("  checked:   {}", health.checked_at.to_rfc3339());
    println!(
        "  transport: {:?}{}",
        health.transport.outcome,
        health
            .transport
            .latency_ms
            .map(|ms| format!(" ({ms} ms)"))
            .unwrap_or_default()
    );
    if let Some(e) = &health.transport.error {
        println!("             {}", e.dimmed());
    }
    println!(
        "  metrics:   {:?} {}{}",
        health.metrics.outcome,
        health.metrics.url,
        health
            .metrics
            .http_status
            .map(|s| format!(" [{s}]"))
            .unwrap_or_default()
    );
    if let Some(e) = &health.metrics.error {
        println!("             {}", e.dimmed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_parse_as_key_value() {
        assert_eq!(
            parse_label("env=prod").unwrap(),
            ("env".to_string(), "prod".to_string())
        );
        assert_eq!(
            parse_label("team = a=b").unwrap(),
            ("team".to_string(), "a=b".to_string())
        );
        assert!(parse_label("env").is_err());
        assert!(parse_label("=prod").is_err());
    }
}
