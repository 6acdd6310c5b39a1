//! `fleetwatch reconcile`: run one pass against the local registry and exit.
//!
//! Works without a daemon. Running it next to a live daemon that owns the same
//! files is safe for the document (atomic writes) but both will probe.

use std::path::Path;

use anyhow::{bail, Result};
use colored::Colorize;

use super::{print_json, status_label, OutputFormat};
use crate::config::{Config, LogFormat};
use crate::reconciler::PassReport;
use crate::server;

pub fn run(format: OutputFormat, config_path: Option<&Path>) -> Result<()> {
    let config = Config::load(config_path)?;
    if format == OutputFormat::Table {
        server::init_tracing(&config.daemon.log_level, LogFormat::Pretty);
    }

    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(async {
        let components = server::build_components(&config).await?;
        anyhow::Ok(components.reconciler.run_pass().await)
    })?;

    match format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Table => print_report(&report, Some(config.scrape.config_path.as_path())),
    }

    if !report.errors.is_empty() {
        bail!("reconciliation finished with {} error(s)", report.errors.len());
    }
    Ok(())
}

pub(crate) fn print_report(report: &PassReport, written_to: Option<&Path>) {
    println!("{}", "fleetwatch reconcile".bold());
    println!("  probed:      {}", report.probed);
    if report.abandoned > 0 {
        println!("  abandoned:   {}", report.abandoned.to_string().yellow());
    }
    for change in &report.transitions {
        println!(
            "  {} {} {} -> {}",
            "~".blue().bold(),
            change.node_id,
            status_label(change.from),
            status_label(change.to)
        );
    }
    for job in &report.upserted {
        println!("  {} {}", "+".green().bold(), job);
    }
    for job in &report.removed {
        println!("  {} {}", "-".red().bold(), job);
    }
    if report.config_written {
        println!(
            "  {} wrote {}{}",
            "ok".green().bold(),
            written_to
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "scrape config".to_string()),
            if report.reloaded { " and reloaded" } else { "" }
        );
    } else if report.errors.is_empty() {
        println!("  {} scrape config already up to date", "ok".green().bold());
    }
    for error in &report.errors {
        println!("  {} {}", "!!".red().bold(), error);
    }
    println!("  took {} ms", report.duration_ms);
}
