//! `fleetwatch targets`: list static targets straight from the scrape config.

use std::path::Path;

use anyhow::Result;
use colored::Colorize;

use super::{print_json, OutputFormat};
use crate::config::Config;
use crate::domain::error::StoreError;
use crate::domain::types::ScrapeTarget;
use crate::scrape::store::ConfigStore;

pub fn run(managed_only: bool, format: OutputFormat, config_path: Option<&Path>) -> Result<()> {
    let config = Config::load(config_path)?;
    let store = ConfigStore::new(
        config.scrape.config_path.clone(),
        config.scrape.backup_dir.clone(),
        config.scrape.backup_retention,
    );

    let rt = tokio::runtime::Runtime::new()?;
    let (mut targets, interval) = match rt.block_on(store.read()) {
        Ok(doc) => (
            doc.scrape_targets(&config.scrape.job_prefix),
            doc.global().scrape_interval.clone(),
        ),
        Err(StoreError::NotFound(path)) => {
            eprintln!("{} {} does not exist yet", "::".blue().bold(), path.display());
            (Vec::new(), None)
        }
        Err(e) => return Err(e.into()),
    };
    if managed_only {
        targets.retain(|t| t.managed);
    }

    match format {
        OutputFormat::Json => print_json(&targets),
        OutputFormat::Table => {
            if let Some(interval) = interval {
                println!("{} {}", "scrape_interval:".bold(), interval);
            }
            print_targets(&targets);
            Ok(())
        }
    }
}

fn print_targets(targets: &[ScrapeTarget]) {
    if targets.is_empty() {
        println!("{} No scrape targets", "::".blue().bold());
        return;
    }
    for t in targets {
        let owner = if t.managed {
            "managed".green()
        } else {
            "foreign".dimmed()
        };
        let labels: Vec<String> = t.labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
        println!(
            "  {} {} {}://{} {}",
            owner,
            t.job_name.bold(),
            t.scheme,
            t.target,
            labels.join(",").dimmed()
        );
    }
}
