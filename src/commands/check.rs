//! `fleetwatch check <address>`: one ad-hoc health probe, no registry involved.

use std::path::Path;

use anyhow::Result;

use super::{print_json, OutputFormat};
use crate::config::Config;
use crate::domain::node::{OsFamily, DEFAULT_METRICS_PORT};
use crate::probe::{HttpProbe, Probe, ProbeTarget};

pub fn run(
    address: &str,
    os: OsFamily,
    management_port: Option<u16>,
    metrics_port: Option<u16>,
    skip_transport: bool,
    format: OutputFormat,
    config_path: Option<&Path>,
) -> Result<()> {
    let config = Config::load(config_path)?;
    let probe = HttpProbe::new(
        config.probe.connect_timeout(),
        config.probe.metrics_timeout(),
        &config.scrape.metrics_path,
    )?;
    let target = ProbeTarget {
        address: address.to_string(),
        management_port: if skip_transport {
            None
        } else {
            Some(management_port.unwrap_or_else(|| os.default_management_port()))
        },
        metrics_port: metrics_port.unwrap_or(DEFAULT_METRICS_PORT),
    };

    let rt = tokio::runtime::Runtime::new()?;
    let health = rt.block_on(probe.probe(&target));

    match format {
        OutputFormat::Json => print_json(&health)?,
        OutputFormat::Table => super::nodes::print_health(&health),
    }

    if !health.online {
        std::process::exit(1);
    }
    Ok(())
}
