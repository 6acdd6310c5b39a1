use std::path::PathBuf;

use anyhow::Result;

use crate::config::{Config, LogFormat};

pub fn run(
    http_addr: Option<String>,
    log_level: Option<String>,
    log_format: Option<LogFormat>,
    config_path: Option<PathBuf>,
) -> Result<()> {
    let mut config = Config::load(config_path.as_deref())?;

    // CLI flags override config values
    if let Some(addr) = http_addr {
        config.daemon.http_addr = addr;
    }
    if let Some(level) = log_level {
        config.daemon.log_level = level;
    }
    if let Some(format) = log_format {
        config.daemon.log_format = format;
    }

    // Build tokio runtime explicitly (no #[tokio::main] on fn main)
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(crate::server::run(config))
}
