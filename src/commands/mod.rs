pub mod check;
pub mod daemon;
pub mod nodes;
pub mod reconcile;
pub mod targets;

use anyhow::Result;
use clap::ValueEnum;
use colored::{ColoredString, Colorize};

use crate::domain::node::NodeStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
}

pub(crate) fn print_json<T: serde::Serialize>(data: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(data)?);
    Ok(())
}

pub(crate) fn status_label(status: NodeStatus) -> ColoredString {
    let text = status.to_string();
    match status {
        NodeStatus::Online => text.green().bold(),
        NodeStatus::Degraded => text.yellow().bold(),
        NodeStatus::Error => text.red().bold(),
        NodeStatus::Pending | NodeStatus::Provisioning => text.cyan(),
    }
}
