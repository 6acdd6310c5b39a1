//! Node: one monitored host and its exporter.
//!
//! A `Node` carries both what the operator declared (address, ports, labels)
//! and what the reconciler observed (status, last probe result).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use async_graphql::{ComplexObject, Enum, SimpleObject};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::{HealthResult, ProvisionFacts};

pub const DEFAULT_METRICS_PORT: u16 = 9100;

/// A monitored node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, SimpleObject)]
#[graphql(complex)]
pub struct Node {
    pub id: String,
    pub display_name: String,
    pub address: String,
    pub management_port: u16,
    pub metrics_port: u16,
    pub os_family: OsFamily,
    pub status: NodeStatus,
    pub last_health_check: Option<HealthResult>,
    #[graphql(skip)]
    pub scrape_labels: BTreeMap<String, String>,
    /// Labels as of the last successful health check; these are what gets scraped.
    #[graphql(skip)]
    #[serde(default)]
    pub published_labels: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub facts: Option<ProvisionFacts>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status_changed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, SimpleObject)]
pub struct Label {
    pub name: String,
    pub value: String,
}

#[ComplexObject]
impl Node {
    /// Labels attached to the scrape job.
    async fn labels(&self) -> Vec<Label> {
        self.scrape_labels
            .iter()
            .map(|(name, value)| Label {
                name: name.clone(),
                value: value.clone(),
            })
            .collect()
    }

    /// The `address:port` scraped by the monitoring system.
    async fn scrape_target(&self) -> String {
        self.target()
    }
}

impl Node {
    /// `address:metrics_port`, bracketing IPv6 literals.
    pub fn target(&self) -> String {
        host_port(&self.address, self.metrics_port)
    }

    /// Deterministic scrape job name for this node.
    pub fn job_key(&self, prefix: &str) -> String {
        job_key(prefix, &self.id)
    }

    pub fn is_scraped(&self) -> bool {
        self.status.is_scraped()
    }

    /// Hostname reported by the provisioner, falling back to the address.
    pub fn hostname(&self) -> &str {
        self.facts
            .as_ref()
            .and_then(|f| f.hostname.as_deref())
            .unwrap_or(&self.address)
    }

    /// Labels to publish: user labels plus `hostname` and `os`, which cannot be
    /// overridden, and an `instance` of `hostname:metrics_port` unless the user set one.
    pub fn effective_labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.scrape_labels.clone();
        labels
            .entry("instance".to_string())
            .or_insert_with(|| host_port(self.hostname(), self.metrics_port));
        labels.insert("hostname".to_string(), self.hostname().to_string());
        labels.insert("os".to_string(), self.os_family.to_string());
        labels
    }
}

pub fn job_key(prefix: &str, node_id: &str) -> String {
    format!("{prefix}{node_id}")
}

pub fn host_port(address: &str, port: u16) -> String {
    if address.contains(':') {
        format!("[{address}]:{port}")
    } else {
        format!("{address}:{port}")
    }
}

/// Lifecycle status of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Enum)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Pending,
    Provisioning,
    Online,
    Degraded,
    Error,
}

impl NodeStatus {
    /// Whether a scrape job exists for nodes in this status.
    pub fn is_scraped(self) -> bool {
        matches!(self, Self::Online | Self::Degraded)
    }

    /// Whether the reconciler probes nodes in this status.
    pub fn is_probed(self) -> bool {
        matches!(self, Self::Online | Self::Degraded | Self::Error)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Provisioning => "PROVISIONING",
            Self::Online => "ONLINE",
            Self::Degraded => "DEGRADED",
            Self::Error => "ERROR",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Enum)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    Linux,
    Windows,
}

impl OsFamily {
    /// SSH for Linux, WinRM over HTTP for Windows.
    pub fn default_management_port(self) -> u16 {
        match self {
            Self::Linux => 22,
            Self::Windows => 5985,
        }
    }
}

impl FromStr for OsFamily {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "linux" => Ok(Self::Linux),
            "windows" => Ok(Self::Windows),
            other => bail!("unknown OS family '{}' (expected 'linux' or 'windows')", other),
        }
    }
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linux => write!(f, "linux"),
            Self::Windows => write!(f, "windows"),
        }
    }
}

/// Opaque handle to credentials held by the provisioning tooling.
///
/// Never logged and never returned by the API.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialsRef(String);

impl CredentialsRef {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for CredentialsRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CredentialsRef(<redacted>)")
    }
}

impl fmt::Display for CredentialsRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

/// Dashboard input for `AddNode`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    #[serde(default)]
    pub display_name: Option<String>,
    pub address: String,
    pub os_family: OsFamily,
    #[serde(default)]
    pub management_port: Option<u16>,
    #[serde(default)]
    pub metrics_port: Option<u16>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing)]
    pub credentials: Option<CredentialsRef>,
}

/// Mutable fields for `UpdateNode`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeUpdate {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub labels: Option<BTreeMap<String, String>>,
}
