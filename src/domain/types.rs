use async_graphql::{Enum, SimpleObject};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of the TCP connect to the management port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Enum)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransportOutcome {
    Success,
    Refused,
    Timeout,
    Unreachable,
    /// No management port to check; counts as reachable.
    Skipped,
}

impl TransportOutcome {
    pub fn is_ok(self) -> bool {
        matches!(self, Self::Success | Self::Skipped)
    }
}

/// Outcome of the GET against the metrics endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Enum)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetricsOutcome {
    Success,
    ConnectionError,
    Timeout,
    HttpError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, SimpleObject)]
pub struct TransportCheck {
    pub outcome: TransportOutcome,
    pub port: Option<u16>,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, SimpleObject)]
pub struct MetricsCheck {
    pub outcome: MetricsOutcome,
    pub url: String,
    /// Set whenever a response was received, including for `HttpError`.
    pub http_status: Option<u16>,
    pub body_bytes: Option<u64>,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

/// Result of one two-stage health probe. Retained on the node until the next probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, SimpleObject)]
pub struct HealthResult {
    pub checked_at: DateTime<Utc>,
    pub online: bool,
    pub transport: TransportCheck,
    pub metrics: MetricsCheck,
}

impl HealthResult {
    pub fn new(transport: TransportCheck, metrics: MetricsCheck) -> Self {
        let online = transport.outcome.is_ok() && metrics.outcome == MetricsOutcome::Success;
        Self {
            checked_at: Utc::now(),
            online,
            transport,
            metrics,
        }
    }

    /// First error text of the two checks, for the node's `last_error`.
    pub fn error_summary(&self) -> Option<String> {
        match (&self.transport.error, &self.metrics.error) {
            (Some(t), Some(m)) => Some(format!("transport: {t}; metrics: {m}")),
            (Some(t), None) => Some(format!("transport: {t}")),
            (None, Some(m)) => Some(format!("metrics: {m}")),
            (None, None) => None,
        }
    }
}

/// Facts reported by the provisioner after a successful install.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, SimpleObject)]
pub struct ProvisionFacts {
    pub hostname: Option<String>,
    #[serde(alias = "ip_address")]
    pub ip: Option<String>,
}

/// One static target as it appears in the scrape configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, SimpleObject)]
pub struct ScrapeTarget {
    pub job_name: String,
    pub target: String,
    #[graphql(skip)]
    pub labels: std::collections::BTreeMap<String, String>,
    pub scheme: String,
    /// Whether the job is managed by fleetwatch.
    pub managed: bool,
}

/// Liveness summary served at `/health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, SimpleObject)]
pub struct DaemonHealth {
    pub status: String,
    pub version: String,
    pub nodes: usize,
    pub online: usize,
    pub degraded: usize,
    pub error: usize,
}
