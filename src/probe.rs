//! Two-stage health probe: TCP connect to the management port, then a GET
//! against the exporter's metrics endpoint.
//!
//! Both stages always run and are reported separately. Failures are data,
//! never errors, and the probe touches no shared state.

use std::io::ErrorKind;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use crate::domain::node::{host_port, Node};
use crate::domain::types::{
    HealthResult, MetricsCheck, MetricsOutcome, TransportCheck, TransportOutcome,
};

/// What to probe. `management_port: None` skips the transport stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub address: String,
    pub management_port: Option<u16>,
    pub metrics_port: u16,
}

impl From<&Node> for ProbeTarget {
    fn from(node: &Node) -> Self {
        Self {
            address: node.address.clone(),
            management_port: Some(node.management_port),
            metrics_port: node.metrics_port,
        }
    }
}

#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, target: &ProbeTarget) -> HealthResult;
}

pub struct HttpProbe {
    client: reqwest::Client,
    connect_timeout: Duration,
    metrics_timeout: Duration,
    metrics_path: String,
}

impl HttpProbe {
    pub fn new(
        connect_timeout: Duration,
        metrics_timeout: Duration,
        metrics_path: &str,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(metrics_timeout)
            .build()
            .context("building probe HTTP client")?;
        Ok(Self {
            client,
            connect_timeout,
            metrics_timeout,
            metrics_path: metrics_path.to_string(),
        })
    }

    pub fn metrics_url(&self, target: &ProbeTarget) -> String {
        format!(
            "http://{}{}",
            host_port(&target.address, target.metrics_port),
            self.metrics_path
        )
    }

    async fn check_transport(&self, target: &ProbeTarget) -> TransportCheck {
        let Some(port) = target.management_port else {
            return TransportCheck {
                outcome: TransportOutcome::Skipped,
                port: None,
                latency_ms: None,
                error: None,
            };
        };

        let addr = host_port(&target.address, port);
        let started = Instant::now();
        let result = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr)).await;
        let latency_ms = Some(elapsed_ms(started));

        let (outcome, error) = match result {
            Ok(Ok(_stream)) => (TransportOutcome::Success, None),
            Ok(Err(e)) if e.kind() == ErrorKind::ConnectionRefused => {
                (TransportOutcome::Refused, Some(format!("connection refused on port {port}")))
            }
            Ok(Err(e)) if e.kind() == ErrorKind::TimedOut => {
                (TransportOutcome::Timeout, Some(format!("connect to port {port} timed out")))
            }
            Ok(Err(e)) => (TransportOutcome::Unreachable, Some(e.to_string())),
            Err(_) => (
                TransportOutcome::Timeout,
                Some(format!(
                    "connect to port {port} timed out after {}s",
                    self.connect_timeout.as_secs()
                )),
            ),
        };

        TransportCheck {
            outcome,
            port: Some(port),
            latency_ms,
            error,
        }
    }

    async fn check_metrics(&self, target: &ProbeTarget) -> MetricsCheck {
        let url = self.metrics_url(target);
        let started = Instant::now();

        let response = match self.client.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                let outcome = if e.is_timeout() {
                    MetricsOutcome::Timeout
                } else {
                    MetricsOutcome::ConnectionError
                };
                return MetricsCheck {
                    outcome,
                    url,
                    http_status: None,
                    body_bytes: None,
                    latency_ms: Some(elapsed_ms(started)),
                    error: Some(error_chain(&e)),
                };
            }
        };

        let status = response.status().as_u16();
        let body = response.bytes().await;
        let latency_ms = Some(elapsed_ms(started));

        let (outcome, body_bytes, error) = match body {
            Err(e) if e.is_timeout() => (
                MetricsOutcome::Timeout,
                None,
                Some(format!(
                    "reading metrics body timed out after {}s",
                    self.metrics_timeout.as_secs()
                )),
            ),
            Err(e) => (MetricsOutcome::ConnectionError, None, Some(error_chain(&e))),
            Ok(_) if status != 200 => (
                MetricsOutcome::HttpError,
                None,
                Some(format!("metrics endpoint returned HTTP {status}")),
            ),
            Ok(bytes) if bytes.is_empty() => (
                MetricsOutcome::HttpError,
                Some(0),
                Some("empty metrics body".to_string()),
            ),
            Ok(bytes) => (MetricsOutcome::Success, Some(bytes.len() as u64), None),
        };

        MetricsCheck {
            outcome,
            url,
            http_status: Some(status),
            body_bytes,
            latency_ms,
            error,
        }
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn probe(&self, target: &ProbeTarget) -> HealthResult {
        let (transport, metrics) =
            tokio::join!(self.check_transport(target), self.check_metrics(target));
        let result = HealthResult::new(transport, metrics);
        debug!(
            address = %target.address,
            online = result.online,
            transport = ?result.transport.outcome,
            metrics = ?result.metrics.outcome,
            "probe finished"
        );
        result
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis().try_into().unwrap_or(u64::MAX)
}

/// reqwest's top-level message hides the cause ("error sending request").
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
