//! Stub collaborators shared by the service, reconciler and API tests.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::error::ReloadError;
use crate::domain::node::{NodeSpec, OsFamily};
use crate::domain::registry::NodeRegistry;
use crate::domain::types::{
    HealthResult, MetricsCheck, MetricsOutcome, ProvisionFacts, TransportCheck, TransportOutcome,
};
use crate::probe::{Probe, ProbeTarget};
use crate::provisioner::{ProvisionOutcome, ProvisionRequest, Provisioner};
use crate::scrape::reload::Reloader;

pub fn health(online: bool) -> HealthResult {
    HealthResult::new(
        TransportCheck {
            outcome: TransportOutcome::Success,
            port: Some(22),
            latency_ms: Some(1),
            error: None,
        },
        MetricsCheck {
            outcome: if online {
                MetricsOutcome::Success
            } else {
                MetricsOutcome::Timeout
            },
            url: "http://stub/metrics".to_string(),
            http_status: online.then_some(200),
            body_bytes: online.then_some(64),
            latency_ms: Some(1),
            error: (!online).then(|| "timed out".to_string()),
        },
    )
}

/// Answers per address; unknown addresses are online.
#[derive(Default)]
pub struct StubProbe {
    online: Mutex<HashMap<String, bool>>,
    delay: Mutex<HashMap<String, Duration>>,
    pub calls: AtomicUsize,
}

impl StubProbe {
    pub fn set_online(&self, address: &str, online: bool) {
        self.online.lock().unwrap().insert(address.to_string(), online);
    }

    pub fn set_delay(&self, address: &str, delay: Duration) {
        self.delay.lock().unwrap().insert(address.to_string(), delay);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Probe for StubProbe {
    async fn probe(&self, target: &ProbeTarget) -> HealthResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay.lock().unwrap().get(&target.address).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let online = self
            .online
            .lock()
            .unwrap()
            .get(&target.address)
            .copied()
            .unwrap_or(true);
        health(online)
    }
}

#[derive(Default)]
pub struct StubReloader {
    pub calls: AtomicUsize,
    pub fail: std::sync::atomic::AtomicBool,
}

impl StubReloader {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Reloader for StubReloader {
    async fn reload(&self) -> Result<(), ReloadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(ReloadError::Rejected {
                status: 500,
                body: "stub".to_string(),
            });
        }
        Ok(())
    }
}

pub struct StubProvisioner {
    pub success: bool,
    pub delay: Duration,
    pub hostname: Option<String>,
    pub calls: AtomicUsize,
}

impl StubProvisioner {
    pub fn succeeding() -> Self {
        Self {
            success: true,
            delay: Duration::ZERO,
            hostname: Some("web-1".to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            success: false,
            ..Self::succeeding()
        }
    }

    pub fn hanging(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::succeeding()
        }
    }
}

#[async_trait]
impl Provisioner for StubProvisioner {
    async fn provision(&self, _request: &ProvisionRequest) -> ProvisionOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if !self.success {
            return ProvisionOutcome::failed("stub install failed");
        }
        ProvisionOutcome {
            success: true,
            facts: ProvisionFacts {
                hostname: self.hostname.clone(),
                ip: None,
            },
            error: None,
        }
    }
}

pub fn linux_spec(address: &str) -> NodeSpec {
    NodeSpec {
        display_name: None,
        address: address.to_string(),
        os_family: OsFamily::Linux,
        management_port: None,
        metrics_port: Some(9100),
        labels: BTreeMap::new(),
        credentials: None,
    }
}

pub async fn registry(dir: &Path) -> Arc<NodeRegistry> {
    Arc::new(NodeRegistry::open(dir).await.unwrap())
}
