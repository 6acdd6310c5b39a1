//! Fleet service: the command/query interface consumed by the API layers.
//!
//! Mutations return as soon as the registry write completes. Provisioning
//! runs in a background task per node, and every mutation nudges the
//! reconciler so the scrape configuration converges without waiting a full
//! interval.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{error, info, warn};

use crate::domain::error::{RegistryError, StoreError};
use crate::domain::lifecycle;
use crate::domain::node::{Node, NodeSpec, NodeStatus, NodeUpdate};
use crate::domain::registry::NodeRegistry;
use crate::domain::types::{DaemonHealth, HealthResult, ProvisionFacts, ScrapeTarget};
use crate::probe::{Probe, ProbeTarget};
use crate::provisioner::{ProvisionOutcome, ProvisionRequest, Provisioner};
use crate::reconciler::ReconcileTrigger;
use crate::scrape::store::ConfigStore;

pub struct FleetService {
    registry: Arc<NodeRegistry>,
    store: Arc<ConfigStore>,
    job_prefix: String,
    provisioning: ProvisioningRunner,
}

impl FleetService {
    pub fn new(
        registry: Arc<NodeRegistry>,
        store: Arc<ConfigStore>,
        provisioner: Arc<dyn Provisioner>,
        probe: Arc<dyn Probe>,
        trigger: ReconcileTrigger,
        provision_timeout: Duration,
        job_prefix: impl Into<String>,
    ) -> Self {
        Self {
            provisioning: ProvisioningRunner {
                registry: registry.clone(),
                provisioner,
                probe,
                trigger,
                timeout: provision_timeout,
                in_flight: InFlight::default(),
            },
            registry,
            store,
            job_prefix: job_prefix.into(),
        }
    }

    /// Register a node and start provisioning it in the background.
    pub async fn add_node(&self, spec: NodeSpec) -> Result<Node, RegistryError> {
        let node = self.registry.add(spec).await?;
        self.provisioning.spawn(&node.id);
        self.provisioning.trigger.wake();
        Ok(node)
    }

    pub async fn delete_node(&self, id: &str) -> Result<(), RegistryError> {
        self.registry.delete(id).await?;
        self.provisioning.trigger.wake();
        Ok(())
    }

    pub async fn update_node(&self, id: &str, update: NodeUpdate) -> Result<Node, RegistryError> {
        let node = self.registry.update(id, update).await?;
        self.provisioning.trigger.wake();
        Ok(node)
    }

    /// Manual retry for nodes in ERROR, or stuck in PENDING/PROVISIONING.
    pub async fn reprovision(&self, id: &str) -> Result<Node, RegistryError> {
        let node = self.get_node(id).await?;
        if lifecycle::start_provisioning(node.status).is_none() {
            return Err(RegistryError::InvalidInput(format!(
                "node {id} is {}; only ERROR, PENDING or PROVISIONING nodes can be re-provisioned",
                node.status
            )));
        }
        if !self.provisioning.spawn(id) {
            return Err(RegistryError::InvalidInput(format!(
                "provisioning of node {id} is already in progress"
            )));
        }
        Ok(node)
    }

    /// Restart provisioning for nodes left in PENDING by a previous run.
    pub async fn resume_pending(&self) -> usize {
        let pending: Vec<Node> = self
            .registry
            .list()
            .await
            .into_iter()
            .filter(|n| n.status == NodeStatus::Pending)
            .collect();
        for node in &pending {
            info!(node_id = %node.id, "resuming provisioning of pending node");
            self.provisioning.spawn(&node.id);
        }
        pending.len()
    }

    pub async fn list_nodes(&self) -> Vec<Node> {
        self.registry.list().await
    }

    pub async fn get_node(&self, id: &str) -> Result<Node, RegistryError> {
        self.registry
            .get(id)
            .await
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    /// Last probe result, `None` if the node has not been probed yet.
    pub async fn get_health(&self, id: &str) -> Result<Option<HealthResult>, RegistryError> {
        Ok(self.get_node(id).await?.last_health_check)
    }

    /// Every static target in the scrape configuration; empty if the file does not exist yet.
    pub async fn scrape_targets(&self) -> Result<Vec<ScrapeTarget>, StoreError> {
        match self.store.read().await {
            Ok(doc) => Ok(doc.scrape_targets(&self.job_prefix)),
            Err(StoreError::NotFound(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    pub async fn health(&self) -> DaemonHealth {
        let nodes = self.registry.list().await;
        let count = |status: NodeStatus| nodes.iter().filter(|n| n.status == status).count();
        DaemonHealth {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            nodes: nodes.len(),
            online: count(NodeStatus::Online),
            degraded: count(NodeStatus::Degraded),
            error: count(NodeStatus::Error),
        }
    }
}

/// Node ids with a provisioning task running.
#[derive(Clone, Default)]
struct InFlight(Arc<Mutex<HashSet<String>>>);

impl InFlight {
    fn claim(&self, id: &str) -> Option<InFlightGuard> {
        let mut set = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        set.insert(id.to_string()).then(|| InFlightGuard {
            set: self.clone(),
            id: id.to_string(),
        })
    }
}

struct InFlightGuard {
    set: InFlight,
    id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

#[derive(Clone)]
struct ProvisioningRunner {
    registry: Arc<NodeRegistry>,
    provisioner: Arc<dyn Provisioner>,
    probe: Arc<dyn Probe>,
    trigger: ReconcileTrigger,
    timeout: Duration,
    in_flight: InFlight,
}

impl ProvisioningRunner {
    /// Returns `false` if a task for this node is already running.
    fn spawn(&self, id: &str) -> bool {
        let Some(guard) = self.in_flight.claim(id) else {
            return false;
        };
        let runner = self.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = runner.run(&id).await {
                error!(node_id = %id, error = %e, "provisioning could not be recorded");
            }
        });
        true
    }

    async fn run(&self, id: &str) -> Result<(), RegistryError> {
        let Some(node) = self.registry.get(id).await else {
            return Ok(());
        };
        let Some(start) = lifecycle::start_provisioning(node.status) else {
            return Ok(());
        };
        if !self.registry.set_status(id, start, None).await? {
            return Ok(());
        }

        let request = ProvisionRequest::for_node(&node, self.registry.credentials(id).await);
        let outcome = match tokio::time::timeout(self.timeout, self.provisioner.provision(&request)).await {
            Ok(outcome) => outcome,
            Err(_) => ProvisionOutcome::failed(format!(
                "provisioning timed out after {}s",
                self.timeout.as_secs()
            )),
        };

        if !outcome.success {
            let reason = outcome
                .error
                .unwrap_or_else(|| "provisioner reported failure".to_string());
            warn!(node_id = %id, error = %reason, "provisioning failed");
            self.registry
                .set_status(id, lifecycle::after_failed_install(), Some(reason))
                .await?;
            return Ok(());
        }

        if outcome.facts != ProvisionFacts::default() {
            self.registry.record_facts(id, outcome.facts).await?;
        }

        let health = self.probe.probe(&ProbeTarget::from(&node)).await;
        let transition = lifecycle::after_install(health.online);
        if self.registry.update_status(id, transition, Some(health)).await? {
            info!(node_id = %id, status = %transition.status, "provisioning finished");
        }
        self.trigger.wake();
        Ok(())
    }
}
