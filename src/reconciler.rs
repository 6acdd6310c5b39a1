//! Reconciler: converges the scrape configuration onto registry truth.
//!
//! One pass probes every node the state machine owns, folds the verdicts into
//! status transitions, derives the desired job set from ONLINE/DEGRADED nodes
//! and applies the minimal edit set to the configuration document. When there
//! is nothing to change the pass performs no write and no reload.
//!
//! Passes never overlap: the background loop runs them one at a time and an
//! on-demand pass waits on the same lock.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_graphql::SimpleObject;
use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::domain::lifecycle;
use crate::domain::node::{host_port, Node, NodeStatus};
use crate::domain::registry::NodeRegistry;
use crate::domain::types::{
    HealthResult, MetricsCheck, MetricsOutcome, TransportCheck, TransportOutcome,
};
use crate::probe::{Probe, ProbeTarget};
use crate::scrape::document::{JobTemplate, ScrapeJob};
use crate::scrape::reload::Reloader;
use crate::scrape::store::ConfigStore;

/// Nudges the background loop. Wakes that arrive while a pass is running
/// coalesce into a single follow-up pass.
#[derive(Clone, Default)]
pub struct ReconcileTrigger {
    notify: Arc<Notify>,
}

impl ReconcileTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wake(&self) {
        self.notify.notify_one();
    }

    async fn notified(&self) {
        self.notify.notified().await;
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    pub template: JobTemplate,
    pub failure_threshold: u32,
    pub max_concurrency: usize,
    /// Ceiling for a single probe, including both stages.
    pub probe_timeout: Duration,
    /// Probes still running at this point are abandoned for the pass.
    pub pass_deadline: Duration,
    /// Nodes in PROVISIONING for longer than this are moved to ERROR.
    pub provisioning_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, SimpleObject)]
pub struct StatusChange {
    pub node_id: String,
    pub from: NodeStatus,
    pub to: NodeStatus,
}

/// What one pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, SimpleObject)]
pub struct PassReport {
    pub probed: usize,
    /// Probes cut off by the pass deadline; their nodes keep their status.
    pub abandoned: usize,
    pub transitions: Vec<StatusChange>,
    pub upserted: Vec<String>,
    pub removed: Vec<String>,
    pub config_written: bool,
    pub reloaded: bool,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

pub struct Reconciler {
    registry: Arc<NodeRegistry>,
    probe: Arc<dyn Probe>,
    store: Arc<ConfigStore>,
    reloader: Arc<dyn Reloader>,
    settings: ReconcileSettings,
    pass_lock: Mutex<()>,
}

impl Reconciler {
    pub fn new(
        registry: Arc<NodeRegistry>,
        probe: Arc<dyn Probe>,
        store: Arc<ConfigStore>,
        reloader: Arc<dyn Reloader>,
        settings: ReconcileSettings,
    ) -> Self {
        Self {
            registry,
            probe,
            store,
            reloader,
            settings,
            pass_lock: Mutex::new(()),
        }
    }

    /// Run passes on `interval` and whenever `trigger` fires, until `shutdown` flips.
    pub async fn run(
        self: Arc<Self>,
        trigger: ReconcileTrigger,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = interval.as_secs(), "reconciler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = trigger.notified() => debug!("reconciler woken by registry change"),
                _ = shutdown.changed() => break,
            }

            tokio::select! {
                report = self.run_pass() => log_report(&report),
                _ = shutdown.changed() => {
                    info!("shutdown during reconciliation pass, abandoning in-flight probes");
                    break;
                }
            }
        }

        info!("reconciler stopped");
    }

    pub async fn run_pass(&self) -> PassReport {
        let _pass = self.pass_lock.lock().await;
        let started = Instant::now();
        let mut report = PassReport::default();

        self.expire_stuck_provisioning(&mut report).await;

        let nodes: Vec<Node> = self
            .registry
            .list()
            .await
            .into_iter()
            .filter(|n| n.status.is_probed())
            .collect();
        self.probe_all(nodes, &mut report).await;

        self.converge_config(&mut report).await;

        report.duration_ms = started.elapsed().as_millis().try_into().unwrap_or(u64::MAX);
        report
    }

    async fn expire_stuck_provisioning(&self, report: &mut PassReport) {
        let timeout = chrono::Duration::from_std(self.settings.provisioning_timeout)
            .unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();

        for node in self.registry.list().await {
            if node.status != NodeStatus::Provisioning || now - node.status_changed_at <= timeout {
                continue;
            }
            let transition = lifecycle::after_failed_install();
            match self
                .registry
                .set_status(&node.id, transition, Some("provisioning timed out".to_string()))
                .await
            {
                Ok(true) => {
                    warn!(node_id = %node.id, "provisioning never completed, marking node as ERROR");
                    report.transitions.push(StatusChange {
                        node_id: node.id,
                        from: NodeStatus::Provisioning,
                        to: transition.status,
                    });
                }
                Ok(false) => {}
                Err(e) => {
                    error!(node_id = %node.id, error = %e, "failed to expire provisioning");
                    report.errors.push(format!("{}: {e}", node.id));
                }
            }
        }
    }

    async fn probe_all(&self, nodes: Vec<Node>, report: &mut PassReport) {
        if nodes.is_empty() {
            return;
        }
        let concurrency = nodes.len().min(self.settings.max_concurrency.max(1));
        let deadline = tokio::time::Instant::now() + self.settings.pass_deadline;
        let probe_timeout = self.settings.probe_timeout;
        let metrics_path = self.settings.template.metrics_path.as_str();

        let results: Vec<(Node, Option<HealthResult>)> = stream::iter(nodes)
            .map(|node| {
                let probe = Arc::clone(&self.probe);
                async move {
                    let target = ProbeTarget::from(&node);
                    let bounded = tokio::time::timeout(probe_timeout, probe.probe(&target));
                    let result = match tokio::time::timeout_at(deadline, bounded).await {
                        Ok(Ok(health)) => Some(health),
                        Ok(Err(_)) => Some(timed_out(&target, probe_timeout, metrics_path)),
                        Err(_) => None,
                    };
                    (node, result)
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        for (node, health) in results {
            let Some(health) = health else {
                warn!(node_id = %node.id, "probe abandoned at pass deadline");
                report.abandoned += 1;
                continue;
            };
            report.probed += 1;
            self.record_probe(node, health, report).await;
        }
    }

    /// Failures here stay with the one node.
    async fn record_probe(&self, node: Node, health: HealthResult, report: &mut PassReport) {
        let Some(transition) = lifecycle::after_probe(
            node.status,
            node.consecutive_failures,
            health.online,
            self.settings.failure_threshold,
        ) else {
            return;
        };

        match self
            .registry
            .update_status(&node.id, transition, Some(health))
            .await
        {
            Ok(true) if transition.is_change() => {
                info!(
                    node_id = %node.id,
                    target = %node.target(),
                    from = %node.status,
                    to = %transition.status,
                    failures = transition.consecutive_failures,
                    "node status changed"
                );
                report.transitions.push(StatusChange {
                    node_id: node.id,
                    from: node.status,
                    to: transition.status,
                });
            }
            Ok(_) => {}
            Err(e) => {
                error!(node_id = %node.id, error = %e, "failed to record probe result");
                report.errors.push(format!("{}: {e}", node.id));
            }
        }
    }

    async fn converge_config(&self, report: &mut PassReport) {
        let prefix = self.settings.template.prefix.as_str();

        // Tombstones first: anything deleted before the snapshot is absent from `desired`.
        let tombstones = self.registry.tombstones().await;
        let desired: Vec<ScrapeJob> = self
            .registry
            .list()
            .await
            .iter()
            .filter(|n| n.is_scraped())
            .map(|n| ScrapeJob::for_node(n, &self.settings.template))
            .collect();

        let mut doc = match self.store.read_or_default().await {
            Ok(doc) => doc,
            Err(e) => {
                error!(error = %e, "cannot read scrape config, skipping write this pass");
                report.errors.push(e.to_string());
                return;
            }
        };

        let plan = match doc.plan(&desired, prefix) {
            Ok(plan) => plan,
            Err(e) => {
                error!(error = %e, "cannot plan scrape config edits");
                report.errors.push(e.to_string());
                return;
            }
        };

        if plan.is_empty() {
            debug!(jobs = desired.len(), "scrape config already converged");
            self.registry.purge_tombstones(&tombstones).await;
            return;
        }

        if let Err(e) = doc.apply(&plan) {
            error!(error = %e, "cannot apply scrape config edits");
            report.errors.push(e.to_string());
            return;
        }
        if let Err(e) = self.store.write_atomic(&doc).await {
            error!(error = %e, "scrape config write failed, will retry next pass");
            report.errors.push(e.to_string());
            return;
        }

        report.config_written = true;
        report.upserted = plan.upserts.iter().map(|j| j.job_key.clone()).collect();
        report.removed = plan.removals.clone();
        info!(
            upserted = plan.upserts.len(),
            removed = plan.removals.len(),
            path = %self.store.path().display(),
            "scrape config updated"
        );
        self.registry.purge_tombstones(&tombstones).await;

        match self.reloader.reload().await {
            Ok(()) => report.reloaded = true,
            Err(e) => {
                warn!(error = %e, "reload failed; monitoring keeps the previous job set");
                report.errors.push(e.to_string());
            }
        }
    }
}

/// Synthetic verdict for a probe that overran its ceiling.
fn timed_out(target: &ProbeTarget, after: Duration, metrics_path: &str) -> HealthResult {
    let message = format!("probe exceeded {}s", after.as_secs());
    HealthResult::new(
        TransportCheck {
            outcome: TransportOutcome::Timeout,
            port: target.management_port,
            latency_ms: None,
            error: Some(message.clone()),
        },
        MetricsCheck {
            outcome: MetricsOutcome::Timeout,
            url: format!(
                "http://{}{metrics_path}",
                host_port(&target.address, target.metrics_port)
            ),
            http_status: None,
            body_bytes: None,
            latency_ms: None,
            error: Some(message),
        },
    )
}

fn log_report(report: &PassReport) {
    if report.errors.is_empty() {
        info!(
            probed = report.probed,
            transitions = report.transitions.len(),
            written = report.config_written,
            duration_ms = report.duration_ms,
            "reconciliation pass completed"
        );
    } else {
        warn!(
            probed = report.probed,
            errors = report.errors.len(),
            written = report.config_written,
            duration_ms = report.duration_ms,
            "reconciliation pass completed with errors"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::domain::lifecycle::{after_install, start_provisioning};
    use crate::testing::{linux_spec, registry, StubProbe, StubReloader};

    const PREFIX: &str = "fleetwatch-node-";

    struct Harness {
        _dir: tempfile::TempDir,
        registry: Arc<NodeRegistry>,
        probe: Arc<StubProbe>,
        reloader: Arc<StubReloader>,
        store: Arc<ConfigStore>,
        reconciler: Reconciler,
    }

    fn settings() -> ReconcileSettings {
        ReconcileSettings {
            template: JobTemplate {
                prefix: PREFIX.to_string(),
                scheme: "http".to_string(),
                metrics_path: "/metrics".to_string(),
            },
            failure_threshold: 3,
            max_concurrency: 50,
            probe_timeout: Duration::from_secs(5),
            pass_deadline: Duration::from_secs(30),
            provisioning_timeout: Duration::from_secs(600),
        }
    }

    async fn harness_with(settings: ReconcileSettings) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(&dir.path().join("data")).await;
        let probe = Arc::new(StubProbe::default());
        let reloader = Arc::new(StubReloader::default());
        let store = Arc::new(ConfigStore::new(dir.path().join("prometheus.yml"), None, 10));
        let reconciler = Reconciler::new(
            registry.clone(),
            probe.clone(),
            store.clone(),
            reloader.clone(),
            settings,
        );
        Harness {
            _dir: dir,
            registry,
            probe,
            reloader,
            store,
            reconciler,
        }
    }

    async fn harness() -> Harness {
        harness_with(settings()).await
    }

    /// Register a node and walk it through a successful install, as the provisioning path would.
    async fn installed(h: &Harness, address: &str) -> String {
        let node = h.registry.add(linux_spec(address)).await.unwrap();
        let start = start_provisioning(node.status).unwrap();
        h.registry.set_status(&node.id, start, None).await.unwrap();
        h.registry
            .update_status(&node.id, after_install(true), None)
            .await
            .unwrap();
        node.id
    }

    async fn job_names(store: &ConfigStore) -> BTreeSet<String> {
        store
            .read()
            .await
            .unwrap()
            .job_names()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    async fn status(h: &Harness, id: &str) -> NodeStatus {
        h.registry.get(id).await.unwrap().status
    }

    #[tokio::test]
    async fn registration_reaches_scrape_config() {
        let h = harness().await;
        let id = installed(&h, "10.0.0.5").await;

        let report = h.reconciler.run_pass().await;
        assert!(report.config_written);
        assert!(report.reloaded);
        assert_eq!(status(&h, &id).await, NodeStatus::Online);

        let doc = h.store.read().await.unwrap();
        let targets = doc.scrape_targets(PREFIX);
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].job_name, format!("{PREFIX}{id}"));
        assert_eq!(targets[0].target, "10.0.0.5:9100");
        assert_eq!(targets[0].labels["hostname"], "10.0.0.5");
        assert_eq!(targets[0].labels["os"], "linux");
        assert_eq!(targets[0].labels["instance"], "10.0.0.5:9100");
    }

    #[tokio::test]
    async fn second_pass_is_idempotent() {
        let h = harness().await;
        installed(&h, "10.0.0.5").await;
        installed(&h, "10.0.0.6").await;

        h.reconciler.run_pass().await;
        let written = std::fs::read_to_string(h.store.path()).unwrap();
        let reloads = h.reloader.calls();

        let report = h.reconciler.run_pass().await;
        assert!(!report.config_written);
        assert!(!report.reloaded);
        assert_eq!(h.reloader.calls(), reloads);
        assert_eq!(std::fs::read_to_string(h.store.path()).unwrap(), written);
        assert_eq!(h.store.backups().await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn deletion_removes_job_and_purges_tombstone() {
        let h = harness().await;
        let id = installed(&h, "10.0.0.5").await;
        h.reconciler.run_pass().await;

        h.registry.delete(&id).await.unwrap();
        let report = h.reconciler.run_pass().await;

        assert_eq!(report.removed, vec![format!("{PREFIX}{id}")]);
        assert!(job_names(&h.store).await.is_empty());
        assert!(h.registry.list().await.is_empty());
        assert!(h.registry.tombstones().await.is_empty());
    }

    #[tokio::test]
    async fn flapping_node_degrades_then_errors_out_of_config() {
        let h = harness().await;
        let id = installed(&h, "10.0.0.5").await;
        let job = format!("{PREFIX}{id}");
        h.reconciler.run_pass().await;

        h.probe.set_online("10.0.0.5", false);
        h.reconciler.run_pass().await;
        assert_eq!(status(&h, &id).await, NodeStatus::Degraded);
        assert!(job_names(&h.store).await.contains(&job));

        // Recovery resets the counter.
        h.probe.set_online("10.0.0.5", true);
        h.reconciler.run_pass().await;
        assert_eq!(status(&h, &id).await, NodeStatus::Online);

        h.probe.set_online("10.0.0.5", false);
        h.reconciler.run_pass().await;
        h.reconciler.run_pass().await;
        assert_eq!(status(&h, &id).await, NodeStatus::Degraded);
        assert!(job_names(&h.store).await.contains(&job));

        let report = h.reconciler.run_pass().await;
        assert_eq!(status(&h, &id).await, NodeStatus::Error);
        assert_eq!(report.removed, vec![job.clone()]);
        assert!(job_names(&h.store).await.is_empty());

        // ERROR nodes are still probed and come back on success.
        h.probe.set_online("10.0.0.5", true);
        h.reconciler.run_pass().await;
        assert_eq!(status(&h, &id).await, NodeStatus::Online);
        assert!(job_names(&h.store).await.contains(&job));
    }

    #[tokio::test]
    async fn one_failing_node_does_not_affect_another() {
        let h = harness().await;
        let a = installed(&h, "10.0.0.5").await;
        let b = installed(&h, "10.0.0.6").await;
        h.probe.set_online("10.0.0.5", false);

        let report = h.reconciler.run_pass().await;
        assert_eq!(report.probed, 2);
        assert_eq!(status(&h, &a).await, NodeStatus::Degraded);
        let b = h.registry.get(&b).await.unwrap();
        assert_eq!(b.status, NodeStatus::Online);
        assert_eq!(b.consecutive_failures, 0);
        assert!(b.last_health_check.unwrap().online);
        assert_eq!(
            report.transitions,
            vec![StatusChange {
                node_id: a.clone(),
                from: NodeStatus::Online,
                to: NodeStatus::Degraded,
            }]
        );
    }

    #[tokio::test]
    async fn config_matches_scraped_nodes_exactly() {
        let h = harness().await;
        let mut ids = Vec::new();
        for i in 1..=6 {
            ids.push(installed(&h, &format!("10.0.1.{i}")).await);
        }
        let pending = h.registry.add(linux_spec("10.0.1.99")).await.unwrap();
        h.probe.set_online("10.0.1.2", false);
        h.probe.set_online("10.0.1.4", false);
        h.registry.delete(&ids[5]).await.unwrap();

        h.reconciler.run_pass().await;
        h.probe.set_online("10.0.1.2", true);
        h.reconciler.run_pass().await;

        let expected: BTreeSet<String> = h
            .registry
            .list()
            .await
            .iter()
            .filter(|n| n.is_scraped())
            .map(|n| n.job_key(PREFIX))
            .collect();
        assert_eq!(job_names(&h.store).await, expected);
        assert!(!expected.contains(&pending.job_key(PREFIX)));
        assert_eq!(expected.len(), 5);
    }

    #[tokio::test]
    async fn pending_nodes_are_not_probed() {
        let h = harness().await;
        h.registry.add(linux_spec("10.0.0.5")).await.unwrap();
        let report = h.reconciler.run_pass().await;
        assert_eq!(report.probed, 0);
        assert_eq!(h.probe.calls(), 0);
        assert!(!report.config_written);
    }

    #[tokio::test]
    async fn unparsable_config_is_left_untouched() {
        let h = harness().await;
        installed(&h, "10.0.0.5").await;
        let broken = "scrape_configs: [\n  - oops\n";
        std::fs::write(h.store.path(), broken).unwrap();

        let report = h.reconciler.run_pass().await;
        assert!(!report.config_written);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(h.reloader.calls(), 0);
        assert_eq!(std::fs::read_to_string(h.store.path()).unwrap(), broken);
    }

    #[tokio::test]
    async fn foreign_jobs_and_comments_survive() {
        let h = harness().await;
        let original = "# ops-owned\nglobal:\n  scrape_interval: 1m\nscrape_configs:\n  # self\n  - job_name: prometheus\n    static_configs:\n      - targets: ['localhost:9090']\n";
        std::fs::write(h.store.path(), original).unwrap();
        let id = installed(&h, "10.0.0.5").await;

        h.reconciler.run_pass().await;
        let written = std::fs::read_to_string(h.store.path()).unwrap();
        assert!(written.starts_with(original));

        h.registry.delete(&id).await.unwrap();
        h.reconciler.run_pass().await;
        assert_eq!(std::fs::read_to_string(h.store.path()).unwrap(), original);
        assert_eq!(h.store.backups().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failed_reload_is_not_fatal_and_not_retried_without_changes() {
        let h = harness().await;
        installed(&h, "10.0.0.5").await;
        h.reloader.fail.store(true, Ordering::SeqCst);

        let report = h.reconciler.run_pass().await;
        assert!(report.config_written);
        assert!(!report.reloaded);
        assert_eq!(report.errors.len(), 1);

        let report = h.reconciler.run_pass().await;
        assert!(!report.config_written);
        assert_eq!(h.reloader.calls(), 1);
    }

    #[tokio::test]
    async fn slow_probe_times_out_as_failure() {
        let mut s = settings();
        s.probe_timeout = Duration::from_millis(50);
        let h = harness_with(s).await;
        let id = installed(&h, "10.0.0.5").await;
        h.probe.set_delay("10.0.0.5", Duration::from_secs(2));

        let report = h.reconciler.run_pass().await;
        assert_eq!(report.probed, 1);
        let node = h.registry.get(&id).await.unwrap();
        assert_eq!(node.status, NodeStatus::Degraded);
        let health = node.last_health_check.unwrap();
        assert_eq!(health.metrics.outcome, MetricsOutcome::Timeout);
    }

    #[tokio::test]
    async fn pass_deadline_abandons_without_status_change() {
        let mut s = settings();
        s.pass_deadline = Duration::from_millis(50);
        let h = harness_with(s).await;
        let slow = installed(&h, "10.0.0.5").await;
        let fast = installed(&h, "10.0.0.6").await;
        h.probe.set_delay("10.0.0.5", Duration::from_secs(2));

        let report = h.reconciler.run_pass().await;
        assert_eq!(report.abandoned, 1);
        assert_eq!(report.probed, 1);
        let slow = h.registry.get(&slow).await.unwrap();
        assert_eq!(slow.status, NodeStatus::Online);
        assert!(slow.last_health_check.is_none());
        assert!(h.registry.get(&fast).await.unwrap().last_health_check.is_some());
    }

    #[tokio::test]
    async fn stuck_provisioning_expires_to_error() {
        let mut s = settings();
        s.provisioning_timeout = Duration::ZERO;
        let h = harness_with(s).await;
        h.probe.set_online("10.0.0.5", false);
        let node = h.registry.add(linux_spec("10.0.0.5")).await.unwrap();
        let start = start_provisioning(node.status).unwrap();
        h.registry.set_status(&node.id, start, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let report = h.reconciler.run_pass().await;
        assert_eq!(
            report.transitions[0],
            StatusChange {
                node_id: node.id.clone(),
                from: NodeStatus::Provisioning,
                to: NodeStatus::Error,
            }
        );
        assert_eq!(status(&h, &node.id).await, NodeStatus::Error);
        assert!(!config_exists(&h.store));
    }

    #[tokio::test]
    async fn retried_provisioning_survives_the_next_pass() {
        let mut s = settings();
        s.provisioning_timeout = Duration::from_millis(200);
        let h = harness_with(s).await;
        let node = h.registry.add(linux_spec("10.0.0.5")).await.unwrap();
        let start = start_provisioning(node.status).unwrap();
        h.registry.set_status(&node.id, start, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;

        let retry = start_provisioning(NodeStatus::Provisioning).unwrap();
        assert!(h.registry.set_status(&node.id, retry, None).await.unwrap());

        let report = h.reconciler.run_pass().await;
        assert!(report.transitions.is_empty());
        assert_eq!(report.probed, 0);
        assert_eq!(h.probe.calls(), 0);
        assert_eq!(status(&h, &node.id).await, NodeStatus::Provisioning);

        // The retry's own result still lands.
        let applied = h
            .registry
            .update_status(&node.id, after_install(true), None)
            .await
            .unwrap();
        assert!(applied);
        assert_eq!(status(&h, &node.id).await, NodeStatus::Online);
    }

    #[tokio::test]
    async fn wake_triggers_a_pass_and_shutdown_stops_the_loop() {
        let h = harness().await;
        let id = installed(&h, "10.0.0.5").await;
        let Harness {
            _dir,
            registry,
            store,
            reconciler,
            ..
        } = h;
        let reconciler = Arc::new(reconciler);
        let trigger = ReconcileTrigger::new();
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(reconciler.run(trigger.clone(), Duration::from_secs(3600), rx));

        // The first tick fires immediately; wait for it to land, then delete and wake.
        wait_for_jobs(&store, 1).await;
        registry.delete(&id).await.unwrap();
        trigger.wake();
        wait_for_jobs(&store, 0).await;

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    fn config_exists(store: &ConfigStore) -> bool {
        store.path().exists()
    }

    async fn wait_for_jobs(store: &ConfigStore, expected: usize) {
        for _ in 0..200 {
            if store.path().exists() {
                if let Ok(doc) = store.read().await {
                    if doc.job_names().len() == expected {
                        return;
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("scrape config never reached {expected} jobs");
    }
}
