//! NodeRegistry: source of truth for every monitored node.
//!
//! Each node lives in its own file under `<data_dir>/nodes/<id>.json`, wrapped
//! with a SHA-256 checksum and written atomically (temp file, fsync, rename),
//! so a failed or corrupt write can only ever affect that one node.
//!
//! Locking: the index lock guards membership (add/delete/duplicate checks);
//! each record has its own mutex, so probes updating different nodes never
//! contend with each other.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::RegistryError;
use super::lifecycle::Transition;
use super::node::{
    CredentialsRef, Node, NodeSpec, NodeStatus, NodeUpdate, DEFAULT_METRICS_PORT,
};
use super::types::{HealthResult, ProvisionFacts};
use super::validate;

/// Everything persisted for one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct NodeRecord {
    node: Node,
    #[serde(default)]
    credentials: Option<CredentialsRef>,
    #[serde(default)]
    deleted_at: Option<DateTime<Utc>>,
}

/// On-disk envelope: `"sha256:<hex>"` over the serialized record.
#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    checksum: String,
    record: NodeRecord,
}

impl StoredRecord {
    fn new(record: NodeRecord) -> std::io::Result<Self> {
        let checksum = checksum(&record)?;
        Ok(Self { checksum, record })
    }

    fn verify(&self) -> bool {
        checksum(&self.record)
            .map(|expected| expected == self.checksum)
            .unwrap_or(false)
    }
}

fn checksum(record: &NodeRecord) -> std::io::Result<String> {
    let serialized = serde_json::to_string(record).map_err(std::io::Error::other)?;
    Ok(format!("sha256:{:x}", Sha256::digest(serialized.as_bytes())))
}

struct Entry {
    /// `address:metrics_port`; immutable for the node's lifetime.
    target: String,
    record: Mutex<NodeRecord>,
}

pub struct NodeRegistry {
    dir: PathBuf,
    entries: RwLock<HashMap<String, Arc<Entry>>>,
    tombstones: Mutex<HashMap<String, PathBuf>>,
}

impl NodeRegistry {
    /// Open (or create) the registry under `data_dir`, loading every valid record.
    ///
    /// Unreadable or checksum-failing records are skipped with a warning; they
    /// do not prevent the rest of the fleet from loading.
    pub async fn open(data_dir: &Path) -> Result<Self, RegistryError> {
        let dir = data_dir.join("nodes");
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| RegistryError::persistence(format!("creating {}", dir.display()), e))?;

        let mut entries = HashMap::new();
        let mut tombstones = HashMap::new();

        let mut read_dir = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| RegistryError::persistence(format!("listing {}", dir.display()), e))?;

        while let Some(dirent) = read_dir
            .next_entry()
            .await
            .map_err(|e| RegistryError::persistence(format!("listing {}", dir.display()), e))?
        {
            let path = dirent.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match load_record(&path).await {
                Ok(record) => {
                    let id = record.node.id.clone();
                    if record.deleted_at.is_some() {
                        tombstones.insert(id, path);
                    } else {
                        let target = record.node.target();
                        entries.insert(
                            id,
                            Arc::new(Entry {
                                target,
                                record: Mutex::new(record),
                            }),
                        );
                    }
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable node record");
                }
            }
        }

        info!(
            nodes = entries.len(),
            tombstones = tombstones.len(),
            dir = %dir.display(),
            "node registry loaded"
        );

        Ok(Self {
            dir,
            entries: RwLock::new(entries),
            tombstones: Mutex::new(tombstones),
        })
    }

    /// Validate and register a new node in `PENDING`.
    pub async fn add(&self, spec: NodeSpec) -> Result<Node, RegistryError> {
        let address = validate::address(&spec.address)?;
        let management_port = validate::port(
            spec.management_port
                .unwrap_or_else(|| spec.os_family.default_management_port()),
            "management port",
        )?;
        let metrics_port = validate::port(
            spec.metrics_port.unwrap_or(DEFAULT_METRICS_PORT),
            "metrics port",
        )?;
        let display_name = match spec.display_name.as_deref() {
            Some(name) => validate::display_name(name)?,
            None => address.clone(),
        };
        let scrape_labels = validate::labels(&spec.labels)?;

        let now = Utc::now();
        let node = Node {
            id: Uuid::new_v4().to_string(),
            display_name,
            address,
            management_port,
            metrics_port,
            os_family: spec.os_family,
            status: NodeStatus::Pending,
            last_health_check: None,
            scrape_labels,
            published_labels: None,
            consecutive_failures: 0,
            last_error: None,
            facts: None,
            created_at: now,
            updated_at: now,
            status_changed_at: now,
        };
        let target = node.target();

        let mut entries = self.entries.write().await;
        if let Some((existing_id, _)) = entries.iter().find(|(_, e)| e.target == target) {
            return Err(RegistryError::DuplicateTarget {
                target,
                existing_id: existing_id.clone(),
            });
        }

        let record = NodeRecord {
            node: node.clone(),
            credentials: spec.credentials,
            deleted_at: None,
        };
        self.persist(&record).await?;

        entries.insert(
            node.id.clone(),
            Arc::new(Entry {
                target,
                record: Mutex::new(record),
            }),
        );

        info!(node_id = %node.id, target = %node.target(), os = %node.os_family, "node registered");
        Ok(node)
    }

    /// Record a probe-driven transition.
    ///
    /// Returns `false` without touching the record if the node was deleted or
    /// has left `transition.from` in the meantime (e.g. it was re-provisioned
    /// while a probe was in flight).
    pub async fn update_status(
        &self,
        id: &str,
        transition: Transition,
        health: Option<HealthResult>,
    ) -> Result<bool, RegistryError> {
        let updated = self
            .mutate(id, |node| {
                if node.status != transition.from {
                    return Ok(false);
                }
                apply_status(node, transition.status);
                node.consecutive_failures = transition.consecutive_failures;
                if let Some(health) = health {
                    if health.online {
                        node.published_labels = Some(node.effective_labels());
                    }
                    node.last_error = health.error_summary();
                    node.last_health_check = Some(health);
                }
                Ok(true)
            })
            .await?;
        Ok(updated.is_some())
    }

    /// Provisioning-path move with an explanatory error text.
    ///
    /// Same compare-and-set rule as [`update_status`](Self::update_status).
    /// Every provisioning start restarts the stuck-install clock, including a
    /// retry of a node already in PROVISIONING.
    pub async fn set_status(
        &self,
        id: &str,
        transition: Transition,
        error: Option<String>,
    ) -> Result<bool, RegistryError> {
        let updated = self
            .mutate(id, |node| {
                if node.status != transition.from {
                    return Ok(false);
                }
                apply_status(node, transition.status);
                if transition.status == NodeStatus::Provisioning {
                    node.status_changed_at = Utc::now();
                }
                node.consecutive_failures = transition.consecutive_failures;
                node.last_error = error;
                Ok(true)
            })
            .await?;
        Ok(updated.is_some())
    }

    pub async fn record_facts(&self, id: &str, facts: ProvisionFacts) -> Result<bool, RegistryError> {
        let updated = self
            .mutate(id, |node| {
                node.facts = Some(facts);
                Ok(true)
            })
            .await?;
        Ok(updated.is_some())
    }

    /// Apply an explicit update command to the mutable fields.
    pub async fn update(&self, id: &str, update: NodeUpdate) -> Result<Node, RegistryError> {
        let display_name = update
            .display_name
            .as_deref()
            .map(validate::display_name)
            .transpose()?;
        let labels = update.labels.as_ref().map(validate::labels).transpose()?;

        self.mutate(id, |node| {
            if let Some(name) = display_name {
                node.display_name = name;
            }
            if let Some(labels) = labels {
                node.scrape_labels = labels;
            }
            Ok(true)
        })
        .await?
        .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    /// Tombstone a node. The scrape job is removed by the next reconciliation pass.
    pub async fn delete(&self, id: &str) -> Result<(), RegistryError> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .remove(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        let mut record = entry.record.lock().await;
        let previous = record.deleted_at;
        record.deleted_at = Some(Utc::now());

        if let Err(e) = self.persist(&record).await {
            record.deleted_at = previous;
            drop(record);
            entries.insert(id.to_string(), entry);
            return Err(e);
        }

        self.tombstones
            .lock()
            .await
            .insert(id.to_string(), self.record_path(id));
        info!(node_id = %id, target = %entry.target, "node deleted");
        Ok(())
    }

    /// Snapshot of all live nodes, oldest first.
    pub async fn list(&self) -> Vec<Node> {
        let entries: Vec<Arc<Entry>> = self.entries.read().await.values().cloned().collect();
        let mut nodes = Vec::with_capacity(entries.len());
        for entry in entries {
            let record = entry.record.lock().await;
            if record.deleted_at.is_none() {
                nodes.push(record.node.clone());
            }
        }
        nodes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        nodes
    }

    pub async fn get(&self, id: &str) -> Option<Node> {
        let entry = self.entries.read().await.get(id).cloned()?;
        let record = entry.record.lock().await;
        record.deleted_at.is_none().then(|| record.node.clone())
    }

    pub async fn credentials(&self, id: &str) -> Option<CredentialsRef> {
        let entry = self.entries.read().await.get(id).cloned()?;
        let record = entry.record.lock().await;
        record.credentials.clone()
    }

    /// Ids of deleted nodes whose records have not been purged yet.
    pub async fn tombstones(&self) -> Vec<String> {
        self.tombstones.lock().await.keys().cloned().collect()
    }

    /// Remove tombstone files once the scrape config no longer references them.
    pub async fn purge_tombstones(&self, ids: &[String]) {
        let mut tombstones = self.tombstones.lock().await;
        for id in ids {
            let Some(path) = tombstones.remove(id) else {
                continue;
            };
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(node_id = %id, "purged tombstone"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(node_id = %id, error = %e, "failed to purge tombstone");
                    tombstones.insert(id.clone(), path);
                }
            }
        }
    }

    /// Run `f` against a live node under its record lock and persist the result.
    ///
    /// Returns `Ok(None)` when the node is missing, was deleted concurrently,
    /// or `f` declined the change by returning `false`. On a persistence
    /// failure the in-memory record is left unchanged.
    async fn mutate<F>(&self, id: &str, f: F) -> Result<Option<Node>, RegistryError>
    where
        F: FnOnce(&mut Node) -> Result<bool, RegistryError>,
    {
        let Some(entry) = self.entries.read().await.get(id).cloned() else {
            return Ok(None);
        };
        let mut record = entry.record.lock().await;
        if record.deleted_at.is_some() {
            return Ok(None);
        }

        let mut next = record.clone();
        if !f(&mut next.node)? {
            return Ok(None);
        }
        next.node.updated_at = Utc::now();
        self.persist(&next).await?;

        *record = next;
        Ok(Some(record.node.clone()))
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    async fn persist(&self, record: &NodeRecord) -> Result<(), RegistryError> {
        let path = self.record_path(&record.node.id);
        write_record(&path, record)
            .await
            .map_err(|e| RegistryError::persistence(format!("writing {}", path.display()), e))
    }

    /// Number of live nodes already registered for `address:port`.
    #[cfg(test)]
    async fn count_target(&self, address: &str, port: u16) -> usize {
        let target = crate::domain::node::host_port(address, port);
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.target == target)
            .count()
    }
}

fn apply_status(node: &mut Node, status: NodeStatus) {
    if node.status != status {
        node.status_changed_at = Utc::now();
    }
    node.status = status;
}

async fn write_record(path: &Path, record: &NodeRecord) -> std::io::Result<()> {
    let stored = StoredRecord::new(record.clone())?;
    let content = serde_json::to_vec_pretty(&stored).map_err(std::io::Error::other)?;

    let tmp_path = path.with_extension("json.tmp");
    let mut file = tokio::fs::File::create(&tmp_path).await?;
    file.write_all(&content).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp_path, path).await
}

async fn load_record(path: &Path) -> anyhow::Result<NodeRecord> {
    use anyhow::{bail, Context};

    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let stored: StoredRecord = serde_json::from_str(&content)
        .with_context(|| format!("parsing {}", path.display()))?;

    if !stored.verify() {
        bail!("checksum verification failed for {}", path.display());
    }
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
    if stem != stored.record.node.id {
        bail!(
            "record id {} does not match file name {}",
            stored.record.node.id,
            path.display()
        );
    }
    Ok(stored.record)
}
