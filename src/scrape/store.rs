//! ConfigStore: reads and atomically replaces the Prometheus configuration file.
//!
//! A write stages the full new document in a temp file beside the target,
//! fsyncs it, copies the previous version into the backup directory and
//! renames the temp file over the target. Readers therefore see either the
//! old or the new document, never a partial one.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::document::ConfigDocument;
use crate::domain::error::StoreError;

pub struct ConfigStore {
    path: PathBuf,
    backup_dir: PathBuf,
    retention: usize,
    write_lock: Mutex<()>,
}

impl ConfigStore {
    /// `backup_dir` defaults to `backups/` next to the configuration file.
    pub fn new(path: impl Into<PathBuf>, backup_dir: Option<PathBuf>, retention: usize) -> Self {
        let path = path.into();
        let backup_dir = backup_dir.unwrap_or_else(|| {
            path.parent()
                .unwrap_or_else(|| Path::new("."))
                .join("backups")
        });
        Self {
            path,
            backup_dir,
            retention: retention.max(1),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub async fn read(&self) -> Result<ConfigDocument, StoreError> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound(self.path.clone()))
            }
            Err(e) => {
                return Err(StoreError::io(
                    format!("reading {}", self.path.display()),
                    e,
                ))
            }
        };
        ConfigDocument::parse(&text).map_err(|e| StoreError::Parse {
            path: self.path.clone(),
            message: e.to_string(),
        })
    }

    /// Like [`read`](Self::read), but a missing file yields the default document.
    pub async fn read_or_default(&self) -> Result<ConfigDocument, StoreError> {
        match self.read().await {
            Err(StoreError::NotFound(path)) => {
                info!(path = %path.display(), "scrape config missing, starting from default document");
                Ok(ConfigDocument::default_document())
            }
            other => other,
        }
    }

    /// Replace the file with `doc`. Returns the backup of the previous version, if any.
    pub async fn write_atomic(&self, doc: &ConfigDocument) -> Result<Option<PathBuf>, StoreError> {
        let _guard = self.write_lock.lock().await;
        let tmp = self.stage(&doc.render()).await?;
        self.commit(&tmp).await
    }

    fn tmp_path(&self) -> PathBuf {
        self.path
            .with_file_name(format!(".{}.fleetwatch.tmp", self.file_name()))
    }

    fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "prometheus.yml".to_string())
    }

    /// Write and fsync the temp file. Any leftover from an interrupted write is overwritten.
    async fn stage(&self, contents: &str) -> Result<PathBuf, StoreError> {
        let tmp = self.tmp_path();
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    StoreError::io(format!("creating {}", parent.display()), e)
                })?;
            }
        }

        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| StoreError::io(format!("creating {}", tmp.display()), e))?;
        file.write_all(contents.as_bytes())
            .await
            .map_err(|e| StoreError::io(format!("writing {}", tmp.display()), e))?;
        file.sync_all()
            .await
            .map_err(|e| StoreError::io(format!("syncing {}", tmp.display()), e))?;
        drop(file);

        // Keep the original file's permissions.
        if let Ok(meta) = tokio::fs::metadata(&self.path).await {
            if let Err(e) = tokio::fs::set_permissions(&tmp, meta.permissions()).await {
                debug!(error = %e, "could not copy permissions to temp file");
            }
        }

        Ok(tmp)
    }

    async fn commit(&self, tmp: &Path) -> Result<Option<PathBuf>, StoreError> {
        let backup = match tokio::fs::try_exists(&self.path).await {
            Ok(true) => Some(self.backup_current().await?),
            Ok(false) => None,
            Err(e) => {
                return Err(StoreError::io(
                    format!("checking {}", self.path.display()),
                    e,
                ))
            }
        };

        if let Err(e) = tokio::fs::rename(tmp, &self.path).await {
            let _ = tokio::fs::remove_file(tmp).await;
            return Err(StoreError::io(
                format!("renaming {} over {}", tmp.display(), self.path.display()),
                e,
            ));
        }

        info!(
            path = %self.path.display(),
            backup = ?backup.as_ref().map(|b| b.display().to_string()),
            "scrape config written"
        );
        self.prune_backups().await;
        Ok(backup)
    }

    async fn backup_current(&self) -> Result<PathBuf, StoreError> {
        tokio::fs::create_dir_all(&self.backup_dir)
            .await
            .map_err(|e| StoreError::io(format!("creating {}", self.backup_dir.display()), e))?;

        let stamp = Utc::now().format("%Y%m%d_%H%M%S_%6f");
        let base = format!("{}.backup.{stamp}", self.file_name());
        let mut backup = self.backup_dir.join(&base);
        let mut n = 1;
        while tokio::fs::try_exists(&backup).await.unwrap_or(false) {
            backup = self.backup_dir.join(clash_name(&base, n));
            n += 1;
        }

        tokio::fs::copy(&self.path, &backup).await.map_err(|e| {
            StoreError::io(format!("backing up to {}", backup.display()), e)
        })?;
        Ok(backup)
    }

    /// Backups of this file, oldest first.
    pub async fn backups(&self) -> Result<Vec<PathBuf>, StoreError> {
        let prefix = format!("{}.backup.", self.file_name());
        let mut entries = match tokio::fs::read_dir(&self.backup_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(StoreError::io(
                    format!("listing {}", self.backup_dir.display()),
                    e,
                ))
            }
        };

        let mut backups = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(format!("listing {}", self.backup_dir.display()), e))?
        {
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                backups.push(entry.path());
            }
        }
        backups.sort();
        Ok(backups)
    }

    async fn prune_backups(&self) {
        let backups = match self.backups().await {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "could not list backups for pruning");
                return;
            }
        };
        let excess = backups.len().saturating_sub(self.retention);
        for old in &backups[..excess] {
            match tokio::fs::remove_file(old).await {
                Ok(()) => debug!(backup = %old.display(), "pruned backup"),
                Err(e) => warn!(backup = %old.display(), error = %e, "failed to prune backup"),
            }
        }
    }
}

/// Zero-padded so clashing backups within one microsecond still sort in creation order.
fn clash_name(base: &str, n: u32) -> String {
    format!("{base}.{n:04}")
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::scrape::document::ScrapeJob;

    const FOREIGN: &str = "\
global:
  scrape_interval: 15s
scrape_configs:
  # self
  - job_name: prometheus
    static_configs:
      - targets: ['localhost:9090']
";

    fn job(id: &str) -> ScrapeJob {
        ScrapeJob {
            job_key: format!("fleetwatch-node-{id}"),
            targets: vec!["10.0.0.5:9100".to_string()],
            labels: BTreeMap::new(),
            scheme: "http".to_string(),
            metrics_path: "/metrics".to_string(),
        }
    }

    fn store(dir: &Path, retention: usize) -> ConfigStore {
        ConfigStore::new(dir.join("prometheus.yml"), None, retention)
    }

    #[tokio::test]
    async fn missing_file_reads_as_not_found_or_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 3);
        assert!(matches!(store.read().await, Err(StoreError::NotFound(_))));
        let doc = store.read_or_default().await.unwrap();
        assert!(doc.job_names().is_empty());
    }

    #[tokio::test]
    async fn unparsable_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 3);
        std::fs::write(store.path(), "scrape_configs: [\n").unwrap();
        assert!(matches!(store.read().await, Err(StoreError::Parse { .. })));
        assert!(matches!(store.read_or_default().await, Err(StoreError::Parse { .. })));
    }

    #[tokio::test]
    async fn first_write_creates_file_without_backup() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 3);
        let mut doc = store.read_or_default().await.unwrap();
        doc.upsert(&job("a")).unwrap();

        let backup = store.write_atomic(&doc).await.unwrap();
        assert!(backup.is_none());
        let reread = store.read().await.unwrap();
        assert_eq!(reread.job_names(), vec!["fleetwatch-node-a"]);
    }

    #[tokio::test]
    async fn write_backs_up_previous_version() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 3);
        std::fs::write(store.path(), FOREIGN).unwrap();

        let mut doc = store.read().await.unwrap();
        doc.upsert(&job("a")).unwrap();
        let backup = store.write_atomic(&doc).await.unwrap().unwrap();

        assert_eq!(std::fs::read_to_string(&backup).unwrap(), FOREIGN);
        assert!(backup
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("prometheus.yml.backup."));
        let written = std::fs::read_to_string(store.path()).unwrap();
        assert!(written.starts_with(FOREIGN));
    }

    #[tokio::test]
    async fn backups_are_pruned_to_retention() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 2);
        std::fs::write(store.path(), FOREIGN).unwrap();

        for i in 0..5 {
            let mut doc = store.read().await.unwrap();
            doc.upsert(&job(&i.to_string())).unwrap();
            store.write_atomic(&doc).await.unwrap();
        }

        // The two newest previous versions survive: before the 4th and 5th writes.
        let backups = store.backups().await.unwrap();
        assert_eq!(backups.len(), 2);
        let kept: Vec<Vec<String>> = backups
            .iter()
            .map(|b| {
                let text = std::fs::read_to_string(b).unwrap();
                let doc = ConfigDocument::parse(&text).unwrap();
                doc.job_names().into_iter().map(str::to_string).collect()
            })
            .collect();
        assert_eq!(
            kept[0],
            vec!["prometheus", "fleetwatch-node-0", "fleetwatch-node-1", "fleetwatch-node-2"]
        );
        assert_eq!(kept[1].len(), 5);
        assert_eq!(kept[1][4], "fleetwatch-node-3");
    }

    #[test]
    fn clashing_backup_names_sort_in_creation_order() {
        let base = "prometheus.yml.backup.20260101_000000_000000";
        let created: Vec<String> = std::iter::once(base.to_string())
            .chain((1..=12).map(|n| clash_name(base, n)))
            .collect();
        let mut sorted = created.clone();
        sorted.sort();
        assert_eq!(sorted, created);
    }

    #[tokio::test]
    async fn interrupted_write_leaves_original_intact() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 3);
        std::fs::write(store.path(), FOREIGN).unwrap();

        // Crash after staging but before the rename.
        let tmp = store.stage("half-written garbage").await.unwrap();
        assert!(tmp.exists());
        assert_eq!(std::fs::read_to_string(store.path()).unwrap(), FOREIGN);
        assert_eq!(store.read().await.unwrap().render(), FOREIGN);

        // The next write replaces the stale temp file and succeeds.
        let mut doc = store.read().await.unwrap();
        doc.upsert(&job("a")).unwrap();
        store.write_atomic(&doc).await.unwrap();
        assert!(!tmp.exists());
        assert_eq!(store.read().await.unwrap().job_names().len(), 2);
    }

    #[tokio::test]
    async fn custom_backup_dir_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let backups = dir.path().join("nested").join("bak");
        let store = ConfigStore::new(dir.path().join("prometheus.yml"), Some(backups.clone()), 5);
        std::fs::write(store.path(), FOREIGN).unwrap();

        let doc = store.read().await.unwrap();
        let backup = store.write_atomic(&doc).await.unwrap().unwrap();
        assert!(backup.starts_with(&backups));
        assert_eq!(store.backup_dir(), backups.as_path());
    }
}
