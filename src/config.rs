//! Daemon configuration.
//!
//! Layered with figment: built-in defaults, then the YAML file, then
//! `FLEETWATCH_*` environment variables (`__` separates nested keys, e.g.
//! `FLEETWATCH_SCRAPE__CONFIG_PATH`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::domain::validate;
use crate::reconciler::ReconcileSettings;
use crate::scrape::document::JobTemplate;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub daemon: DaemonConfig,
    pub registry: RegistryConfig,
    pub scrape: ScrapeConfig,
    pub reload: ReloadConfig,
    pub probe: ProbeConfig,
    pub reconcile: ReconcileConfig,
    pub provisioner: ProvisionerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub http_addr: String,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            http_addr: "127.0.0.1:9110".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Node records live in `<data_dir>/nodes/`.
    pub data_dir: PathBuf,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            data_dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("fleetwatch"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrapeConfig {
    pub config_path: PathBuf,
    /// Defaults to `backups/` next to `config_path`.
    pub backup_dir: Option<PathBuf>,
    pub backup_retention: usize,
    pub job_prefix: String,
    pub scheme: String,
    pub metrics_path: String,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("/etc/prometheus/prometheus.yml"),
            backup_dir: None,
            backup_retention: 10,
            job_prefix: "fleetwatch-node-".to_string(),
            scheme: "http".to_string(),
            metrics_path: "/metrics".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReloadConfig {
    /// e.g. `http://localhost:9090/-/reload`. Unset disables the reload call.
    pub url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub connect_timeout_secs: u64,
    pub metrics_timeout_secs: u64,
    pub max_concurrency: usize,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 5,
            metrics_timeout_secs: 5,
            max_concurrency: 50,
        }
    }
}

impl ProbeConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn metrics_timeout(&self) -> Duration {
        Duration::from_secs(self.metrics_timeout_secs)
    }

    /// Both stages run concurrently; allow one extra second of slack.
    pub fn overall_timeout(&self) -> Duration {
        self.connect_timeout().max(self.metrics_timeout()) + Duration::from_secs(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub interval_secs: u64,
    /// Consecutive failed probes before a node leaves the scrape config.
    pub failure_threshold: u32,
    pub pass_deadline_secs: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            failure_threshold: 3,
            pass_deadline_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionerConfig {
    /// Install command. Unset means exporters are installed out of band.
    pub command: Option<String>,
    pub args: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            timeout_secs: 600,
        }
    }
}

impl ProvisionerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().context("could not determine config directory")?;
        Ok(config_dir.join("fleetwatch").join("config.yaml"))
    }

    /// Load from `path` (must exist) or the default location (optional).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(p) => {
                if !p.exists() {
                    bail!("config file {} does not exist", p.display());
                }
                Some(p.to_path_buf())
            }
            None => Self::default_path().ok(),
        };

        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(file) = &file {
            figment = figment.merge(Yaml::file(file));
        }
        figment = figment.merge(Env::prefixed("FLEETWATCH_").split("__"));

        Self::from_figment(figment)
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Config = figment.extract().context("invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.reconcile.interval_secs == 0 {
            bail!("reconcile.interval_secs must be at least 1");
        }
        if self.reconcile.failure_threshold == 0 {
            bail!("reconcile.failure_threshold must be at least 1");
        }
        if self.reconcile.pass_deadline_secs == 0 {
            bail!("reconcile.pass_deadline_secs must be at least 1");
        }
        if self.probe.max_concurrency == 0 {
            bail!("probe.max_concurrency must be at least 1");
        }
        if self.probe.connect_timeout_secs == 0 || self.probe.metrics_timeout_secs == 0 {
            bail!("probe timeouts must be at least 1 second");
        }
        if self.scrape.backup_retention == 0 {
            bail!("scrape.backup_retention must be at least 1");
        }
        if !validate::is_job_name(&self.scrape.job_prefix) {
            bail!(
                "scrape.job_prefix '{}' must be non-empty and use only letters, digits, '_', '-' or '.'",
                self.scrape.job_prefix
            );
        }
        if !matches!(self.scrape.scheme.as_str(), "http" | "https") {
            bail!("scrape.scheme must be 'http' or 'https'");
        }
        if !self.scrape.metrics_path.starts_with('/') {
            bail!("scrape.metrics_path must start with '/'");
        }
        if self.reload.timeout_secs == 0 {
            bail!("reload.timeout_secs must be at least 1");
        }
        if self.provisioner.timeout_secs == 0 {
            bail!("provisioner.timeout_secs must be at least 1");
        }
        Ok(())
    }

    pub fn job_template(&self) -> JobTemplate {
        JobTemplate {
            prefix: self.scrape.job_prefix.clone(),
            scheme: self.scrape.scheme.clone(),
            metrics_path: self.scrape.metrics_path.clone(),
        }
    }

    pub fn reconcile_settings(&self) -> ReconcileSettings {
        ReconcileSettings {
            template: self.job_template(),
            failure_threshold: self.reconcile.failure_threshold,
            max_concurrency: self.probe.max_concurrency,
            probe_timeout: self.probe.overall_timeout(),
            pass_deadline: Duration::from_secs(self.reconcile.pass_deadline_secs),
            provisioning_timeout: self.provisioner.timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_yaml(yaml: &str) -> Result<Config> {
        Config::from_figment(
            Figment::from(Serialized::defaults(Config::default())).merge(Yaml::string(yaml)),
        )
    }

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.daemon.http_addr, "127.0.0.1:9110");
        assert_eq!(config.daemon.log_format, LogFormat::Json);
        assert_eq!(config.scrape.backup_retention, 10);
        assert_eq!(config.reconcile.interval_secs, 30);
        assert_eq!(config.reconcile.failure_threshold, 3);
        assert_eq!(config.probe.max_concurrency, 50);
        assert!(config.registry.data_dir.ends_with("fleetwatch"));
    }

    #[test]
    fn yaml_overrides_only_what_it_names() {
        let config = from_yaml(
            "scrape:\n  config_path: /tmp/prom.yml\n  job_prefix: fw-\nreconcile:\n  failure_threshold: 5\ndaemon:\n  log_format: pretty\n",
        )
        .unwrap();
        assert_eq!(config.scrape.config_path, PathBuf::from("/tmp/prom.yml"));
        assert_eq!(config.scrape.job_prefix, "fw-");
        assert_eq!(config.scrape.metrics_path, "/metrics");
        assert_eq!(config.reconcile.failure_threshold, 5);
        assert_eq!(config.reconcile.interval_secs, 30);
        assert_eq!(config.daemon.log_format, LogFormat::Pretty);
    }

    #[test]
    fn invalid_values_are_rejected() {
        for yaml in [
            "reconcile:\n  failure_threshold: 0\n",
            "probe:\n  max_concurrency: 0\n",
            "scrape:\n  backup_retention: 0\n",
            "scrape:\n  job_prefix: 'bad prefix'\n",
            "scrape:\n  job_prefix: ''\n",
            "scrape:\n  scheme: ftp\n",
            "daemon:\n  log_format: xml\n",
            "reload:\n  timeout_secs: 0\n",
        ] {
            assert!(from_yaml(yaml).is_err(), "{yaml:?} should be rejected");
        }
    }

    #[test]
    fn load_reads_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "reload:\n  url: http://localhost:9090/-/reload\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(
            config.reload.url.as_deref(),
            Some("http://localhost:9090/-/reload")
        );
        assert!(Config::load(Some(&dir.path().join("missing.yaml"))).is_err());
    }

    #[test]
    fn reconcile_settings_bound_probes() {
        let settings = Config::default().reconcile_settings();
        assert_eq!(settings.probe_timeout, Duration::from_secs(6));
        assert_eq!(settings.provisioning_timeout, Duration::from_secs(600));
        assert_eq!(settings.template.prefix, "fleetwatch-node-");
    }
}
