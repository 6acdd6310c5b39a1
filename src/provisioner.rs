//! Provisioner adapter: installs the exporter on a node.
//!
//! The install itself is external tooling. `CommandProvisioner` runs it as a
//! child process with typed arguments (never through a shell) and reads the
//! facts it reports as a JSON object on stdout.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::domain::node::{CredentialsRef, Node, OsFamily};
use crate::domain::types::ProvisionFacts;

/// Environment variable carrying the credentials handle to the install command.
pub const CREDENTIALS_ENV: &str = "FLEETWATCH_CREDENTIALS_REF";

#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub node_id: String,
    pub address: String,
    pub management_port: u16,
    pub metrics_port: u16,
    pub os_family: OsFamily,
    pub credentials: Option<CredentialsRef>,
}

impl ProvisionRequest {
    pub fn for_node(node: &Node, credentials: Option<CredentialsRef>) -> Self {
        Self {
            node_id: node.id.clone(),
            address: node.address.clone(),
            management_port: node.management_port,
            metrics_port: node.metrics_port,
            os_family: node.os_family,
            credentials,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionOutcome {
    pub success: bool,
    pub facts: ProvisionFacts,
    pub error: Option<String>,
}

impl ProvisionOutcome {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            facts: ProvisionFacts::default(),
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn provision(&self, request: &ProvisionRequest) -> ProvisionOutcome;
}

/// For fleets where the exporter is installed out of band.
pub struct PreinstalledProvisioner;

#[async_trait]
impl Provisioner for PreinstalledProvisioner {
    async fn provision(&self, request: &ProvisionRequest) -> ProvisionOutcome {
        debug!(node_id = %request.node_id, "no provisioner configured, assuming exporter is installed");
        ProvisionOutcome {
            success: true,
            facts: ProvisionFacts::default(),
            error: None,
        }
    }
}

pub struct CommandProvisioner {
    program: String,
    args: Vec<String>,
}

impl CommandProvisioner {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn command(&self, request: &ProvisionRequest) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("--host")
            .arg(&request.address)
            .arg("--port")
            .arg(request.management_port.to_string())
            .arg("--os")
            .arg(request.os_family.to_string())
            .arg("--metrics-port")
            .arg(request.metrics_port.to_string())
            .arg("--node-id")
            .arg(&request.node_id)
            .env_remove(CREDENTIALS_ENV)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(creds) = &request.credentials {
            cmd.env(CREDENTIALS_ENV, creds.expose());
        }
        cmd
    }
}

#[async_trait]
impl Provisioner for CommandProvisioner {
    async fn provision(&self, request: &ProvisionRequest) -> ProvisionOutcome {
        info!(
            node_id = %request.node_id,
            address = %request.address,
            os = %request.os_family,
            program = %self.program,
            "running provisioner"
        );

        let output = match self.command(request).output().await {
            Ok(output) => output,
            Err(e) => {
                warn!(program = %self.program, error = %e, "failed to start provisioner");
                return ProvisionOutcome::failed(format!("failed to start {}: {e}", self.program));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let facts = parse_facts(&stdout).unwrap_or_default();

        if output.status.success() {
            return ProvisionOutcome {
                success: true,
                facts,
                error: None,
            };
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let reason = stderr
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("provisioner exited with {}", output.status));
        warn!(node_id = %request.node_id, error = %reason, "provisioner failed");
        ProvisionOutcome {
            success: false,
            facts,
            error: Some(reason),
        }
    }
}

/// The last line of `stdout` that is a JSON object.
fn parse_facts(stdout: &str) -> Option<ProvisionFacts> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|l| l.starts_with('{'))
        .find_map(|l| serde_json::from_str(l).ok())
}
