//! Typed HTTP client for the fleetwatch daemon REST API.

use anyhow::{bail, Context, Result};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::domain::node::{Node, NodeSpec};
use crate::domain::types::{DaemonHealth, HealthResult};
use crate::reconciler::PassReport;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:9110";

pub struct FleetwatchClient {
    base_url: String,
    http: Client,
}

impl FleetwatchClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub async fn health(&self) -> Result<DaemonHealth> {
        self.get("/health").await
    }

    pub async fn list_nodes(&self) -> Result<Vec<Node>> {
        self.get("/api/v1/nodes").await
    }

    pub async fn add_node(&self, spec: &NodeSpec) -> Result<Node> {
        self.send(self.request(Method::POST, "/api/v1/nodes").json(&WireSpec(spec)))
            .await
    }

    pub async fn delete_node(&self, id: &str) -> Result<()> {
        let url = self.url(&format!("/api/v1/nodes/{id}"));
        let resp = self
            .http
            .delete(&url)
            .send()
            .await
            .with_context(|| format!("DELETE {}", url))?;
        check(resp, &url).await.map(drop)
    }

    pub async fn node_health(&self, id: &str) -> Result<Option<HealthResult>> {
        self.get(&format!("/api/v1/nodes/{id}/health")).await
    }

    pub async fn reprovision(&self, id: &str) -> Result<Node> {
        self.send(self.request(Method::POST, &format!("/api/v1/nodes/{id}/reprovision")))
            .await
    }

    pub async fn reconcile(&self) -> Result<PassReport> {
        self.send(self.request(Method::POST, "/api/v1/reconcile")).await
    }

    // ── Internal helpers ───────────────────────────────────

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http.request(method, self.url(path))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send(self.request(Method::GET, path)).await
    }

    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T> {
        let (client, req) = req.build_split();
        let req = req.context("building request")?;
        let label = format!("{} {}", req.method(), req.url());

        let resp = client
            .execute(req)
            .await
            .with_context(|| label.clone())?;
        let resp = check(resp, &label).await?;

        resp.json()
            .await
            .with_context(|| format!("parsing response from {}", label))
    }
}

/// Turn a non-2xx response into an error carrying the daemon's message.
async fn check(resp: reqwest::Response, label: &str) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    match status {
        StatusCode::NOT_FOUND | StatusCode::CONFLICT | StatusCode::BAD_REQUEST if !body.is_empty() => {
            bail!("{}", body)
        }
        _ => bail!("{} returned {}: {}", label, status, body),
    }
}

/// `NodeSpec` skips credentials when serialized; the add request must carry them.
struct WireSpec<'a>(&'a NodeSpec);

impl Serialize for WireSpec<'_> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Wire<'a> {
            #[serde(flatten)]
            spec: &'a NodeSpec,
            #[serde(skip_serializing_if = "Option::is_none")]
            credentials: Option<&'a str>,
        }
        Wire {
            spec: self.0,
            credentials: self.0.credentials.as_ref().map(|c| c.expose()),
        }
        .serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    use axum::extract::State;
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::{delete, post};
    use axum::{Json, Router};

    use super::*;
    use crate::domain::node::{CredentialsRef, OsFamily};

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn add_node_sends_credentials_handle() {
        let seen = Arc::new(Mutex::new(None::<serde_json::Value>));
        let app = Router::new()
            .route(
                "/api/v1/nodes",
                post(
                    |State(seen): State<Arc<Mutex<Option<serde_json::Value>>>>,
                     Json(body): Json<serde_json::Value>| async move {
                        *seen.lock().unwrap() = Some(body);
                        (AxumStatus::CONFLICT, "target 10.0.0.5:9100 is already registered")
                    },
                ),
            )
            .with_state(seen.clone());
        let client = FleetwatchClient::new(&serve(app).await).unwrap();

        let spec = NodeSpec {
            display_name: None,
            address: "10.0.0.5".to_string(),
            os_family: OsFamily::Linux,
            management_port: None,
            metrics_port: None,
            labels: BTreeMap::new(),
            credentials: Some(CredentialsRef::new("vault:web-1")),
        };
        let err = client.add_node(&spec).await.unwrap_err();
        assert_eq!(err.to_string(), "target 10.0.0.5:9100 is already registered");

        let body = seen.lock().unwrap().clone().unwrap();
        assert_eq!(body["address"], "10.0.0.5");
        assert_eq!(body["os_family"], "linux");
        assert_eq!(body["credentials"], "vault:web-1");
    }

    #[tokio::test]
    async fn delete_and_server_errors() {
        let app = Router::new().route(
            "/api/v1/nodes/{id}",
            delete(|| async { AxumStatus::NO_CONTENT }),
        );
        let client = FleetwatchClient::new(&serve(app).await).unwrap();
        client.delete_node("n1").await.unwrap();

        let err = client.list_nodes().await.unwrap_err();
        assert!(err.to_string().contains("404"), "{err}");
    }
}
