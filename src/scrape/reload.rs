//! Tells Prometheus to re-read its configuration after a write.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::domain::error::ReloadError;

#[async_trait]
pub trait Reloader: Send + Sync {
    async fn reload(&self) -> Result<(), ReloadError>;
}

/// POSTs to the monitoring system's lifecycle endpoint (`/-/reload`).
pub struct ReloadNotifier {
    client: reqwest::Client,
    url: String,
}

impl ReloadNotifier {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building reload HTTP client")?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl Reloader for ReloadNotifier {
    async fn reload(&self) -> Result<(), ReloadError> {
        let response = self
            .client
            .post(&self.url)
            .send()
            .await
            .map_err(|e| ReloadError::Unreachable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(ReloadError::Rejected {
            status: status.as_u16(),
            body: body.chars().take(512).collect(),
        })
    }
}

/// Used when no reload URL is configured; Prometheus picks up the file on its own schedule.
pub struct NoReload;

#[async_trait]
impl Reloader for NoReload {
    async fn reload(&self) -> Result<(), ReloadError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::Router;

    use super::*;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/-/reload")
    }

    #[tokio::test]
    async fn success_status_is_ok() {
        let url = serve(Router::new().route("/-/reload", post(|| async { StatusCode::OK }))).await;
        let notifier = ReloadNotifier::new(&url, Duration::from_secs(2)).unwrap();
        notifier.reload().await.unwrap();
    }

    #[tokio::test]
    async fn error_status_is_rejected() {
        let url = serve(Router::new().route(
            "/-/reload",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "bad config") }),
        ))
        .await;
        let notifier = ReloadNotifier::new(&url, Duration::from_secs(2)).unwrap();
        match notifier.reload().await {
            Err(ReloadError::Rejected { status, body }) => {
                assert_eq!(status, 500);
                assert_eq!(body, "bad config");
            }
            other => panic!("expected Rejected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn closed_port_is_unreachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let notifier =
            ReloadNotifier::new(&format!("http://{addr}/-/reload"), Duration::from_secs(2)).unwrap();
        assert!(matches!(
            notifier.reload().await,
            Err(ReloadError::Unreachable(_))
        ));
    }
}
