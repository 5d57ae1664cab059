//! Best-effort reload call to the serving process.
//!
//! `POST {url}` with `{"token": ...}` (token omitted when unset). Any 2xx is
//! success; everything else is logged and swallowed.

use crate::artifacts::CheckpointManifest;
use crate::config::ReloadConfig;
use crate::error::{OrchestratorError, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};

#[async_trait]
pub trait ReloadNotifier: Send + Sync {
    /// Never fails the caller
    async fn notify(&self, manifest: &CheckpointManifest);
}

/// Notifier that does nothing (no serving process configured)
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl ReloadNotifier for NoopNotifier {
    async fn notify(&self, _manifest: &CheckpointManifest) {}
}

#[derive(Debug, Serialize)]
struct ReloadRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<&'a str>,
}

pub struct HttpReloadNotifier {
    client: reqwest::Client,
    url: Option<String>,
    token: Option<String>,
}

impl HttpReloadNotifier {
    pub fn new(config: &ReloadConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| OrchestratorError::config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: config
                .url
                .as_deref()
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(str::to_string),
            token: config.token.clone().filter(|t| !t.is_empty()),
        })
    }

    /// Single attempt; `Ok(false)` when no endpoint is configured
    pub async fn try_notify(&self) -> Result<bool> {
        let Some(url) = self.url.as_deref() else {
            return Ok(false);
        };

        let response = self
            .client
            .post(url)
            .json(&ReloadRequest {
                token: self.token.as_deref(),
            })
            .send()
            .await
            .map_err(|e| OrchestratorError::NotifyFailure(format!("{}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OrchestratorError::NotifyFailure(format!(
                "{} returned {}: {}",
                url,
                status,
                body.trim()
            )));
        }
        Ok(true)
    }
}

#[async_trait]
impl ReloadNotifier for HttpReloadNotifier {
    async fn notify(&self, manifest: &CheckpointManifest) {
        match self.try_notify().await {
            Ok(true) => info!("Requested serving reload for model {}", manifest.version),
            Ok(false) => info!("No reload URL configured, skipping serving reload"),
            Err(e) => warn!("Unable to request serving reload: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// One-shot HTTP stub; returns the raw request it received
    async fn stub(status_line: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/internal/reload", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                received.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&received);
                if let Some(split) = text.find("\r\n\r\n") {
                    let length = text[..split]
                        .lines()
                        .find_map(|l| {
                            let lower = l.to_ascii_lowercase();
                            lower
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                        })
                        .unwrap_or(0);
                    if received.len() >= split + 4 + length || n == 0 {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let reply = format!(
                "{}\r\ncontent-type: application/json\r\ncontent-length: 2\r\nconnection: close\r\n\r\n{{}}",
                status_line
            );
            socket.write_all(reply.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&received).into_owned()
        });

        (url, handle)
    }

    fn config(url: Option<String>, token: Option<&str>) -> ReloadConfig {
        ReloadConfig {
            url,
            token: token.map(str::to_string),
            timeout_seconds: 5,
        }
    }

    #[tokio::test]
    async fn test_posts_token() {
        let (url, server) = stub("HTTP/1.1 200 OK").await;
        let notifier = HttpReloadNotifier::new(&config(Some(url), Some("s3cret"))).unwrap();

        assert!(notifier.try_notify().await.unwrap());

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /internal/reload"));
        assert!(request.ends_with(r#"{"token":"s3cret"}"#));
    }

    #[tokio::test]
    async fn test_body_is_empty_object_without_token() {
        let (url, server) = stub("HTTP/1.1 202 Accepted").await;
        let notifier = HttpReloadNotifier::new(&config(Some(url), None)).unwrap();

        assert!(notifier.try_notify().await.unwrap());
        assert!(server.await.unwrap().ends_with("{}"));
    }

    #[tokio::test]
    async fn test_server_error_is_notify_failure() {
        let (url, _server) = stub("HTTP/1.1 503 Service Unavailable").await;
        let notifier = HttpReloadNotifier::new(&config(Some(url), None)).unwrap();

        let err = notifier.try_notify().await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NotifyFailure(_)));
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn test_blank_url_is_noop() {
        let notifier = HttpReloadNotifier::new(&config(Some("  ".to_string()), None)).unwrap();
        assert!(!notifier.try_notify().await.unwrap());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_swallowed() {
        // Bind then drop to get a port nobody listens on
        let addr = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap();
        let notifier =
            HttpReloadNotifier::new(&config(Some(format!("http://{}/reload", addr)), None)).unwrap();

        assert!(notifier.try_notify().await.is_err());

        let manifest = CheckpointManifest {
            version: "20240309-140507".to_string(),
            saved_at: "2024-03-09T14:05:07+00:00".to_string(),
            file: "versions/20240309-140507.pth".into(),
            source: "BERT4Rec-Mar-09-2024_14-05-07.pth".to_string(),
            current_link: "current.pth".into(),
        };
        notifier.notify(&manifest).await;
    }
}
