//! Client for the remote scan service.
//!
//! The orchestrator only needs three operations (start, status, stop), which
//! the [`ScanTransport`] trait captures so tests can script the server.
//! [`HttpTransport`] is the production implementation over [`reqwest`].

use std::time::Duration;

use async_trait::async_trait;
use log::Level;
use logging_timer::timer;
use serde::{Deserialize, Serialize};

use crate::error::ScanError;

/// Status values reported by the scan service
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteState {
    Running,
    Completed,
    Failed,
    Stopped,
    #[serde(other)]
    Unknown, // Anything else the service reports is treated as still running
}

impl RemoteState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RemoteState::Completed | RemoteState::Failed | RemoteState::Stopped
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteStatus {
    pub status: RemoteState,
    #[serde(default)]
    pub error: Option<String>,
}

impl RemoteStatus {
    pub fn new(status: RemoteState) -> Self {
        Self {
            status,
            error: None,
        }
    }
}

/// The three remote operations the orchestrator drives
#[async_trait]
pub trait ScanTransport: Send + Sync {
    /// Launch a scan job, returning the server-assigned scan id
    async fn start(&self, target_url: &str) -> Result<String, ScanError>;

    async fn status(&self, scan_id: &str) -> Result<RemoteStatus, ScanError>;

    async fn stop(&self, scan_id: &str) -> Result<(), ScanError>;
}

#[derive(Debug, Serialize)]
struct StartRequest<'a> {
    url: &'a str,
}

#[derive(Debug, Deserialize)]
struct StartResponse {
    scan_id: String,
}

/// HTTP client for the scan service.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    /// * `base_url` - Service root, e.g. `http://127.0.0.1:5000`.
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, ScanError> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn scan_url(&self, scan_id: &str, action: &str) -> String {
        format!("{}/api/scan/{}/{}", self.base_url, scan_id, action)
    }

    /// Fetch the raw results document of a completed scan
    pub async fn results(&self, scan_id: &str) -> Result<serde_json::Value, ScanError> {
        let _tmr = timer!(Level::Debug; "HttpTransport::results", "scan_id {}", scan_id);
        let response = self
            .client
            .get(self.scan_url(scan_id, "results"))
            .send()
            .await?;
        Ok(Self::check_status(response).await?.json().await?)
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ScanError> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(ScanError::ServiceError {
                status: status.as_u16(),
                body,
            })
        }
    }
}

#[async_trait]
impl ScanTransport for HttpTransport {
    async fn start(&self, target_url: &str) -> Result<String, ScanError> {
        let _tmr = timer!(Level::Debug; "HttpTransport::start");
        let response = self
            .client
            .post(format!("{}/api/scan", self.base_url))
            .json(&StartRequest { url: target_url })
            .send()
            .await?;
        let started: StartResponse = Self::check_status(response).await?.json().await?;
        Ok(started.scan_id)
    }

    async fn status(&self, scan_id: &str) -> Result<RemoteStatus, ScanError> {
        let _tmr = timer!(Level::Trace; "HttpTransport::status", "scan_id {}", scan_id);
        let response = self
            .client
            .get(self.scan_url(scan_id, "status"))
            .send()
            .await?;
        let status: RemoteStatus = Self::check_status(response).await?.json().await?;
        if status.status.is_terminal() {
            log::debug!("Scan {} reported {:?}", scan_id, status.status);
        }
        Ok(status)
    }

    async fn stop(&self, scan_id: &str) -> Result<(), ScanError> {
        let _tmr = timer!(Level::Debug; "HttpTransport::stop", "scan_id {}", scan_id);
        let response = self
            .client
            .post(self.scan_url(scan_id, "stop"))
            .send()
            .await?;
        Self::check_status(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::Path,
        http::StatusCode,
        routing::{get, post},
        Json, Router,
    };
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use tokio::net::TcpListener;

    async fn spawn_fake_service() -> String {
        let app = Router::new()
            .route(
                "/api/scan",
                post(|Json(body): Json<Value>| async move {
                    if body["url"] == "https://example.com" {
                        Ok(Json(json!({ "scan_id": "s1" })))
                    } else {
                        Err((StatusCode::BAD_REQUEST, "unsupported target"))
                    }
                }),
            )
            .route(
                "/api/scan/{id}/status",
                get(|Path(id): Path<String>| async move {
                    match id.as_str() {
                        "s1" => Json(json!({ "status": "running" })),
                        "s2" => Json(json!({ "status": "failed", "error": "crawler crashed" })),
                        _ => Json(json!({ "status": "queued" })),
                    }
                }),
            )
            .route(
                "/api/scan/{id}/stop",
                post(|Path(id): Path<String>| async move {
                    if id == "s1" {
                        StatusCode::OK
                    } else {
                        StatusCode::NOT_FOUND
                    }
                }),
            )
            .route(
                "/api/scan/{id}/results",
                get(|Path(id): Path<String>| async move {
                    Json(json!({ "scan_id": id, "vulnerabilities": [] }))
                }),
            );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/", addr)
    }

    fn transport(base_url: &str) -> HttpTransport {
        HttpTransport::new(base_url, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_remote_state_decoding() {
        let status: RemoteStatus = serde_json::from_str(r#"{"status":"completed"}"#).unwrap();
        assert_eq!(status, RemoteStatus::new(RemoteState::Completed));

        let status: RemoteStatus =
            serde_json::from_str(r#"{"status":"analyzing","error":null}"#).unwrap();
        assert_eq!(status.status, RemoteState::Unknown);
        assert!(!status.status.is_terminal());
    }

    #[tokio::test]
    async fn test_start_returns_scan_id() {
        let base = spawn_fake_service().await;
        let scan_id = transport(&base).start("https://example.com").await.unwrap();
        assert_eq!(scan_id, "s1");
    }

    #[tokio::test]
    async fn test_start_rejection_is_service_error() {
        let base = spawn_fake_service().await;
        let err = transport(&base).start("https://other.example").await.unwrap_err();
        match err {
            ScanError::ServiceError { status, body } => {
                assert_eq!(status, 400);
                assert_eq!(body, "unsupported target");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_status_decodes_service_states() {
        let base = spawn_fake_service().await;
        let transport = transport(&base);

        assert_eq!(
            transport.status("s1").await.unwrap(),
            RemoteStatus::new(RemoteState::Running)
        );

        let failed = transport.status("s2").await.unwrap();
        assert_eq!(failed.status, RemoteState::Failed);
        assert_eq!(failed.error.as_deref(), Some("crawler crashed"));

        assert_eq!(transport.status("s3").await.unwrap().status, RemoteState::Unknown);
    }

    #[tokio::test]
    async fn test_stop() {
        let base = spawn_fake_service().await;
        let transport = transport(&base);
        assert!(transport.stop("s1").await.is_ok());
        assert!(matches!(
            transport.stop("missing").await,
            Err(ScanError::ServiceError { status: 404, .. })
        ));
    }

    #[tokio::test]
    async fn test_results() {
        let base = spawn_fake_service().await;
        let results = transport(&base).results("s1").await.unwrap();
        assert_eq!(results["scan_id"], "s1");
    }

    #[tokio::test]
    async fn test_unreachable_service_is_http_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = transport(&format!("http://{}", addr))
            .status("s1")
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::HttpError(_)));
    }
}
