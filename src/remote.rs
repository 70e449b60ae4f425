//! Remote indexing service transport.
//!
//! Defines the [`ChunkTransport`] seam the orchestrator and batcher deliver
//! through, plus the production [`HttpTransport`] speaking the service's
//! JSON contract: `POST {endpoint}/index/chunk` for chunk delivery and
//! `GET {endpoint}/health` for the per-file liveness precheck. Both accept
//! an optional bearer token.
//!
//! Errors are classified so the retry policy can tell transient failures
//! (5xx, transport) from terminal ones (other statuses, cancellation).

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

use crate::compress::Payload;
use crate::config::Config;
use crate::models::Chunk;

#[derive(Debug, Error, Clone)]
pub enum SendError {
    /// 5xx response; worth retrying with backoff.
    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },
    /// Non-5xx error response; retrying will not help.
    #[error("request rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },
    /// Connection/timeout failure; worth retrying.
    #[error("transport error: {0}")]
    Transport(String),
    /// The run was cancelled; propagates immediately, never retried.
    #[error("delivery cancelled")]
    Cancelled,
}

impl SendError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SendError::Server { .. } | SendError::Transport(_))
    }
}

/// One chunk ready to go over the wire.
#[derive(Debug, Clone)]
pub struct ChunkDelivery {
    pub chunk: Chunk,
    pub payload: Payload,
    /// Workspace-relative path carried in request metadata.
    pub file_path: String,
    pub job_id: String,
}

/// Seam between the pipeline and the indexing service. Tests substitute a
/// scripted implementation; production uses [`HttpTransport`].
#[async_trait]
pub trait ChunkTransport: Send + Sync + 'static {
    /// Deliver one chunk. Returns the service-assigned external id, if any.
    async fn send_chunk(&self, delivery: &ChunkDelivery) -> Result<Option<String>, SendError>;

    /// Lightweight liveness probe against the target endpoint.
    async fn health_check(&self) -> anyhow::Result<()>;
}

pub struct HttpTransport {
    /// Client with the longer per-attempt chunk delivery timeout.
    delivery_client: reqwest::Client,
    /// Client with the short health-check timeout.
    health_client: reqwest::Client,
    chunk_url: String,
    health_url: String,
    auth_token: Option<String>,
    user_id: String,
    workspace_id: String,
    webhook_url: Option<String>,
}

impl HttpTransport {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let base = config.endpoint.url.trim_end_matches('/');
        Ok(Self {
            delivery_client: reqwest::Client::builder()
                .timeout(Duration::from_secs(config.delivery.chunk_timeout_secs))
                .build()?,
            health_client: reqwest::Client::builder()
                .timeout(Duration::from_secs(config.delivery.health_timeout_secs))
                .build()?,
            chunk_url: format!("{}/index/chunk", base),
            health_url: format!("{}/health", base),
            auth_token: config.endpoint.auth_token.clone(),
            user_id: config.endpoint.user_id.clone(),
            workspace_id: config.endpoint.workspace_id.clone(),
            webhook_url: config.endpoint.webhook_url.clone(),
        })
    }

    fn body_for(&self, delivery: &ChunkDelivery) -> serde_json::Value {
        let chunk = &delivery.chunk;
        json!({
            "job_type": "index_chunk",
            "user_id": self.user_id,
            "metadata": {
                "file_path": delivery.file_path,
                "chunk_index": chunk.index,
                "content_length": chunk.content.len(),
                "fingerprint": chunk.fingerprint,
                "timestamp": Utc::now().to_rfc3339(),
                "source": "chunk-courier",
                "workspace_id": self.workspace_id,
                "job_id": delivery.job_id,
                "webhook_url": self.webhook_url,
            },
            "content": delivery.payload.wire_content(),
            "compressed": delivery.payload.is_compressed(),
            "chunk_metadata": {
                "line_count": chunk.line_count,
                "char_count": chunk.char_count,
                "has_code": chunk.has_code,
                "language": chunk.language,
                "index": chunk.index,
                "fingerprint": chunk.fingerprint,
            },
        })
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

#[async_trait]
impl ChunkTransport for HttpTransport {
    async fn send_chunk(&self, delivery: &ChunkDelivery) -> Result<Option<String>, SendError> {
        let request = self
            .authorize(self.delivery_client.post(&self.chunk_url))
            .json(&self.body_for(delivery));

        let response = request
            .send()
            .await
            .map_err(|e| SendError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            // The external id is optional and lives under either key.
            let external_id = response
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|body| {
                    body.get("chunk_id")
                        .or_else(|| body.get("job_id"))
                        .and_then(|v| v.as_str())
                        .map(String::from)
                });
            return Ok(external_id);
        }

        let message = response.text().await.unwrap_or_default();
        if status.is_server_error() {
            Err(SendError::Server {
                status: status.as_u16(),
                message,
            })
        } else {
            Err(SendError::Rejected {
                status: status.as_u16(),
                message,
            })
        }
    }

    async fn health_check(&self) -> anyhow::Result<()> {
        let response = self
            .authorize(self.health_client.get(&self.health_url))
            .send()
            .await
            .map_err(|e| {
                anyhow::anyhow!(
                    "indexing service unreachable at {}: {} (is the service running?)",
                    self.health_url,
                    e
                )
            })?;

        if !response.status().is_success() {
            anyhow::bail!(
                "indexing service health check failed at {}: HTTP {}",
                self.health_url,
                response.status()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::splitter::make_chunk;

    fn transport() -> HttpTransport {
        HttpTransport {
            delivery_client: reqwest::Client::new(),
            health_client: reqwest::Client::new(),
            chunk_url: "http://localhost:1/index/chunk".into(),
            health_url: "http://localhost:1/health".into(),
            auth_token: None,
            user_id: "u-1".into(),
            workspace_id: "ws-1".into(),
            webhook_url: None,
        }
    }

    #[test]
    fn body_carries_wire_contract_fields() {
        let chunk = make_chunk("src/lib.rs", 2, "pub fn f() {}".into(), "rust");
        let delivery = ChunkDelivery {
            payload: Payload::Plain(chunk.content.clone()),
            file_path: "src/lib.rs".into(),
            job_id: "job-7".into(),
            chunk,
        };
        let body = transport().body_for(&delivery);

        assert_eq!(body["job_type"], "index_chunk");
        assert_eq!(body["user_id"], "u-1");
        assert_eq!(body["metadata"]["chunk_index"], 2);
        assert_eq!(body["metadata"]["workspace_id"], "ws-1");
        assert_eq!(body["metadata"]["job_id"], "job-7");
        assert_eq!(body["content"], "pub fn f() {}");
        assert_eq!(body["compressed"], false);
        assert_eq!(body["chunk_metadata"]["language"], "rust");
        assert_eq!(
            body["chunk_metadata"]["fingerprint"],
            body["metadata"]["fingerprint"]
        );
    }

    #[test]
    fn retryable_classification() {
        assert!(SendError::Server {
            status: 503,
            message: String::new()
        }
        .is_retryable());
        assert!(SendError::Transport("timeout".into()).is_retryable());
        assert!(!SendError::Rejected {
            status: 400,
            message: String::new()
        }
        .is_retryable());
        assert!(!SendError::Cancelled.is_retryable());
    }
}
