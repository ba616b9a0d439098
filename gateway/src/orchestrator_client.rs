//! HTTP client for the orchestrator's internal RPC surface.

use async_trait::async_trait;
use data_model::{
    AckResponse,
    ContainerId,
    EnsureRequest,
    EnsureResponse,
    EvictRequest,
    HeartbeatRequest,
};
use tracing::debug;

use crate::config::GatewayConfig;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Connection-level failure; the orchestrator may be restarting.
    #[error("orchestrator unreachable: {0}")]
    Unreachable(String),
    #[error("orchestrator request timed out")]
    Timeout,
    /// The orchestrator answered with an error status.
    #[error("orchestrator returned {status}: {detail}")]
    Failed { status: u16, detail: String },
}

/// The gateway's view of the orchestrator. Tests substitute an in-process
/// implementation.
#[async_trait]
pub trait OrchestratorBackend: Send + Sync {
    async fn ensure(&self, function_name: &str) -> Result<EnsureResponse, OrchestratorError>;

    async fn heartbeat(
        &self,
        ids: Vec<ContainerId>,
        idle_ids: Vec<ContainerId>,
    ) -> Result<(), OrchestratorError>;

    async fn evict(&self, container_id: &ContainerId) -> Result<(), OrchestratorError>;
}

pub struct HttpOrchestratorClient {
    client: reqwest::Client,
    base_url: String,
    timeout: std::time::Duration,
}

impl HttpOrchestratorClient {
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.orchestrator_url.trim_end_matches('/').to_string(),
            timeout: config.orchestrator_timeout(),
        }
    }

    async fn post_json<Req: serde::Serialize, Resp: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        request: &Req,
    ) -> Result<Resp, OrchestratorError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(request)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    OrchestratorError::Timeout
                } else {
                    OrchestratorError::Unreachable(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(OrchestratorError::Failed {
                status: status.as_u16(),
                detail,
            });
        }
        response
            .json()
            .await
            .map_err(|e| OrchestratorError::Unreachable(e.to_string()))
    }
}

#[async_trait]
impl OrchestratorBackend for HttpOrchestratorClient {
    async fn ensure(&self, function_name: &str) -> Result<EnsureResponse, OrchestratorError> {
        debug!(function = %function_name, "Requesting container ensure");
        self.post_json(
            "/containers/ensure",
            &EnsureRequest {
                function_name: function_name.to_string(),
            },
        )
        .await
    }

    async fn heartbeat(
        &self,
        ids: Vec<ContainerId>,
        idle_ids: Vec<ContainerId>,
    ) -> Result<(), OrchestratorError> {
        let _: AckResponse = self
            .post_json("/containers/heartbeat", &HeartbeatRequest { ids, idle_ids })
            .await?;
        Ok(())
    }

    async fn evict(&self, container_id: &ContainerId) -> Result<(), OrchestratorError> {
        let _: AckResponse = self
            .post_json(
                "/containers/evict",
                &EvictRequest {
                    container_id: container_id.clone(),
                },
            )
            .await?;
        Ok(())
    }
}
