use std::{
    collections::HashMap,
    sync::{
        Arc,
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use axum::{Json, Router, response::IntoResponse, routing::post};
use data_model::{
    ContainerId,
    EnsureResponse,
    FunctionDescriptor,
    FunctionRegistry,
    RIE_INVOKE_PATH,
    WorkerAddr,
};
use tracing::subscriber;
use tracing_subscriber::{Layer, layer::SubscriberExt};

use crate::{
    config::GatewayConfig,
    orchestrator_client::{OrchestratorBackend, OrchestratorError},
    service::Service,
};

/// In-process stand-in for the orchestrator RPC surface.
#[derive(Default)]
pub struct MockOrchestrator {
    workers: Mutex<HashMap<String, (ContainerId, WorkerAddr)>>,
    pub ensure_calls: AtomicUsize,
    pub evictions: Mutex<Vec<ContainerId>>,
    pub heartbeats: Mutex<Vec<(Vec<ContainerId>, Vec<ContainerId>)>>,
    fail_ensure: AtomicBool,
    unreachable: AtomicBool,
}

impl MockOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_worker(&self, function_name: &str, id: &str, address: WorkerAddr) {
        self.workers.lock().unwrap().insert(
            function_name.to_string(),
            (ContainerId::from(id), address),
        );
    }

    pub fn set_fail_ensure(&self, fail: bool) {
        self.fail_ensure.store(fail, Ordering::SeqCst);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn ensure_calls(&self) -> usize {
        self.ensure_calls.load(Ordering::SeqCst)
    }

    pub fn evicted_ids(&self) -> Vec<String> {
        self.evictions
            .lock()
            .unwrap()
            .iter()
            .map(|id| id.get().to_string())
            .collect()
    }
}

#[async_trait]
impl OrchestratorBackend for MockOrchestrator {
    async fn ensure(&self, function_name: &str) -> Result<EnsureResponse, OrchestratorError> {
        self.ensure_calls.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(OrchestratorError::Unreachable(
                "connection refused".to_string(),
            ));
        }
        if self.fail_ensure.load(Ordering::SeqCst) {
            return Err(OrchestratorError::Failed {
                status: 500,
                detail: "injected ensure failure".to_string(),
            });
        }
        let workers = self.workers.lock().unwrap();
        match workers.get(function_name) {
            Some((id, address)) => Ok(EnsureResponse {
                container_id: id.clone(),
                address: address.clone(),
            }),
            None => Err(OrchestratorError::Failed {
                status: 404,
                detail: format!("unknown function {function_name}"),
            }),
        }
    }

    async fn heartbeat(
        &self,
        ids: Vec<ContainerId>,
        idle_ids: Vec<ContainerId>,
    ) -> Result<(), OrchestratorError> {
        self.heartbeats.lock().unwrap().push((ids, idle_ids));
        Ok(())
    }

    async fn evict(&self, container_id: &ContainerId) -> Result<(), OrchestratorError> {
        self.evictions.lock().unwrap().push(container_id.clone());
        Ok(())
    }
}

/// Behavior of a spawned in-process worker.
#[derive(Clone)]
pub enum WorkerBehavior {
    /// Respond 200 with this JSON body.
    Respond(serde_json::Value),
    /// Respond with this HTTP status and an empty JSON object.
    Status(u16),
    /// Sleep, then respond 200 with this JSON body.
    Delay(Duration, serde_json::Value),
}

pub struct FakeWorker {
    pub address: WorkerAddr,
    hits: Arc<AtomicUsize>,
}

impl FakeWorker {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

/// Spawn a worker on an ephemeral port that answers the RIE invocation
/// path with the given behavior.
pub async fn spawn_worker(behavior: WorkerBehavior) -> FakeWorker {
    let hits = Arc::new(AtomicUsize::new(0));
    let handler_hits = hits.clone();

    let app = Router::new().route(
        RIE_INVOKE_PATH,
        post(move || {
            let behavior = behavior.clone();
            let hits = handler_hits.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                match behavior {
                    WorkerBehavior::Respond(body) => {
                        (axum::http::StatusCode::OK, Json(body)).into_response()
                    }
                    WorkerBehavior::Status(status) => (
                        axum::http::StatusCode::from_u16(status).unwrap(),
                        Json(serde_json::json!({})),
                    )
                        .into_response(),
                    WorkerBehavior::Delay(delay, body) => {
                        tokio::time::sleep(delay).await;
                        (axum::http::StatusCode::OK, Json(body)).into_response()
                    }
                }
            }
        }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    FakeWorker {
        address: WorkerAddr::new("127.0.0.1".to_string(), port),
        hits,
    }
}

pub struct TestService {
    pub service: Service,
    pub orchestrator: Arc<MockOrchestrator>,
}

impl TestService {
    pub fn new(descriptors: Vec<FunctionDescriptor>) -> Result<Self> {
        Self::with_config(descriptors, test_config())
    }

    pub fn with_config(
        descriptors: Vec<FunctionDescriptor>,
        config: GatewayConfig,
    ) -> Result<Self> {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let _ = subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_filter(env_filter)),
        );

        let orchestrator = Arc::new(MockOrchestrator::new());
        let registry = Arc::new(FunctionRegistry::new(descriptors));
        let service = Service::with_backend(config, registry, orchestrator.clone())?;

        Ok(Self {
            service,
            orchestrator,
        })
    }

    pub fn bearer_token(&self) -> String {
        crate::auth::create_access_token(
            &self.service.config.auth_user,
            &self.service.config.jwt_secret_key,
            self.service.config.jwt_expires_secs,
        )
        .unwrap()
    }

    pub fn router(&self) -> Router {
        crate::routes::create_routes(crate::routes::RouteState {
            config: self.service.config.clone(),
            registry: self.service.registry.clone(),
            matcher: self.service.matcher.clone(),
            pool_orchestrator: self.service.pool_orchestrator.clone(),
            pools: self.service.pools.clone(),
        })
    }
}

pub fn test_config() -> GatewayConfig {
    GatewayConfig {
        enable_container_pooling: true,
        pool_acquire_timeout: 1.0,
        circuit_breaker_recovery_timeout: 0.2,
        lambda_invoke_timeout: 5,
        ..Default::default()
    }
}
