//! Per-request worker orchestration.
//!
//! Order per request: breaker gate, pool permit, warm handle or host-cache
//! or Ensure, proxy the invocation, then settle the permit. Every acquired
//! permit is settled exactly once — the slot's drop guard covers panics and
//! cancelled requests.

use std::sync::Arc;

use bytes::Bytes;
use data_model::{ContainerId, FunctionRegistry};
use tracing::{info, warn};

use crate::{
    circuit_breaker::{BreakerDecision, BreakerMap},
    config::GatewayConfig,
    host_cache::ContainerHostCache,
    http_objects::GatewayError,
    invoker::{InvokeFailure, InvokeResult, Invoker},
    orchestrator_client::{OrchestratorBackend, OrchestratorError},
    pool::{AcquireError, PoolManager, WorkerHandle},
};

pub struct PoolOrchestrator {
    pub pools: Arc<PoolManager>,
    pub breakers: Arc<BreakerMap>,
    pub cache: Arc<ContainerHostCache>,
    orchestrator: Arc<dyn OrchestratorBackend>,
    invoker: Invoker,
    registry: Arc<FunctionRegistry>,
    config: Arc<GatewayConfig>,
}

impl PoolOrchestrator {
    pub fn new(
        pools: Arc<PoolManager>,
        breakers: Arc<BreakerMap>,
        cache: Arc<ContainerHostCache>,
        orchestrator: Arc<dyn OrchestratorBackend>,
        registry: Arc<FunctionRegistry>,
        config: Arc<GatewayConfig>,
    ) -> Self {
        Self {
            pools,
            breakers,
            cache,
            orchestrator,
            invoker: Invoker::new(),
            registry,
            config,
        }
    }

    /// Invoke `function_name` with `payload`, transparently provisioning a
    /// worker when none is warm.
    pub async fn invoke_function(
        &self,
        function_name: &str,
        payload: Bytes,
        request_id: Option<&str>,
    ) -> Result<InvokeResult, GatewayError> {
        let descriptor = self
            .registry
            .get(function_name)
            .ok_or_else(|| GatewayError::FunctionNotFound(function_name.to_string()))?;

        let breaker = self.breakers.breaker(function_name);
        let is_probe = match breaker.check() {
            BreakerDecision::Allow => false,
            BreakerDecision::AllowProbe => {
                info!(function = %function_name, "Circuit breaker probing worker");
                true
            }
            BreakerDecision::Reject => {
                return Err(GatewayError::BreakerOpen(function_name.to_string()));
            }
        };

        let result = self
            .invoke_with_permit(function_name, payload, request_id, descriptor)
            .await;

        match &result {
            Ok(_) => breaker.record_success(),
            Err(e) if upstream_failure(e) => breaker.record_failure(),
            // The worker was never reached; a probe slot must be returned.
            Err(_) if is_probe => breaker.abort_probe(),
            Err(_) => {}
        }
        result
    }

    async fn invoke_with_permit(
        &self,
        function_name: &str,
        payload: Bytes,
        request_id: Option<&str>,
        descriptor: &data_model::FunctionDescriptor,
    ) -> Result<InvokeResult, GatewayError> {
        let pool = self
            .pools
            .pool(function_name)
            .ok_or_else(|| GatewayError::FunctionNotFound(function_name.to_string()))?;

        let mut slot = pool
            .acquire(self.config.pool_acquire_timeout())
            .await
            .map_err(|e| match e {
                AcquireError::TimedOut => {
                    GatewayError::AcquireTimedOut(function_name.to_string())
                }
                AcquireError::Disabled => {
                    GatewayError::FunctionDisabled(function_name.to_string())
                }
            })?;

        if slot.handle().is_none() {
            match self.resolve_worker(function_name).await {
                Ok(handle) => slot.attach(handle),
                Err(e) => {
                    // Free the bare permit for the next acquirer.
                    slot.release();
                    return Err(e);
                }
            }
        }
        let handle = slot
            .handle()
            .expect("slot was just filled")
            .clone();

        let timeout = self.config.invoke_timeout(Some(descriptor));
        match self
            .invoker
            .invoke(&handle.address, payload, request_id, timeout)
            .await
        {
            Ok(result) if !result.is_failure() => {
                slot.release();
                Ok(result)
            }
            Ok(result) => {
                warn!(
                    function = %function_name,
                    container_id = %handle.container_id,
                    status = %result.status,
                    "Worker reported a failure"
                );
                self.cache.invalidate(function_name);
                slot.evict();
                Err(GatewayError::UpstreamServerError(function_name.to_string()))
            }
            Err(failure) => {
                warn!(
                    function = %function_name,
                    container_id = %handle.container_id,
                    error = %failure,
                    "Worker unreachable, evicting"
                );
                self.cache.invalidate(function_name);
                self.pools
                    .discard_container(function_name, &handle.container_id);
                slot.evict();
                // The container is presumed dead; have the orchestrator
                // remove it so the record does not linger until the reaper.
                self.evict_remote(handle.container_id.clone());
                match failure {
                    InvokeFailure::Timeout => {
                        Err(GatewayError::UpstreamTimeout(function_name.to_string()))
                    }
                    InvokeFailure::Network(_) => {
                        Err(GatewayError::UpstreamUnreachable(function_name.to_string()))
                    }
                }
            }
        }
    }

    /// Find an address for a fresh permit: host cache first, Ensure on miss.
    async fn resolve_worker(&self, function_name: &str) -> Result<WorkerHandle, GatewayError> {
        if let Some((container_id, address)) = self.cache.get(function_name) {
            return Ok(WorkerHandle {
                container_id,
                address,
            });
        }

        let response = self
            .orchestrator
            .ensure(function_name)
            .await
            .map_err(|e| match e {
                OrchestratorError::Unreachable(detail) => {
                    GatewayError::OrchestratorUnavailable(detail)
                }
                OrchestratorError::Timeout => {
                    GatewayError::OrchestratorUnavailable("request timed out".to_string())
                }
                OrchestratorError::Failed { status, detail } => {
                    GatewayError::ProvisioningFailed(format!("{status}: {detail}"))
                }
            })?;

        self.cache.put(
            function_name,
            response.container_id.clone(),
            response.address.clone(),
        );
        Ok(WorkerHandle {
            container_id: response.container_id,
            address: response.address,
        })
    }

    fn evict_remote(&self, container_id: ContainerId) {
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            if let Err(e) = orchestrator.evict(&container_id).await {
                warn!(container_id = %container_id, error = %e, "Remote evict failed");
            }
        });
    }
}

/// Failures that count against the breaker: the worker was reached and
/// misbehaved. Routing, capacity and control-plane errors do not.
fn upstream_failure(e: &GatewayError) -> bool {
    matches!(
        e,
        GatewayError::UpstreamServerError(_)
            | GatewayError::UpstreamTimeout(_)
            | GatewayError::UpstreamUnreachable(_)
    )
}
