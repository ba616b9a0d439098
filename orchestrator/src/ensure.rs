//! Idempotent "a ready container exists for this function" operation.
//!
//! Concurrent Ensure calls for one function coalesce on a per-function
//! flight mutex: the first caller does the work, followers re-check the warm
//! path after the lock and observe the same container. The cold path runs in
//! a detached task so a cancelled client request can neither abort a
//! half-finished start nor leak the container it created.

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use data_model::{
    ContainerId,
    ContainerRecord,
    ContainerState,
    EnsureResponse,
    FunctionDescriptor,
    FunctionRegistry,
    RIE_INVOKE_PATH,
    WorkerAddr,
    esb_labels,
    get_epoch_time_in_ms,
};
use nanoid::nanoid;
use runtime_driver::{
    ContainerSpec,
    DriverError,
    LABEL_HOST_PORT,
    RuntimeDriver,
    RuntimeState,
};
use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::{config::OrchestratorConfig, lifecycle_store::LifecycleStore, ports::PortAllocator};

const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(500);
const READINESS_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const ADDRESS_POLL_ATTEMPTS: u32 = 20;
const ADDRESS_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum EnsureError {
    #[error("unknown function: {0}")]
    UnknownFunction(String),
    #[error("function {0} is at capacity")]
    AtCapacity(String),
    #[error("image pull failed for {function}: {source}")]
    ImagePullFailed {
        function: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("container start failed for {function}: {source}")]
    ContainerStartFailed {
        function: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("container for {0} did not become ready in time")]
    ReadinessTimedOut(String),
    #[error("container name conflict for {0}")]
    Conflict(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub struct Provisioner {
    driver: Arc<dyn RuntimeDriver>,
    store: Arc<LifecycleStore>,
    registry: Arc<FunctionRegistry>,
    ports: Arc<PortAllocator>,
    config: Arc<OrchestratorConfig>,
    http_client: reqwest::Client,
    /// Per-function flight locks coalescing concurrent Ensure calls.
    flights: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Provisioner {
    pub fn new(
        driver: Arc<dyn RuntimeDriver>,
        store: Arc<LifecycleStore>,
        registry: Arc<FunctionRegistry>,
        ports: Arc<PortAllocator>,
        config: Arc<OrchestratorConfig>,
    ) -> Self {
        Self {
            driver,
            store,
            registry,
            ports,
            config,
            http_client: reqwest::Client::new(),
            flights: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn flight(&self, function_name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut flights = self.flights.lock().unwrap();
        flights
            .entry(function_name.to_string())
            .or_default()
            .clone()
    }

    pub async fn ensure(&self, function_name: &str) -> Result<EnsureResponse, EnsureError> {
        let descriptor = self
            .registry
            .get(function_name)
            .cloned()
            .ok_or_else(|| EnsureError::UnknownFunction(function_name.to_string()))?;

        // Warm fast path, no flight lock.
        if let Some(response) = self.warm_path(function_name).await {
            return Ok(response);
        }

        let flight = self.flight(function_name);
        let _guard = flight.lock().await;

        // Re-check after the lock: a coalesced leader may have provisioned
        // while this caller waited.
        if let Some(response) = self.warm_path(function_name).await {
            return Ok(response);
        }

        if let Some(response) = self.resume_paused(function_name).await? {
            return Ok(response);
        }

        if descriptor.max_capacity == 0 {
            return Err(EnsureError::AtCapacity(function_name.to_string()));
        }
        let active = self
            .store
            .with_function(function_name, |fc| fc.active_count())
            .await;
        if active >= descriptor.max_capacity as usize {
            // The gateway pool already bounds this; defensive.
            return Err(EnsureError::AtCapacity(function_name.to_string()));
        }

        self.cold_start_detached(descriptor).await
    }

    async fn warm_path(&self, function_name: &str) -> Option<EnsureResponse> {
        let now = get_epoch_time_in_ms();
        self.store
            .with_function(function_name, |fc| {
                let warm_id = fc.find_warm().map(|r| r.id.clone())?;
                let record = fc.get_mut(&warm_id)?;
                record.touch(now);
                Some(EnsureResponse {
                    container_id: record.id.clone(),
                    address: record.address.clone(),
                })
            })
            .await
    }

    async fn resume_paused(
        &self,
        function_name: &str,
    ) -> Result<Option<EnsureResponse>, EnsureError> {
        let paused_id = self
            .store
            .with_function(function_name, |fc| fc.find_paused().map(|r| r.id.clone()))
            .await;
        let Some(id) = paused_id else {
            return Ok(None);
        };

        match self.driver.resume(&id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                // The container vanished underneath us; fall back to a cold
                // start.
                warn!(container_id = %id, "Paused container gone, purging record");
                self.store.remove(&id).await;
                return Ok(None);
            }
            Err(e) => return Err(EnsureError::Internal(anyhow::Error::new(e))),
        }

        info!(function = %function_name, container_id = %id, "Resumed paused container");
        let now = get_epoch_time_in_ms();
        let response = self
            .store
            .with_function(function_name, |fc| {
                let record = fc.get_mut(&id)?;
                record.set_state(ContainerState::Ready).ok()?;
                record.touch(now);
                Some(EnsureResponse {
                    container_id: record.id.clone(),
                    address: record.address.clone(),
                })
            })
            .await;
        Ok(response)
    }

    /// Run the cold start in a spawned task so client cancellation cannot
    /// drop it halfway and leak a container.
    async fn cold_start_detached(
        &self,
        descriptor: FunctionDescriptor,
    ) -> Result<EnsureResponse, EnsureError> {
        let driver = self.driver.clone();
        let store = self.store.clone();
        let ports = self.ports.clone();
        let config = self.config.clone();
        let http_client = self.http_client.clone();

        tokio::spawn(async move {
            cold_start(driver, store, ports, config, http_client, descriptor).await
        })
        .await
        .map_err(|e| EnsureError::Internal(anyhow::anyhow!("cold start task failed: {e}")))?
    }

    /// Remove a container and its record, freeing any published port.
    /// Idempotent: a container already gone still gets its record purged.
    pub async fn teardown(&self, id: &ContainerId, reason: &str) -> Result<(), anyhow::Error> {
        if let Some(function) = self.store.function_of(id) {
            self.store
                .with_function(&function, |fc| {
                    if let Some(record) = fc.get_mut(id) {
                        let _ = record.set_state(ContainerState::Stopping);
                    }
                })
                .await;
        }

        match self.driver.remove(id, true).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                warn!(container_id = %id, error = %e, "Failed to remove container");
                return Err(anyhow::Error::new(e));
            }
        }

        if let Some(record) = self.store.remove(id).await {
            release_published_port(&self.ports, &record);
            info!(
                container_id = %id,
                function = %record.function_name,
                reason = %reason,
                "Container removed"
            );
        }
        Ok(())
    }
}

pub(crate) fn release_published_port(ports: &PortAllocator, record: &ContainerRecord) {
    if let Some(port) = record
        .labels
        .get(LABEL_HOST_PORT)
        .and_then(|p| p.parse().ok())
    {
        ports.release(port);
    }
}

async fn cold_start(
    driver: Arc<dyn RuntimeDriver>,
    store: Arc<LifecycleStore>,
    ports: Arc<PortAllocator>,
    config: Arc<OrchestratorConfig>,
    http_client: reqwest::Client,
    descriptor: FunctionDescriptor,
) -> Result<EnsureResponse, EnsureError> {
    let function_name = descriptor.name.clone();

    driver
        .ensure_image(&descriptor.image_ref)
        .await
        .map_err(|e| EnsureError::ImagePullFailed {
            function: function_name.clone(),
            source: anyhow::Error::new(e),
        })?;

    let host_port = if config.publish_ports {
        Some(ports.allocate().map_err(EnsureError::Internal)?)
    } else {
        None
    };

    let name = format!("esb-{}-{}", function_name, nanoid!(8));
    let mut spec = ContainerSpec::new(name.clone(), descriptor.image_ref.clone(), config.lambda_port);
    spec.env = descriptor.env.clone();
    spec.labels = esb_labels(&function_name);
    spec.network = config.lambda_network.clone();
    spec.host_port = host_port;

    let id = match driver.create_container(&spec).await {
        Ok(id) => id,
        Err(DriverError::Conflict(_)) => {
            if let Some(port) = host_port {
                ports.release(port);
            }
            return adopt_existing(driver, store, &function_name, &name).await;
        }
        Err(e) => {
            if let Some(port) = host_port {
                ports.release(port);
            }
            return Err(EnsureError::ContainerStartFailed {
                function: function_name,
                source: anyhow::Error::new(e),
            });
        }
    };

    // Record the container as provisioning before it starts so capacity
    // accounting covers the whole cold window.
    let mut record = ContainerRecord::new(
        id.clone(),
        &function_name,
        WorkerAddr::new(String::new(), config.lambda_port),
    );
    store.insert(record.clone()).await;

    info!(function = %function_name, container_id = %id, "Cold start: starting container");

    if let Err(e) = driver.start(&id).await {
        rollback(&driver, &store, &ports, &id, host_port).await;
        return Err(EnsureError::ContainerStartFailed {
            function: function_name,
            source: anyhow::Error::new(e),
        });
    }

    let Some((address, labels)) = wait_for_address(&driver, &id).await else {
        rollback(&driver, &store, &ports, &id, host_port).await;
        return Err(EnsureError::ContainerStartFailed {
            function: function_name,
            source: anyhow::anyhow!("container has no reachable address"),
        });
    };

    if config.probe_readiness {
        let ready = wait_for_readiness(&http_client, &address, config.cold_start_timeout()).await;
        if !ready {
            rollback(&driver, &store, &ports, &id, host_port).await;
            return Err(EnsureError::ReadinessTimedOut(function_name));
        }
    }

    let now = get_epoch_time_in_ms();
    record.address = address.clone();
    record.labels = labels;
    record
        .set_state(ContainerState::Ready)
        .map_err(|e| EnsureError::Internal(anyhow::anyhow!(e)))?;
    record.touch(now);
    store.insert(record).await;

    info!(function = %function_name, container_id = %id, address = %address, "Cold start complete");

    Ok(EnsureResponse {
        container_id: id,
        address,
    })
}

/// A create hit a name collision: adopt the existing container if it is ours
/// and running, otherwise clear it out and fail.
async fn adopt_existing(
    driver: Arc<dyn RuntimeDriver>,
    store: Arc<LifecycleStore>,
    function_name: &str,
    name: &str,
) -> Result<EnsureResponse, EnsureError> {
    let id = ContainerId::new(name.to_string());
    let existing = driver
        .inspect(&id)
        .await
        .map_err(|e| EnsureError::Internal(anyhow::Error::new(e)))?;

    let ours = existing
        .labels
        .get(data_model::LABEL_FUNCTION)
        .is_some_and(|f| f == function_name);

    if ours && existing.state == RuntimeState::Running {
        if let Some(address) = existing.address {
            info!(function = %function_name, container_id = %id, "Adopted colliding container");
            let mut record = ContainerRecord::new(id.clone(), function_name, address.clone());
            record.labels = existing.labels;
            record
                .set_state(ContainerState::Ready)
                .map_err(|e| EnsureError::Internal(anyhow::anyhow!(e)))?;
            store.insert(record).await;
            return Ok(EnsureResponse {
                container_id: id,
                address,
            });
        }
    }

    warn!(function = %function_name, container_id = %id, "Removing non-adoptable colliding container");
    let _ = driver.remove(&id, true).await;
    Err(EnsureError::Conflict(function_name.to_string()))
}

async fn rollback(
    driver: &Arc<dyn RuntimeDriver>,
    store: &Arc<LifecycleStore>,
    ports: &Arc<PortAllocator>,
    id: &ContainerId,
    host_port: Option<u16>,
) {
    warn!(container_id = %id, "Rolling back failed cold start");
    if let Err(e) = driver.remove(id, true).await {
        if !e.is_not_found() {
            warn!(container_id = %id, error = %e, "Rollback removal failed");
        }
    }
    store.remove(id).await;
    if let Some(port) = host_port {
        ports.release(port);
    }
}

/// Poll inspect until the runtime reports a reachable address.
async fn wait_for_address(
    driver: &Arc<dyn RuntimeDriver>,
    id: &ContainerId,
) -> Option<(WorkerAddr, HashMap<String, String>)> {
    for _ in 0..ADDRESS_POLL_ATTEMPTS {
        match driver.inspect(id).await {
            Ok(container) => {
                if let Some(address) = container.address {
                    return Some((address, container.labels));
                }
            }
            Err(e) if e.is_not_found() => return None,
            Err(_) => {}
        }
        tokio::time::sleep(ADDRESS_POLL_INTERVAL).await;
    }
    None
}

/// TCP connect then an RIE ping until the worker answers or the cold start
/// deadline lapses.
async fn wait_for_readiness(
    http_client: &reqwest::Client,
    address: &WorkerAddr,
    timeout: Duration,
) -> bool {
    let socket_addr: Option<SocketAddr> = format!("{}", address).parse().ok();
    let url = format!("http://{}{}", address, RIE_INVOKE_PATH);
    let deadline = tokio::time::Instant::now() + timeout;

    while tokio::time::Instant::now() < deadline {
        let connected = match socket_addr {
            Some(addr) => tokio::time::timeout(
                READINESS_CONNECT_TIMEOUT,
                TcpStream::connect(addr),
            )
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false),
            None => false,
        };

        if connected {
            let ping = http_client
                .post(&url)
                .json(&serde_json::json!({"ping": true}))
                .timeout(READINESS_CONNECT_TIMEOUT)
                .send()
                .await;
            if matches!(ping, Ok(resp) if resp.status().is_success()) {
                return true;
            }
        }

        tokio::time::sleep(READINESS_POLL_INTERVAL).await;
    }
    false
}
