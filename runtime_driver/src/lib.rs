//! Narrow contract over the container runtime.
//!
//! The orchestrator drives containers exclusively through [`RuntimeDriver`];
//! the Docker backend talks to the engine API, the memory backend backs
//! tests with deterministic behavior. Only two failure modes are typed —
//! [`DriverError::NotFound`] (container vanished) and
//! [`DriverError::Conflict`] (duplicate create) — everything else is opaque
//! and treated as transient by callers.

mod docker;
mod memory;

use std::collections::HashMap;

use async_trait::async_trait;
use data_model::{ContainerId, WorkerAddr};
pub use docker::DockerDriver;
pub use memory::{InjectedFailure, MemoryDriver};

/// Container port label, persisted so the address can be rebuilt from a bare
/// runtime listing after an orchestrator restart.
pub const LABEL_PORT: &str = "esb_port";
/// Host-side published port label (NAT mode).
pub const LABEL_HOST_PORT: &str = "esb_host_port";

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("container not found: {0}")]
    NotFound(String),
    #[error("container name conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DriverError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DriverError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, DriverError::Conflict(_))
    }
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Specification for creating one worker container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Runtime name; doubles as the stable container id.
    pub name: String,
    pub image: String,
    pub env: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    /// Network to attach to (e.g. `lambda-net`).
    pub network: Option<String>,
    /// Port the worker listens on inside the container.
    pub port: u16,
    /// Host port to publish `port` on. `None` means the gateway reaches the
    /// container network directly.
    pub host_port: Option<u16>,
}

impl ContainerSpec {
    pub fn new(name: String, image: String, port: u16) -> Self {
        Self {
            name,
            image,
            env: HashMap::new(),
            labels: HashMap::new(),
            network: None,
            port,
            host_port: None,
        }
    }
}

/// Runtime-reported container state, deliberately coarser than the
/// lifecycle store's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Running,
    Paused,
    Exited,
    Unknown,
}

/// A container as seen by the runtime, used by inspect/list and AdoptSync.
#[derive(Debug, Clone)]
pub struct RuntimeContainer {
    pub id: ContainerId,
    pub state: RuntimeState,
    pub labels: HashMap<String, String>,
    pub address: Option<WorkerAddr>,
}

#[async_trait]
pub trait RuntimeDriver: Send + Sync {
    /// Pull the image if it is not available locally. Idempotent.
    async fn ensure_image(&self, image: &str) -> DriverResult<()>;

    /// Create a container from `spec` without starting it.
    async fn create_container(&self, spec: &ContainerSpec) -> DriverResult<ContainerId>;

    async fn start(&self, id: &ContainerId) -> DriverResult<()>;

    async fn pause(&self, id: &ContainerId) -> DriverResult<()>;

    async fn resume(&self, id: &ContainerId) -> DriverResult<()>;

    async fn remove(&self, id: &ContainerId, force: bool) -> DriverResult<()>;

    async fn inspect(&self, id: &ContainerId) -> DriverResult<RuntimeContainer>;

    /// List containers matching every `key=value` pair in `label_selector`,
    /// including stopped ones.
    async fn list(&self, label_selector: &[(String, String)]) -> DriverResult<Vec<RuntimeContainer>>;
}

/// Build the address for a listed/inspected container from its labels and
/// reported IP. Published-port containers advertise the host address.
pub(crate) fn address_from_labels(
    labels: &HashMap<String, String>,
    container_ip: Option<&str>,
    advertise_ip: &str,
) -> Option<WorkerAddr> {
    if let Some(host_port) = labels.get(LABEL_HOST_PORT).and_then(|p| p.parse().ok()) {
        return Some(WorkerAddr::new(advertise_ip.to_string(), host_port));
    }
    let port: u16 = labels.get(LABEL_PORT)?.parse().ok()?;
    let ip = container_ip?;
    if ip.is_empty() {
        return None;
    }
    Some(WorkerAddr::new(ip.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_prefers_published_port() {
        let mut labels = HashMap::new();
        labels.insert(LABEL_PORT.to_string(), "8080".to_string());
        labels.insert(LABEL_HOST_PORT.to_string(), "31000".to_string());

        let addr = address_from_labels(&labels, Some("172.18.0.9"), "192.168.1.4").unwrap();
        assert_eq!(addr, WorkerAddr::new("192.168.1.4".to_string(), 31000));
    }

    #[test]
    fn test_address_from_container_network() {
        let mut labels = HashMap::new();
        labels.insert(LABEL_PORT.to_string(), "8080".to_string());

        let addr = address_from_labels(&labels, Some("172.18.0.9"), "192.168.1.4").unwrap();
        assert_eq!(addr, WorkerAddr::new("172.18.0.9".to_string(), 8080));
    }

    #[test]
    fn test_address_missing_ip() {
        let mut labels = HashMap::new();
        labels.insert(LABEL_PORT.to_string(), "8080".to_string());
        assert!(address_from_labels(&labels, None, "192.168.1.4").is_none());
        assert!(address_from_labels(&labels, Some(""), "192.168.1.4").is_none());
    }
}
