//! In-memory runtime backend for tests.
//!
//! Deterministic: containers live in a map, addresses are assigned from a
//! fixed private range in creation order, and failure injection hooks let
//! tests exercise the conflict/not-found paths without a real runtime.

use std::{
    collections::HashMap,
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use data_model::{ContainerId, WorkerAddr};

use super::{
    ContainerSpec,
    DriverError,
    DriverResult,
    RuntimeContainer,
    RuntimeDriver,
    RuntimeState,
    address_from_labels,
};

#[derive(Debug, Clone)]
struct MemContainer {
    labels: HashMap<String, String>,
    state: RuntimeState,
    ip: String,
}

#[derive(Default)]
struct Inner {
    containers: HashMap<String, MemContainer>,
    /// When set, the next create_container call fails with this error kind.
    fail_next_create: Option<InjectedFailure>,
    fail_next_start: bool,
    next_ip_octet: u8,
}

#[derive(Debug, Clone, Copy)]
pub enum InjectedFailure {
    Conflict,
    Opaque,
}

pub struct MemoryDriver {
    inner: Mutex<Inner>,
    create_calls: AtomicUsize,
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            create_calls: AtomicUsize::new(0),
        }
    }

    /// Number of create_container calls observed, across all functions.
    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn fail_next_create(&self, failure: InjectedFailure) {
        self.inner.lock().unwrap().fail_next_create = Some(failure);
    }

    pub fn fail_next_start(&self) {
        self.inner.lock().unwrap().fail_next_start = true;
    }

    /// Seed a container as if a previous orchestrator run had created it.
    pub fn seed_container(
        &self,
        name: &str,
        labels: HashMap<String, String>,
        state: RuntimeState,
    ) {
        let mut inner = self.inner.lock().unwrap();
        inner.next_ip_octet += 1;
        let ip = format!("10.88.0.{}", inner.next_ip_octet);
        inner
            .containers
            .insert(name.to_string(), MemContainer { labels, state, ip });
    }

    /// Force a container into a runtime state (e.g. simulate a crash).
    pub fn set_state(&self, id: &ContainerId, state: RuntimeState) {
        if let Some(c) = self.inner.lock().unwrap().containers.get_mut(id.get()) {
            c.state = state;
        }
    }

    pub fn contains(&self, id: &ContainerId) -> bool {
        self.inner.lock().unwrap().containers.contains_key(id.get())
    }

    pub fn container_ids(&self) -> Vec<String> {
        self.inner.lock().unwrap().containers.keys().cloned().collect()
    }

    fn make_runtime_container(name: &str, c: &MemContainer) -> RuntimeContainer {
        let address = address_from_labels(&c.labels, Some(&c.ip), "127.0.0.1");
        RuntimeContainer {
            id: ContainerId::new(name.to_string()),
            state: c.state,
            labels: c.labels.clone(),
            address,
        }
    }
}

#[async_trait]
impl RuntimeDriver for MemoryDriver {
    async fn ensure_image(&self, _image: &str) -> DriverResult<()> {
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> DriverResult<ContainerId> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock().unwrap();

        match inner.fail_next_create.take() {
            Some(InjectedFailure::Conflict) => {
                return Err(DriverError::Conflict(spec.name.clone()));
            }
            Some(InjectedFailure::Opaque) => {
                return Err(DriverError::Other(anyhow::anyhow!("injected create failure")));
            }
            None => {}
        }

        if inner.containers.contains_key(&spec.name) {
            return Err(DriverError::Conflict(spec.name.clone()));
        }

        let mut labels = spec.labels.clone();
        labels.insert(super::LABEL_PORT.to_string(), spec.port.to_string());
        if let Some(host_port) = spec.host_port {
            labels.insert(super::LABEL_HOST_PORT.to_string(), host_port.to_string());
        }

        inner.next_ip_octet += 1;
        let ip = format!("10.88.0.{}", inner.next_ip_octet);
        inner.containers.insert(
            spec.name.clone(),
            MemContainer {
                labels,
                state: RuntimeState::Exited,
                ip,
            },
        );
        Ok(ContainerId::new(spec.name.clone()))
    }

    async fn start(&self, id: &ContainerId) -> DriverResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_next_start {
            inner.fail_next_start = false;
            return Err(DriverError::Other(anyhow::anyhow!("injected start failure")));
        }
        let container = inner
            .containers
            .get_mut(id.get())
            .ok_or_else(|| DriverError::NotFound(id.get().to_string()))?;
        container.state = RuntimeState::Running;
        Ok(())
    }

    async fn pause(&self, id: &ContainerId) -> DriverResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let container = inner
            .containers
            .get_mut(id.get())
            .ok_or_else(|| DriverError::NotFound(id.get().to_string()))?;
        container.state = RuntimeState::Paused;
        Ok(())
    }

    async fn resume(&self, id: &ContainerId) -> DriverResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let container = inner
            .containers
            .get_mut(id.get())
            .ok_or_else(|| DriverError::NotFound(id.get().to_string()))?;
        container.state = RuntimeState::Running;
        Ok(())
    }

    async fn remove(&self, id: &ContainerId, force: bool) -> DriverResult<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.containers.get(id.get()) {
            None => Err(DriverError::NotFound(id.get().to_string())),
            Some(c) if c.state == RuntimeState::Running && !force => Err(DriverError::Other(
                anyhow::anyhow!("cannot remove running container {} without force", id),
            )),
            Some(_) => {
                inner.containers.remove(id.get());
                Ok(())
            }
        }
    }

    async fn inspect(&self, id: &ContainerId) -> DriverResult<RuntimeContainer> {
        let inner = self.inner.lock().unwrap();
        inner
            .containers
            .get(id.get())
            .map(|c| Self::make_runtime_container(id.get(), c))
            .ok_or_else(|| DriverError::NotFound(id.get().to_string()))
    }

    async fn list(&self, label_selector: &[(String, String)]) -> DriverResult<Vec<RuntimeContainer>> {
        let inner = self.inner.lock().unwrap();
        let mut result: Vec<RuntimeContainer> = inner
            .containers
            .iter()
            .filter(|(_, c)| {
                label_selector
                    .iter()
                    .all(|(k, v)| c.labels.get(k).is_some_and(|lv| lv == v))
            })
            .map(|(name, c)| Self::make_runtime_container(name, c))
            .collect();
        result.sort_by(|a, b| a.id.get().cmp(b.id.get()));
        Ok(result)
    }
}
