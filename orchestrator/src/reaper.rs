//! Idle container sweeper.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use data_model::{ContainerId, ContainerState, FunctionRegistry, get_epoch_time_in_ms};
use runtime_driver::RuntimeDriver;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::{
    config::OrchestratorConfig,
    ensure::release_published_port,
    lifecycle_store::LifecycleStore,
    ports::PortAllocator,
};

/// Multiple of the idle timeout after which a READY/BUSY container with a
/// stale `last_used_at` is considered leaked.
const STUCK_MULTIPLIER: u32 = 4;

pub struct Reaper {
    store: Arc<LifecycleStore>,
    driver: Arc<dyn RuntimeDriver>,
    ports: Arc<PortAllocator>,
    registry: Arc<FunctionRegistry>,
    config: Arc<OrchestratorConfig>,
}

impl Reaper {
    pub fn new(
        store: Arc<LifecycleStore>,
        driver: Arc<dyn RuntimeDriver>,
        ports: Arc<PortAllocator>,
        registry: Arc<FunctionRegistry>,
        config: Arc<OrchestratorConfig>,
    ) -> Self {
        Self {
            store,
            driver,
            ports,
            registry,
            config,
        }
    }

    pub async fn start(self: Arc<Self>, mut shutdown_rx: watch::Receiver<()>) {
        let mut interval = tokio::time::interval(self.config.reaper_interval());
        // The first tick fires immediately; skip it so a fresh start does not
        // race AdoptSync's records.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.sweep().await {
                        error!("Reaper sweep failed: {err:?}");
                    }
                }
                _ = shutdown_rx.changed() => {
                    info!("Reaper shutting down");
                    break;
                }
            }
        }
    }

    fn idle_timeout_for(&self, function_name: &str) -> Duration {
        self.registry
            .get(function_name)
            .and_then(|d| d.idle_timeout_s)
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.config.idle_timeout())
    }

    /// One pass over every record. Returns the number of containers reaped.
    pub async fn sweep(&self) -> Result<usize> {
        let now = get_epoch_time_in_ms();
        let mut reaped = 0;

        for function in self.store.function_names() {
            let idle_timeout_ms = self.idle_timeout_for(&function).as_millis() as u64;
            let stuck_threshold_ms = idle_timeout_ms.saturating_mul(STUCK_MULTIPLIER as u64);

            // Select and mark under the shard lock; tear down outside it.
            let expired: Vec<ContainerId> = self
                .store
                .with_function(&function, |fc| {
                    let mut expired = Vec::new();
                    for record in fc.records.iter_mut() {
                        let idle_for = record.idle_for_ms(now);
                        let reap = match record.state {
                            ContainerState::Idle | ContainerState::Paused => {
                                idle_for > idle_timeout_ms
                            }
                            ContainerState::Ready | ContainerState::Busy => {
                                if idle_for > stuck_threshold_ms {
                                    warn!(
                                        container_id = %record.id,
                                        function = %record.function_name,
                                        state = %record.state,
                                        idle_ms = idle_for,
                                        "Reaping stuck container; a release was likely missed"
                                    );
                                    true
                                } else {
                                    false
                                }
                            }
                            _ => false,
                        };
                        if reap && record.set_state(ContainerState::Stopping).is_ok() {
                            expired.push(record.id.clone());
                        }
                    }
                    expired
                })
                .await;

            for id in expired {
                match self.driver.remove(&id, true).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => {
                        warn!(container_id = %id, error = %e, "Failed to remove idle container");
                        continue;
                    }
                }
                if let Some(record) = self.store.remove(&id).await {
                    release_published_port(&self.ports, &record);
                    info!(
                        container_id = %id,
                        function = %record.function_name,
                        "Reaped idle container"
                    );
                    reaped += 1;
                }
            }
        }

        Ok(reaped)
    }
}
