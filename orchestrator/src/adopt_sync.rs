//! Restart recovery: rebuild the lifecycle store from the runtime.
//!
//! Runs once before the RPC listener comes up. The runtime's container list,
//! filtered by our ownership label, is authoritative; whatever it reports
//! Running is adopted, whatever it reports Exited is removed.

use std::sync::Arc;

use anyhow::Result;
use data_model::{
    ContainerRecord,
    ContainerState,
    LABEL_CREATED_BY,
    LABEL_CREATED_BY_VALUE,
    LABEL_FUNCTION,
    get_epoch_time_in_ms,
};
use runtime_driver::{LABEL_HOST_PORT, RuntimeDriver, RuntimeState};
use tracing::{info, warn};

use crate::{lifecycle_store::LifecycleStore, ports::PortAllocator};

pub struct AdoptSync {
    store: Arc<LifecycleStore>,
    driver: Arc<dyn RuntimeDriver>,
    ports: Arc<PortAllocator>,
}

impl AdoptSync {
    pub fn new(
        store: Arc<LifecycleStore>,
        driver: Arc<dyn RuntimeDriver>,
        ports: Arc<PortAllocator>,
    ) -> Self {
        Self {
            store,
            driver,
            ports,
        }
    }

    pub async fn run(&self) -> Result<()> {
        let selector = vec![(
            LABEL_CREATED_BY.to_string(),
            LABEL_CREATED_BY_VALUE.to_string(),
        )];
        let containers = self.driver.list(&selector).await?;

        let mut adopted = 0;
        let mut removed = 0;
        let now = get_epoch_time_in_ms();

        for container in containers {
            let Some(function_name) = container.labels.get(LABEL_FUNCTION).cloned() else {
                warn!(container_id = %container.id, "Labelled container without a function label, removing");
                let _ = self.driver.remove(&container.id, true).await;
                removed += 1;
                continue;
            };

            match container.state {
                RuntimeState::Running | RuntimeState::Paused => {
                    let Some(address) = container.address.clone() else {
                        warn!(
                            container_id = %container.id,
                            function = %function_name,
                            "Running container without an address, removing"
                        );
                        let _ = self.driver.remove(&container.id, true).await;
                        removed += 1;
                        continue;
                    };

                    let mut record =
                        ContainerRecord::new(container.id.clone(), &function_name, address);
                    record.labels = container.labels.clone();
                    let adopted_state = if container.state == RuntimeState::Paused {
                        ContainerState::Paused
                    } else {
                        ContainerState::Ready
                    };
                    // Provisioning -> Ready is direct; Paused goes through
                    // Ready first.
                    record.set_state(ContainerState::Ready).ok();
                    if adopted_state == ContainerState::Paused {
                        record.set_state(ContainerState::Paused).ok();
                    }
                    record.touch(now);

                    if let Some(port) = container
                        .labels
                        .get(LABEL_HOST_PORT)
                        .and_then(|p| p.parse().ok())
                    {
                        self.ports.reserve(port);
                    }

                    info!(
                        container_id = %record.id,
                        function = %function_name,
                        state = %record.state,
                        "Adopted container"
                    );
                    self.store.insert(record).await;
                    adopted += 1;
                }
                RuntimeState::Exited | RuntimeState::Unknown => {
                    info!(
                        container_id = %container.id,
                        function = %function_name,
                        "Removing stopped container"
                    );
                    let _ = self.driver.remove(&container.id, true).await;
                    removed += 1;
                }
            }
        }

        info!(adopted, removed, "Adopt & Sync complete");
        Ok(())
    }
}
