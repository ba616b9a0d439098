//! Periodic "still in use" report to the orchestrator.
//!
//! Reports both checked-out and cached containers so neither a long-running
//! invocation nor a cached-but-quiet worker is reaped mid-use. A missed
//! report is tolerated; the container just ages toward the idle timeout.

use std::{collections::HashSet, sync::Arc, time::Duration};

use data_model::ContainerId;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    host_cache::ContainerHostCache,
    orchestrator_client::OrchestratorBackend,
    pool::PoolManager,
};

pub struct HeartbeatJanitor {
    pools: Arc<PoolManager>,
    cache: Arc<ContainerHostCache>,
    orchestrator: Arc<dyn OrchestratorBackend>,
    interval: Duration,
}

impl HeartbeatJanitor {
    pub fn new(
        pools: Arc<PoolManager>,
        cache: Arc<ContainerHostCache>,
        orchestrator: Arc<dyn OrchestratorBackend>,
        interval: Duration,
    ) -> Self {
        Self {
            pools,
            cache,
            orchestrator,
            interval,
        }
    }

    pub async fn start(self: Arc<Self>, mut shutdown_rx: watch::Receiver<()>) {
        info!(interval = ?self.interval, "Heartbeat janitor started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    self.send_heartbeat().await;
                }
                _ = shutdown_rx.changed() => {
                    info!("Heartbeat janitor stopped");
                    break;
                }
            }
        }
    }

    pub async fn send_heartbeat(&self) {
        let (ids, idle_ids) = self.collect_report();
        if ids.is_empty() {
            return;
        }
        match self
            .orchestrator
            .heartbeat(ids.clone(), idle_ids)
            .await
        {
            Ok(()) => debug!(count = ids.len(), "Heartbeat sent"),
            // Tolerated: the orchestrator will see the containers go idle
            // naturally.
            Err(e) => warn!(error = %e, "Heartbeat failed"),
        }
    }

    /// All held ids plus live cache entries; idle = not currently serving.
    pub fn collect_report(&self) -> (Vec<ContainerId>, Vec<ContainerId>) {
        let pool_ids: HashSet<ContainerId> = self.pools.all_worker_ids().into_iter().collect();
        let idle_pool_ids: HashSet<ContainerId> =
            self.pools.idle_worker_ids().into_iter().collect();
        let busy_ids: HashSet<ContainerId> =
            pool_ids.difference(&idle_pool_ids).cloned().collect();

        let mut all: HashSet<ContainerId> = pool_ids.clone();
        all.extend(self.cache.cached_ids());

        let idle_ids: Vec<ContainerId> = all
            .iter()
            .filter(|id| !busy_ids.contains(id))
            .cloned()
            .collect();
        (all.into_iter().collect(), idle_ids)
    }
}
