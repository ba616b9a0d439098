//! Per-function worker pool.
//!
//! Capacity is a fixed permit count. Idle handles are reused LIFO for
//! warmth; under saturation waiters queue FIFO and a freed permit is handed
//! to the head waiter directly, so a slot never sits idle while someone
//! waits and late arrivals cannot starve early ones.
//!
//! Every successful acquire yields a [`PoolSlot`] that settles the permit
//! exactly once: explicit `release`/`evict`, or eviction on drop when the
//! request unwinds through cancellation or panic.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        Arc,
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use data_model::{ContainerId, FunctionRegistry, WorkerAddr};
use tokio::sync::oneshot;

use crate::http_objects::PoolStats;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerHandle {
    pub container_id: ContainerId,
    pub address: WorkerAddr,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AcquireError {
    #[error("pool acquire timed out")]
    TimedOut,
    #[error("function is disabled")]
    Disabled,
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    /// `Some(handle)` hands a warm worker over; `None` transfers a bare
    /// permit the waiter must fill via Ensure.
    tx: oneshot::Sender<Option<WorkerHandle>>,
}

#[derive(Default, Debug)]
struct PoolState {
    in_use: usize,
    /// LIFO stack of warm handles.
    idle: Vec<WorkerHandle>,
    /// Ids currently checked out, reported by the heartbeat.
    checked_out: HashSet<ContainerId>,
    /// FIFO queue of suspended acquirers.
    waiters: VecDeque<Waiter>,
}

#[derive(Debug)]
pub struct ContainerPool {
    pub function_name: String,
    pub max_capacity: usize,
    state: Mutex<PoolState>,
    next_waiter_id: AtomicU64,
}

impl ContainerPool {
    pub fn new(function_name: &str, max_capacity: usize) -> Self {
        Self {
            function_name: function_name.to_string(),
            max_capacity,
            state: Mutex::new(PoolState::default()),
            next_waiter_id: AtomicU64::new(0),
        }
    }

    /// Acquire a permit. Returns a slot carrying a warm handle when one is
    /// idle, or an empty slot the caller must fill after Ensure.
    pub async fn acquire(
        self: &Arc<Self>,
        deadline: Duration,
    ) -> Result<PoolSlot, AcquireError> {
        if self.max_capacity == 0 {
            return Err(AcquireError::Disabled);
        }

        let (id, mut rx) = {
            let mut state = self.state.lock().unwrap();
            if let Some(handle) = state.idle.pop() {
                state.in_use += 1;
                state.checked_out.insert(handle.container_id.clone());
                return Ok(PoolSlot::new(self.clone(), Some(handle)));
            }
            if state.in_use + state.idle.len() < self.max_capacity {
                state.in_use += 1;
                return Ok(PoolSlot::new(self.clone(), None));
            }

            let (tx, rx) = oneshot::channel();
            let id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed);
            state.waiters.push_back(Waiter { id, tx });
            (id, rx)
        };

        match tokio::time::timeout(deadline, &mut rx).await {
            Ok(Ok(handle)) => Ok(PoolSlot::new(self.clone(), handle)),
            // Sender dropped without a handover; only possible if the pool
            // itself is being torn down.
            Ok(Err(_)) => Err(AcquireError::TimedOut),
            Err(_) => {
                // Deadline fired. Handovers happen under the state lock, so
                // once our waiter entry is removed below no permit can be
                // assigned to us anymore.
                let mut state = self.state.lock().unwrap();
                let was_queued = state.waiters.iter().any(|w| w.id == id);
                if was_queued {
                    state.waiters.retain(|w| w.id != id);
                    return Err(AcquireError::TimedOut);
                }
                drop(state);
                // A handover raced the deadline; the permit is already ours.
                match rx.try_recv() {
                    Ok(handle) => Ok(PoolSlot::new(self.clone(), handle)),
                    Err(_) => Err(AcquireError::TimedOut),
                }
            }
        }
    }

    /// Return a handle. Prefers the head waiter over the idle stack.
    fn release(&self, handle: WorkerHandle) {
        let mut state = self.state.lock().unwrap();
        let mut handle = handle;
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.tx.send(Some(handle)) {
                // Direct handover: the permit and handle transfer as one.
                Ok(()) => return,
                Err(returned) => {
                    handle = returned.expect("handover payload is always Some");
                }
            }
        }
        state.checked_out.remove(&handle.container_id);
        state.in_use = state.in_use.saturating_sub(1);
        state.idle.push(handle);
    }

    /// Drop an unhealthy handle. The permit is still freed so a waiter can
    /// provision a replacement.
    fn evict(&self, handle: &WorkerHandle) {
        let mut state = self.state.lock().unwrap();
        state.checked_out.remove(&handle.container_id);
        Self::free_permit_locked(&mut state);
    }

    /// Give up a reserved permit that was never filled (Ensure failed).
    fn abort_provision(&self) {
        let mut state = self.state.lock().unwrap();
        Self::free_permit_locked(&mut state);
    }

    fn free_permit_locked(state: &mut PoolState) {
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.tx.send(None).is_ok() {
                // Permit transferred; the waiter provisions into it.
                return;
            }
        }
        state.in_use = state.in_use.saturating_sub(1);
    }

    fn register(&self, container_id: &ContainerId) {
        self.state
            .lock()
            .unwrap()
            .checked_out
            .insert(container_id.clone());
    }

    /// Drop idle handles pointing at a container known to be gone.
    pub fn discard_idle(&self, container_id: &ContainerId) {
        let mut state = self.state.lock().unwrap();
        state.idle.retain(|h| &h.container_id != container_id);
    }

    /// All ids this pool is responsible for (busy and idle).
    pub fn all_ids(&self) -> Vec<ContainerId> {
        let state = self.state.lock().unwrap();
        state
            .checked_out
            .iter()
            .cloned()
            .chain(state.idle.iter().map(|h| h.container_id.clone()))
            .collect()
    }

    pub fn idle_ids(&self) -> Vec<ContainerId> {
        let state = self.state.lock().unwrap();
        state.idle.iter().map(|h| h.container_id.clone()).collect()
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock().unwrap();
        PoolStats {
            function_name: self.function_name.clone(),
            max_capacity: self.max_capacity,
            in_use: state.in_use,
            idle: state.idle.len(),
            waiters: state.waiters.len(),
            breaker: String::new(),
        }
    }
}

/// A held pool permit, optionally carrying a worker handle.
///
/// Settles exactly once: `release` on success, `evict` on failure, and
/// eviction from `Drop` when the owning task unwinds without either.
#[derive(Debug)]
pub struct PoolSlot {
    pool: Arc<ContainerPool>,
    handle: Option<WorkerHandle>,
    armed: bool,
}

impl PoolSlot {
    fn new(pool: Arc<ContainerPool>, handle: Option<WorkerHandle>) -> Self {
        Self {
            pool,
            handle,
            armed: true,
        }
    }

    pub fn handle(&self) -> Option<&WorkerHandle> {
        self.handle.as_ref()
    }

    /// Fill a bare permit with the worker Ensure produced.
    pub fn attach(&mut self, handle: WorkerHandle) {
        self.pool.register(&handle.container_id);
        self.handle = Some(handle);
    }

    pub fn release(mut self) {
        self.armed = false;
        match self.handle.take() {
            Some(handle) => self.pool.release(handle),
            None => self.pool.abort_provision(),
        }
    }

    pub fn evict(mut self) {
        self.armed = false;
        match self.handle.take() {
            Some(handle) => self.pool.evict(&handle),
            None => self.pool.abort_provision(),
        }
    }
}

impl Drop for PoolSlot {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // The request unwound without settling; the worker's state is
        // unknown, so treat it as unhealthy.
        match self.handle.take() {
            Some(handle) => self.pool.evict(&handle),
            None => self.pool.abort_provision(),
        }
    }
}

/// All pools, created lazily per function.
pub struct PoolManager {
    pools: Mutex<HashMap<String, Arc<ContainerPool>>>,
    registry: Arc<FunctionRegistry>,
    pooling_enabled: bool,
}

impl PoolManager {
    pub fn new(registry: Arc<FunctionRegistry>, pooling_enabled: bool) -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
            registry,
            pooling_enabled,
        }
    }

    pub fn pool(&self, function_name: &str) -> Option<Arc<ContainerPool>> {
        let descriptor = self.registry.get(function_name)?;
        let mut capacity = descriptor.max_capacity as usize;
        if !self.pooling_enabled {
            capacity = capacity.min(1);
        }
        let mut pools = self.pools.lock().unwrap();
        Some(
            pools
                .entry(function_name.to_string())
                .or_insert_with(|| Arc::new(ContainerPool::new(function_name, capacity)))
                .clone(),
        )
    }

    pub fn all_worker_ids(&self) -> Vec<ContainerId> {
        let pools = self.pools.lock().unwrap();
        pools.values().flat_map(|p| p.all_ids()).collect()
    }

    pub fn idle_worker_ids(&self) -> Vec<ContainerId> {
        let pools = self.pools.lock().unwrap();
        pools.values().flat_map(|p| p.idle_ids()).collect()
    }

    pub fn discard_container(&self, function_name: &str, container_id: &ContainerId) {
        let pools = self.pools.lock().unwrap();
        if let Some(pool) = pools.get(function_name) {
            pool.discard_idle(container_id);
        }
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        let pools = self.pools.lock().unwrap();
        let mut stats: Vec<PoolStats> = pools.values().map(|p| p.stats()).collect();
        stats.sort_by(|a, b| a.function_name.cmp(&b.function_name));
        stats
    }
}
