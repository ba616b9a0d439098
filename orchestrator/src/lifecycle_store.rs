//! In-memory authoritative view of managed containers.
//!
//! Records are sharded by function name: every mutation for a function goes
//! through that function's mutex, so capacity checks and state transitions
//! for one function are serialised while functions stay independent. The
//! store is crash-volatile; AdoptSync rebuilds it from the runtime's
//! container list after a restart.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use data_model::{ContainerId, ContainerRecord, ContainerState};

#[derive(Default)]
pub struct FunctionContainers {
    pub records: Vec<ContainerRecord>,
}

impl FunctionContainers {
    pub fn get(&self, id: &ContainerId) -> Option<&ContainerRecord> {
        self.records.iter().find(|r| &r.id == id)
    }

    pub fn get_mut(&mut self, id: &ContainerId) -> Option<&mut ContainerRecord> {
        self.records.iter_mut().find(|r| &r.id == id)
    }

    /// Containers counting toward the function's capacity.
    pub fn active_count(&self) -> usize {
        self.records.iter().filter(|r| r.state.is_active()).count()
    }

    /// A container an invocation can be routed to without a cold start.
    pub fn find_warm(&self) -> Option<&ContainerRecord> {
        self.records.iter().find(|r| r.state.is_warm())
    }

    pub fn find_paused(&self) -> Option<&ContainerRecord> {
        self.records
            .iter()
            .find(|r| r.state == ContainerState::Paused)
    }
}

pub struct LifecycleStore {
    shards: Mutex<HashMap<String, Arc<tokio::sync::Mutex<FunctionContainers>>>>,
    /// container id -> owning function, kept in sync with the shards.
    index: Mutex<HashMap<ContainerId, String>>,
}

impl Default for LifecycleStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleStore {
    pub fn new() -> Self {
        Self {
            shards: Mutex::new(HashMap::new()),
            index: Mutex::new(HashMap::new()),
        }
    }

    fn shard(&self, function_name: &str) -> Arc<tokio::sync::Mutex<FunctionContainers>> {
        let mut shards = self.shards.lock().unwrap();
        shards
            .entry(function_name.to_string())
            .or_default()
            .clone()
    }

    /// Run `f` with the function's records under the shard mutex. The lock
    /// is never held across runtime driver calls.
    pub async fn with_function<R>(
        &self,
        function_name: &str,
        f: impl FnOnce(&mut FunctionContainers) -> R,
    ) -> R {
        let shard = self.shard(function_name);
        let mut guard = shard.lock().await;
        f(&mut guard)
    }

    pub async fn insert(&self, record: ContainerRecord) {
        let function_name = record.function_name.clone();
        let id = record.id.clone();
        self.with_function(&function_name, |fc| {
            fc.records.retain(|r| r.id != id);
            fc.records.push(record);
        })
        .await;
        self.index.lock().unwrap().insert(id, function_name);
    }

    /// Drop a record entirely. Returns the removed record, if any.
    pub async fn remove(&self, id: &ContainerId) -> Option<ContainerRecord> {
        let function_name = self.function_of(id)?;
        let removed = self
            .with_function(&function_name, |fc| {
                let pos = fc.records.iter().position(|r| &r.id == id)?;
                Some(fc.records.remove(pos))
            })
            .await;
        if removed.is_some() {
            self.index.lock().unwrap().remove(id);
        }
        removed
    }

    pub fn function_of(&self, id: &ContainerId) -> Option<String> {
        self.index.lock().unwrap().get(id).cloned()
    }

    pub fn function_names(&self) -> Vec<String> {
        self.shards.lock().unwrap().keys().cloned().collect()
    }

    /// Refresh `last_used_at` for every known id in `ids`. Unknown ids are
    /// ignored; the gateway may be reporting a container already reaped.
    pub async fn touch_containers(&self, ids: &[ContainerId], now_ms: u64) -> usize {
        let mut by_function: HashMap<String, Vec<ContainerId>> = HashMap::new();
        for id in ids {
            if let Some(function) = self.function_of(id) {
                by_function.entry(function).or_default().push(id.clone());
            }
        }

        let mut touched = 0;
        for (function, ids) in by_function {
            touched += self
                .with_function(&function, |fc| {
                    let mut count = 0;
                    for id in &ids {
                        if let Some(record) = fc.get_mut(id) {
                            record.touch(now_ms);
                            count += 1;
                        }
                    }
                    count
                })
                .await;
        }
        touched
    }

    /// Apply a gateway heartbeat: refresh `last_used_at` for every reported
    /// id and mirror the gateway's busy/idle view into the records.
    pub async fn apply_heartbeat(
        &self,
        ids: &[ContainerId],
        idle_ids: &[ContainerId],
        now_ms: u64,
    ) -> usize {
        let touched = self.touch_containers(ids, now_ms).await;

        let idle: std::collections::HashSet<&ContainerId> = idle_ids.iter().collect();
        for id in ids {
            let Some(function) = self.function_of(id) else {
                continue;
            };
            let target = if idle.contains(id) {
                ContainerState::Idle
            } else {
                ContainerState::Busy
            };
            self.with_function(&function, |fc| {
                if let Some(record) = fc.get_mut(id) {
                    if record.state != target {
                        // Only warm-side flips; a stopping container stays
                        // stopping.
                        let _ = record.set_state(target);
                    }
                }
            })
            .await;
        }
        touched
    }

    /// Copy of every record, across all functions.
    pub async fn snapshot(&self) -> Vec<ContainerRecord> {
        let mut records = Vec::new();
        for function in self.function_names() {
            self.with_function(&function, |fc| {
                records.extend(fc.records.iter().cloned());
            })
            .await;
        }
        records
    }
}
