use std::{
    collections::HashMap,
    fmt::{self, Display},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

/// Label stamped on every container the control plane creates. AdoptSync and
/// the reaper only ever touch containers carrying it.
pub const LABEL_CREATED_BY: &str = "created_by";
pub const LABEL_CREATED_BY_VALUE: &str = "esb";
/// Label carrying the owning function's name.
pub const LABEL_FUNCTION: &str = "esb_function";

/// Invocation path exposed by the AWS Lambda runtime interface emulator
/// inside every worker container.
pub const RIE_INVOKE_PATH: &str = "/2015-03-31/functions/function/invocations";

pub fn get_epoch_time_in_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before epoch")
        .as_millis() as u64
}

pub fn esb_labels(function_name: &str) -> HashMap<String, String> {
    HashMap::from([
        (
            LABEL_CREATED_BY.to_string(),
            LABEL_CREATED_BY_VALUE.to_string(),
        ),
        (LABEL_FUNCTION.to_string(), function_name.to_string()),
    ])
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContainerId(String);

impl ContainerId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ContainerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Address of a worker container as reachable from the gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct WorkerAddr {
    pub ip: String,
    pub port: u16,
}

impl WorkerAddr {
    pub fn new(ip: String, port: u16) -> Self {
        Self { ip, port }
    }
}

impl Display for WorkerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// One HTTP route exposed by a function.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouteSpec {
    pub path: String,
    pub method: String,
}

pub const DEFAULT_MAX_CAPACITY: u32 = 50;

fn default_max_capacity() -> u32 {
    DEFAULT_MAX_CAPACITY
}

/// Static description of a deployable function, loaded from the routing
/// table at startup. Immutable for the lifetime of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDescriptor {
    pub name: String,
    pub image_ref: String,
    #[serde(default)]
    pub handler: Option<String>,
    #[serde(default)]
    pub routes: Vec<RouteSpec>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Reserved concurrency. Zero disables the function.
    #[serde(default = "default_max_capacity")]
    pub max_capacity: u32,
    #[serde(default)]
    pub invoke_timeout_ms: Option<u64>,
    #[serde(default)]
    pub idle_timeout_s: Option<u64>,
}

impl FunctionDescriptor {
    pub fn new(name: &str, image_ref: &str) -> Self {
        Self {
            name: name.to_string(),
            image_ref: image_ref.to_string(),
            handler: None,
            routes: Vec::new(),
            env: HashMap::new(),
            max_capacity: DEFAULT_MAX_CAPACITY,
            invoke_timeout_ms: None,
            idle_timeout_s: None,
        }
    }
}

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, strum::AsRefStr, strum::Display,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ContainerState {
    Provisioning,
    Ready,
    Busy,
    Idle,
    Paused,
    Stopping,
    Gone,
}

impl ContainerState {
    /// States that count toward a function's capacity.
    pub fn is_active(&self) -> bool {
        !matches!(self, ContainerState::Stopping | ContainerState::Gone)
    }

    /// States from which an invocation can be served without a cold start.
    pub fn is_warm(&self) -> bool {
        matches!(self, ContainerState::Ready | ContainerState::Idle)
    }

    fn can_transition_to(&self, next: ContainerState) -> bool {
        use ContainerState::*;
        match (self, next) {
            // Any live state can be torn down.
            (Provisioning | Ready | Busy | Idle | Paused, Stopping) => true,
            (Stopping, Gone) => true,
            // Rollback of a failed provision skips Stopping.
            (Provisioning, Gone) => true,
            (Provisioning, Ready) => true,
            (Ready, Busy | Idle) => true,
            (Busy, Ready | Idle) => true,
            (Idle, Busy | Ready) => true,
            (Ready | Idle, Paused) => true,
            (Paused, Ready) => true,
            _ => false,
        }
    }
}

/// A single managed container as tracked by the orchestrator.
///
/// Records are crash-volatile; the container itself (via its labels) is the
/// durable representation, re-read by AdoptSync after a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub id: ContainerId,
    pub function_name: String,
    pub address: WorkerAddr,
    pub state: ContainerState,
    /// Epoch millis, monotone non-decreasing. Updated on acquire, release
    /// and heartbeat.
    pub last_used_at: u64,
    pub created_at: u64,
    pub labels: HashMap<String, String>,
}

impl ContainerRecord {
    pub fn new(id: ContainerId, function_name: &str, address: WorkerAddr) -> Self {
        let now = get_epoch_time_in_ms();
        Self {
            id,
            function_name: function_name.to_string(),
            address,
            state: ContainerState::Provisioning,
            last_used_at: now,
            created_at: now,
            labels: esb_labels(function_name),
        }
    }

    /// Transition to `next`, rejecting transitions the lifecycle does not
    /// allow (e.g. out of Gone).
    pub fn set_state(&mut self, next: ContainerState) -> Result<(), String> {
        if !self.state.can_transition_to(next) {
            return Err(format!(
                "invalid container state transition {} -> {}",
                self.state, next
            ));
        }
        self.state = next;
        Ok(())
    }

    /// Refresh `last_used_at`. Stale timestamps are ignored so the field
    /// stays monotone.
    pub fn touch(&mut self, now_ms: u64) {
        if now_ms > self.last_used_at {
            self.last_used_at = now_ms;
        }
    }

    pub fn idle_for_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_used_at)
    }
}

/// On-disk shape of the functions config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionsFile {
    #[serde(default)]
    pub functions: Vec<FunctionDescriptor>,
}

/// Lookup table of declared functions, immutable per-run.
#[derive(Debug, Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, FunctionDescriptor>,
}

impl FunctionRegistry {
    pub fn new(descriptors: Vec<FunctionDescriptor>) -> Self {
        let functions = descriptors
            .into_iter()
            .map(|d| (d.name.clone(), d))
            .collect();
        Self { functions }
    }

    pub fn get(&self, name: &str) -> Option<&FunctionDescriptor> {
        self.functions.get(name)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &FunctionDescriptor> {
        self.functions.values()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Orchestrator RPC payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsureRequest {
    pub function_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsureResponse {
    pub container_id: ContainerId,
    pub address: WorkerAddr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    /// Every container this gateway holds: checked out, idle in a pool, or
    /// host-cached.
    pub ids: Vec<ContainerId>,
    /// Subset of `ids` not currently serving an invocation.
    #[serde(default)]
    pub idle_ids: Vec<ContainerId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvictRequest {
    pub container_id: ContainerId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckResponse {
    pub ok: bool,
}
