// src/core/types.rs

//! Shared types for the scheduler and catalog: spec keys, instances, and the
//! observability snapshots returned by `Scheduler::get_pool_status`.

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use strum_macros::{Display, EnumString};
use tokio::sync::Notify;

/// Stable fingerprint of a server spec; the pool-sharing key.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct SpecKey(String);

impl SpecKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SpecKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SpecKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle state of a child instance.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Display, EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
#[repr(u8)]
pub enum InstanceState {
    Starting = 0,
    Initializing = 1,
    Handshaking = 2,
    Ready = 3,
    Busy = 4,
    Draining = 5,
    Stopped = 6,
    Failed = 7,
}

impl InstanceState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => InstanceState::Starting,
            1 => InstanceState::Initializing,
            2 => InstanceState::Handshaking,
            3 => InstanceState::Ready,
            4 => InstanceState::Busy,
            5 => InstanceState::Draining,
            6 => InstanceState::Stopped,
            _ => InstanceState::Failed,
        }
    }

    /// Ready or Busy: the instance can take routed traffic.
    pub fn is_routable(self) -> bool {
        matches!(self, InstanceState::Ready | InstanceState::Busy)
    }
}

/// Why an instance was started. Attached at start time for observability.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum StartCause {
    /// A caller's acquire found no capacity.
    #[default]
    OnDemand,
    /// Warm-pool growth toward the desired floor.
    MinReady,
    /// First start triggered while the system was coming up.
    Bootstrap,
}

/// Current epoch milliseconds; the resolution all instance timestamps use.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn millis_to_datetime(ms: u64) -> Option<DateTime<Utc>> {
    if ms == 0 {
        return None;
    }
    Utc.timestamp_millis_opt(ms as i64).single()
}

/// A running child. Created by `Lifecycle::start_instance`, owned by the
/// scheduler, destroyed exactly once via `Lifecycle::stop_instance`.
///
/// Fields are atomics so `Arc<Instance>` holders can read them without the
/// pool lock; all mutation still happens only while the owning pool's lock
/// is held.
#[derive(Debug)]
pub struct Instance {
    pub id: String,
    pub spec_key: SpecKey,
    /// Opaque handle the lifecycle driver attached for its router and the
    /// health probe. The core never interprets it.
    pub conn_token: String,

    state: AtomicU8,
    busy_count: AtomicU32,
    last_active_ms: AtomicU64,
    spawned_at_ms: AtomicU64,
    handshaked_at_ms: AtomicU64,
    last_heartbeat_ms: AtomicU64,
    sticky_key: Mutex<Option<String>>,
    start_cause: Mutex<StartCause>,

    /// Fired from `release` when a draining instance's busy count reaches 0.
    pub(crate) drain_done: Notify,
    /// Guards the drain completion path so the final stop runs once.
    pub(crate) drain_fired: AtomicBool,
}

impl Instance {
    pub fn new(id: impl Into<String>, spec_key: SpecKey, conn_token: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            id: id.into(),
            spec_key,
            conn_token: conn_token.into(),
            state: AtomicU8::new(InstanceState::Starting as u8),
            busy_count: AtomicU32::new(0),
            last_active_ms: AtomicU64::new(now),
            spawned_at_ms: AtomicU64::new(now),
            handshaked_at_ms: AtomicU64::new(0),
            last_heartbeat_ms: AtomicU64::new(0),
            sticky_key: Mutex::new(None),
            start_cause: Mutex::new(StartCause::OnDemand),
            drain_done: Notify::new(),
            drain_fired: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> InstanceState {
        InstanceState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: InstanceState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn busy_count(&self) -> u32 {
        self.busy_count.load(Ordering::SeqCst)
    }

    pub(crate) fn increment_busy(&self) -> u32 {
        self.busy_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Saturating decrement, so a double release can never drive the count
    /// negative.
    pub(crate) fn decrement_busy(&self) -> u32 {
        self.busy_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| {
                Some(c.saturating_sub(1))
            })
            .map(|prev| prev.saturating_sub(1))
            .unwrap_or(0)
    }

    pub fn is_routable(&self) -> bool {
        self.state().is_routable()
    }

    pub fn touch(&self) {
        self.last_active_ms.store(now_millis(), Ordering::SeqCst);
    }

    pub fn last_active_ms(&self) -> u64 {
        self.last_active_ms.load(Ordering::SeqCst)
    }

    pub fn mark_handshaked(&self) {
        self.handshaked_at_ms.store(now_millis(), Ordering::SeqCst);
    }

    pub fn mark_heartbeat(&self) {
        self.last_heartbeat_ms.store(now_millis(), Ordering::SeqCst);
    }

    pub fn sticky_key(&self) -> Option<String> {
        self.sticky_key.lock().clone()
    }

    pub(crate) fn set_sticky_key(&self, key: Option<String>) {
        *self.sticky_key.lock() = key;
    }

    pub fn start_cause(&self) -> StartCause {
        *self.start_cause.lock()
    }

    pub(crate) fn set_start_cause(&self, cause: StartCause) {
        *self.start_cause.lock() = cause;
    }

    /// Builds the observability snapshot for this instance.
    pub fn info(&self) -> InstanceInfo {
        InstanceInfo {
            id: self.id.clone(),
            spec_key: self.spec_key.clone(),
            state: self.state(),
            busy_count: self.busy_count(),
            last_active: millis_to_datetime(self.last_active_ms.load(Ordering::SeqCst)),
            spawned_at: millis_to_datetime(self.spawned_at_ms.load(Ordering::SeqCst)),
            handshaked_at: millis_to_datetime(self.handshaked_at_ms.load(Ordering::SeqCst)),
            last_heartbeat_at: millis_to_datetime(self.last_heartbeat_ms.load(Ordering::SeqCst)),
            sticky_key: self.sticky_key(),
            last_start_cause: self.start_cause(),
        }
    }
}

/// Serializable view of a single instance.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct InstanceInfo {
    pub id: String,
    pub spec_key: SpecKey,
    pub state: InstanceState,
    pub busy_count: u32,
    pub last_active: Option<DateTime<Utc>>,
    pub spawned_at: Option<DateTime<Utc>>,
    pub handshaked_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub sticky_key: Option<String>,
    pub last_start_cause: StartCause,
}

/// Serializable view of one pool, as returned by
/// `Scheduler::get_pool_status`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PoolInfo {
    pub spec_key: SpecKey,
    pub server_name: String,
    pub strategy: crate::config::Strategy,
    pub min_ready: usize,
    pub starting: usize,
    pub generation: u64,
    pub start_count: u64,
    pub stop_count: u64,
    pub sticky_bindings: usize,
    pub instances: Vec<InstanceInfo>,
    pub draining: Vec<InstanceInfo>,
}
