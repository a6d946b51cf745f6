//! Backend instances and the injected registry that tracks them.
//!
//! Topology is provisioned externally and injected at startup; the
//! gateway never creates or destroys instances, it only observes and
//! routes around their health, circuit and swap state.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering},
        Arc,
    },
};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerStats};

/// Latency/quality class of a backend pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    RealTime,
    Interactive,
    BatchAsync,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::RealTime => "real_time",
            Tier::Interactive => "interactive",
            Tier::BatchAsync => "batch_async",
        }
    }

    /// Next tier in the single-step fallback chain.
    pub fn fallback_next(&self) -> Option<Tier> {
        match self {
            Tier::RealTime => Some(Tier::Interactive),
            Tier::Interactive => Some(Tier::BatchAsync),
            Tier::BatchAsync => None,
        }
    }

    pub const ALL: [Tier; 3] = [Tier::RealTime, Tier::Interactive, Tier::BatchAsync];
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const HEALTH_HEALTHY: u8 = 0;
const HEALTH_DEGRADED: u8 = 1;
const HEALTH_UNREACHABLE: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    /// Responding, but slower than the probe's comfort threshold.
    /// Degraded instances stay in rotation.
    Degraded,
    Unreachable,
}

impl HealthState {
    fn to_int(self) -> u8 {
        match self {
            HealthState::Healthy => HEALTH_HEALTHY,
            HealthState::Degraded => HEALTH_DEGRADED,
            HealthState::Unreachable => HEALTH_UNREACHABLE,
        }
    }

    fn from_int(v: u8) -> Self {
        match v {
            HEALTH_DEGRADED => HealthState::Degraded,
            HEALTH_UNREACHABLE => HealthState::Unreachable,
            _ => HealthState::Healthy,
        }
    }

    pub fn is_routable(&self) -> bool {
        !matches!(self, HealthState::Unreachable)
    }
}

/// One inference backend instance inside a tier.
#[derive(Debug)]
pub struct Backend {
    id: String,
    url: String,
    tier: Tier,
    health: AtomicU8,
    active_load: AtomicUsize,
    processed: AtomicUsize,
    swap_in_progress: AtomicBool,
    adapter_memory_budget_bytes: u64,
    circuit_breaker: CircuitBreaker,
}

impl Backend {
    pub fn new(
        id: impl Into<String>,
        url: impl Into<String>,
        tier: Tier,
        adapter_memory_budget_bytes: u64,
        circuit_breaker: CircuitBreaker,
    ) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            tier,
            health: AtomicU8::new(HEALTH_HEALTHY),
            active_load: AtomicUsize::new(0),
            processed: AtomicUsize::new(0),
            swap_in_progress: AtomicBool::new(false),
            adapter_memory_budget_bytes,
            circuit_breaker,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn endpoint_url(&self, route: &str) -> String {
        format!("{}{}", self.url.trim_end_matches('/'), route)
    }

    pub fn health(&self) -> HealthState {
        HealthState::from_int(self.health.load(Ordering::Acquire))
    }

    pub fn set_health(&self, state: HealthState) {
        self.health.store(state.to_int(), Ordering::Release);
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuit_breaker
    }

    pub fn load(&self) -> usize {
        self.active_load.load(Ordering::Relaxed)
    }

    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn adapter_memory_budget_bytes(&self) -> u64 {
        self.adapter_memory_budget_bytes
    }

    pub fn is_swapping(&self) -> bool {
        self.swap_in_progress.load(Ordering::Acquire)
    }

    pub fn set_swapping(&self, value: bool) {
        self.swap_in_progress.store(value, Ordering::Release);
    }

    /// Routable = reachable, circuit not open, and no adapter swap is
    /// rewriting the instance's adapter set.
    pub fn is_available(&self) -> bool {
        self.health().is_routable()
            && self.circuit_breaker.state() != super::CircuitState::Open
            && !self.is_swapping()
    }

    pub fn snapshot(&self) -> BackendSnapshot {
        BackendSnapshot {
            id: self.id.clone(),
            url: self.url.clone(),
            tier: self.tier,
            health: self.health(),
            load: self.load(),
            processed: self.processed(),
            swap_in_progress: self.is_swapping(),
            circuit: self.circuit_breaker.stats(),
        }
    }
}

/// Point-in-time view of an instance, for the operational endpoint.
#[derive(Debug, Clone)]
pub struct BackendSnapshot {
    pub id: String,
    pub url: String,
    pub tier: Tier,
    pub health: HealthState,
    pub load: usize,
    pub processed: usize,
    pub swap_in_progress: bool,
    pub circuit: CircuitBreakerStats,
}

/// RAII in-flight counter: increments on creation, decrements on drop,
/// counts the request as processed when marked complete.
pub struct LoadGuard {
    backend: Arc<Backend>,
}

impl LoadGuard {
    pub fn acquire(backend: Arc<Backend>) -> Self {
        backend.active_load.fetch_add(1, Ordering::Relaxed);
        Self { backend }
    }

    pub fn mark_processed(&self) {
        self.backend.processed.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        self.backend.active_load.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Injected store of all backend instances, keyed by id and by tier.
/// Per-instance state lives on the instances themselves; the registry
/// only hands out snapshots of the membership.
#[derive(Debug, Default)]
pub struct BackendRegistry {
    by_id: DashMap<String, Arc<Backend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, backend: Arc<Backend>) {
        self.by_id.insert(backend.id().to_string(), backend);
    }

    pub fn get(&self, id: &str) -> Option<Arc<Backend>> {
        self.by_id.get(id).map(|entry| entry.value().clone())
    }

    pub fn all(&self) -> Vec<Arc<Backend>> {
        self.by_id.iter().map(|e| e.value().clone()).collect()
    }

    pub fn tier(&self, tier: Tier) -> Vec<Arc<Backend>> {
        let mut backends: Vec<_> = self
            .by_id
            .iter()
            .filter(|e| e.value().tier() == tier)
            .map(|e| e.value().clone())
            .collect();
        // Stable order so round-robin rotation is deterministic.
        backends.sort_by(|a, b| a.id().cmp(b.id()));
        backends
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
