//! Adaptive batching-parameter control.
//!
//! Each backend carries one current `BatchingConfig` (never a history)
//! and a bounded ring of recent utilization/latency samples. A periodic
//! bang-bang tuner steps the batch size toward the configured water
//! marks, clamped to hard floor/ceiling bounds. Sample writes are
//! index-atomic and per-slot; losing a sample under contention is
//! acceptable telemetry loss, not a correctness problem.

use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{config::BatchingTunerConfig, observability::metrics::RouterMetrics};

/// Current batching limits for one backend. Mutable at runtime; only the
/// present value is retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchingConfig {
    pub max_batch_size: u32,
    pub max_seq_len: u32,
    pub max_batched_tokens: u32,
    pub max_concurrent_seqs: u32,
    pub prefix_cache_enabled: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub utilization: f32,
    pub batch_size: u32,
    pub latency_ms: u64,
}

/// Fixed-capacity overwrite ring with an atomic write index.
#[derive(Debug)]
struct SampleRing {
    slots: Vec<RwLock<Option<Sample>>>,
    next: AtomicUsize,
}

impl SampleRing {
    fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity.max(1)).map(|_| RwLock::new(None)).collect(),
            next: AtomicUsize::new(0),
        }
    }

    fn push(&self, sample: Sample) {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        *self.slots[idx].write() = Some(sample);
    }

    fn snapshot(&self) -> Vec<Sample> {
        self.slots.iter().filter_map(|slot| *slot.read()).collect()
    }
}

#[derive(Debug)]
struct BackendBatchState {
    config: RwLock<BatchingConfig>,
    latency_target_ms: Option<u64>,
    ring: SampleRing,
}

#[derive(Debug)]
pub struct BatchingController {
    tuner: BatchingTunerConfig,
    backends: DashMap<String, BackendBatchState>,
}

impl BatchingController {
    pub fn new(tuner: BatchingTunerConfig) -> Self {
        Self {
            tuner,
            backends: DashMap::new(),
        }
    }

    /// Register a backend with the tier's latency target and the initial
    /// limits. Idempotent; re-registration resets the window.
    pub fn register_backend(&self, backend_id: impl Into<String>, latency_target_ms: Option<u64>) {
        let initial = BatchingConfig {
            max_batch_size: self
                .tuner
                .initial_max_batch_size
                .clamp(self.tuner.batch_size_floor, self.tuner.batch_size_ceiling),
            max_seq_len: self.tuner.max_seq_len,
            max_batched_tokens: self.tuner.max_batched_tokens,
            max_concurrent_seqs: self.tuner.max_concurrent_seqs,
            prefix_cache_enabled: self.tuner.prefix_cache_enabled,
        };
        self.backends.insert(
            backend_id.into(),
            BackendBatchState {
                config: RwLock::new(initial),
                latency_target_ms,
                ring: SampleRing::new(self.tuner.window_size),
            },
        );
    }

    pub fn get_config(&self, backend_id: &str) -> Option<BatchingConfig> {
        self.backends
            .get(backend_id)
            .map(|state| *state.config.read())
    }

    /// Append one telemetry sample. Unknown backends are ignored; the
    /// feed is best-effort.
    pub fn record_sample(&self, backend_id: &str, utilization: f32, batch_size: u32, latency_ms: u64) {
        match self.backends.get(backend_id) {
            Some(state) => state.ring.push(Sample {
                utilization: utilization.clamp(0.0, 1.0),
                batch_size,
                latency_ms,
            }),
            None => debug!(backend = backend_id, "sample for unregistered backend dropped"),
        }
    }

    /// One tuning pass for one backend. Returns whether the batch size
    /// changed. Movement is a single step per pass, clamped to
    /// [floor, ceiling]; nothing but the two water-mark conditions
    /// adjusts the configuration.
    pub fn tune(&self, backend_id: &str) -> bool {
        let Some(state) = self.backends.get(backend_id) else {
            return false;
        };

        let samples = state.ring.snapshot();
        if samples.is_empty() {
            return false;
        }

        let n = samples.len() as f64;
        let avg_utilization =
            samples.iter().map(|s| s.utilization as f64).sum::<f64>() / n;
        let avg_latency_ms = samples.iter().map(|s| s.latency_ms as f64).sum::<f64>() / n;

        let under_budget = state
            .latency_target_ms
            .is_none_or(|target| avg_latency_ms <= target as f64);
        let over_budget = state
            .latency_target_ms
            .is_some_and(|target| avg_latency_ms > target as f64);

        let mut config = state.config.write();
        let current = config.max_batch_size;

        let proposed = if avg_utilization < self.tuner.low_utilization_watermark as f64
            && under_budget
        {
            current
                .saturating_add(self.tuner.batch_size_step)
                .min(self.tuner.batch_size_ceiling)
        } else if avg_utilization > self.tuner.high_utilization_watermark as f64 && over_budget {
            current
                .saturating_sub(self.tuner.batch_size_step)
                .max(self.tuner.batch_size_floor)
        } else {
            return false;
        };

        if proposed == current {
            return false;
        }

        config.max_batch_size = proposed;
        drop(config);

        info!(
            backend = backend_id,
            from = current,
            to = proposed,
            avg_utilization,
            avg_latency_ms,
            "batch size adjusted"
        );
        RouterMetrics::set_batch_size(backend_id, proposed);
        true
    }

    /// Tune every registered backend; returns how many changed.
    pub fn tune_all(&self) -> usize {
        let ids: Vec<String> = self.backends.iter().map(|e| e.key().clone()).collect();
        ids.iter().filter(|id| self.tune(id)).count()
    }
}
