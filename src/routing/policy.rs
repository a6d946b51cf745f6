//! Instance selection policies.
//!
//! The router filters candidates for eligibility first; a policy only
//! picks an index among already-eligible instances. The contract is no
//! starvation across repeated calls, nothing more.

use std::{
    fmt::Debug,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use async_trait::async_trait;

use crate::core::Backend;

#[async_trait]
pub trait SelectionPolicy: Send + Sync + Debug {
    /// Pick one of the given (eligible, non-empty order-stable) backends.
    async fn select(&self, backends: &[Arc<Backend>]) -> Option<usize>;

    fn name(&self) -> &'static str;

    /// Reset internal state (e.g. rotation counters).
    fn reset(&self) {}
}

/// Cycles through eligible instances with an atomic counter.
#[derive(Debug, Default)]
pub struct RoundRobinPolicy {
    counter: AtomicUsize,
}

impl RoundRobinPolicy {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SelectionPolicy for RoundRobinPolicy {
    async fn select(&self, backends: &[Arc<Backend>]) -> Option<usize> {
        if backends.is_empty() {
            return None;
        }
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        Some(count % backends.len())
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn reset(&self) {
        self.counter.store(0, Ordering::Relaxed);
    }
}
