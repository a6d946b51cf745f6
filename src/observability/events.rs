//! Structured events, one per significant state transition.

use tracing::{info, warn};

use crate::core::Tier;

pub trait Event {
    fn emit(&self);
}

/// Emitted once per routed request with the audit fields callers also
/// receive in the response.
#[derive(Debug, Clone, Copy)]
pub struct RouteCompletedEvent<'a> {
    pub tier_requested: Option<Tier>,
    pub tier_used: Tier,
    pub backend_id: &'a str,
    pub latency_ms: u64,
    pub fell_back: bool,
}

impl Event for RouteCompletedEvent<'_> {
    fn emit(&self) {
        info!(
            tier_requested = self.tier_requested.map(|t| t.as_str()),
            tier_used = self.tier_used.as_str(),
            backend = self.backend_id,
            latency_ms = self.latency_ms,
            fell_back = self.fell_back,
            "route completed"
        );
    }
}

/// A deliberate quality/availability tradeoff; always logged at WARN.
#[derive(Debug, Clone, Copy)]
pub struct TierFallbackEvent {
    pub from: Tier,
    pub to: Tier,
}

impl Event for TierFallbackEvent {
    fn emit(&self) {
        warn!(
            from = self.from.as_str(),
            to = self.to.as_str(),
            "tier unavailable, falling back one step (degraded quality)"
        );
    }
}

/// Emitted at the end of every hot swap, success or failure.
#[derive(Debug, Clone, Copy)]
pub struct AdapterSwapEvent<'a> {
    pub instance: &'a str,
    pub old_adapter: &'a str,
    pub new_adapter: &'a str,
    pub strategy: &'static str,
    pub success: bool,
}

impl Event for AdapterSwapEvent<'_> {
    fn emit(&self) {
        if self.success {
            info!(
                instance = self.instance,
                old_adapter = self.old_adapter,
                new_adapter = self.new_adapter,
                strategy = self.strategy,
                "adapter hot swap completed"
            );
        } else {
            warn!(
                instance = self.instance,
                old_adapter = self.old_adapter,
                new_adapter = self.new_adapter,
                strategy = self.strategy,
                "adapter hot swap failed"
            );
        }
    }
}
