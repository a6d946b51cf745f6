//! Metrics facade over the `metrics` crate.
//!
//! One static method per signal keeps call sites terse and the metric
//! names/labels in a single place. Exposition is the collector's
//! concern; the gateway only emits.

use std::time::Duration;

use metrics::{counter, gauge, histogram};

use crate::core::Tier;

pub struct RouterMetrics;

impl RouterMetrics {
    pub fn record_route(tier: Tier, latency: Duration) {
        counter!("dg_route_requests_total", "tier" => tier.as_str()).increment(1);
        histogram!("dg_route_duration_seconds", "tier" => tier.as_str())
            .record(latency.as_secs_f64());
    }

    pub fn record_route_error(tier: Tier, code: &'static str) {
        counter!("dg_route_errors_total", "tier" => tier.as_str(), "code" => code).increment(1);
    }

    pub fn record_fallback(from: Tier, to: Tier) {
        counter!("dg_tier_fallbacks_total", "from" => from.as_str(), "to" => to.as_str())
            .increment(1);
    }

    pub fn record_retry(backend_id: &str) {
        counter!("dg_call_retries_total", "backend" => backend_id.to_string()).increment(1);
    }

    pub fn record_retry_backoff(delay: Duration, attempt: u32) {
        histogram!("dg_call_retry_backoff_seconds", "attempt" => attempt.to_string())
            .record(delay.as_secs_f64());
    }

    pub fn set_breaker_state(backend_id: &str, state: u8) {
        gauge!("dg_breaker_state", "backend" => backend_id.to_string()).set(state as f64);
    }

    pub fn record_breaker_transition(backend_id: &str, from: &'static str, to: &'static str) {
        counter!(
            "dg_breaker_transitions_total",
            "backend" => backend_id.to_string(),
            "from" => from,
            "to" => to
        )
        .increment(1);
    }

    pub fn record_breaker_outcome(backend_id: &str, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        counter!(
            "dg_breaker_outcomes_total",
            "backend" => backend_id.to_string(),
            "outcome" => outcome
        )
        .increment(1);
    }

    pub fn record_health_check(backend_id: &str, healthy: bool) {
        let outcome = if healthy { "ok" } else { "failed" };
        counter!(
            "dg_health_checks_total",
            "backend" => backend_id.to_string(),
            "outcome" => outcome
        )
        .increment(1);
    }

    pub fn record_adapter_swap(strategy: &'static str, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        counter!(
            "dg_adapter_swaps_total",
            "strategy" => strategy,
            "outcome" => outcome
        )
        .increment(1);
    }

    pub fn set_batch_size(backend_id: &str, size: u32) {
        gauge!("dg_batch_max_size", "backend" => backend_id.to_string()).set(size as f64);
    }
}
