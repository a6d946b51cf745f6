//! Tier selection and request routing.
//!
//! The router picks a tier (caller override first, latency budget
//! second, interactive otherwise), filters that tier's instances down to
//! the eligible set, and drives the resilient client against the pick.
//! Fallback across tiers is explicit, single-step and always logged; an
//! explicit tier request is never silently downgraded.

mod policy;

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

pub use policy::{RoundRobinPolicy, SelectionPolicy};
use tracing::debug;

use crate::{
    adapters::AdapterLifecycleManager,
    batching::BatchingController,
    config::{GatewayConfig, RoutingConfig, TiersConfig},
    core::{
        Backend, BackendRegistry, CallError, GatewayError, GatewayResult, LoadGuard,
        ResilientClient, Tier,
    },
    observability::{
        events::{Event, RouteCompletedEvent, TierFallbackEvent},
        metrics::RouterMetrics,
    },
    protocols::{CompletionRequest, RoutingRequest, RoutingResult},
};

pub struct TierRouter {
    registry: Arc<BackendRegistry>,
    adapters: Arc<AdapterLifecycleManager>,
    batching: Arc<BatchingController>,
    client: Arc<ResilientClient>,
    routing: RoutingConfig,
    tiers: TiersConfig,
    max_attempts: u32,
    policies: HashMap<Tier, Arc<dyn SelectionPolicy>>,
}

impl TierRouter {
    pub fn new(
        config: &GatewayConfig,
        registry: Arc<BackendRegistry>,
        adapters: Arc<AdapterLifecycleManager>,
        batching: Arc<BatchingController>,
        client: Arc<ResilientClient>,
    ) -> Self {
        let policies = Tier::ALL
            .into_iter()
            .map(|tier| {
                (
                    tier,
                    Arc::new(RoundRobinPolicy::new()) as Arc<dyn SelectionPolicy>,
                )
            })
            .collect();

        Self {
            registry,
            adapters,
            batching,
            client,
            routing: config.routing.clone(),
            tiers: config.tiers.clone(),
            max_attempts: config.retry.max_retries,
            policies,
        }
    }

    /// Route one generation request and return the result with its audit
    /// metadata, or a typed failure.
    pub async fn route(&self, request: &RoutingRequest) -> GatewayResult<RoutingResult> {
        request.validate()?;

        let started = Instant::now();
        let deadline = request
            .latency_budget_ms
            .map(|ms| started + Duration::from_millis(ms));
        let tier = self.select_tier(request);

        let outcome = self
            .route_in_tier(tier, request, deadline, started, false)
            .await;

        let outcome = match outcome {
            Err(GatewayError::TierUnavailable { .. }) if self.fallback_permitted(request) => {
                match tier.fallback_next() {
                    Some(next) => {
                        TierFallbackEvent {
                            from: tier,
                            to: next,
                        }
                        .emit();
                        RouterMetrics::record_fallback(tier, next);
                        self.route_in_tier(next, request, deadline, started, true)
                            .await
                    }
                    None => Err(GatewayError::TierUnavailable { tier }),
                }
            }
            other => other,
        };

        match &outcome {
            Ok(result) => {
                RouteCompletedEvent {
                    tier_requested: request.tier,
                    tier_used: result.tier_used,
                    backend_id: &result.backend_id,
                    latency_ms: result.latency_ms,
                    fell_back: result.fell_back,
                }
                .emit();
                RouterMetrics::record_route(result.tier_used, started.elapsed());
            }
            Err(err) => {
                RouterMetrics::record_route_error(tier, err.code());
            }
        }
        outcome
    }

    /// Tier selection, in priority order: explicit pin, then latency
    /// budget against the configured thresholds, then interactive. A
    /// synchronous caller is never silently deferred to batch-async.
    fn select_tier(&self, request: &RoutingRequest) -> Tier {
        if let Some(tier) = request.tier {
            return tier;
        }
        match request.latency_budget_ms {
            Some(budget) if budget < self.routing.realtime_threshold_ms => Tier::RealTime,
            Some(budget) if budget < self.routing.interactive_threshold_ms => Tier::Interactive,
            _ => Tier::Interactive,
        }
    }

    /// Fallback needs the config switch, and additionally the caller's
    /// own opt-in when the request pinned a tier explicitly.
    fn fallback_permitted(&self, request: &RoutingRequest) -> bool {
        self.routing.enable_fallback && (request.tier.is_none() || request.allow_fallback)
    }

    async fn route_in_tier(
        &self,
        tier: Tier,
        request: &RoutingRequest,
        deadline: Option<Instant>,
        started: Instant,
        fell_back: bool,
    ) -> GatewayResult<RoutingResult> {
        let mut candidates = self.eligible_backends(tier, request.adapter.as_deref())?;
        let payload = CompletionRequest::from_routing(request);
        let timeout = Duration::from_secs(self.tiers.tier(tier).request_timeout_secs);
        let policy = &self.policies[&tier];

        while !candidates.is_empty() {
            let idx = match policy.select(&candidates).await {
                Some(idx) => idx,
                None => break,
            };
            let backend = candidates[idx].clone();

            let guard = LoadGuard::acquire(backend.clone());
            let call = self
                .client
                .generate(&backend, &payload, timeout, deadline)
                .await;

            match call {
                Ok(response) => {
                    guard.mark_processed();
                    let latency_ms = started.elapsed().as_millis() as u64;
                    return Ok(RoutingResult {
                        text: response.text,
                        tokens_generated: response.completion_tokens,
                        tier_used: tier,
                        backend_id: backend.id().to_string(),
                        latency_ms,
                        fell_back,
                    });
                }
                Err(CallError::CircuitOpen { .. }) => {
                    // Instance-level condition: move on to a different
                    // instance in the same tier.
                    debug!(backend = backend.id(), %tier, "skipping open circuit");
                    candidates.remove(idx);
                }
                Err(err @ CallError::Timeout { .. })
                | Err(err @ CallError::ConnectionRefused { .. }) => {
                    return Err(GatewayError::BackendUnavailable {
                        tier,
                        url: backend.url().to_string(),
                        attempts: self.max_attempts,
                        source: err,
                    });
                }
                Err(CallError::ApplicationError {
                    url,
                    status,
                    message,
                }) => {
                    return Err(GatewayError::Upstream {
                        url,
                        status,
                        message,
                    });
                }
            }
        }

        Err(GatewayError::TierUnavailable { tier })
    }

    /// Eligibility filter: reachable health, circuit not open, no swap
    /// in progress, below the instance's concurrency capacity hint, and
    /// — when the request names an adapter — that adapter loaded.
    fn eligible_backends(
        &self,
        tier: Tier,
        adapter: Option<&str>,
    ) -> GatewayResult<Vec<Arc<Backend>>> {
        let mut eligible: Vec<Arc<Backend>> = self
            .registry
            .tier(tier)
            .into_iter()
            .filter(|b| b.is_available())
            .filter(|b| {
                let capacity = self
                    .batching
                    .get_config(b.id())
                    .map(|c| c.max_concurrent_seqs)
                    .unwrap_or(u32::MAX);
                (b.load() as u32) < capacity
            })
            .collect();

        if eligible.is_empty() {
            return Err(GatewayError::TierUnavailable { tier });
        }

        if let Some(name) = adapter {
            eligible.retain(|b| self.adapters.is_loaded(name, b.id()));
            if eligible.is_empty() {
                return Err(GatewayError::AdapterNotReady {
                    adapter: name.to_string(),
                    tier,
                });
            }
        }

        Ok(eligible)
    }
}
