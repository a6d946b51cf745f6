#![allow(dead_code)]

pub mod mock_backend;

use dialogue_gateway::{
    config::{BackendConfig, GatewayConfig},
    core::Tier,
    protocols::RoutingRequest,
};

/// Baseline test configuration: empty topology, fast retries, short
/// breaker recovery so recovery scenarios run in test time.
pub fn base_config() -> GatewayConfig {
    let mut config: GatewayConfig = serde_yaml::from_str("tiers: {}").unwrap();
    config.retry.max_retries = 2;
    config.retry.initial_backoff_ms = 5;
    config.retry.max_backoff_ms = 20;
    config.retry.jitter_factor = 0.0;
    config.circuit_breaker.failure_threshold = 5;
    config.circuit_breaker.success_threshold = 1;
    config.circuit_breaker.recovery_timeout_secs = 1;
    config.health_check.timeout_secs = 2;
    // Maintenance loops are driven manually in tests.
    config.health_check.check_interval_secs = 3600;
    config.batching.tune_interval_secs = 3600;
    config
}

pub fn add_backend(config: &mut GatewayConfig, tier: Tier, name: &str, url: &str) {
    let tier_config = match tier {
        Tier::RealTime => &mut config.tiers.real_time,
        Tier::Interactive => &mut config.tiers.interactive,
        Tier::BatchAsync => &mut config.tiers.batch_async,
    };
    tier_config.backends.push(BackendConfig {
        name: Some(name.to_string()),
        url: url.to_string(),
        adapter_memory_budget_bytes: None,
    });
}

pub fn generation_request() -> RoutingRequest {
    RoutingRequest {
        prompt: "The vampire lord surveys the ballroom".to_string(),
        max_tokens: 64,
        temperature: 0.7,
        tier: None,
        latency_budget_ms: None,
        adapter: None,
        allow_fallback: false,
    }
}
