use serde::{Deserialize, Serialize};
use url::Url;

use super::{ConfigError, ConfigResult};
use crate::core::Tier;

/// Main gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub routing: RoutingConfig,
    pub tiers: TiersConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub batching: BatchingTunerConfig,
    #[serde(default)]
    pub adapters: AdapterSandboxConfig,
    pub log_level: Option<String>,
    pub log_dir: Option<String>,
    #[serde(default)]
    pub json_logs: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3080
}

/// Tier-selection thresholds and the fallback switch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Latency budgets below this select the real-time tier.
    pub realtime_threshold_ms: u64,
    /// Latency budgets below this (and above the real-time threshold)
    /// select the interactive tier.
    pub interactive_threshold_ms: u64,
    /// Master switch for single-step tier fallback. Requests that pin a
    /// tier explicitly must additionally opt in per request.
    pub enable_fallback: bool,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            realtime_threshold_ms: 100,
            interactive_threshold_ms: 1000,
            enable_fallback: false,
        }
    }
}

/// One entry per tier; a tier with no backends is valid but always
/// reports `TierUnavailable`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TiersConfig {
    #[serde(default = "TierConfig::default_real_time")]
    pub real_time: TierConfig,
    #[serde(default = "TierConfig::default_interactive")]
    pub interactive: TierConfig,
    #[serde(default = "TierConfig::default_batch_async")]
    pub batch_async: TierConfig,
}

impl Default for TiersConfig {
    fn default() -> Self {
        Self {
            real_time: TierConfig::default_real_time(),
            interactive: TierConfig::default_interactive(),
            batch_async: TierConfig::default_batch_async(),
        }
    }
}

impl TiersConfig {
    pub fn tier(&self, tier: Tier) -> &TierConfig {
        match tier {
            Tier::RealTime => &self.real_time,
            Tier::Interactive => &self.interactive,
            Tier::BatchAsync => &self.batch_async,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Tier, &TierConfig)> {
        [
            (Tier::RealTime, &self.real_time),
            (Tier::Interactive, &self.interactive),
            (Tier::BatchAsync, &self.batch_async),
        ]
        .into_iter()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    /// Per-request latency target for the tier; `None` means unbounded
    /// (batch-async). Feeds the batching tuner's latency comparison.
    pub latency_target_ms: Option<u64>,
    /// Per-attempt timeout for calls to this tier's backends.
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

impl TierConfig {
    pub fn default_real_time() -> Self {
        Self {
            latency_target_ms: Some(100),
            request_timeout_secs: 2,
            backends: vec![],
        }
    }

    pub fn default_interactive() -> Self {
        Self {
            latency_target_ms: Some(1000),
            request_timeout_secs: 30,
            backends: vec![],
        }
    }

    pub fn default_batch_async() -> Self {
        Self {
            latency_target_ms: None,
            request_timeout_secs: 600,
            backends: vec![],
        }
    }
}

impl Default for TierConfig {
    fn default() -> Self {
        Self::default_interactive()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Stable identifier; defaults to the URL with the scheme stripped.
    pub name: Option<String>,
    pub url: String,
    /// Memory available for adapter artifacts on this instance. Decides
    /// make-before-break vs break-before-make during hot swaps.
    pub adapter_memory_budget_bytes: Option<u64>,
}

impl BackendConfig {
    pub fn effective_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            self.url
                .trim_start_matches("http://")
                .trim_start_matches("https://")
                .trim_end_matches('/')
                .to_string()
        })
    }
}

/// Retry configuration for backend calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f32,
    /// D' = D * (1 + U[-j, +j]) where j is the jitter factor
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 50,
            max_backoff_ms: 5000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }
}

fn default_jitter_factor() -> f32 {
    0.2
}

/// Circuit breaker configuration, one breaker per backend instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Successful trial calls required to close from half-open.
    pub success_threshold: u32,
    /// Time an open circuit waits before admitting a trial call.
    pub recovery_timeout_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            recovery_timeout_secs: 60,
        }
    }
}

/// Background health probe configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    pub check_interval_secs: u64,
    pub timeout_secs: u64,
    pub endpoint: String,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 10,
            timeout_secs: 5,
            endpoint: "/health".to_string(),
        }
    }
}

/// Water marks and bounds for the batching control loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchingTunerConfig {
    /// Samples retained per backend.
    pub window_size: usize,
    pub low_utilization_watermark: f32,
    pub high_utilization_watermark: f32,
    pub batch_size_step: u32,
    pub batch_size_floor: u32,
    pub batch_size_ceiling: u32,
    pub tune_interval_secs: u64,
    /// Initial per-backend limits handed to new backends.
    pub initial_max_batch_size: u32,
    pub max_seq_len: u32,
    pub max_batched_tokens: u32,
    pub max_concurrent_seqs: u32,
    pub prefix_cache_enabled: bool,
}

impl Default for BatchingTunerConfig {
    fn default() -> Self {
        Self {
            window_size: 1000,
            low_utilization_watermark: 0.70,
            high_utilization_watermark: 0.95,
            batch_size_step: 4,
            batch_size_floor: 1,
            batch_size_ceiling: 256,
            tune_interval_secs: 30,
            initial_max_batch_size: 32,
            max_seq_len: 4096,
            max_batched_tokens: 32768,
            max_concurrent_seqs: 64,
            prefix_cache_enabled: true,
        }
    }
}

/// Adapter artifact sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterSandboxConfig {
    /// Base directory all adapter paths must resolve inside.
    pub sandbox_dir: String,
    /// Budget assumed for instances that do not declare one.
    pub default_memory_budget_bytes: u64,
}

impl Default for AdapterSandboxConfig {
    fn default() -> Self {
        Self {
            sandbox_dir: "adapters".to_string(),
            default_memory_budget_bytes: 2 * 1024 * 1024 * 1024,
        }
    }
}

impl GatewayConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.routing.realtime_threshold_ms >= self.routing.interactive_threshold_ms {
            return Err(ConfigError::Validation(format!(
                "realtime_threshold_ms ({}) must be below interactive_threshold_ms ({})",
                self.routing.realtime_threshold_ms, self.routing.interactive_threshold_ms
            )));
        }

        let mut total_backends = 0;
        for (tier, tier_config) in self.tiers.iter() {
            if tier_config.request_timeout_secs == 0 {
                return Err(ConfigError::Validation(format!(
                    "tier {tier} request_timeout_secs must be nonzero"
                )));
            }
            for backend in &tier_config.backends {
                let url = Url::parse(&backend.url).map_err(|e| {
                    ConfigError::Validation(format!("invalid backend url {}: {e}", backend.url))
                })?;
                if url.scheme() != "http" && url.scheme() != "https" {
                    return Err(ConfigError::Validation(format!(
                        "backend url {} must use http or https",
                        backend.url
                    )));
                }
                total_backends += 1;
            }
        }
        if total_backends == 0 {
            return Err(ConfigError::Validation(
                "no backends configured in any tier".to_string(),
            ));
        }

        let b = &self.batching;
        if b.batch_size_floor == 0 || b.batch_size_floor > b.batch_size_ceiling {
            return Err(ConfigError::Validation(format!(
                "batch size bounds [{}, {}] are invalid",
                b.batch_size_floor, b.batch_size_ceiling
            )));
        }
        if !(0.0..=1.0).contains(&b.low_utilization_watermark)
            || !(0.0..=1.0).contains(&b.high_utilization_watermark)
            || b.low_utilization_watermark >= b.high_utilization_watermark
        {
            return Err(ConfigError::Validation(format!(
                "utilization water marks ({}, {}) must satisfy 0 <= low < high <= 1",
                b.low_utilization_watermark, b.high_utilization_watermark
            )));
        }
        if b.window_size == 0 {
            return Err(ConfigError::Validation(
                "batching window_size must be nonzero".to_string(),
            ));
        }

        if self.circuit_breaker.failure_threshold == 0
            || self.circuit_breaker.success_threshold == 0
        {
            return Err(ConfigError::Validation(
                "circuit breaker thresholds must be nonzero".to_string(),
            ));
        }
        if self.retry.max_retries == 0 {
            return Err(ConfigError::Validation(
                "retry.max_retries must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_one_backend() -> GatewayConfig {
        let mut tiers = TiersConfig::default();
        tiers.interactive = TierConfig {
            backends: vec![BackendConfig {
                name: None,
                url: "http://worker1:8000".to_string(),
                adapter_memory_budget_bytes: None,
            }],
            ..TierConfig::default_interactive()
        };
        GatewayConfig {
            host: default_host(),
            port: default_port(),
            routing: RoutingConfig::default(),
            tiers,
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            health_check: HealthCheckConfig::default(),
            batching: BatchingTunerConfig::default(),
            adapters: AdapterSandboxConfig::default(),
            log_level: None,
            log_dir: None,
            json_logs: false,
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(config_with_one_backend().validate().is_ok());
    }

    #[test]
    fn test_empty_topology_rejected() {
        let mut config = config_with_one_backend();
        config.tiers.interactive.backends.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_threshold_ordering_enforced() {
        let mut config = config_with_one_backend();
        config.routing.realtime_threshold_ms = 2000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_backend_url_rejected() {
        let mut config = config_with_one_backend();
        config.tiers.interactive.backends[0].url = "ftp://worker1".to_string();
        assert!(config.validate().is_err());

        config.tiers.interactive.backends[0].url = "not a url".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_batch_bounds_validated() {
        let mut config = config_with_one_backend();
        config.batching.batch_size_floor = 64;
        config.batching.batch_size_ceiling = 8;
        assert!(config.validate().is_err());

        let mut config = config_with_one_backend();
        config.batching.low_utilization_watermark = 0.95;
        config.batching.high_utilization_watermark = 0.70;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backend_effective_name() {
        let backend = BackendConfig {
            name: None,
            url: "http://worker1:8000".to_string(),
            adapter_memory_budget_bytes: None,
        };
        assert_eq!(backend.effective_name(), "worker1:8000");

        let named = BackendConfig {
            name: Some("rt-0".to_string()),
            url: "http://worker1:8000".to_string(),
            adapter_memory_budget_bytes: None,
        };
        assert_eq!(named.effective_name(), "rt-0");
    }

    #[test]
    fn test_yaml_roundtrip_defaults() {
        let yaml = r#"
tiers:
  interactive:
    latency_target_ms: 800
    request_timeout_secs: 20
    backends:
      - url: http://worker1:8000
"#;
        let config: GatewayConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.routing.realtime_threshold_ms, 100);
        assert_eq!(config.tiers.interactive.latency_target_ms, Some(800));
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert!(config.validate().is_ok());
    }
}
