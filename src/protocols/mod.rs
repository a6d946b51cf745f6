//! Typed request/response structs for the inbound boundary and the
//! outbound wire to inference backends. Everything crossing a process
//! boundary is an explicit tagged struct validated here, never an
//! untyped map.

use serde::{Deserialize, Serialize};

use crate::core::{GatewayError, GatewayResult, Tier};

pub const MAX_PROMPT_BYTES: usize = 1 << 20;
pub const MAX_GENERATION_TOKENS: u32 = 8192;

/// Inbound generation request from a world service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRequest {
    pub prompt: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Explicit tier pin; always wins over the latency budget.
    #[serde(default)]
    pub tier: Option<Tier>,
    /// Soft end-to-end budget used for tier selection and as the overall
    /// deadline across retries.
    #[serde(default)]
    pub latency_budget_ms: Option<u64>,
    /// Archetype adapter that must be loaded on the serving instance.
    #[serde(default)]
    pub adapter: Option<String>,
    /// Per-request opt-in required for fallback when `tier` is pinned.
    #[serde(default)]
    pub allow_fallback: bool,
}

fn default_max_tokens() -> u32 {
    256
}

fn default_temperature() -> f32 {
    0.7
}

impl RoutingRequest {
    pub fn validate(&self) -> GatewayResult<()> {
        if self.prompt.is_empty() {
            return Err(GatewayError::Validation("prompt must not be empty".into()));
        }
        if self.prompt.len() > MAX_PROMPT_BYTES {
            return Err(GatewayError::Validation(format!(
                "prompt exceeds {MAX_PROMPT_BYTES} bytes"
            )));
        }
        if self.max_tokens == 0 || self.max_tokens > MAX_GENERATION_TOKENS {
            return Err(GatewayError::Validation(format!(
                "max_tokens must be in 1..={MAX_GENERATION_TOKENS}"
            )));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(GatewayError::Validation(
                "temperature must be in 0.0..=2.0".into(),
            ));
        }
        if let Some(adapter) = &self.adapter {
            if adapter.is_empty() {
                return Err(GatewayError::Validation(
                    "adapter id must not be empty when present".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Result of a routed generation; the audit fields always travel with
/// the text so callers can check SLA compliance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingResult {
    pub text: String,
    pub tokens_generated: u32,
    pub tier_used: Tier,
    pub backend_id: String,
    pub latency_ms: u64,
    pub fell_back: bool,
}

/// Outbound payload for a backend's `/v1/completions` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adapter: Option<String>,
}

impl CompletionRequest {
    pub fn from_routing(req: &RoutingRequest) -> Self {
        Self {
            prompt: req.prompt.clone(),
            max_tokens: req.max_tokens,
            temperature: req.temperature,
            adapter: req.adapter.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub text: String,
    pub completion_tokens: u32,
}

/// Runtime-side telemetry polled from `/stats`, feeding the batching
/// controller's sample window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BackendStats {
    pub utilization: f32,
    pub running_batch_size: u32,
    pub avg_latency_ms: u64,
}

/// Command body for a backend's adapter-loading API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterLoadCommand {
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterUnloadCommand {
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_request() -> RoutingRequest {
        RoutingRequest {
            prompt: "The innkeeper greets you".to_string(),
            max_tokens: 128,
            temperature: 0.7,
            tier: None,
            latency_budget_ms: Some(500),
            adapter: None,
            allow_fallback: false,
        }
    }

    #[test]
    fn test_valid_request_passes() {
        assert!(valid_request().validate().is_ok());
    }

    #[test]
    fn test_empty_prompt_rejected() {
        let mut req = valid_request();
        req.prompt.clear();
        assert!(matches!(
            req.validate(),
            Err(GatewayError::Validation(_))
        ));
    }

    #[test]
    fn test_token_and_temperature_bounds() {
        let mut req = valid_request();
        req.max_tokens = 0;
        assert!(req.validate().is_err());

        let mut req = valid_request();
        req.max_tokens = MAX_GENERATION_TOKENS + 1;
        assert!(req.validate().is_err());

        let mut req = valid_request();
        req.temperature = 2.5;
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_deserialization_applies_defaults() {
        let req: RoutingRequest =
            serde_json::from_str(r#"{"prompt": "hello"}"#).unwrap();
        assert_eq!(req.max_tokens, 256);
        assert!(req.tier.is_none());
        assert!(!req.allow_fallback);
    }

    #[test]
    fn test_tier_serde_names() {
        let req: RoutingRequest =
            serde_json::from_str(r#"{"prompt": "x", "tier": "real_time"}"#).unwrap();
        assert_eq!(req.tier, Some(Tier::RealTime));

        let json = serde_json::to_string(&RoutingResult {
            text: "y".into(),
            tokens_generated: 1,
            tier_used: Tier::BatchAsync,
            backend_id: "w1".into(),
            latency_ms: 12,
            fell_back: true,
        })
        .unwrap();
        assert!(json.contains("\"batch_async\""));
    }

    #[test]
    fn test_completion_request_omits_absent_adapter() {
        let wire = CompletionRequest::from_routing(&valid_request());
        let json = serde_json::to_string(&wire).unwrap();
        assert!(!json.contains("adapter"));
    }
}
