//! Error taxonomy for backend calls and routing decisions.

use super::backend::Tier;

/// Failure of a single logical call against one backend instance.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CallError {
    #[error("request to {url} timed out after {timeout_ms}ms")]
    Timeout { url: String, timeout_ms: u64 },

    #[error("connection to {url} failed: {reason}")]
    ConnectionRefused { url: String, reason: String },

    #[error("circuit open for {url}")]
    CircuitOpen { url: String },

    #[error("backend {url} returned {status}: {message}")]
    ApplicationError {
        url: String,
        status: u16,
        message: String,
    },
}

impl CallError {
    /// Transient network failures are retried; application-level errors
    /// and open circuits are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CallError::Timeout { .. } | CallError::ConnectionRefused { .. }
        )
    }

    /// Only network-level failures feed the circuit breaker. A backend
    /// that answers with an application error is alive.
    pub fn counts_toward_breaker(&self) -> bool {
        self.is_retryable()
    }

    pub fn url(&self) -> &str {
        match self {
            CallError::Timeout { url, .. }
            | CallError::ConnectionRefused { url, .. }
            | CallError::CircuitOpen { url }
            | CallError::ApplicationError { url, .. } => url,
        }
    }

    /// Classify a transport error from the shared HTTP client.
    pub fn from_reqwest(err: reqwest::Error, url: &str, timeout_ms: u64) -> Self {
        if err.is_timeout() {
            CallError::Timeout {
                url: url.to_string(),
                timeout_ms,
            }
        } else {
            CallError::ConnectionRefused {
                url: url.to_string(),
                reason: err.to_string(),
            }
        }
    }
}

/// Request-level failures surfaced to callers of the router.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("no eligible instance in tier {tier}")]
    TierUnavailable { tier: Tier },

    #[error("adapter {adapter} is not loaded on any eligible instance in tier {tier}")]
    AdapterNotReady { adapter: String, tier: Tier },

    #[error("backend {url} in tier {tier} unavailable after {attempts} attempts: {source}")]
    BackendUnavailable {
        tier: Tier,
        url: String,
        attempts: u32,
        #[source]
        source: CallError,
    },

    #[error("backend {url} rejected the request with status {status}: {message}")]
    Upstream {
        url: String,
        status: u16,
        message: String,
    },
}

impl GatewayError {
    /// HTTP-equivalent status class for the inbound boundary.
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::Validation(_) => 400,
            GatewayError::TierUnavailable { .. } | GatewayError::AdapterNotReady { .. } => 503,
            GatewayError::BackendUnavailable { .. } | GatewayError::Upstream { .. } => 502,
        }
    }

    /// Stable machine-readable code for structured error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Validation(_) => "validation_error",
            GatewayError::TierUnavailable { .. } => "tier_unavailable",
            GatewayError::AdapterNotReady { .. } => "adapter_not_ready",
            GatewayError::BackendUnavailable { .. } => "backend_unavailable",
            GatewayError::Upstream { .. } => "upstream_error",
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
