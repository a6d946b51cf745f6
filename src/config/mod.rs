//! Static startup configuration.
//!
//! Everything here is supplied once at launch (YAML file plus CLI
//! overrides) and treated as immutable afterwards; the only live-mutated
//! value in the system is the batch size owned by the batching controller.

mod types;

use std::path::Path;

pub use types::{
    AdapterSandboxConfig, BackendConfig, BatchingTunerConfig, CircuitBreakerConfig, GatewayConfig,
    HealthCheckConfig, RetryConfig, RoutingConfig, TierConfig, TiersConfig,
};

/// Configuration errors surfaced before the gateway starts serving.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid configuration: {0}")]
    Validation(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

impl GatewayConfig {
    /// Load and validate a configuration from a YAML file.
    pub fn load_from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: GatewayConfig =
            serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }
}
