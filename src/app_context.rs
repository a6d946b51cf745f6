//! Application context: every shared component constructed once at
//! startup and injected explicitly. There are no module-level singletons;
//! anything that needs the client, registry or managers receives them
//! from here.

use std::{sync::Arc, time::Duration};

use anyhow::{bail, Context};

use crate::{
    adapters::AdapterLifecycleManager,
    batching::BatchingController,
    config::GatewayConfig,
    core::{Backend, BackendRegistry, CircuitBreaker, ResilientClient},
    routing::TierRouter,
};

pub struct AppContext {
    pub config: GatewayConfig,
    pub client: Arc<ResilientClient>,
    pub registry: Arc<BackendRegistry>,
    pub adapters: Arc<AdapterLifecycleManager>,
    pub batching: Arc<BatchingController>,
    pub router: Arc<TierRouter>,
}

impl AppContext {
    pub fn from_config(config: GatewayConfig) -> anyhow::Result<Arc<Self>> {
        config.validate().context("configuration rejected")?;

        let http = reqwest::Client::builder()
            .build()
            .context("failed to build HTTP client")?;
        let client = Arc::new(ResilientClient::new(
            http,
            config.retry.clone(),
            config.health_check.endpoint.clone(),
            Duration::from_secs(config.health_check.timeout_secs),
        ));

        let registry = Arc::new(BackendRegistry::new());
        let batching = Arc::new(BatchingController::new(config.batching.clone()));

        for (tier, tier_config) in config.tiers.iter() {
            for backend_config in &tier_config.backends {
                let id = backend_config.effective_name();
                if registry.get(&id).is_some() {
                    bail!("duplicate backend id {id} in topology");
                }
                let breaker = CircuitBreaker::new(config.circuit_breaker.clone(), id.clone());
                registry.insert(Arc::new(Backend::new(
                    id.clone(),
                    backend_config.url.clone(),
                    tier,
                    backend_config
                        .adapter_memory_budget_bytes
                        .unwrap_or(config.adapters.default_memory_budget_bytes),
                    breaker,
                )));
                batching.register_backend(id, tier_config.latency_target_ms);
            }
        }

        let adapters = Arc::new(AdapterLifecycleManager::new(
            &config.adapters,
            registry.clone(),
            client.clone(),
        ));
        let router = Arc::new(TierRouter::new(
            &config,
            registry.clone(),
            adapters.clone(),
            batching.clone(),
            client.clone(),
        ));

        Ok(Arc::new(Self {
            config,
            client,
            registry,
            adapters,
            batching,
            router,
        }))
    }
}
