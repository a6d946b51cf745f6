//! Resilient backend client: one shared HTTP connection pool, bounded
//! retries with backoff, and per-instance circuit breaking.
//!
//! The breaker is re-checked before every dispatch, including retries;
//! no lock is held across a network call — breaker state is atomics and
//! permits are claimed/released around each attempt.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use tracing::{debug, warn};

use super::{
    backend::Backend,
    error::CallError,
    retry::RetryExecutor,
};
use crate::{
    config::RetryConfig,
    observability::metrics::RouterMetrics,
    protocols::{
        AdapterLoadCommand, AdapterUnloadCommand, BackendStats, CompletionRequest,
        CompletionResponse,
    },
};

const COMPLETIONS_ROUTE: &str = "/v1/completions";
const STATS_ROUTE: &str = "/stats";
const ADAPTER_LOAD_ROUTE: &str = "/adapters/load";
const ADAPTER_UNLOAD_ROUTE: &str = "/adapters/unload";

#[derive(Debug, Clone)]
pub struct ResilientClient {
    http: reqwest::Client,
    retry: RetryConfig,
    health_endpoint: String,
    health_timeout: Duration,
}

impl ResilientClient {
    pub fn new(
        http: reqwest::Client,
        retry: RetryConfig,
        health_endpoint: String,
        health_timeout: Duration,
    ) -> Self {
        Self {
            http,
            retry,
            health_endpoint,
            health_timeout,
        }
    }

    /// Execute one logical generation call against one instance.
    ///
    /// `timeout` bounds each attempt; `deadline`, when present, is the
    /// caller's overall budget and is checked before every retry.
    pub async fn generate(
        &self,
        backend: &Arc<Backend>,
        payload: &CompletionRequest,
        timeout: Duration,
        deadline: Option<Instant>,
    ) -> Result<CompletionResponse, CallError> {
        let url = backend.endpoint_url(COMPLETIONS_ROUTE);

        RetryExecutor::execute(
            &self.retry,
            |attempt| {
                let url = url.clone();
                async move {
                    if let Some(deadline) = deadline {
                        if Instant::now() >= deadline {
                            return Err(CallError::Timeout {
                                url: backend.url().to_string(),
                                timeout_ms: timeout.as_millis() as u64,
                            });
                        }
                    }

                    let permit = match backend.circuit_breaker().try_acquire() {
                        Some(permit) => permit,
                        None => {
                            return Err(CallError::CircuitOpen {
                                url: backend.url().to_string(),
                            })
                        }
                    };

                    debug!(backend = backend.id(), attempt, "dispatching completion");
                    let outcome = self
                        .dispatch_json::<CompletionResponse, _>(&url, payload, timeout)
                        .await;

                    let breaker_success = match &outcome {
                        Ok(_) => true,
                        Err(err) => !err.counts_toward_breaker(),
                    };
                    backend.circuit_breaker().release(permit, breaker_success);
                    outcome
                }
            },
            |outcome, _attempt| {
                let retryable = outcome.as_ref().err().is_some_and(CallError::is_retryable);
                let budget_left = deadline.is_none_or(|d| Instant::now() < d);
                retryable && budget_left
            },
            |delay, attempt| {
                RouterMetrics::record_retry(backend.id());
                RouterMetrics::record_retry_backoff(delay, attempt);
            },
        )
        .await
    }

    /// Single liveness probe. No retry, no backoff, but the circuit is
    /// still respected: probing an open circuit is the half-open trial
    /// mechanism, not a bypass of it.
    ///
    /// Returns the probe round-trip time on success.
    pub async fn health_check(&self, backend: &Arc<Backend>) -> Result<Duration, CallError> {
        let permit = match backend.circuit_breaker().try_acquire() {
            Some(permit) => permit,
            None => {
                return Err(CallError::CircuitOpen {
                    url: backend.url().to_string(),
                })
            }
        };

        let url = backend.endpoint_url(&self.health_endpoint);
        let started = Instant::now();
        let result = self
            .http
            .get(&url)
            .timeout(self.health_timeout)
            .send()
            .await;

        let outcome = match result {
            Ok(response) if response.status().is_success() => Ok(started.elapsed()),
            Ok(response) => Err(CallError::ApplicationError {
                url: backend.url().to_string(),
                status: response.status().as_u16(),
                message: "health probe rejected".to_string(),
            }),
            Err(err) => Err(CallError::from_reqwest(
                err,
                backend.url(),
                self.health_timeout.as_millis() as u64,
            )),
        };

        let breaker_success = match &outcome {
            Ok(_) => true,
            Err(err) => !err.counts_toward_breaker(),
        };
        backend.circuit_breaker().release(permit, breaker_success);
        RouterMetrics::record_health_check(backend.id(), outcome.is_ok());
        outcome
    }

    /// Poll runtime telemetry for the batching controller. Best-effort:
    /// bypasses the breaker entirely, a missed sample is acceptable.
    pub async fn fetch_stats(&self, backend: &Arc<Backend>) -> Result<BackendStats, CallError> {
        let url = backend.endpoint_url(STATS_ROUTE);
        let response = self
            .http
            .get(&url)
            .timeout(self.health_timeout)
            .send()
            .await
            .map_err(|e| {
                CallError::from_reqwest(e, backend.url(), self.health_timeout.as_millis() as u64)
            })?;

        if !response.status().is_success() {
            return Err(CallError::ApplicationError {
                url: backend.url().to_string(),
                status: response.status().as_u16(),
                message: "stats endpoint rejected".to_string(),
            });
        }
        response.json::<BackendStats>().await.map_err(|e| {
            CallError::from_reqwest(e, backend.url(), self.health_timeout.as_millis() as u64)
        })
    }

    /// Issue an adapter load command to the backend's own adapter API.
    /// Commands are single-shot: the lifecycle manager treats a failed
    /// command as a Failed transition requiring operator intervention,
    /// so retrying here would hide exactly the state it must surface.
    pub async fn load_adapter(
        &self,
        backend: &Arc<Backend>,
        command: &AdapterLoadCommand,
        timeout: Duration,
    ) -> Result<(), CallError> {
        let url = backend.endpoint_url(ADAPTER_LOAD_ROUTE);
        self.dispatch_command(backend, &url, command, timeout).await
    }

    pub async fn unload_adapter(
        &self,
        backend: &Arc<Backend>,
        command: &AdapterUnloadCommand,
        timeout: Duration,
    ) -> Result<(), CallError> {
        let url = backend.endpoint_url(ADAPTER_UNLOAD_ROUTE);
        self.dispatch_command(backend, &url, command, timeout).await
    }

    async fn dispatch_command<B: serde::Serialize>(
        &self,
        backend: &Arc<Backend>,
        url: &str,
        body: &B,
        timeout: Duration,
    ) -> Result<(), CallError> {
        let response = self
            .http
            .post(url)
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| CallError::from_reqwest(e, backend.url(), timeout.as_millis() as u64))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let message = response.text().await.unwrap_or_default();
            warn!(backend = backend.id(), %status, "adapter command rejected");
            Err(CallError::ApplicationError {
                url: backend.url().to_string(),
                status: status.as_u16(),
                message,
            })
        }
    }

    async fn dispatch_json<T, B>(
        &self,
        url: &str,
        body: &B,
        timeout: Duration,
    ) -> Result<T, CallError>
    where
        T: serde::de::DeserializeOwned,
        B: serde::Serialize,
    {
        let response = self
            .http
            .post(url)
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| CallError::from_reqwest(e, url, timeout.as_millis() as u64))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(CallError::ApplicationError {
                url: url.to_string(),
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| CallError::from_reqwest(e, url, timeout.as_millis() as u64))
    }
}
