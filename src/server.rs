//! HTTP boundary and background maintenance tasks.

use std::{sync::Arc, time::Duration};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::future::join_all;
use serde::Deserialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    adapters::{AdapterDescriptor, AdapterError},
    app_context::AppContext,
    core::{CallError, GatewayError, HealthState},
    protocols::RoutingRequest,
};

pub fn build_app(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/generate", post(generate))
        .route("/v1/backends", get(list_backends))
        .route("/v1/adapters", post(register_adapter))
        .route("/v1/adapters/{name}", get(adapter_status))
        .route("/v1/adapters/{name}/load", post(load_adapter))
        .route("/v1/adapters/{name}/unload", post(unload_adapter))
        .route("/v1/adapters/{name}/swap", post(swap_adapter))
        .route("/v1/batching/{backend_id}", get(batching_config))
        .with_state(ctx)
}

/// Run the gateway until ctrl-c, including the health-probe and
/// batching-tuner loops.
pub async fn serve(ctx: Arc<AppContext>) -> anyhow::Result<()> {
    let addr = format!("{}:{}", ctx.config.host, ctx.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, backends = ctx.registry.len(), "dialogue gateway listening");

    let maintenance = spawn_maintenance(ctx.clone());

    axum::serve(listener, build_app(ctx))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    for handle in maintenance {
        handle.abort();
    }
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

/// Health probes keep instance health and circuit state current; the
/// stats poll feeds the batching sample window; the tune loop applies
/// the water-mark controller.
pub fn spawn_maintenance(ctx: Arc<AppContext>) -> Vec<JoinHandle<()>> {
    let probe_ctx = ctx.clone();
    let probe_handle = tokio::spawn(async move {
        let interval = Duration::from_secs(probe_ctx.config.health_check.check_interval_secs);
        let degraded_threshold =
            Duration::from_secs(probe_ctx.config.health_check.timeout_secs) / 2;
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let probes = probe_ctx.registry.all().into_iter().map(|backend| {
                let ctx = probe_ctx.clone();
                async move {
                    match ctx.client.health_check(&backend).await {
                        Ok(elapsed) => {
                            let state = if elapsed > degraded_threshold {
                                HealthState::Degraded
                            } else {
                                HealthState::Healthy
                            };
                            backend.set_health(state);
                        }
                        Err(CallError::CircuitOpen { .. }) => {
                            // Breaker is already gating the instance; the
                            // probe that matters is the half-open trial.
                        }
                        Err(err) => {
                            debug!(backend = backend.id(), error = %err, "health probe failed");
                            backend.set_health(HealthState::Unreachable);
                        }
                    }

                    match ctx.client.fetch_stats(&backend).await {
                        Ok(stats) => ctx.batching.record_sample(
                            backend.id(),
                            stats.utilization,
                            stats.running_batch_size,
                            stats.avg_latency_ms,
                        ),
                        Err(err) => {
                            debug!(backend = backend.id(), error = %err, "stats poll failed")
                        }
                    }
                }
            });
            join_all(probes).await;
        }
    });

    let tune_ctx = ctx;
    let tune_handle = tokio::spawn(async move {
        let interval = Duration::from_secs(tune_ctx.config.batching.tune_interval_secs);
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let changed = tune_ctx.batching.tune_all();
            if changed > 0 {
                info!(changed, "batching tuner adjusted backends");
            }
        }
    });

    vec![probe_handle, tune_handle]
}

async fn health() -> Response {
    Json(json!({"status": "ok"})).into_response()
}

async fn generate(
    State(ctx): State<Arc<AppContext>>,
    Json(request): Json<RoutingRequest>,
) -> Response {
    let request_id = Uuid::new_v4();
    debug!(%request_id, tier = ?request.tier, "handling generate request");

    let mut response = match ctx.router.route(&request).await {
        Ok(result) => Json(result).into_response(),
        Err(err) => gateway_error_response(&err),
    };
    if let Ok(value) = request_id.to_string().parse() {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

async fn list_backends(State(ctx): State<Arc<AppContext>>) -> Response {
    let backends: Vec<_> = ctx
        .registry
        .all()
        .iter()
        .map(|backend| {
            let snapshot = backend.snapshot();
            json!({
                "id": snapshot.id,
                "url": snapshot.url,
                "tier": snapshot.tier.as_str(),
                "health": snapshot.health,
                "load": snapshot.load,
                "processed": snapshot.processed,
                "swap_in_progress": snapshot.swap_in_progress,
                "circuit": {
                    "state": snapshot.circuit.state.as_str(),
                    "consecutive_failures": snapshot.circuit.consecutive_failures,
                    "total_failures": snapshot.circuit.total_failures,
                    "total_successes": snapshot.circuit.total_successes,
                },
            })
        })
        .collect();
    Json(json!({"backends": backends})).into_response()
}

async fn register_adapter(
    State(ctx): State<Arc<AppContext>>,
    Json(descriptor): Json<AdapterDescriptor>,
) -> Response {
    match ctx.adapters.register(descriptor) {
        Ok(()) => StatusCode::CREATED.into_response(),
        Err(err) => adapter_error_response(&err),
    }
}

async fn adapter_status(
    State(ctx): State<Arc<AppContext>>,
    Path(name): Path<String>,
) -> Response {
    match ctx.adapters.status(&name) {
        Ok(status) => Json(status).into_response(),
        Err(err) => adapter_error_response(&err),
    }
}

#[derive(Debug, Deserialize)]
struct InstanceTarget {
    instance: String,
}

async fn load_adapter(
    State(ctx): State<Arc<AppContext>>,
    Path(name): Path<String>,
    Json(target): Json<InstanceTarget>,
) -> Response {
    match ctx.adapters.load(&name, &target.instance).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => adapter_error_response(&err),
    }
}

async fn unload_adapter(
    State(ctx): State<Arc<AppContext>>,
    Path(name): Path<String>,
    Json(target): Json<InstanceTarget>,
) -> Response {
    match ctx.adapters.unload(&name, &target.instance).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => adapter_error_response(&err),
    }
}

#[derive(Debug, Deserialize)]
struct SwapTarget {
    new_adapter: String,
    instance: String,
}

async fn swap_adapter(
    State(ctx): State<Arc<AppContext>>,
    Path(name): Path<String>,
    Json(target): Json<SwapTarget>,
) -> Response {
    match ctx
        .adapters
        .hot_swap(&name, &target.new_adapter, &target.instance)
        .await
    {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => adapter_error_response(&err),
    }
}

async fn batching_config(
    State(ctx): State<Arc<AppContext>>,
    Path(backend_id): Path<String>,
) -> Response {
    match ctx.batching.get_config(&backend_id) {
        Some(config) => Json(config).into_response(),
        None => error_response(
            StatusCode::NOT_FOUND,
            "unknown_backend",
            format!("no backend named {backend_id}"),
        ),
    }
}

fn gateway_error_response(err: &GatewayError) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        warn!(code = err.code(), error = %err, "request failed");
    }
    error_response(status, err.code(), err.to_string())
}

fn adapter_error_response(err: &AdapterError) -> Response {
    let (status, code) = match err {
        AdapterError::InvalidPath { .. } | AdapterError::DuplicateName { .. } => {
            (StatusCode::BAD_REQUEST, "invalid_adapter")
        }
        AdapterError::UnknownAdapter { .. } | AdapterError::UnknownInstance { .. } => {
            (StatusCode::NOT_FOUND, "not_found")
        }
        AdapterError::InvalidState { .. } => (StatusCode::CONFLICT, "invalid_state"),
        AdapterError::CommandFailed { .. } => (StatusCode::BAD_GATEWAY, "command_failed"),
    };
    error_response(status, code, err.to_string())
}

fn error_response(
    status: StatusCode,
    code: impl Into<String>,
    message: impl Into<String>,
) -> Response {
    (
        status,
        Json(json!({
            "error": {
                "code": code.into(),
                "message": message.into(),
            }
        })),
    )
        .into_response()
}
