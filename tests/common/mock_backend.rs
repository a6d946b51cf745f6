// Mock inference backend for integration tests.
#![allow(dead_code)]

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use dialogue_gateway::protocols::{
    AdapterLoadCommand, AdapterUnloadCommand, BackendStats, CompletionResponse,
};
use serde_json::json;
use tokio::sync::{oneshot, RwLock};

/// Mutable behavior knobs; tests flip these at runtime.
#[derive(Debug, Clone)]
pub struct MockBackendBehavior {
    pub completion_text: String,
    pub completion_tokens: u32,
    pub completion_delay: Duration,
    pub completion_status: u16,
    pub health_delay: Duration,
    pub health_status: u16,
    pub stats: BackendStats,
    pub adapter_command_delay: Duration,
    pub adapter_command_status: u16,
}

impl Default for MockBackendBehavior {
    fn default() -> Self {
        Self {
            completion_text: "the innkeeper polishes a tankard".to_string(),
            completion_tokens: 42,
            completion_delay: Duration::ZERO,
            completion_status: 200,
            health_delay: Duration::ZERO,
            health_status: 200,
            stats: BackendStats {
                utilization: 0.5,
                running_batch_size: 8,
                avg_latency_ms: 120,
            },
            adapter_command_delay: Duration::ZERO,
            adapter_command_status: 200,
        }
    }
}

#[derive(Clone)]
struct MockShared {
    behavior: Arc<RwLock<MockBackendBehavior>>,
    commands: Arc<Mutex<Vec<String>>>,
}

/// Mock backend server exposing the inference-runtime surface the
/// gateway talks to: completions, health, stats, adapter commands.
pub struct MockBackend {
    port: u16,
    behavior: Arc<RwLock<MockBackendBehavior>>,
    commands: Arc<Mutex<Vec<String>>>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl MockBackend {
    pub async fn start() -> Self {
        Self::start_on(0).await
    }

    /// Bind a specific port (0 = ephemeral). Tests restart a backend on
    /// its old port to simulate recovery.
    pub async fn start_on(port: u16) -> Self {
        let behavior = Arc::new(RwLock::new(MockBackendBehavior::default()));
        let commands = Arc::new(Mutex::new(Vec::new()));
        let shared = MockShared {
            behavior: behavior.clone(),
            commands: commands.clone(),
        };

        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
            .await
            .expect("bind mock backend");
        let port = listener.local_addr().unwrap().port();

        let app = Router::new()
            .route("/health", get(health_handler))
            .route("/stats", get(stats_handler))
            .route("/v1/completions", post(completions_handler))
            .route("/adapters/load", post(adapter_load_handler))
            .route("/adapters/unload", post(adapter_unload_handler))
            .with_state(shared);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        Self {
            port,
            behavior,
            commands,
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop serving; subsequent connections are refused.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    pub async fn set_behavior(&self, update: impl FnOnce(&mut MockBackendBehavior)) {
        let mut behavior = self.behavior.write().await;
        update(&mut behavior);
    }

    /// Adapter commands received, in order, as `load:<name>` /
    /// `unload:<name>`.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn health_handler(State(shared): State<MockShared>) -> Response {
    let behavior = shared.behavior.read().await.clone();
    tokio::time::sleep(behavior.health_delay).await;
    status_or(
        behavior.health_status,
        json!({"status": "healthy"}),
    )
}

async fn stats_handler(State(shared): State<MockShared>) -> Response {
    let behavior = shared.behavior.read().await.clone();
    axum::Json(behavior.stats).into_response()
}

async fn completions_handler(State(shared): State<MockShared>) -> Response {
    let behavior = shared.behavior.read().await.clone();
    tokio::time::sleep(behavior.completion_delay).await;
    if behavior.completion_status != 200 {
        return status_or(behavior.completion_status, json!({}));
    }
    axum::Json(CompletionResponse {
        text: behavior.completion_text,
        completion_tokens: behavior.completion_tokens,
    })
    .into_response()
}

async fn adapter_load_handler(
    State(shared): State<MockShared>,
    Json(command): Json<AdapterLoadCommand>,
) -> Response {
    shared
        .commands
        .lock()
        .unwrap()
        .push(format!("load:{}", command.name));
    let behavior = shared.behavior.read().await.clone();
    tokio::time::sleep(behavior.adapter_command_delay).await;
    status_or(behavior.adapter_command_status, json!({"status": "ok"}))
}

async fn adapter_unload_handler(
    State(shared): State<MockShared>,
    Json(command): Json<AdapterUnloadCommand>,
) -> Response {
    shared
        .commands
        .lock()
        .unwrap()
        .push(format!("unload:{}", command.name));
    let behavior = shared.behavior.read().await.clone();
    tokio::time::sleep(behavior.adapter_command_delay).await;
    status_or(behavior.adapter_command_status, json!({"status": "ok"}))
}

fn status_or(status: u16, body: serde_json::Value) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, axum::Json(body)).into_response()
}
