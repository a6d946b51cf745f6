//! Adapter lifecycle management.
//!
//! Adapters are small per-archetype customization artifacts loaded on
//! top of a backend's base model. The manager tracks registration, the
//! per-(adapter, instance) state machine, and performs hot swaps without
//! ever letting the router select an instance mid-swap. The gateway only
//! issues load/unload commands to the backend's own adapter API; it
//! never touches weights.

use std::{
    collections::HashMap,
    path::{Component, Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{
    config::AdapterSandboxConfig,
    core::{Backend, BackendRegistry, CallError, ResilientClient},
    observability::{
        events::{AdapterSwapEvent, Event},
        metrics::RouterMetrics,
    },
    protocols::{AdapterLoadCommand, AdapterUnloadCommand},
};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Lifecycle of one adapter on one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterState {
    Registered,
    Loading,
    Loaded,
    Unloading,
    /// A transition failed; the backend's memory state is suspect and
    /// only explicit re-registration clears the condition.
    Failed,
}

/// Registered adapter artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterDescriptor {
    pub name: String,
    pub base_model: String,
    /// Relative to the sandbox directory; validated at registration.
    pub path: String,
    pub rank: u32,
    pub alpha: f32,
    pub memory_footprint_bytes: u64,
}

/// Snapshot returned by `status`.
#[derive(Debug, Clone, Serialize)]
pub struct AdapterStatus {
    pub descriptor: AdapterDescriptor,
    pub instances: HashMap<String, AdapterState>,
}

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("adapter path {path:?} is invalid: {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("adapter {name} is already registered for base model {existing}")]
    DuplicateName { name: String, existing: String },

    #[error("adapter {name} is not registered")]
    UnknownAdapter { name: String },

    #[error("backend instance {instance} is not registered")]
    UnknownInstance { instance: String },

    #[error("adapter {name} is {actual:?} on {instance}, expected {expected:?}")]
    InvalidState {
        name: String,
        instance: String,
        actual: AdapterState,
        expected: AdapterState,
    },

    #[error("adapter command for {name} on {instance} failed: {source}")]
    CommandFailed {
        name: String,
        instance: String,
        #[source]
        source: CallError,
    },
}

pub type AdapterResult<T> = Result<T, AdapterError>;

#[derive(Debug)]
struct AdapterEntry {
    descriptor: AdapterDescriptor,
    /// Per-instance lifecycle state; absent means Registered.
    instances: HashMap<String, AdapterState>,
}

/// Clears the instance's swap flag when the swap scope ends, success or
/// not, so an error can never leave the instance permanently excluded.
struct SwapScope {
    backend: Arc<Backend>,
}

impl SwapScope {
    fn begin(backend: Arc<Backend>) -> Self {
        backend.set_swapping(true);
        Self { backend }
    }
}

impl Drop for SwapScope {
    fn drop(&mut self) {
        self.backend.set_swapping(false);
    }
}

pub struct AdapterLifecycleManager {
    sandbox_dir: PathBuf,
    registry: Arc<BackendRegistry>,
    client: Arc<ResilientClient>,
    adapters: DashMap<String, AdapterEntry>,
    /// Serializes load/unload/swap per instance; swaps on different
    /// instances proceed in parallel.
    instance_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl AdapterLifecycleManager {
    pub fn new(
        config: &AdapterSandboxConfig,
        registry: Arc<BackendRegistry>,
        client: Arc<ResilientClient>,
    ) -> Self {
        Self {
            sandbox_dir: PathBuf::from(&config.sandbox_dir),
            registry,
            client,
            adapters: DashMap::new(),
            instance_locks: DashMap::new(),
        }
    }

    /// Register an adapter artifact. Rejects paths escaping the sandbox
    /// and names already bound to a different base model. Re-registering
    /// the same name for the same base model replaces the descriptor and
    /// clears any Failed instance states back to Registered.
    pub fn register(&self, descriptor: AdapterDescriptor) -> AdapterResult<()> {
        self.validate_path(&descriptor.path)?;

        if let Some(mut entry) = self.adapters.get_mut(&descriptor.name) {
            if entry.descriptor.base_model != descriptor.base_model {
                return Err(AdapterError::DuplicateName {
                    name: descriptor.name.clone(),
                    existing: entry.descriptor.base_model.clone(),
                });
            }
            entry
                .instances
                .values_mut()
                .for_each(|state| {
                    if *state == AdapterState::Failed {
                        *state = AdapterState::Registered;
                    }
                });
            entry.descriptor = descriptor;
            return Ok(());
        }

        info!(adapter = %descriptor.name, base_model = %descriptor.base_model, "adapter registered");
        self.adapters.insert(
            descriptor.name.clone(),
            AdapterEntry {
                descriptor,
                instances: HashMap::new(),
            },
        );
        Ok(())
    }

    pub fn status(&self, name: &str) -> AdapterResult<AdapterStatus> {
        let entry = self
            .adapters
            .get(name)
            .ok_or_else(|| AdapterError::UnknownAdapter {
                name: name.to_string(),
            })?;
        Ok(AdapterStatus {
            descriptor: entry.descriptor.clone(),
            instances: entry.instances.clone(),
        })
    }

    /// Whether the adapter is in Loaded state on the given instance; the
    /// router's eligibility filter consults this.
    pub fn is_loaded(&self, name: &str, instance_id: &str) -> bool {
        self.adapters
            .get(name)
            .map(|entry| entry.instances.get(instance_id) == Some(&AdapterState::Loaded))
            .unwrap_or(false)
    }

    pub async fn load(&self, name: &str, instance_id: &str) -> AdapterResult<()> {
        let backend = self.backend(instance_id)?;
        let lock = self.instance_lock(instance_id);
        let _guard = lock.lock().await;
        self.load_locked(name, &backend).await
    }

    pub async fn unload(&self, name: &str, instance_id: &str) -> AdapterResult<()> {
        let backend = self.backend(instance_id)?;
        let lock = self.instance_lock(instance_id);
        let _guard = lock.lock().await;
        self.unload_locked(name, &backend).await
    }

    /// Replace `old_name` with `new_name` on one instance.
    ///
    /// The instance is excluded from routing for the whole swap; with
    /// enough declared adapter memory for both artifacts the swap is
    /// make-before-break, otherwise it degrades to unload-then-load.
    pub async fn hot_swap(
        &self,
        old_name: &str,
        new_name: &str,
        instance_id: &str,
    ) -> AdapterResult<()> {
        let backend = self.backend(instance_id)?;
        let lock = self.instance_lock(instance_id);
        let _guard = lock.lock().await;

        self.expect_state(old_name, instance_id, AdapterState::Loaded)?;
        let new_footprint = self
            .adapters
            .get(new_name)
            .ok_or_else(|| AdapterError::UnknownAdapter {
                name: new_name.to_string(),
            })?
            .descriptor
            .memory_footprint_bytes;

        let _scope = SwapScope::begin(backend.clone());

        let loaded_bytes = self.loaded_footprint(instance_id);
        let make_before_break =
            loaded_bytes + new_footprint <= backend.adapter_memory_budget_bytes();
        let strategy = if make_before_break {
            "make_before_break"
        } else {
            "break_before_make"
        };

        let outcome = if make_before_break {
            match self.load_locked(new_name, &backend).await {
                Ok(()) => self.unload_locked(old_name, &backend).await,
                Err(err) => Err(err),
            }
        } else {
            match self.unload_locked(old_name, &backend).await {
                Ok(()) => self.load_locked(new_name, &backend).await,
                Err(err) => Err(err),
            }
        };

        AdapterSwapEvent {
            instance: instance_id,
            old_adapter: old_name,
            new_adapter: new_name,
            strategy,
            success: outcome.is_ok(),
        }
        .emit();
        RouterMetrics::record_adapter_swap(strategy, outcome.is_ok());
        outcome
    }

    /// Sum of footprints currently Loaded (or mid-transition) on an
    /// instance; mid-transition adapters still occupy memory.
    fn loaded_footprint(&self, instance_id: &str) -> u64 {
        self.adapters
            .iter()
            .filter(|entry| {
                matches!(
                    entry.instances.get(instance_id),
                    Some(AdapterState::Loaded)
                        | Some(AdapterState::Loading)
                        | Some(AdapterState::Unloading)
                )
            })
            .map(|entry| entry.descriptor.memory_footprint_bytes)
            .sum()
    }

    async fn load_locked(&self, name: &str, backend: &Arc<Backend>) -> AdapterResult<()> {
        let instance_id = backend.id().to_string();
        self.expect_state(name, &instance_id, AdapterState::Registered)?;

        let command = {
            let entry = self
                .adapters
                .get(name)
                .ok_or_else(|| AdapterError::UnknownAdapter {
                    name: name.to_string(),
                })?;
            AdapterLoadCommand {
                name: entry.descriptor.name.clone(),
                path: self
                    .sandbox_dir
                    .join(&entry.descriptor.path)
                    .to_string_lossy()
                    .into_owned(),
            }
        };

        self.set_state(name, &instance_id, AdapterState::Loading);
        match self
            .client
            .load_adapter(backend, &command, COMMAND_TIMEOUT)
            .await
        {
            Ok(()) => {
                self.set_state(name, &instance_id, AdapterState::Loaded);
                info!(adapter = name, instance = %instance_id, "adapter loaded");
                Ok(())
            }
            Err(source) => {
                self.set_state(name, &instance_id, AdapterState::Failed);
                warn!(adapter = name, instance = %instance_id, error = %source, "adapter load failed");
                Err(AdapterError::CommandFailed {
                    name: name.to_string(),
                    instance: instance_id,
                    source,
                })
            }
        }
    }

    async fn unload_locked(&self, name: &str, backend: &Arc<Backend>) -> AdapterResult<()> {
        let instance_id = backend.id().to_string();
        self.expect_state(name, &instance_id, AdapterState::Loaded)?;

        let command = AdapterUnloadCommand {
            name: name.to_string(),
        };

        self.set_state(name, &instance_id, AdapterState::Unloading);
        match self
            .client
            .unload_adapter(backend, &command, COMMAND_TIMEOUT)
            .await
        {
            Ok(()) => {
                self.set_state(name, &instance_id, AdapterState::Registered);
                info!(adapter = name, instance = %instance_id, "adapter unloaded");
                Ok(())
            }
            Err(source) => {
                self.set_state(name, &instance_id, AdapterState::Failed);
                warn!(adapter = name, instance = %instance_id, error = %source, "adapter unload failed");
                Err(AdapterError::CommandFailed {
                    name: name.to_string(),
                    instance: instance_id,
                    source,
                })
            }
        }
    }

    fn backend(&self, instance_id: &str) -> AdapterResult<Arc<Backend>> {
        self.registry
            .get(instance_id)
            .ok_or_else(|| AdapterError::UnknownInstance {
                instance: instance_id.to_string(),
            })
    }

    fn instance_lock(&self, instance_id: &str) -> Arc<Mutex<()>> {
        self.instance_locks
            .entry(instance_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn expect_state(
        &self,
        name: &str,
        instance_id: &str,
        expected: AdapterState,
    ) -> AdapterResult<()> {
        let entry = self
            .adapters
            .get(name)
            .ok_or_else(|| AdapterError::UnknownAdapter {
                name: name.to_string(),
            })?;
        let actual = entry
            .instances
            .get(instance_id)
            .copied()
            .unwrap_or(AdapterState::Registered);
        if actual != expected {
            return Err(AdapterError::InvalidState {
                name: name.to_string(),
                instance: instance_id.to_string(),
                actual,
                expected,
            });
        }
        Ok(())
    }

    fn set_state(&self, name: &str, instance_id: &str, state: AdapterState) {
        if let Some(mut entry) = self.adapters.get_mut(name) {
            entry.instances.insert(instance_id.to_string(), state);
        }
    }

    /// Reject absolute paths and any `..` traversal, then confirm the
    /// joined path still resolves inside the sandbox once existing
    /// symlinks are followed.
    fn validate_path(&self, path: &str) -> AdapterResult<()> {
        let invalid = |reason: &str| AdapterError::InvalidPath {
            path: path.to_string(),
            reason: reason.to_string(),
        };

        if path.is_empty() {
            return Err(invalid("path must not be empty"));
        }
        let candidate = Path::new(path);
        if candidate.is_absolute() {
            return Err(invalid("absolute paths are not allowed"));
        }
        for component in candidate.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                Component::ParentDir => {
                    return Err(invalid("parent-directory segments are not allowed"))
                }
                _ => return Err(invalid("path must be a plain relative path")),
            }
        }

        // Symlinks inside the sandbox can still point outside it; if the
        // artifact already exists on disk, resolve and re-check.
        let joined = self.sandbox_dir.join(candidate);
        if let (Ok(resolved), Ok(sandbox)) = (joined.canonicalize(), self.sandbox_dir.canonicalize())
        {
            if !resolved.starts_with(&sandbox) {
                return Err(invalid("path resolves outside the sandbox"));
            }
        }

        Ok(())
    }
}
