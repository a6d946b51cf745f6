//! Tiered routing gateway for game-world text generation.
//!
//! The gateway sits between world services that need generated text and
//! several pools of inference backends with different latency/quality/cost
//! profiles. It selects a tier per request, executes calls with bounded
//! retries behind per-instance circuit breakers, manages per-archetype
//! adapter hot-swaps without routing into the swap window, and tunes
//! per-backend batching parameters from utilization/latency telemetry.

pub mod adapters;
pub mod app_context;
pub mod batching;
pub mod config;
pub mod core;
pub mod observability;
pub mod protocols;
pub mod routing;
pub mod server;
