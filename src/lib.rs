//! flowengine is a user-space packet processing runtime. It pins worker
//! threads to CPU cores, pulls packet bursts from endpoint devices, runs
//! each burst through per-endpoint processor chains and fans the results
//! out to peer endpoints through lock-free rings.
//!
//! The `apis` module provides the dataplane primitives (buffer pool, packet
//! handles, burst vectors, rings); the remaining modules build the
//! orchestration layer on top of them: the concurrent flow table, the
//! processor pipeline, the distributor fabric, the executor and the
//! manager that drives the whole program through its load/start/stop
//! lifecycle.

pub mod apis;
pub mod config;
pub mod distributor;
pub mod endpoint;
pub mod executor;
pub mod flowtable;
pub mod manager;
pub mod pipeline;
pub mod processors;
pub mod program;
pub mod telemetry;

pub use apis::*;

/// Upper bound on the number of worker threads the runtime will ever spawn.
/// Per-worker state (pool caches, flow table epochs, per-core metrics) is
/// sized against this.
pub const MAX_WORKERS: usize = 64;
