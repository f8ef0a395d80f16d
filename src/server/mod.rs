//! Cache server.
//!
//! - [`proxy`]: ServerProxy, accepted channels and typed requests
//! - [`tasks`]: Add, get and relay transfer state
//! - [`relay`]: Queue of values waiting to be pushed upstream
//! - [`orchestrator`]: The state machine tying store, clients and upstream together
//! - [`core`]: Startup, event loop, autosave and shutdown
//! - [`metrics`]: Prometheus counters and gauges
//! - [`admin`]: Admin HTTP API (health, stats, metrics)
//! - [`streaming`]: SSE stream of stats snapshots

pub mod admin;
pub mod core;
pub mod metrics;
pub mod orchestrator;
pub mod proxy;
pub mod relay;
pub mod streaming;
pub mod tasks;
