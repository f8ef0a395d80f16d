//! asset-cache: distributed build-artifact cache.
//!
//! Build tools store and fetch artifacts by a 32-byte key. Servers keep
//! artifacts in a capacity-bounded local store and may chain to an
//! upstream server: local misses are fetched from upstream, local adds
//! are relayed to it.

pub mod cache;
pub mod client;
pub mod config;
pub mod net;
pub mod protocol;
pub mod server;

pub use cache::key::CacheKey;
pub use cache::value::CacheValue;
pub use client::cache_client::{CacheClient, CacheError};
pub use config::Config;
pub use server::core::{start, ServerHandle};
