//! Client side of the cache protocol.
//!
//! - [`proxy`]: ClientProxy, one outbound connection with typed events
//! - [`cache_client`]: CacheClient, request/response operations with timeouts

pub mod cache_client;
pub mod proxy;
