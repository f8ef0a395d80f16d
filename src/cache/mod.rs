//! Artifact storage.
//!
//! This module contains the cache data model and the local store:
//! - [`key`]: CacheKey, the 32-byte content identity of an artifact
//! - [`value`]: CacheValue, named blobs plus provenance description
//! - [`store`]: Capacity-bounded keyed store with access tokens
//! - [`evictor`]: Victim selection when the store is full
//! - [`persist`]: zstd-compressed store file on disk

pub mod evictor;
pub mod key;
pub mod persist;
pub mod store;
pub mod value;
