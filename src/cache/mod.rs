//! Encrypted offline storage.
//!
//! This module provides:
//! - A durable store with two collections: cached responses keyed by URL,
//!   and a queue of form submissions waiting to be replayed
//! - Cache-only and network-first read strategies over that store
//! - All-or-nothing priming of the cache under a freshly derived key

mod layer;
mod storage;
mod traits;

pub use layer::CacheRouter;
pub use storage::SqliteStore;
pub use traits::{CachedEntry, OfflineStore, QueuedMutation};
