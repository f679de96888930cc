//! Infrastructure layer - Storage adapters
//!
//! - `sqlite`: durable versioned store
//! - `memory`: live cache store, also usable as a watchable source

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::LiveCacheStore;

#[cfg(feature = "sqlite")]
pub use sqlite::VersionedStore;
