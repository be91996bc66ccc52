//! Client-side resource cache and mutation layer for a REST marketplace API.
//!
//! A [`Store`] owns normalized per-resource caches. Reads go through the
//! query coordinator (request coalescing, stale-while-revalidate); writes go
//! through the mutation executor (optimistic patch, commit or exact
//! rollback). Tag-based invalidation decides which cached reads a committed
//! write makes stale.

pub mod api;
pub mod cache;
mod error;
pub mod resource;
pub mod storage;
pub mod store;

#[cfg(test)]
mod testing;

pub use api::{HttpTransport, Transport, TransportError};
pub use cache::{CacheResult, CacheSource, EntityId, QueryKey, Tag};
pub use error::{Error, Result};
pub use resource::{Page, Resource, ResourceConfig};
pub use storage::{MemoryTokenStore, SqliteTokenStore, TokenStore, ACCESS_TOKEN_KEY};
pub use store::{RevalidatePolicy, Store, StoreEvent, StoreSettings};
