//! Normalized resource caching.
//!
//! This module holds the resource-agnostic pieces of the store:
//! - Per-resource entity tables with id-only list pages
//! - A tag graph deciding which queries a write makes stale
//! - Coalesced, stale-while-revalidate reads
//! - Optimistic mutations with exact rollback

mod graph;
mod layer;
mod mutation;
mod storage;
mod traits;

pub use graph::InvalidationGraph;
pub use layer::{Fetched, Fetcher, InFlightRequest, Payload, QueryCoordinator, RegisteredQuery};
pub use mutation::{MutationExecutor, MutationKind, PendingMutation};
pub use storage::{
  merge_fields, CachedEntity, ListPage, PageKey, PageRemoval, Refreshed, ResourceCache, Snapshot,
};
pub use traits::{CacheResult, CacheSource, EntityId, QueryKey, Tag, TagId};
