//! The store: one explicit instance owning every cache, the invalidation
//! graph, the in-flight registry and the mutation ledger.
//!
//! All of that state sits behind a single mutex that is never held across an
//! `.await`, so each cache read or write is atomic with respect to other
//! operations. Suspension only happens at transport calls and at the
//! per-entity mutation gate.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::info;

use crate::api::{Transport, TransportError};
use crate::cache::{
  EntityId, InFlightRequest, InvalidationGraph, MutationExecutor, PageKey, Payload,
  PendingMutation, QueryCoordinator, QueryKey, RegisteredQuery, ResourceCache, Tag,
};
use crate::error::{Error, Result};
use crate::resource::{Resource, ResourceConfig};

/// When invalidated queries are refetched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevalidatePolicy {
  /// On the next read, which serves the stale value meanwhile
  #[default]
  OnAccess,
  /// Right after invalidation, for every query with a known fetcher
  Eager,
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
  pub revalidate: RevalidatePolicy,
  /// Buffered events per subscriber before it starts lagging
  pub event_capacity: usize,
}

impl Default for StoreSettings {
  fn default() -> Self {
    Self {
      revalidate: RevalidatePolicy::OnAccess,
      event_capacity: 256,
    }
  }
}

/// Notifications for subscribers (UI layers, loggers, tests).
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
  /// A fetch settled and the cached result changed
  QueryUpdated(QueryKey),
  QueryFailed {
    key: QueryKey,
    error: TransportError,
  },
  Invalidated(Vec<QueryKey>),
  /// An optimistic change is now visible in the cache
  MutationApplied {
    resource: String,
    id: EntityId,
  },
  MutationCommitted {
    resource: String,
    id: Option<EntityId>,
  },
  MutationRolledBack {
    resource: String,
    id: EntityId,
    error: TransportError,
  },
  Cleared(String),
}

type GateKey = (String, EntityId);

/// Everything guarded by the store mutex.
#[derive(Default)]
pub(crate) struct StoreState {
  pub(crate) caches: HashMap<String, ResourceCache>,
  pub(crate) graph: InvalidationGraph,
  pub(crate) in_flight: HashMap<QueryKey, InFlightRequest>,
  pub(crate) queries: HashMap<QueryKey, RegisteredQuery>,
  pub(crate) pending: HashMap<GateKey, PendingMutation>,
  /// Last id handed to an in-flight request
  pub(crate) next_fetch: u64,
}

impl StoreState {
  /// The cache for a configured resource, created on first use.
  pub(crate) fn cache_for(&mut self, config: &ResourceConfig) -> &mut ResourceCache {
    self
      .caches
      .entry(config.resource_type().to_string())
      .or_insert_with(|| {
        ResourceCache::new(config.resource_type(), config.tag_type(), config.id_field())
      })
  }

  /// Cached data for a query, resolved against the entity tables.
  pub(crate) fn materialize(&self, key: &QueryKey) -> Option<(Payload, DateTime<Utc>)> {
    match key {
      QueryKey::Item { resource, id } => {
        let entity = self.caches.get(resource)?.get(id)?;
        Some((Payload::Item(entity.data.clone()), entity.cached_at))
      }
      QueryKey::List {
        resource,
        page,
        limit,
      } => {
        let (items, meta, cached_at) = self.caches.get(resource)?.materialize_page(&PageKey {
          page: *page,
          limit: *limit,
        })?;
        Some((Payload::Page { items, meta }, cached_at))
      }
    }
  }

  /// Drop a query's registration, fetcher and stale flag.
  pub(crate) fn forget(&mut self, key: &QueryKey) {
    self.graph.unregister(key);
    self.queries.remove(key);
  }
}

pub(crate) struct Shared {
  state: Mutex<StoreState>,
  gates: Mutex<HashMap<GateKey, Arc<tokio::sync::Mutex<()>>>>,
  pub(crate) transport: Arc<dyn Transport>,
  pub(crate) settings: StoreSettings,
  events: broadcast::Sender<StoreEvent>,
  disposed: AtomicBool,
}

impl Shared {
  pub(crate) fn state(&self) -> MutexGuard<'_, StoreState> {
    // Every critical section leaves the state consistent before it can panic
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub(crate) fn gates(&self) -> MutexGuard<'_, HashMap<GateKey, Arc<tokio::sync::Mutex<()>>>> {
    self.gates.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub(crate) fn emit(&self, event: StoreEvent) {
    // No subscribers is fine
    let _ = self.events.send(event);
  }

  pub(crate) fn is_disposed(&self) -> bool {
    self.disposed.load(Ordering::SeqCst)
  }

  pub(crate) fn ensure_live(&self) -> Result<()> {
    if self.is_disposed() {
      Err(Error::Disposed)
    } else {
      Ok(())
    }
  }
}

/// Handle to the shared cache state. Cheap to clone.
#[derive(Clone)]
pub struct Store {
  shared: Arc<Shared>,
}

impl Store {
  /// Create the store. Call once at application start.
  pub fn init(settings: StoreSettings, transport: Arc<dyn Transport>) -> Self {
    let (events, _) = broadcast::channel(settings.event_capacity.max(1));

    info!(revalidate = ?settings.revalidate, "store initialized");

    Self {
      shared: Arc::new(Shared {
        state: Mutex::new(StoreState::default()),
        gates: Mutex::new(HashMap::new()),
        transport,
        settings,
        events,
        disposed: AtomicBool::new(false),
      }),
    }
  }

  /// Typed operations for one resource.
  pub fn resource<T>(&self, config: ResourceConfig) -> Resource<T> {
    self.shared.state().cache_for(&config);
    Resource::new(self.clone(), config)
  }

  pub fn coordinator(&self) -> QueryCoordinator {
    QueryCoordinator::new(Arc::clone(&self.shared))
  }

  pub fn mutations(&self) -> MutationExecutor {
    MutationExecutor::new(Arc::clone(&self.shared))
  }

  pub fn transport(&self) -> Arc<dyn Transport> {
    Arc::clone(&self.shared.transport)
  }

  pub fn settings(&self) -> &StoreSettings {
    &self.shared.settings
  }

  pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
    self.shared.events.subscribe()
  }

  /// Invalidate tags by hand, e.g. after an out-of-band change.
  pub fn invalidate(&self, tags: &[Tag]) -> Vec<QueryKey> {
    self.coordinator().invalidate(tags)
  }

  pub fn is_stale(&self, key: &QueryKey) -> bool {
    self.shared.state().graph.is_stale(key)
  }

  /// Callers currently waiting on the in-flight request for `key`.
  pub fn in_flight_subscribers(&self, key: &QueryKey) -> Option<usize> {
    self
      .shared
      .state()
      .in_flight
      .get(key)
      .map(|request| request.subscribers)
  }

  /// The optimistic change currently applied to an entity, if any.
  pub fn pending_mutation(&self, resource: &str, id: &EntityId) -> Option<PendingMutation> {
    self
      .shared
      .state()
      .pending
      .get(&(resource.to_string(), id.clone()))
      .cloned()
  }

  /// Drop every cached entity, page and query of one resource type.
  pub fn clear(&self, resource: &str) {
    {
      let mut state = self.shared.state();
      if let Some(cache) = state.caches.get_mut(resource) {
        cache.clear();
      }
      for key in state.graph.queries_of(resource) {
        state.forget(&key);
      }
      state.queries.retain(|key, _| key.resource() != resource);
      // Reads after the clear start over instead of joining older fetches
      state.in_flight.retain(|key, _| key.resource() != resource);
    }

    info!(resource, "cache cleared");
    self.shared.emit(StoreEvent::Cleared(resource.to_string()));
  }

  pub fn clear_all(&self) {
    let resources: Vec<String> = self.shared.state().caches.keys().cloned().collect();
    for resource in resources {
      self.clear(&resource);
    }
  }

  /// Tear the store down. Later operations fail with `Error::Disposed` and
  /// fetches that settle afterwards are discarded.
  pub fn dispose(&self) {
    if self.shared.disposed.swap(true, Ordering::SeqCst) {
      return;
    }

    {
      let mut state = self.shared.state();
      for cache in state.caches.values_mut() {
        cache.clear();
      }
      state.caches.clear();
      state.graph.clear();
      state.in_flight.clear();
      state.queries.clear();
      state.pending.clear();
    }
    self.shared.gates().clear();

    info!("store disposed");
  }

  pub fn is_disposed(&self) -> bool {
    self.shared.is_disposed()
  }

  #[cfg(test)]
  pub(crate) fn gate_count(&self) -> usize {
    self.shared.gates().len()
  }
}
