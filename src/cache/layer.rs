//! Query coordinator: request coalescing and stale-while-revalidate reads.

use futures::future::{BoxFuture, FutureExt, Shared as SharedFuture};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::api::{PageMeta, TransportError};
use crate::error::Result;
use crate::store::{RevalidatePolicy, Shared, StoreEvent, StoreState};

use super::storage::{PageKey, Refreshed, ResourceCache};
use super::traits::{CacheResult, QueryKey, Tag};

/// Materialized result of a read.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
  Item(Value),
  Page { items: Vec<Value>, meta: PageMeta },
}

/// What a fetcher hands back: the data plus the tags it provides.
#[derive(Debug, Clone)]
pub struct Fetched {
  pub payload: Payload,
  pub tags: Vec<Tag>,
}

/// Reusable network read for one query.
pub type Fetcher =
  Arc<dyn Fn() -> BoxFuture<'static, Result<Fetched, TransportError>> + Send + Sync>;

type SharedFetch = SharedFuture<BoxFuture<'static, Result<Payload, TransportError>>>;

/// A read that has been issued but not settled.
pub struct InFlightRequest {
  pub key: QueryKey,
  /// Tells this request apart from a later one for the same key
  fetch_id: u64,
  future: SharedFetch,
  /// Callers that joined, including the one that issued it
  pub subscribers: usize,
}

impl fmt::Debug for InFlightRequest {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("InFlightRequest")
      .field("key", &self.key)
      .field("subscribers", &self.subscribers)
      .finish_non_exhaustive()
  }
}

/// Fetcher and static tags remembered for background refetches.
#[derive(Clone)]
pub struct RegisteredQuery {
  pub tags: Vec<Tag>,
  pub fetcher: Fetcher,
}

/// Serves reads from the cache and coalesces the ones that must hit the network.
#[derive(Clone)]
pub struct QueryCoordinator {
  shared: Arc<Shared>,
}

impl QueryCoordinator {
  pub(crate) fn new(shared: Arc<Shared>) -> Self {
    Self { shared }
  }

  /// Read `key`.
  ///
  /// 1. Cached and fresh: returned as is.
  /// 2. Cached but invalidated: returned immediately, and one background
  ///    refetch is started unless one is already running.
  /// 3. Not cached: joins the in-flight request for `key`, or issues one.
  ///
  /// `tags` are registered for the query up front; the fetcher may add more.
  pub async fn read(
    &self,
    key: QueryKey,
    tags: Vec<Tag>,
    fetcher: Fetcher,
  ) -> Result<CacheResult<Payload>> {
    self.shared.ensure_live()?;

    let pending = {
      let mut state = self.shared.state();
      state.queries.insert(
        key.clone(),
        RegisteredQuery {
          tags: tags.clone(),
          fetcher: Arc::clone(&fetcher),
        },
      );

      if let Some((payload, cached_at)) = state.materialize(&key) {
        if !state.graph.is_registered(&key) {
          state.graph.provide(&key, tags.clone());
        }

        let stale = state.graph.is_stale(&key);
        if stale && !state.in_flight.contains_key(&key) {
          debug!(%key, "serving stale data, revalidating");
          self.start_fetch(&mut state, key.clone(), tags, fetcher);
        } else {
          debug!(%key, stale, "cache hit");
        }

        return Ok(CacheResult::from_cache(payload, cached_at, stale));
      }

      let joined = match state.in_flight.get_mut(&key) {
        Some(request) => {
          request.subscribers += 1;
          debug!(%key, subscribers = request.subscribers, "joining in-flight request");
          Some(request.future.clone())
        }
        None => None,
      };

      match joined {
        Some(future) => future,
        None => {
          debug!(%key, "cache miss");
          self.start_fetch(&mut state, key.clone(), tags, fetcher)
        }
      }
    };

    let payload = pending.await?;
    Ok(CacheResult::from_network(payload))
  }

  /// Cached data for `key` without touching the network.
  pub fn peek(&self, key: &QueryKey) -> Option<Payload> {
    self.shared.state().materialize(key).map(|(payload, _)| payload)
  }

  /// Mark queries depending on `tags` stale. Refetches right away under
  /// [`RevalidatePolicy::Eager`].
  pub fn invalidate(&self, tags: &[Tag]) -> Vec<QueryKey> {
    let affected = self.shared.state().graph.invalidate(tags);
    if affected.is_empty() {
      return affected;
    }

    info!(
      tags = %tags.iter().map(Tag::to_string).collect::<Vec<_>>().join(","),
      queries = affected.len(),
      "invalidated"
    );
    self.shared.emit(StoreEvent::Invalidated(affected.clone()));

    if self.shared.settings.revalidate == RevalidatePolicy::Eager {
      self.revalidate(&affected);
    }

    affected
  }

  /// Start a refetch for every key that has a registered fetcher and no
  /// request in flight.
  pub fn revalidate(&self, keys: &[QueryKey]) {
    if self.shared.is_disposed() {
      return;
    }

    let mut state = self.shared.state();
    for key in keys {
      if state.in_flight.contains_key(key) {
        continue;
      }
      let Some(query) = state.queries.get(key).cloned() else {
        continue;
      };
      debug!(%key, "eager revalidation");
      // Driven by its own task; nobody awaits the handle
      let _ = self.start_fetch(&mut state, key.clone(), query.tags, query.fetcher);
    }
  }

  /// Issue the network read for `key` and register it as in flight.
  ///
  /// The fetch runs on its own task so that callers going away never cancel
  /// a request other callers may be sharing.
  fn start_fetch(
    &self,
    state: &mut StoreState,
    key: QueryKey,
    tags: Vec<Tag>,
    fetcher: Fetcher,
  ) -> SharedFetch {
    let shared = Arc::clone(&self.shared);
    let fetch_key = key.clone();
    state.next_fetch += 1;
    let fetch_id = state.next_fetch;
    let generation = state
      .caches
      .get(key.resource())
      .map(ResourceCache::generation);

    let future = async move {
      let outcome = fetcher().await;
      settle(&shared, &fetch_key, fetch_id, generation, tags, outcome)
    }
    .boxed()
    .shared();

    state.in_flight.insert(
      key.clone(),
      InFlightRequest {
        key,
        fetch_id,
        future: future.clone(),
        subscribers: 1,
      },
    );

    tokio::spawn(future.clone());
    future
  }
}

/// Write a settled fetch into the cache and retire its in-flight entry.
///
/// Results of fetches that outlived a clear of their cache are handed to
/// the waiting callers but not written.
fn settle(
  shared: &Shared,
  key: &QueryKey,
  fetch_id: u64,
  generation: Option<u64>,
  tags: Vec<Tag>,
  outcome: Result<Fetched, TransportError>,
) -> Result<Payload, TransportError> {
  let mut state = shared.state();
  if state
    .in_flight
    .get(key)
    .is_some_and(|request| request.fetch_id == fetch_id)
  {
    state.in_flight.remove(key);
  }

  if shared.is_disposed() {
    return outcome.map(|fetched| fetched.payload);
  }

  let current = state
    .caches
    .get(key.resource())
    .map(ResourceCache::generation);
  if outcome.is_ok() && current != generation {
    debug!(%key, "cache cleared while fetching, result not cached");
    return outcome.map(|fetched| fetched.payload);
  }

  match outcome {
    Ok(fetched) => {
      let payload = store_payload(&mut state, key, fetched.payload);

      let mut provided = tags;
      for tag in fetched.tags {
        if !provided.contains(&tag) {
          provided.push(tag);
        }
      }
      state.graph.provide(key, provided);
      state.graph.mark_fresh(key);
      drop(state);

      debug!(%key, "query updated");
      shared.emit(StoreEvent::QueryUpdated(key.clone()));
      Ok(payload)
    }
    Err(error) => {
      // Prior data and its stale flag stay as they were
      drop(state);

      warn!(%key, %error, "query failed");
      shared.emit(StoreEvent::QueryFailed {
        key: key.clone(),
        error: error.clone(),
      });
      Err(error)
    }
  }
}

/// Normalize fetched data into the resource cache and return it as cached.
///
/// Optimistic changes still waiting for the server are put back on top, so
/// readers keep seeing them until they commit or roll back.
fn store_payload(state: &mut StoreState, key: &QueryKey, payload: Payload) -> Payload {
  let StoreState { caches, pending, .. } = &mut *state;
  let Some(cache) = caches.get_mut(key.resource()) else {
    warn!(%key, "no cache registered for resource, result not cached");
    return payload;
  };

  let (refreshed, fallback) = match (key, payload) {
    (QueryKey::Item { id, .. }, Payload::Item(data)) => {
      let stored = cache.store_item(Some(id), data.clone());
      (
        Refreshed {
          ids: stored.into_iter().collect(),
          page: None,
        },
        Payload::Item(data),
      )
    }
    (QueryKey::List { page, limit, .. }, Payload::Page { items, meta }) => {
      let page_key = PageKey {
        page: *page,
        limit: *limit,
      };
      let ids = cache.store_page(page_key, items, meta);
      (
        Refreshed {
          ids,
          page: Some(page_key),
        },
        Payload::Page {
          items: Vec::new(),
          meta,
        },
      )
    }
    (_, payload) => {
      warn!(%key, "payload shape does not match query, result not cached");
      return payload;
    }
  };

  for ((resource, id), mutation) in pending.iter_mut() {
    if resource == key.resource() {
      debug!(%key, %id, "keeping pending change over fetched data");
      cache.reapply(&mut mutation.snapshot, &mutation.optimistic_patch, &refreshed);
    }
  }

  // A pending delete can leave an item read with nothing cached; the caller
  // still gets what the server sent
  state
    .materialize(key)
    .map(|(payload, _)| payload)
    .unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::{ApiRequest, Method, Transport};
  use crate::cache::EntityId;
  use crate::resource::ResourceConfig;
  use crate::store::{Store, StoreSettings};
  use crate::testing::{wait_for_update, FakeTransport};
  use futures::future::join_all;
  use serde_json::json;
  use std::time::Duration;

  fn setup(count: u64) -> (Arc<FakeTransport>, Store) {
    let transport = FakeTransport::new();
    transport.seed("hostels", count);
    let store = Store::init(StoreSettings::default(), transport.clone());
    store.resource::<Value>(ResourceConfig::new("hostels").with_tag("Hostel"));
    (transport, store)
  }

  fn item_fetcher(transport: &Arc<FakeTransport>, id: u64) -> Fetcher {
    let transport = Arc::clone(transport);
    Arc::new(move || {
      let transport = Arc::clone(&transport);
      async move {
        let envelope = transport
          .execute(ApiRequest::get(format!("/hostels/{}", id)))
          .await?;
        Ok(Fetched {
          payload: Payload::Item(envelope.data),
          tags: Vec::new(),
        })
      }
      .boxed()
    })
  }

  fn item_key(id: u64) -> QueryKey {
    QueryKey::item("hostels", id)
  }

  #[tokio::test]
  async fn test_concurrent_reads_share_one_request() {
    let (transport, store) = setup(3);
    let coordinator = store.coordinator();
    transport.hold();

    let reads = (0..5).map(|_| {
      coordinator.read(
        item_key(1),
        vec![Tag::item("Hostel", 1u64)],
        item_fetcher(&transport, 1),
      )
    });

    let (results, _) = tokio::join!(join_all(reads), async {
      transport.wait_for_calls(1).await;
      assert_eq!(store.in_flight_subscribers(&item_key(1)), Some(5));
      transport.release(1);
    });

    assert_eq!(transport.call_count(), 1);
    let first = results[0].as_ref().unwrap().data.clone();
    for result in &results {
      assert_eq!(result.as_ref().unwrap().data, first);
    }
    assert_eq!(store.in_flight_subscribers(&item_key(1)), None);
  }

  #[tokio::test]
  async fn test_fresh_hit_skips_network() {
    let (transport, store) = setup(3);
    let coordinator = store.coordinator();
    let tags = vec![Tag::item("Hostel", 2u64)];

    let first = coordinator
      .read(item_key(2), tags.clone(), item_fetcher(&transport, 2))
      .await
      .unwrap();
    assert_eq!(first.source, crate::cache::CacheSource::Network);

    let second = coordinator
      .read(item_key(2), tags, item_fetcher(&transport, 2))
      .await
      .unwrap();
    assert_eq!(second.source, crate::cache::CacheSource::CacheFresh);
    assert_eq!(second.data, first.data);
    assert_eq!(transport.call_count(), 1);
  }

  #[tokio::test]
  async fn test_stale_read_returns_cached_and_refetches_once() {
    let (transport, store) = setup(3);
    let coordinator = store.coordinator();
    let mut events = store.subscribe();
    let tags = vec![Tag::item("Hostel", 1u64)];

    coordinator
      .read(item_key(1), tags.clone(), item_fetcher(&transport, 1))
      .await
      .unwrap();

    transport.with_server(|server| server.patch("hostels", 1, json!({ "price": 4242 })));
    coordinator.invalidate(&[Tag::item("Hostel", 1u64)]);
    transport.hold();

    let stale = coordinator
      .read(item_key(1), tags.clone(), item_fetcher(&transport, 1))
      .await
      .unwrap();
    assert!(stale.is_stale());
    assert_eq!(stale.data, Payload::Item(json!({ "id": 1, "name": "hostels 1", "price": 100 })));

    // Second stale read while the refetch is running starts nothing new
    transport.wait_for_calls(2).await;
    let again = coordinator
      .read(item_key(1), tags.clone(), item_fetcher(&transport, 1))
      .await
      .unwrap();
    assert!(again.is_stale());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(transport.call_count(), 2);

    transport.release(1);
    wait_for_update(&mut events, &item_key(1)).await;

    let fresh = coordinator
      .read(item_key(1), tags, item_fetcher(&transport, 1))
      .await
      .unwrap();
    assert_eq!(fresh.source, crate::cache::CacheSource::CacheFresh);
    assert_eq!(fresh.data, Payload::Item(json!({ "id": 1, "name": "hostels 1", "price": 4242 })));
    assert_eq!(transport.call_count(), 2);
  }

  #[tokio::test]
  async fn test_failed_read_surfaces_error_and_keeps_cache() {
    let (transport, store) = setup(3);
    let coordinator = store.coordinator();
    let tags = vec![Tag::item("Hostel", 1u64)];

    let cold = coordinator
      .read(item_key(3), vec![Tag::item("Hostel", 3u64)], item_fetcher(&transport, 3));
    transport.fail_next(TransportError::Timeout);
    assert!(matches!(
      cold.await,
      Err(crate::error::Error::Transport(TransportError::Timeout))
    ));
    assert!(coordinator.peek(&item_key(3)).is_none());

    coordinator
      .read(item_key(1), tags.clone(), item_fetcher(&transport, 1))
      .await
      .unwrap();
    let before = coordinator.peek(&item_key(1));

    let mut events = store.subscribe();
    coordinator.invalidate(&tags);
    transport.fail_next(TransportError::Network("offline".to_string()));
    let stale = coordinator
      .read(item_key(1), tags.clone(), item_fetcher(&transport, 1))
      .await
      .unwrap();
    assert!(stale.is_stale());

    // The background refetch fails; cached data and stale flag survive
    loop {
      if let StoreEvent::QueryFailed { key, .. } = events.recv().await.unwrap() {
        assert_eq!(key, item_key(1));
        break;
      }
    }
    assert_eq!(coordinator.peek(&item_key(1)), before);
    assert!(store.is_stale(&item_key(1)));
  }

  #[tokio::test]
  async fn test_abandoned_read_still_populates_cache() {
    let (transport, store) = setup(3);
    let mut events = store.subscribe();
    transport.hold();

    let coordinator = store.coordinator();
    let fetcher = item_fetcher(&transport, 2);
    let task = tokio::spawn(async move {
      coordinator
        .read(item_key(2), vec![Tag::item("Hostel", 2u64)], fetcher)
        .await
    });

    transport.wait_for_calls(1).await;
    task.abort();
    transport.release(1);

    wait_for_update(&mut events, &item_key(2)).await;
    let cached = store.coordinator().peek(&item_key(2)).unwrap();
    assert_eq!(cached, Payload::Item(json!({ "id": 2, "name": "hostels 2", "price": 200 })));
  }

  #[tokio::test]
  async fn test_eager_policy_refetches_on_invalidate() {
    let transport = FakeTransport::new();
    transport.seed("hostels", 2);
    let store = Store::init(
      StoreSettings {
        revalidate: RevalidatePolicy::Eager,
        ..StoreSettings::default()
      },
      transport.clone(),
    );
    store.resource::<Value>(ResourceConfig::new("hostels").with_tag("Hostel"));
    let coordinator = store.coordinator();
    let mut events = store.subscribe();

    coordinator
      .read(item_key(1), vec![Tag::item("Hostel", 1u64)], item_fetcher(&transport, 1))
      .await
      .unwrap();

    coordinator.invalidate(&[Tag::item("Hostel", 1u64)]);
    wait_for_update(&mut events, &item_key(1)).await;

    assert_eq!(transport.count(Method::Get), 2);
    assert!(!store.is_stale(&item_key(1)));
  }

  #[tokio::test]
  async fn test_list_read_registers_member_tags() {
    let (transport, store) = setup(4);
    let coordinator = store.coordinator();
    let key = QueryKey::list("hostels", 1, 2);

    let fetcher: Fetcher = {
      let transport = Arc::clone(&transport);
      Arc::new(move || {
        let transport = Arc::clone(&transport);
        async move {
          let envelope = transport
            .execute(ApiRequest::get("/hostels").with_query("page", 1).with_query("limit", 2))
            .await?;
          let items = envelope.data.as_array().cloned().unwrap_or_default();
          let tags = items
            .iter()
            .filter_map(|item| EntityId::from_entity(item, "id"))
            .map(|id| Tag::item("Hostel", id))
            .collect();
          Ok(Fetched {
            payload: Payload::Page {
              items,
              meta: envelope.meta.unwrap_or(PageMeta {
                page: 1,
                limit: 2,
                total: 0,
              }),
            },
            tags,
          })
        }
        .boxed()
      })
    };

    coordinator
      .read(key.clone(), vec![Tag::list("Hostel")], fetcher)
      .await
      .unwrap();

    let affected = coordinator.invalidate(&[Tag::item("Hostel", 2u64)]);
    assert_eq!(affected, vec![key.clone()]);

    let affected = store.invalidate(&[Tag::item("Hostel", 3u64)]);
    assert!(affected.is_empty());
  }

  #[tokio::test]
  async fn test_fetch_outliving_clear_is_not_cached() {
    let (transport, store) = setup(3);
    let hostels = store.resource::<Value>(ResourceConfig::new("hostels").with_tag("Hostel"));
    transport.hold();

    let read = tokio::spawn({
      let hostels = hostels.clone();
      async move { hostels.list(1, 10).await }
    });
    transport.wait_for_calls(1).await;
    store.clear("hostels");
    transport.release(1);

    // The caller still gets its data, the cleared cache stays empty
    let page = read.await.unwrap().unwrap();
    assert_eq!(page.data.items.len(), 3);
    assert!(hostels.peek_list(1, 10).is_none());
    assert!(hostels.peek(1u64).is_none());
    assert!(store.invalidate(&[Tag::list("Hostel")]).is_empty());
  }

  #[tokio::test]
  async fn test_older_fetch_does_not_retire_newer_request() {
    let (transport, store) = setup(3);
    let hostels = store.resource::<Value>(ResourceConfig::new("hostels").with_tag("Hostel"));
    let key = QueryKey::list("hostels", 1, 10);
    transport.hold();

    let first = tokio::spawn({
      let hostels = hostels.clone();
      async move { hostels.list(1, 10).await }
    });
    transport.wait_for_calls(1).await;
    store.clear("hostels");

    let second = tokio::spawn({
      let hostels = hostels.clone();
      async move { hostels.list(1, 10).await }
    });
    transport.wait_for_calls(2).await;

    transport.release(1);
    first.await.unwrap().unwrap();
    assert_eq!(store.in_flight_subscribers(&key), Some(1));

    let third = tokio::spawn({
      let hostels = hostels.clone();
      async move { hostels.list(1, 10).await }
    });
    tokio::task::yield_now().await;
    assert_eq!(store.in_flight_subscribers(&key), Some(2));

    transport.release(1);
    second.await.unwrap().unwrap();
    third.await.unwrap().unwrap();
    assert_eq!(transport.call_count(), 2);
    assert_eq!(hostels.peek_list(1, 10).unwrap().items.len(), 3);
  }
}
