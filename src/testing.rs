//! In-memory transport for tests: a tiny REST server plus call recording,
//! a hold/release gate and queued failures.

use futures::future::{BoxFuture, FutureExt};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Semaphore};

use crate::api::{ApiRequest, Envelope, Method, PageMeta, Transport, TransportError};
use crate::cache::{merge_fields, EntityId, QueryKey};
use crate::store::StoreEvent;

const WAIT: Duration = Duration::from_secs(5);

/// Collections keyed by resource name, in insertion order.
#[derive(Debug, Default)]
pub(crate) struct MemoryServer {
  collections: HashMap<String, Vec<Value>>,
}

fn item_id(item: &Value) -> Option<EntityId> {
  EntityId::from_entity(item, "id").or_else(|| EntityId::from_entity(item, "_id"))
}

fn not_found() -> TransportError {
  TransportError::Server {
    status: 404,
    message: "Not Found".to_string(),
  }
}

impl MemoryServer {
  pub(crate) fn seed(&mut self, resource: &str, count: u64) {
    let items = (1..=count)
      .map(|i| json!({ "id": i, "name": format!("{} {}", resource, i), "price": i * 100 }))
      .collect();
    self.collections.insert(resource.to_string(), items);
  }

  pub(crate) fn insert(&mut self, resource: &str, item: Value) {
    self
      .collections
      .entry(resource.to_string())
      .or_default()
      .push(item);
  }

  /// Change an entity behind the store's back.
  pub(crate) fn patch(&mut self, resource: &str, id: u64, fields: Value) {
    let id = EntityId::from(id);
    if let Some(item) = self.find_mut(resource, &id) {
      merge_fields(item, &fields);
    }
  }

  fn find_mut(&mut self, resource: &str, id: &EntityId) -> Option<&mut Value> {
    self
      .collections
      .get_mut(resource)?
      .iter_mut()
      .find(|item| item_id(item).as_ref() == Some(id))
  }

  fn next_id(&self, resource: &str) -> u64 {
    self
      .collections
      .get(resource)
      .map(|items| {
        items
          .iter()
          .filter_map(|item| item["id"].as_u64())
          .max()
          .unwrap_or(0)
      })
      .unwrap_or(0)
      + 1
  }

  fn handle(&mut self, request: &ApiRequest) -> Result<Envelope<Value>, TransportError> {
    let mut segments = request.path.trim_matches('/').split('/');
    let resource = segments.next().unwrap_or_default().to_string();
    let id = segments.next().map(EntityId::from);

    match (request.method, id) {
      (Method::Get, None) => {
        let param = |name: &str, default: u32| {
          request
            .query
            .iter()
            .find(|(key, _)| key == name)
            .and_then(|(_, value)| value.parse().ok())
            .unwrap_or(default)
        };
        let page: u32 = param("page", 1).max(1);
        let limit: u32 = param("limit", 10);

        let items = self.collections.get(&resource).cloned().unwrap_or_default();
        let total = items.len() as u64;
        let data = items
          .into_iter()
          .skip(((page - 1) * limit) as usize)
          .take(limit as usize)
          .collect();

        Ok(Envelope::ok(Value::Array(data)).with_meta(PageMeta { page, limit, total }))
      }
      (Method::Get, Some(id)) => self
        .find_mut(&resource, &id)
        .map(|item| Envelope::ok(item.clone()))
        .ok_or_else(not_found),
      (Method::Post, None) => {
        let mut item = match &request.body {
          Some(Value::Object(fields)) => fields.clone(),
          _ => Map::new(),
        };
        item.insert("id".to_string(), json!(self.next_id(&resource)));
        item.insert("createdAt".to_string(), json!("2024-01-01T00:00:00Z"));
        let item = Value::Object(item);
        self.insert(&resource, item.clone());
        Ok(Envelope::ok(item))
      }
      (Method::Patch, Some(id)) => {
        let item = self.find_mut(&resource, &id).ok_or_else(not_found)?;
        if let Some(body) = &request.body {
          merge_fields(item, body);
        }
        Ok(Envelope::ok(item.clone()))
      }
      (Method::Delete, Some(id)) => {
        let items = self.collections.get_mut(&resource).ok_or_else(not_found)?;
        let before = items.len();
        items.retain(|item| item_id(item).as_ref() != Some(&id));
        if items.len() == before {
          return Err(not_found());
        }
        Ok(Envelope::ok(Value::Null))
      }
      _ => Err(TransportError::Server {
        status: 405,
        message: "Method Not Allowed".to_string(),
      }),
    }
  }
}

/// Transport double backed by a `MemoryServer`.
pub(crate) struct FakeTransport {
  server: Mutex<MemoryServer>,
  calls: Mutex<Vec<ApiRequest>>,
  failures: Mutex<VecDeque<TransportError>>,
  held: AtomicBool,
  permits: Semaphore,
  call_count: watch::Sender<usize>,
}

impl FakeTransport {
  pub(crate) fn new() -> Arc<Self> {
    let (call_count, _) = watch::channel(0);
    Arc::new(Self {
      server: Mutex::new(MemoryServer::default()),
      calls: Mutex::new(Vec::new()),
      failures: Mutex::new(VecDeque::new()),
      held: AtomicBool::new(false),
      permits: Semaphore::new(0),
      call_count,
    })
  }

  pub(crate) fn seed(&self, resource: &str, count: u64) {
    self.server.lock().unwrap().seed(resource, count);
  }

  pub(crate) fn with_server<R>(&self, f: impl FnOnce(&mut MemoryServer) -> R) -> R {
    f(&mut self.server.lock().unwrap())
  }

  /// From now on every call waits for a `release` before it answers.
  pub(crate) fn hold(&self) {
    self.held.store(true, Ordering::SeqCst);
  }

  /// Let `n` held calls through, in arrival order.
  pub(crate) fn release(&self, n: usize) {
    self.permits.add_permits(n);
  }

  /// The next call fails with `error` without reaching the server.
  pub(crate) fn fail_next(&self, error: TransportError) {
    self.failures.lock().unwrap().push_back(error);
  }

  pub(crate) fn call_count(&self) -> usize {
    self.calls.lock().unwrap().len()
  }

  pub(crate) fn calls(&self) -> Vec<ApiRequest> {
    self.calls.lock().unwrap().clone()
  }

  pub(crate) fn count(&self, method: Method) -> usize {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|call| call.method == method)
      .count()
  }

  /// Wait until at least `n` calls have been issued.
  pub(crate) async fn wait_for_calls(&self, n: usize) {
    let mut rx = self.call_count.subscribe();
    tokio::time::timeout(WAIT, rx.wait_for(|count| *count >= n))
      .await
      .unwrap_or_else(|_| panic!("timed out waiting for {} calls, saw {}", n, self.call_count()))
      .unwrap();
  }
}

impl Transport for FakeTransport {
  fn execute(&self, request: ApiRequest) -> BoxFuture<'_, Result<Envelope<Value>, TransportError>> {
    async move {
      let failure = self.failures.lock().unwrap().pop_front();
      let count = {
        let mut calls = self.calls.lock().unwrap();
        calls.push(request.clone());
        calls.len()
      };
      self.call_count.send_replace(count);

      if self.held.load(Ordering::SeqCst) {
        self.permits.acquire().await.unwrap().forget();
      }

      match failure {
        Some(error) => Err(error),
        None => self.server.lock().unwrap().handle(&request),
      }
    }
    .boxed()
  }
}

/// Wait for the next `QueryUpdated` event for `key`.
pub(crate) async fn wait_for_update(events: &mut broadcast::Receiver<StoreEvent>, key: &QueryKey) {
  let wait = async {
    loop {
      match events.recv().await {
        Ok(StoreEvent::QueryUpdated(updated)) if &updated == key => return,
        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
        Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
      }
    }
  };
  tokio::time::timeout(WAIT, wait)
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for update of {}", key));
}
