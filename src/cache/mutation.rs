//! Mutation executor: optimistic writes with commit or exact rollback.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::api::{ApiRequest, Envelope, TransportError};
use crate::error::Result;
use crate::resource::ResourceConfig;
use crate::store::{Shared, StoreEvent};

use super::layer::QueryCoordinator;
use super::storage::Snapshot;
use super::traits::{EntityId, QueryKey};

/// The kind of write, carrying the target id where there is one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationKind {
  Create,
  Update(EntityId),
  Delete(EntityId),
}

impl MutationKind {
  pub fn entity_id(&self) -> Option<&EntityId> {
    match self {
      Self::Create => None,
      Self::Update(id) | Self::Delete(id) => Some(id),
    }
  }

  fn label(&self) -> &'static str {
    match self {
      Self::Create => "create",
      Self::Update(_) => "update",
      Self::Delete(_) => "delete",
    }
  }
}

/// An optimistic change that has been applied but not yet confirmed.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMutation {
  pub entity_id: EntityId,
  pub optimistic_patch: Value,
  pub snapshot: Snapshot,
}

/// Holds the per-entity gate; the map entry goes away with the last holder.
struct EntityGate {
  _guard: OwnedMutexGuard<()>,
  key: (String, EntityId),
  shared: Arc<Shared>,
}

impl Drop for EntityGate {
  fn drop(&mut self) {
    let mut gates = self.shared.gates();
    // Only the map and our guard reference the lock: nobody is queued
    let idle = gates
      .get(&self.key)
      .is_some_and(|gate| Arc::strong_count(gate) <= 2);
    if idle {
      gates.remove(&self.key);
    }
  }
}

/// Runs create/update/delete against the transport with optimistic cache
/// updates.
///
/// Writes to the same entity are serialized: a second mutation waits until
/// the first has committed or rolled back before it computes its own patch.
#[derive(Clone)]
pub struct MutationExecutor {
  shared: Arc<Shared>,
  coordinator: QueryCoordinator,
}

impl MutationExecutor {
  pub(crate) fn new(shared: Arc<Shared>) -> Self {
    let coordinator = QueryCoordinator::new(Arc::clone(&shared));
    Self {
      shared,
      coordinator,
    }
  }

  /// Apply `kind` optimistically, send `request`, then commit or roll back.
  ///
  /// `payload` is the optimistic patch for updates; it is ignored otherwise.
  pub async fn mutate(
    &self,
    resource: &ResourceConfig,
    kind: MutationKind,
    payload: Value,
    request: ApiRequest,
  ) -> Result<Envelope<Value>> {
    self.shared.ensure_live()?;

    let _gate = match kind.entity_id() {
      Some(id) => Some(self.acquire(resource.resource_type(), id).await),
      None => None,
    };
    // The store may have gone away while we were queued
    self.shared.ensure_live()?;

    self.apply(resource, &kind, payload);

    match self.shared.transport.execute(request).await {
      Ok(envelope) => {
        self.commit(resource, &kind, &envelope);
        Ok(envelope)
      }
      Err(error) => {
        self.rollback(resource, &kind, &error);
        Err(error.into())
      }
    }
  }

  async fn acquire(&self, resource: &str, id: &EntityId) -> EntityGate {
    let key = (resource.to_string(), id.clone());
    let gate = {
      let mut gates = self.shared.gates();
      let gate = gates.entry(key.clone()).or_default();
      Arc::clone(gate)
    };

    if gate.try_lock().is_err() {
      debug!(resource, %id, "waiting for pending mutation");
    }

    EntityGate {
      _guard: gate.lock_owned().await,
      key,
      shared: Arc::clone(&self.shared),
    }
  }

  fn apply(&self, resource: &ResourceConfig, kind: &MutationKind, payload: Value) {
    let mut state = self.shared.state();
    let cache = state.cache_for(resource);

    let snapshot = match kind {
      MutationKind::Create => return,
      MutationKind::Update(id) => cache.apply_update(id, &payload),
      MutationKind::Delete(id) => cache.apply_delete(id),
    };

    let id = snapshot.entity_id().clone();
    state.pending.insert(
      (resource.resource_type().to_string(), id.clone()),
      PendingMutation {
        entity_id: id.clone(),
        optimistic_patch: payload,
        snapshot,
      },
    );
    drop(state);

    debug!(resource = resource.resource_type(), %id, kind = kind.label(), "optimistic change applied");
    self.shared.emit(StoreEvent::MutationApplied {
      resource: resource.resource_type().to_string(),
      id,
    });
  }

  fn commit(&self, resource: &ResourceConfig, kind: &MutationKind, envelope: &Envelope<Value>) {
    let name = resource.resource_type();

    {
      let mut state = self.shared.state();
      if let Some(id) = kind.entity_id() {
        // Commit: the snapshot is no longer needed
        state.pending.remove(&(name.to_string(), id.clone()));
      }

      if self.shared.is_disposed() {
        return;
      }

      match kind {
        MutationKind::Update(id) => {
          if envelope.data.is_object() {
            state
              .cache_for(resource)
              .store_item(Some(id), envelope.data.clone());
          }
        }
        MutationKind::Delete(id) => state.forget(&QueryKey::item(name, id.clone())),
        MutationKind::Create => {}
      }
    }

    info!(resource = name, id = ?kind.entity_id().map(EntityId::as_str), kind = kind.label(), "mutation committed");
    self.shared.emit(StoreEvent::MutationCommitted {
      resource: name.to_string(),
      id: kind.entity_id().cloned(),
    });

    self
      .coordinator
      .invalidate(&resource.invalidation_tags(kind.entity_id()));
  }

  fn rollback(&self, resource: &ResourceConfig, kind: &MutationKind, error: &TransportError) {
    let name = resource.resource_type();
    let Some(id) = kind.entity_id() else {
      warn!(resource = name, %error, "create rejected");
      return;
    };

    let restored = {
      let mut state = self.shared.state();
      match state.pending.remove(&(name.to_string(), id.clone())) {
        Some(pending) => state
          .caches
          .get_mut(name)
          .is_some_and(|cache| cache.restore(pending.snapshot)),
        None => false,
      }
    };

    warn!(resource = name, %id, kind = kind.label(), restored, %error, "mutation rolled back");
    self.shared.emit(StoreEvent::MutationRolledBack {
      resource: name.to_string(),
      id: id.clone(),
      error: error.clone(),
    });
  }
}
