//! In-memory cache for one resource type.
//!
//! Entities are stored once, by id. List pages only hold the ordered ids of
//! their members, so a write to an entity is seen through every page that
//! references it.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::warn;

use crate::api::PageMeta;

use super::traits::{EntityId, Tag};

/// A single cached entity.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedEntity {
  pub id: EntityId,
  /// Entity fields as returned by the server
  pub data: Value,
  /// Tags this entity provides
  pub tags: HashSet<Tag>,
  /// When the entity was cached
  pub cached_at: DateTime<Utc>,
}

impl CachedEntity {
  pub fn new(id: EntityId, data: Value, tag_type: &str) -> Self {
    let tags = HashSet::from([Tag::item(tag_type, id.clone())]);
    Self {
      id,
      data,
      tags,
      cached_at: Utc::now(),
    }
  }
}

/// Pagination parameters identifying a list page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageKey {
  pub page: u32,
  pub limit: u32,
}

/// A cached list page: id references plus server pagination metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ListPage {
  pub key: PageKey,
  /// Member ids in server order
  pub item_ids: Vec<EntityId>,
  pub meta: PageMeta,
  pub cached_at: DateTime<Utc>,
}

/// Where a delete took an id out of one cached page.
#[derive(Debug, Clone, PartialEq)]
pub struct PageRemoval {
  pub key: PageKey,
  /// Position of the id in `prior_ids`
  pub index: usize,
  /// Page members just before the removal
  pub prior_ids: Vec<EntityId>,
}

impl PageRemoval {
  /// Where to put the id back into `current`: before the first later
  /// neighbour still on the page, else after the closest earlier one.
  fn reinsert_at(&self, current: &[EntityId]) -> usize {
    let position = |id: &EntityId| current.iter().position(|member| member == id);

    if let Some(pos) = self.prior_ids.iter().skip(self.index + 1).find_map(position) {
      return pos;
    }
    let earlier = &self.prior_ids[..self.index.min(self.prior_ids.len())];
    if let Some(pos) = earlier.iter().rev().find_map(position) {
      return pos + 1;
    }
    self.index.min(current.len())
  }
}

/// Entity ids and the page a settled fetch has just written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Refreshed {
  pub ids: Vec<EntityId>,
  pub page: Option<PageKey>,
}

/// Pre-mutation state captured before an optimistic change.
///
/// Restoring undoes only this change: the entity goes back verbatim and a
/// removed id is re-inserted into each page it was taken from, leaving other
/// pending changes on the same pages alone. A snapshot taken before the cache
/// was cleared restores nothing.
#[derive(Debug, Clone, PartialEq)]
pub enum Snapshot {
  /// Field merge on one entity
  Entity {
    id: EntityId,
    prior: Option<CachedEntity>,
    generation: u64,
  },
  /// Removal of an entity and its page memberships
  Removal {
    id: EntityId,
    entity: Option<CachedEntity>,
    pages: Vec<PageRemoval>,
    generation: u64,
  },
}

impl Snapshot {
  pub fn entity_id(&self) -> &EntityId {
    match self {
      Self::Entity { id, .. } | Self::Removal { id, .. } => id,
    }
  }

  pub fn generation(&self) -> u64 {
    match self {
      Self::Entity { generation, .. } | Self::Removal { generation, .. } => *generation,
    }
  }
}

/// Shallow merge: each top-level field of `patch` overwrites the same field
/// of `target`. Returns false when either side is not a JSON object.
pub fn merge_fields(target: &mut Value, patch: &Value) -> bool {
  match (target.as_object_mut(), patch.as_object()) {
    (Some(target), Some(patch)) => {
      for (field, value) in patch {
        target.insert(field.clone(), value.clone());
      }
      true
    }
    _ => false,
  }
}

/// Cached entities and list pages of one resource type.
#[derive(Debug)]
pub struct ResourceCache {
  resource_type: String,
  tag_type: String,
  id_field: String,
  entities: HashMap<EntityId, CachedEntity>,
  pages: HashMap<PageKey, ListPage>,
  /// Bumped on every clear so stale snapshots can be recognised
  generation: u64,
}

impl ResourceCache {
  pub fn new(
    resource_type: impl Into<String>,
    tag_type: impl Into<String>,
    id_field: impl Into<String>,
  ) -> Self {
    Self {
      resource_type: resource_type.into(),
      tag_type: tag_type.into(),
      id_field: id_field.into(),
      entities: HashMap::new(),
      pages: HashMap::new(),
      generation: 0,
    }
  }

  pub fn resource_type(&self) -> &str {
    &self.resource_type
  }

  pub fn tag_type(&self) -> &str {
    &self.tag_type
  }

  pub fn id_field(&self) -> &str {
    &self.id_field
  }

  pub fn generation(&self) -> u64 {
    self.generation
  }

  pub fn len(&self) -> usize {
    self.entities.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entities.is_empty() && self.pages.is_empty()
  }

  pub fn get(&self, id: &EntityId) -> Option<&CachedEntity> {
    self.entities.get(id)
  }

  pub fn put_entity(&mut self, entity: CachedEntity) {
    self.entities.insert(entity.id.clone(), entity);
  }

  pub fn get_list_page(&self, key: &PageKey) -> Option<&ListPage> {
    self.pages.get(key)
  }

  pub fn put_list_page(&mut self, page: ListPage) {
    self.pages.insert(page.key, page);
  }

  pub fn remove_entity(&mut self, id: &EntityId) -> Option<CachedEntity> {
    self.entities.remove(id)
  }

  /// Merge `partial` into the cached entity and return its pre-patch state.
  pub fn patch_entity(&mut self, id: &EntityId, partial: &Value) -> Option<CachedEntity> {
    let entity = self.entities.get_mut(id)?;
    let prior = entity.clone();
    if !merge_fields(&mut entity.data, partial) {
      warn!(resource = %self.resource_type, %id, "patch is not a JSON object, entity left unchanged");
    }
    Some(prior)
  }

  /// Drop `id` from one cached page, decrementing its total.
  pub fn remove_from_page(&mut self, key: &PageKey, id: &EntityId) -> Option<PageRemoval> {
    let page = self.pages.get_mut(key)?;
    let index = page.item_ids.iter().position(|member| member == id)?;
    let prior_ids = page.item_ids.clone();
    page.item_ids.remove(index);
    page.meta.total = page.meta.total.saturating_sub(1);
    Some(PageRemoval {
      key: *key,
      index,
      prior_ids,
    })
  }

  /// Drop `id` from every cached page, decrementing each page's total.
  pub fn remove_from_pages(&mut self, id: &EntityId) -> Vec<PageRemoval> {
    let keys: Vec<PageKey> = self.pages.keys().copied().collect();
    keys
      .iter()
      .filter_map(|key| self.remove_from_page(key, id))
      .collect()
  }

  /// Undo one page removal against the page as it is now.
  fn reinsert_into_page(&mut self, id: &EntityId, removal: &PageRemoval) {
    let Some(page) = self.pages.get_mut(&removal.key) else {
      return;
    };
    if page.item_ids.contains(id) {
      return;
    }
    let at = removal.reinsert_at(&page.item_ids);
    page.item_ids.insert(at, id.clone());
    page.meta.total += 1;
  }

  /// Apply an optimistic field merge and capture how to undo it.
  pub fn apply_update(&mut self, id: &EntityId, partial: &Value) -> Snapshot {
    Snapshot::Entity {
      id: id.clone(),
      prior: self.patch_entity(id, partial),
      generation: self.generation,
    }
  }

  /// Apply an optimistic removal and capture how to undo it.
  pub fn apply_delete(&mut self, id: &EntityId) -> Snapshot {
    let entity = self.remove_entity(id);
    let pages = self.remove_from_pages(id);
    Snapshot::Removal {
      id: id.clone(),
      entity,
      pages,
      generation: self.generation,
    }
  }

  /// Put a snapshot back. Returns false if the cache was cleared since.
  pub fn restore(&mut self, snapshot: Snapshot) -> bool {
    match snapshot {
      Snapshot::Entity {
        prior, generation, ..
      } => {
        if generation != self.generation {
          return false;
        }
        if let Some(prior) = prior {
          self.put_entity(prior);
        }
        true
      }
      Snapshot::Removal {
        id,
        entity,
        pages,
        generation,
      } => {
        if generation != self.generation {
          return false;
        }
        if let Some(entity) = entity {
          self.put_entity(entity);
        }
        for removal in &pages {
          self.reinsert_into_page(&id, removal);
        }
        true
      }
    }
  }

  /// Put a pending change back on top of data a fetch just wrote, and move
  /// the snapshot's base to that server state so a rollback restores it.
  pub fn reapply(&mut self, snapshot: &mut Snapshot, patch: &Value, refreshed: &Refreshed) {
    if snapshot.generation() != self.generation {
      return;
    }

    match snapshot {
      Snapshot::Entity { id, prior, .. } => {
        if refreshed.ids.contains(id) {
          *prior = self.patch_entity(id, patch);
        }
      }
      Snapshot::Removal {
        id, entity, pages, ..
      } => {
        if refreshed.ids.contains(id) {
          if let Some(fresh) = self.remove_entity(id) {
            *entity = Some(fresh);
          }
        }
        if let Some(key) = refreshed.page {
          // The old record described a page that no longer exists
          pages.retain(|removal| removal.key != key);
          if let Some(removal) = self.remove_from_page(&key, id) {
            pages.push(removal);
          }
        }
      }
    }
  }

  /// Write one fetched entity. `fallback_id` is used when the data carries
  /// no id of its own.
  pub fn store_item(&mut self, fallback_id: Option<&EntityId>, data: Value) -> Option<EntityId> {
    let id = EntityId::from_entity(&data, &self.id_field).or_else(|| fallback_id.cloned())?;
    let entity = CachedEntity::new(id.clone(), data, &self.tag_type);
    self.put_entity(entity);
    Some(id)
  }

  /// Write a fetched page: every member entity plus the id list.
  /// Members without an id cannot be referenced and are skipped.
  pub fn store_page(&mut self, key: PageKey, items: Vec<Value>, meta: PageMeta) -> Vec<EntityId> {
    let mut item_ids = Vec::with_capacity(items.len());
    for item in items {
      match self.store_item(None, item) {
        Some(id) => item_ids.push(id),
        None => warn!(
          resource = %self.resource_type,
          id_field = %self.id_field,
          "list item without id, skipping"
        ),
      }
    }

    self.put_list_page(ListPage {
      key,
      item_ids: item_ids.clone(),
      meta,
      cached_at: Utc::now(),
    });

    item_ids
  }

  /// Resolve a page's ids against the entity table, in page order.
  pub fn materialize_page(&self, key: &PageKey) -> Option<(Vec<Value>, PageMeta, DateTime<Utc>)> {
    let page = self.pages.get(key)?;
    let items = page
      .item_ids
      .iter()
      .filter_map(|id| self.entities.get(id))
      .map(|entity| entity.data.clone())
      .collect();
    Some((items, page.meta, page.cached_at))
  }

  /// Drop every entity and page.
  pub fn clear(&mut self) {
    self.entities.clear();
    self.pages.clear();
    self.generation += 1;
  }
}
