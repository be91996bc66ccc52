//! Core types for the caching system.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Identifier of a cached entity within its resource type.
///
/// The API uses both numeric and string ids, so ids are kept in their string
/// form: `5` and `"5"` name the same entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
  pub fn new(id: impl Into<String>) -> Self {
    Self(id.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// Read an id out of a JSON string or number.
  pub fn from_value(value: &Value) -> Option<Self> {
    match value {
      Value::String(s) if !s.is_empty() => Some(Self(s.clone())),
      Value::Number(n) => Some(Self(n.to_string())),
      _ => None,
    }
  }

  /// Read the id stored under `field` of a JSON object.
  pub fn from_entity(entity: &Value, field: &str) -> Option<Self> {
    entity.get(field).and_then(Self::from_value)
  }
}

impl fmt::Display for EntityId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for EntityId {
  fn from(id: &str) -> Self {
    Self(id.to_string())
  }
}

impl From<String> for EntityId {
  fn from(id: String) -> Self {
    Self(id)
  }
}

impl From<&EntityId> for EntityId {
  fn from(id: &EntityId) -> Self {
    id.clone()
  }
}

macro_rules! entity_id_from_int {
  ($($ty:ty),*) => {
    $(
      impl From<$ty> for EntityId {
        fn from(id: $ty) -> Self {
          Self(id.to_string())
        }
      }
    )*
  };
}

entity_id_from_int!(u32, u64, i32, i64, usize);

/// What a tag points at: one entity, or the collection as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TagId {
  Item(EntityId),
  /// Anything depending on membership, order or count
  List,
}

/// Cache tag: `(tag type, id)` or `(tag type, LIST)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tag {
  pub tag_type: String,
  pub id: TagId,
}

impl Tag {
  pub fn item(tag_type: impl Into<String>, id: impl Into<EntityId>) -> Self {
    Self {
      tag_type: tag_type.into(),
      id: TagId::Item(id.into()),
    }
  }

  pub fn list(tag_type: impl Into<String>) -> Self {
    Self {
      tag_type: tag_type.into(),
      id: TagId::List,
    }
  }
}

impl fmt::Display for Tag {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.id {
      TagId::Item(id) => write!(f, "{}:{}", self.tag_type, id),
      TagId::List => write!(f, "{}:LIST", self.tag_type),
    }
  }
}

/// Identity of a cached read.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueryKey {
  /// One page of a resource collection
  List {
    resource: String,
    page: u32,
    limit: u32,
  },
  /// A single entity
  Item { resource: String, id: EntityId },
}

impl QueryKey {
  pub fn list(resource: impl Into<String>, page: u32, limit: u32) -> Self {
    Self::List {
      resource: resource.into(),
      page,
      limit,
    }
  }

  pub fn item(resource: impl Into<String>, id: impl Into<EntityId>) -> Self {
    Self::Item {
      resource: resource.into(),
      id: id.into(),
    }
  }

  pub fn resource(&self) -> &str {
    match self {
      Self::List { resource, .. } | Self::Item { resource, .. } => resource,
    }
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::List {
        resource,
        page,
        limit,
      } => write!(f, "{}?page={}&limit={}", resource, page, limit),
      Self::Item { resource, id } => write!(f, "{}/{}", resource, id),
    }
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>, is_stale: bool) -> Self {
    Self {
      data,
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      cached_at: Some(cached_at),
    }
  }

  pub fn is_stale(&self) -> bool {
    self.source == CacheSource::CacheStale
  }

  /// Convert the data, keeping the source metadata.
  pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CacheResult<U> {
    CacheResult {
      data: f(self.data),
      source: self.source,
      cached_at: self.cached_at,
    }
  }

  /// Fallible version of [`CacheResult::map`].
  pub fn try_map<U, E>(self, f: impl FnOnce(T) -> Result<U, E>) -> Result<CacheResult<U>, E> {
    Ok(CacheResult {
      data: f(self.data)?,
      source: self.source,
      cached_at: self.cached_at,
    })
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Data from cache, invalidated; a refetch is running in the background
  CacheStale,
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_entity_id_from_number_and_string() {
    assert_eq!(EntityId::from_value(&json!(5)), Some(EntityId::from(5u64)));
    assert_eq!(EntityId::from_value(&json!("5")), Some(EntityId::from(5u64)));
    assert_eq!(EntityId::from_value(&json!("")), None);
    assert_eq!(EntityId::from_value(&json!(null)), None);
  }

  #[test]
  fn test_entity_id_from_custom_field() {
    let doc = json!({ "_id": "65f1a", "name": "Dr. Rahman" });
    assert_eq!(EntityId::from_entity(&doc, "_id"), Some(EntityId::from("65f1a")));
    assert_eq!(EntityId::from_entity(&doc, "id"), None);
  }

  #[test]
  fn test_tag_display() {
    assert_eq!(Tag::item("Hostel", 5u64).to_string(), "Hostel:5");
    assert_eq!(Tag::list("Hostel").to_string(), "Hostel:LIST");
  }

  #[test]
  fn test_query_key_resource() {
    assert_eq!(QueryKey::list("jobs", 1, 10).resource(), "jobs");
    assert_eq!(QueryKey::item("jobs", 3u64).to_string(), "jobs/3");
  }
}
