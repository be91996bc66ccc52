//! Typed CRUD access to one REST resource, built on the shared store.

use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::api::{ApiRequest, PageMeta, TransportError};
use crate::cache::{
  CacheResult, EntityId, Fetched, Fetcher, MutationKind, Payload, QueryKey, Tag,
};
use crate::error::{Error, Result};
use crate::store::Store;

fn default_id_field() -> String {
  "id".to_string()
}

fn default_true() -> bool {
  true
}

/// Static description of a REST resource.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ResourceConfig {
  /// Resource type, also the default path segment (`hostels`)
  pub name: String,
  /// Path under the API base URL, defaults to `/{name}`
  #[serde(default)]
  pub path: Option<String>,
  /// Tag type, defaults to the capitalized name
  #[serde(default)]
  pub tag: Option<String>,
  #[serde(default = "default_id_field")]
  pub id_field: String,
  /// Tag types whose lists go stale when this resource is written
  #[serde(default)]
  pub related: Vec<String>,
  #[serde(default)]
  pub auth_reads: bool,
  #[serde(default = "default_true")]
  pub auth_writes: bool,
}

impl ResourceConfig {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      path: None,
      tag: None,
      id_field: default_id_field(),
      related: Vec::new(),
      auth_reads: false,
      auth_writes: true,
    }
  }

  pub fn with_path(mut self, path: impl Into<String>) -> Self {
    self.path = Some(path.into());
    self
  }

  pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
    self.tag = Some(tag.into());
    self
  }

  pub fn with_id_field(mut self, field: impl Into<String>) -> Self {
    self.id_field = field.into();
    self
  }

  pub fn with_related<I, S>(mut self, tags: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.related = tags.into_iter().map(Into::into).collect();
    self
  }

  pub fn with_auth_reads(mut self, auth_reads: bool) -> Self {
    self.auth_reads = auth_reads;
    self
  }

  pub fn resource_type(&self) -> &str {
    &self.name
  }

  /// Collection path, always starting with a slash and without a trailing one.
  pub fn base_path(&self) -> String {
    let path = self.path.as_deref().unwrap_or(&self.name);
    format!("/{}", path.trim_matches('/'))
  }

  pub fn tag_type(&self) -> String {
    if let Some(tag) = &self.tag {
      return tag.clone();
    }
    let mut chars = self.name.chars();
    match chars.next() {
      Some(first) => first.to_uppercase().chain(chars).collect(),
      None => String::new(),
    }
  }

  pub fn id_field(&self) -> &str {
    &self.id_field
  }

  /// Tags a committed write makes stale: the entity itself (if any), the
  /// resource's lists and the lists of related resources.
  pub fn invalidation_tags(&self, id: Option<&EntityId>) -> Vec<Tag> {
    let tag_type = self.tag_type();
    let mut tags = Vec::with_capacity(self.related.len() + 2);
    if let Some(id) = id {
      tags.push(Tag::item(tag_type.clone(), id));
    }
    tags.push(Tag::list(tag_type));
    tags.extend(self.related.iter().map(Tag::list));
    tags
  }

  fn item_path(&self, id: &EntityId) -> String {
    format!("{}/{}", self.base_path(), id)
  }
}

/// A decoded list page.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
  pub items: Vec<T>,
  pub meta: PageMeta,
}

/// Typed operations for one resource. Cheap to clone.
pub struct Resource<T> {
  store: Store,
  config: Arc<ResourceConfig>,
  _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Resource<T> {
  fn clone(&self) -> Self {
    Self {
      store: self.store.clone(),
      config: Arc::clone(&self.config),
      _marker: PhantomData,
    }
  }
}

impl<T> Resource<T> {
  pub(crate) fn new(store: Store, config: ResourceConfig) -> Self {
    Self {
      store,
      config: Arc::new(config),
      _marker: PhantomData,
    }
  }

  pub fn config(&self) -> &ResourceConfig {
    &self.config
  }

  /// Drop everything cached for this resource type.
  pub fn clear(&self) {
    self.store.clear(self.config.resource_type());
  }

  fn list_fetcher(&self, page: u32, limit: u32) -> Fetcher {
    let transport = self.store.transport();
    let config = Arc::clone(&self.config);

    Arc::new(move || {
      let transport = Arc::clone(&transport);
      let config = Arc::clone(&config);
      async move {
        let request = ApiRequest::get(config.base_path())
          .with_query("page", page)
          .with_query("limit", limit)
          .with_auth(config.auth_reads);
        let envelope = transport.execute(request).await?;

        let items = match envelope.data {
          Value::Array(items) => items,
          Value::Null => Vec::new(),
          other => {
            return Err(TransportError::Decode(format!(
              "expected a list of {}, got {}",
              config.name, other
            )))
          }
        };
        let meta = envelope.meta.unwrap_or(PageMeta {
          page,
          limit,
          total: items.len() as u64,
        });

        let tag_type = config.tag_type();
        let tags = items
          .iter()
          .filter_map(|item| EntityId::from_entity(item, config.id_field()))
          .map(|id| Tag::item(tag_type.clone(), id))
          .collect();

        Ok(Fetched {
          payload: Payload::Page { items, meta },
          tags,
        })
      }
      .boxed()
    })
  }

  fn item_fetcher(&self, id: EntityId) -> Fetcher {
    let transport = self.store.transport();
    let config = Arc::clone(&self.config);

    Arc::new(move || {
      let transport = Arc::clone(&transport);
      let config = Arc::clone(&config);
      let id = id.clone();
      async move {
        let request = ApiRequest::get(config.item_path(&id)).with_auth(config.auth_reads);
        let envelope = transport.execute(request).await?;
        if envelope.data.is_null() {
          return Err(TransportError::Decode(format!(
            "no data for {} {}",
            config.name, id
          )));
        }
        Ok(Fetched {
          payload: Payload::Item(envelope.data),
          tags: Vec::new(),
        })
      }
      .boxed()
    })
  }
}

impl<T> Resource<T>
where
  T: Serialize + DeserializeOwned,
{
  /// Read one page of the collection.
  pub async fn list(&self, page: u32, limit: u32) -> Result<CacheResult<Page<T>>> {
    let key = QueryKey::list(self.config.resource_type(), page, limit);
    let tags = vec![Tag::list(self.config.tag_type())];

    let result = self
      .store
      .coordinator()
      .read(key, tags, self.list_fetcher(page, limit))
      .await?;
    result.try_map(|payload| self.decode_page(payload))
  }

  /// Read one entity.
  pub async fn get_by_id(&self, id: impl Into<EntityId>) -> Result<CacheResult<T>> {
    let id = id.into();
    let key = QueryKey::item(self.config.resource_type(), id.clone());
    let tags = vec![Tag::item(self.config.tag_type(), id.clone())];

    let result = self
      .store
      .coordinator()
      .read(key, tags, self.item_fetcher(id))
      .await?;
    result.try_map(|payload| self.decode_item(payload))
  }

  /// Create an entity. Lists are invalidated once the server confirms it;
  /// nothing is inserted speculatively.
  pub async fn create<P: Serialize>(&self, payload: &P) -> Result<T> {
    let body = encode(payload)?;
    let request = ApiRequest::post(self.config.base_path())
      .with_body(body.clone())
      .with_auth(self.config.auth_writes);

    let envelope = self
      .store
      .mutations()
      .mutate(&self.config, MutationKind::Create, body, request)
      .await?;
    self.decode(envelope.data)
  }

  /// Update an entity. The patch is visible in the cache right away and
  /// rolled back if the server rejects it.
  pub async fn update<P: Serialize>(&self, id: impl Into<EntityId>, payload: &P) -> Result<T> {
    let id = id.into();
    let body = encode(payload)?;
    let request = ApiRequest::patch(self.config.item_path(&id))
      .with_body(body.clone())
      .with_auth(self.config.auth_writes);

    let envelope = self
      .store
      .mutations()
      .mutate(&self.config, MutationKind::Update(id.clone()), body, request)
      .await?;

    if envelope.data.is_null() {
      // Server sent no body back; the committed cache entry is the result
      if let Some(Payload::Item(data)) = self
        .store
        .coordinator()
        .peek(&QueryKey::item(self.config.resource_type(), id))
      {
        return self.decode(data);
      }
    }
    self.decode(envelope.data)
  }

  /// Delete an entity. It disappears from cached pages right away and comes
  /// back if the server rejects the delete.
  pub async fn delete(&self, id: impl Into<EntityId>) -> Result<()> {
    let id = id.into();
    let request = ApiRequest::delete(self.config.item_path(&id)).with_auth(self.config.auth_writes);

    self
      .store
      .mutations()
      .mutate(&self.config, MutationKind::Delete(id), Value::Null, request)
      .await?;
    Ok(())
  }

  /// Cached entity without touching the network.
  pub fn peek(&self, id: impl Into<EntityId>) -> Option<T> {
    let key = QueryKey::item(self.config.resource_type(), id.into());
    match self.store.coordinator().peek(&key)? {
      Payload::Item(data) => self.decode(data).ok(),
      Payload::Page { .. } => None,
    }
  }

  /// Cached page without touching the network.
  pub fn peek_list(&self, page: u32, limit: u32) -> Option<Page<T>> {
    let key = QueryKey::list(self.config.resource_type(), page, limit);
    self
      .store
      .coordinator()
      .peek(&key)
      .and_then(|payload| self.decode_page(payload).ok())
  }

  fn decode<D: DeserializeOwned>(&self, data: Value) -> Result<D> {
    serde_json::from_value(data).map_err(|err| Error::Decode {
      resource: self.config.name.clone(),
      message: err.to_string(),
    })
  }

  fn decode_item(&self, payload: Payload) -> Result<T> {
    match payload {
      Payload::Item(data) => self.decode(data),
      Payload::Page { .. } => Err(self.shape_error("item", "page")),
    }
  }

  fn decode_page(&self, payload: Payload) -> Result<Page<T>> {
    match payload {
      Payload::Page { items, meta } => Ok(Page {
        items: items
          .into_iter()
          .map(|item| self.decode(item))
          .collect::<Result<_>>()?,
        meta,
      }),
      Payload::Item(_) => Err(self.shape_error("page", "item")),
    }
  }

  fn shape_error(&self, expected: &str, got: &str) -> Error {
    Error::Decode {
      resource: self.config.name.clone(),
      message: format!("expected {} payload, got {}", expected, got),
    }
  }
}

fn encode<P: Serialize>(payload: &P) -> Result<Value> {
  serde_json::to_value(payload).map_err(|err| Error::Encode(err.to_string()))
}
