//! Bidirectional index between cache tags and the queries that provide them.

use std::collections::{HashMap, HashSet};

use super::traits::{QueryKey, Tag};

/// Tag ↔ query bookkeeping plus the set of invalidated queries.
///
/// Invalidation only marks queries stale. Refetching is up to the caller.
#[derive(Debug, Default)]
pub struct InvalidationGraph {
  by_tag: HashMap<Tag, HashSet<QueryKey>>,
  by_query: HashMap<QueryKey, HashSet<Tag>>,
  stale: HashSet<QueryKey>,
}

impl InvalidationGraph {
  pub fn new() -> Self {
    Self::default()
  }

  /// Record that `key` depends on `tags`, replacing its previous tag set.
  pub fn provide(&mut self, key: &QueryKey, tags: impl IntoIterator<Item = Tag>) {
    self.detach(key);

    let tags: HashSet<Tag> = tags.into_iter().collect();
    for tag in &tags {
      self
        .by_tag
        .entry(tag.clone())
        .or_default()
        .insert(key.clone());
    }
    self.by_query.insert(key.clone(), tags);
  }

  /// Mark every query reachable from `tags` stale and return those queries.
  pub fn invalidate<'a>(&mut self, tags: impl IntoIterator<Item = &'a Tag>) -> Vec<QueryKey> {
    let mut affected: Vec<QueryKey> = Vec::new();
    for tag in tags {
      if let Some(keys) = self.by_tag.get(tag) {
        for key in keys {
          if !affected.contains(key) {
            affected.push(key.clone());
          }
        }
      }
    }

    self.stale.extend(affected.iter().cloned());
    affected
  }

  /// Forget a query entirely.
  pub fn unregister(&mut self, key: &QueryKey) {
    self.detach(key);
    self.stale.remove(key);
  }

  pub fn is_registered(&self, key: &QueryKey) -> bool {
    self.by_query.contains_key(key)
  }

  pub fn is_stale(&self, key: &QueryKey) -> bool {
    self.stale.contains(key)
  }

  pub fn mark_fresh(&mut self, key: &QueryKey) {
    self.stale.remove(key);
  }

  pub fn tags_for(&self, key: &QueryKey) -> Option<&HashSet<Tag>> {
    self.by_query.get(key)
  }

  pub fn queries_for(&self, tag: &Tag) -> Vec<QueryKey> {
    self
      .by_tag
      .get(tag)
      .map(|keys| keys.iter().cloned().collect())
      .unwrap_or_default()
  }

  /// Registered queries belonging to `resource`.
  pub fn queries_of(&self, resource: &str) -> Vec<QueryKey> {
    self
      .by_query
      .keys()
      .filter(|key| key.resource() == resource)
      .cloned()
      .collect()
  }

  pub fn clear(&mut self) {
    self.by_tag.clear();
    self.by_query.clear();
    self.stale.clear();
  }

  fn detach(&mut self, key: &QueryKey) {
    let Some(tags) = self.by_query.remove(key) else {
      return;
    };
    for tag in tags {
      if let Some(keys) = self.by_tag.get_mut(&tag) {
        keys.remove(key);
        if keys.is_empty() {
          self.by_tag.remove(&tag);
        }
      }
    }
  }
}
