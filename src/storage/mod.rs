//! Key-value storage the transport reads the access token from.
//!
//! Token acquisition (login/signup) happens elsewhere; this layer only
//! persists and hands back whatever was stored under a key.

mod sqlite;

use color_eyre::Result;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

pub use sqlite::SqliteTokenStore;

/// Storage key holding the bearer token.
pub const ACCESS_TOKEN_KEY: &str = "accessToken";

/// Trait for key-value token storage backends.
pub trait TokenStore: Send + Sync {
  /// Read a value. Missing keys and backend failures both yield `None`.
  fn get(&self, key: &str) -> Option<String>;

  /// Store a value, replacing any previous one.
  fn set(&self, key: &str, value: &str) -> Result<()>;

  /// Remove a value. Removing a missing key is not an error.
  fn remove(&self, key: &str) -> Result<()>;
}

/// In-process token storage.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
  values: Mutex<HashMap<String, String>>,
}

impl MemoryTokenStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Store pre-seeded with an access token.
  pub fn with_access_token(token: &str) -> Self {
    let store = Self::new();
    store
      .values
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(ACCESS_TOKEN_KEY.to_string(), token.to_string());
    store
  }
}

impl TokenStore for MemoryTokenStore {
  fn get(&self, key: &str) -> Option<String> {
    self
      .values
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .get(key)
      .cloned()
  }

  fn set(&self, key: &str, value: &str) -> Result<()> {
    self
      .values
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(key.to_string(), value.to_string());
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    self
      .values
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .remove(key);
    Ok(())
  }
}
