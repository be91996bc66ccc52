//! Wire types shared by every resource endpoint.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// HTTP verbs used by the resource endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
  Get,
  Post,
  Patch,
  Delete,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Post => "POST",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
    }
  }
}

impl From<Method> for reqwest::Method {
  fn from(method: Method) -> Self {
    match method {
      Method::Get => reqwest::Method::GET,
      Method::Post => reqwest::Method::POST,
      Method::Patch => reqwest::Method::PATCH,
      Method::Delete => reqwest::Method::DELETE,
    }
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A single HTTP-shaped request, relative to the configured base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
  pub method: Method,
  /// Path below the base URL, always starting with `/`
  pub path: String,
  pub query: Vec<(String, String)>,
  pub body: Option<Value>,
  /// Attach the stored bearer token if one exists
  pub require_auth: bool,
}

impl ApiRequest {
  pub fn new(method: Method, path: impl Into<String>) -> Self {
    Self {
      method,
      path: path.into(),
      query: Vec::new(),
      body: None,
      require_auth: false,
    }
  }

  pub fn get(path: impl Into<String>) -> Self {
    Self::new(Method::Get, path)
  }

  pub fn post(path: impl Into<String>) -> Self {
    Self::new(Method::Post, path)
  }

  pub fn patch(path: impl Into<String>) -> Self {
    Self::new(Method::Patch, path)
  }

  pub fn delete(path: impl Into<String>) -> Self {
    Self::new(Method::Delete, path)
  }

  pub fn with_query(mut self, key: &str, value: impl ToString) -> Self {
    self.query.push((key.to_string(), value.to_string()));
    self
  }

  pub fn with_body(mut self, body: Value) -> Self {
    self.body = Some(body);
    self
  }

  pub fn with_auth(mut self, require_auth: bool) -> Self {
    self.require_auth = require_auth;
    self
  }
}

/// Pagination metadata returned by list endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageMeta {
  pub page: u32,
  pub limit: u32,
  pub total: u64,
}

/// Success envelope: `{ success, message, data, meta? }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
  pub success: bool,
  #[serde(default)]
  pub message: String,
  #[serde(default)]
  pub data: T,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub meta: Option<PageMeta>,
}

impl<T> Envelope<T> {
  pub fn ok(data: T) -> Self {
    Self {
      success: true,
      message: String::new(),
      data,
      meta: None,
    }
  }

  pub fn with_meta(mut self, meta: PageMeta) -> Self {
    self.meta = Some(meta);
    self
  }
}

/// One field-level problem reported by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
  pub path: String,
  pub message: String,
}

/// Error envelope: `{ success: false, message, errorMessages? }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEnvelope {
  #[serde(default)]
  pub success: bool,
  #[serde(default)]
  pub message: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error_messages: Option<Vec<ErrorMessage>>,
}
