use futures::future::{BoxFuture, FutureExt};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::error::{Error, Result};
use crate::storage::{TokenStore, ACCESS_TOKEN_KEY};

use super::error::TransportError;
use super::types::{ApiRequest, Envelope, ErrorEnvelope};

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Executes one request and normalizes the outcome.
///
/// Expected failures come back as `Err(TransportError)`, never as panics, and
/// nothing is retried.
pub trait Transport: Send + Sync {
  fn execute(&self, request: ApiRequest) -> BoxFuture<'_, Result<Envelope<Value>, TransportError>>;
}

/// REST transport backed by reqwest
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
  base_url: Url,
  tokens: Arc<dyn TokenStore>,
}

impl HttpTransport {
  pub fn new(base_url: &str, timeout: Duration, tokens: Arc<dyn TokenStore>) -> Result<Self> {
    let base_url =
      Url::parse(base_url).map_err(|e| Error::Config(format!("Invalid base URL {}: {}", base_url, e)))?;

    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

    Ok(Self {
      client,
      base_url,
      tokens,
    })
  }

  pub fn base_url(&self) -> &Url {
    &self.base_url
  }

  /// Full URL for a request: base + path, then the query pairs.
  fn url_for(&self, request: &ApiRequest) -> Result<Url, TransportError> {
    let joined = format!(
      "{}{}",
      self.base_url.as_str().trim_end_matches('/'),
      request.path
    );
    let mut url = Url::parse(&joined)
      .map_err(|e| TransportError::Network(format!("Invalid request URL {}: {}", joined, e)))?;

    if !request.query.is_empty() {
      url.query_pairs_mut().extend_pairs(&request.query);
    }

    Ok(url)
  }

  fn build_request(&self, request: &ApiRequest) -> Result<reqwest::Request, TransportError> {
    let url = self.url_for(request)?;

    let mut builder = self
      .client
      .request(request.method.into(), url)
      .header(CONTENT_TYPE, "application/json")
      .header(ACCEPT, "application/json");

    if request.require_auth {
      // A missing token is not an error; the server decides
      if let Some(token) = self.tokens.get(ACCESS_TOKEN_KEY) {
        builder = builder.bearer_auth(token);
      }
    }

    if let Some(body) = &request.body {
      builder = builder.json(body);
    }

    builder
      .build()
      .map_err(|e| TransportError::Network(e.to_string()))
  }

  async fn send(&self, request: ApiRequest) -> Result<Envelope<Value>, TransportError> {
    let http_request = self.build_request(&request)?;

    debug!(method = %request.method, path = %request.path, "sending request");

    let response = self
      .client
      .execute(http_request)
      .await
      .map_err(map_reqwest_error)?;

    let status = response.status();
    let body = response.bytes().await.map_err(map_reqwest_error)?;

    if status.as_u16() >= 400 {
      let err = classify_error(status.as_u16(), &body);
      debug!(method = %request.method, path = %request.path, status = status.as_u16(), "request failed");
      return Err(err);
    }

    let envelope: Envelope<Value> =
      serde_json::from_slice(&body).map_err(|e| TransportError::Decode(e.to_string()))?;

    if !envelope.success {
      return Err(TransportError::Server {
        status: status.as_u16(),
        message: envelope.message,
      });
    }

    Ok(envelope)
  }
}

impl Transport for HttpTransport {
  fn execute(&self, request: ApiRequest) -> BoxFuture<'_, Result<Envelope<Value>, TransportError>> {
    self.send(request).boxed()
  }
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
  if err.is_timeout() {
    TransportError::Timeout
  } else {
    TransportError::Network(err.to_string())
  }
}

/// Map a status >= 400 and its body onto the error taxonomy.
pub(crate) fn classify_error(status: u16, body: &[u8]) -> TransportError {
  let envelope = serde_json::from_slice::<ErrorEnvelope>(body).ok();

  let message = envelope
    .as_ref()
    .map(|e| e.message.clone())
    .filter(|m| !m.is_empty())
    .unwrap_or_else(|| {
      StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Request failed")
        .to_string()
    });

  if status == 401 {
    return TransportError::Auth { message };
  }

  match envelope
    .and_then(|e| e.error_messages)
    .filter(|errors| !errors.is_empty())
  {
    Some(errors) => TransportError::Validation {
      status,
      message,
      errors,
    },
    None => TransportError::Server { status, message },
  }
}
