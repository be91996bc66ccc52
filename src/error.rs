use crate::api::TransportError;

/// Errors returned by store and resource operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
  #[error(transparent)]
  Transport(#[from] TransportError),
  /// Response data did not match the resource's entity type
  #[error("Failed to decode {resource} data: {message}")]
  Decode { resource: String, message: String },
  #[error("Failed to encode request body: {0}")]
  Encode(String),
  #[error("Invalid configuration: {0}")]
  Config(String),
  #[error("Store has been disposed")]
  Disposed,
}

impl Error {
  /// The transport failure behind this error, if any.
  pub fn transport(&self) -> Option<&TransportError> {
    match self {
      Self::Transport(err) => Some(err),
      _ => None,
    }
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
