use super::types::{ErrorEnvelope, ErrorMessage};

/// Failures the transport reports as values.
///
/// Clone so one failed request can be handed to every caller that was
/// deduplicated onto it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
  /// No response was received
  #[error("Network error: {0}")]
  Network(String),
  #[error("Request timed out")]
  Timeout,
  /// 4xx/5xx response with an error envelope
  #[error("Server error ({status}): {message}")]
  Server { status: u16, message: String },
  /// Error envelope carrying field-level `errorMessages`
  #[error("Validation error ({status}): {message}")]
  Validation {
    status: u16,
    message: String,
    errors: Vec<ErrorMessage>,
  },
  /// 401. Terminal: the caller has to re-authenticate.
  #[error("Unauthorized: {message}")]
  Auth { message: String },
  /// 2xx response whose body is not a valid envelope
  #[error("Invalid response body: {0}")]
  Decode(String),
}

impl TransportError {
  /// HTTP status of the response, when there was one.
  pub fn status(&self) -> Option<u16> {
    match self {
      Self::Server { status, .. } | Self::Validation { status, .. } => Some(*status),
      Self::Auth { .. } => Some(401),
      Self::Network(_) | Self::Timeout | Self::Decode(_) => None,
    }
  }

  pub fn is_auth(&self) -> bool {
    matches!(self, Self::Auth { .. })
  }

  /// Render as the `{ success: false, message, errorMessages? }` envelope.
  pub fn envelope(&self) -> ErrorEnvelope {
    let (message, error_messages) = match self {
      Self::Server { message, .. } | Self::Auth { message } => (message.clone(), None),
      Self::Validation {
        message, errors, ..
      } => (message.clone(), Some(errors.clone())),
      other => (other.to_string(), None),
    };

    ErrorEnvelope {
      success: false,
      message,
      error_messages,
    }
  }
}
