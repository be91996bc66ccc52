//! REST transport for the marketplace API.

mod client;
mod error;
mod types;

pub use client::{HttpTransport, Transport, DEFAULT_TIMEOUT};
pub use error::TransportError;
pub use types::{ApiRequest, Envelope, ErrorEnvelope, ErrorMessage, Method, PageMeta};
