//! Error types for the capture proxy

use std::io;
use thiserror::Error as ThisError;

/// Boxed error returned by user supplied interceptors.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A `Result` alias where the `Err` case is `slinger_wire::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// The errors that may occur while running or querying the capture proxy.
#[derive(ThisError, Debug)]
pub enum Error {
  /// Options that cannot work together, detected before anything is started
  #[error("configuration error: {0}")]
  Configuration(String),

  /// The proxy has not been started yet, or has already been shut down
  #[error("proxy is not running")]
  NotRunning,

  /// The listen address could not be bound
  #[error("failed to bind {addr}: {source}")]
  Bind {
    /// Address the proxy tried to listen on
    addr: String,
    /// Underlying socket error
    #[source]
    source: io::Error,
  },

  /// A blocking wait ran past the caller's deadline
  #[error("{0}")]
  Timeout(String),

  /// A body could not be decoded with the advertised content encoding
  #[error("unable to decode {encoding} body: {reason}")]
  Decode {
    /// Content encoding that failed
    encoding: String,
    /// What went wrong
    reason: String,
  },

  /// An HTTP status code outside of 100..=599
  #[error("invalid status code: {0}")]
  InvalidStatus(u16),

  /// Error raised by a request or response interceptor
  #[error("interceptor failed: {0}")]
  Interceptor(BoxError),

  /// IO error
  #[error("IO error: {0}")]
  Io(io::Error),

  /// TLS error
  #[error("TLS error: {0}")]
  Tls(String),

  /// Certificate error
  #[error("certificate error: {0}")]
  Certificate(String),

  /// Malformed HTTP traffic
  #[error("invalid request: {0}")]
  InvalidRequest(String),

  /// Upstream connection failure
  #[error("connection error: {0}")]
  Connection(String),

  /// Invalid scope or search pattern
  #[error(transparent)]
  Pattern(#[from] regex::Error),

  /// Capture records could not be (de)serialized
  #[error("serialization error: {0}")]
  Serialization(String),
}

impl Error {
  /// Create a configuration error and log it
  pub fn configuration(msg: impl Into<String>) -> Self {
    let error = Error::Configuration(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a certificate error and log it
  pub fn certificate_error(msg: impl Into<String>) -> Self {
    let error = Error::Certificate(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a TLS error and log it
  pub fn tls_error(msg: impl Into<String>) -> Self {
    let error = Error::Tls(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create an invalid request error
  ///
  /// Malformed client traffic is common enough that it is only logged at debug level.
  pub fn invalid_request(msg: impl Into<String>) -> Self {
    let error = Error::InvalidRequest(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Create a connection error and log it
  pub fn connection_error(msg: impl Into<String>) -> Self {
    let error = Error::Connection(msg.into());
    tracing::warn!("{}", error);
    error
  }

  /// Create a decoding error for the given content encoding
  pub fn decode(encoding: impl Into<String>, reason: impl ToString) -> Self {
    Error::Decode {
      encoding: encoding.into(),
      reason: reason.to_string(),
    }
  }

  /// Create a bind error for the given listen address
  pub fn bind(addr: impl Into<String>, source: io::Error) -> Self {
    let error = Error::Bind {
      addr: addr.into(),
      source,
    };
    tracing::error!("{}", error);
    error
  }
}

impl From<io::Error> for Error {
  fn from(value: io::Error) -> Self {
    Error::Io(value)
  }
}

impl From<serde_json::Error> for Error {
  fn from(value: serde_json::Error) -> Self {
    Error::Serialization(value.to_string())
  }
}

impl From<toml::de::Error> for Error {
  fn from(value: toml::de::Error) -> Self {
    Error::configuration(value.to_string())
  }
}

impl From<url::ParseError> for Error {
  fn from(value: url::ParseError) -> Self {
    Error::invalid_request(format!("invalid url: {}", value))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_bind_error_keeps_source() {
    let err = Error::bind(
      "127.0.0.1:8080",
      io::Error::new(io::ErrorKind::AddrInUse, "address in use"),
    );
    assert!(matches!(err, Error::Bind { .. }));
    assert!(err.to_string().contains("127.0.0.1:8080"));
    assert!(std::error::Error::source(&err).is_some());
  }

  #[test]
  fn test_decode_error_message() {
    let err = Error::decode("gzip", "invalid header");
    assert_eq!(err.to_string(), "unable to decode gzip body: invalid header");
  }
}
