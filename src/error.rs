//! Error types for the proxy

use std::io;
use thiserror::Error;

/// A `Result` alias where the `Err` case is `waylay::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// The errors that may occur while proxying traffic.
#[derive(Error, Debug)]
pub enum Error {
  /// IO error
  #[error("io error: {0}")]
  Io(#[from] io::Error),

  /// Certificate generation or loading error
  #[error("certificate error: {0}")]
  Certificate(String),

  /// TLS handshake or configuration error
  #[error("tls error: {0}")]
  Tls(String),

  /// HTTP type construction error
  #[error(transparent)]
  Http(http::Error),

  /// Malformed or oversized request from the client
  #[error("invalid request: {0}")]
  InvalidRequest(String),

  /// Client connection failure
  #[error("connection error: {0}")]
  Connection(String),

  /// Origin-side transport failure (DNS, dial, TLS, read/write)
  #[error("upstream error: {0}")]
  Upstream(String),

  /// Upstream proxy rejected our authentication
  #[error("upstream proxy rejected authentication: {0}")]
  ProxyAuth(String),

  /// An addon hook failed; the affected flow is aborted
  #[error("addon error: {0}")]
  Addon(String),

  /// Listener or configuration failure
  #[error("proxy error: {0}")]
  Proxy(String),
}

impl Error {
  /// Create a certificate error and log it
  pub fn certificate(msg: impl Into<String>) -> Self {
    let error = Error::Certificate(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a TLS error and log it
  pub fn tls(msg: impl Into<String>) -> Self {
    let error = Error::Tls(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Create an invalid request error and log it
  pub fn invalid_request(msg: impl Into<String>) -> Self {
    let error = Error::InvalidRequest(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Create a connection error and log it
  pub fn connection(msg: impl Into<String>) -> Self {
    let error = Error::Connection(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Create an upstream transport error and log it
  pub fn upstream(msg: impl Into<String>) -> Self {
    let error = Error::Upstream(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Create an addon error and log it
  pub fn addon(msg: impl Into<String>) -> Self {
    let error = Error::Addon(msg.into());
    tracing::warn!("{}", error);
    error
  }

  /// Create a proxy error and log it
  pub fn proxy(msg: impl Into<String>) -> Self {
    let error = Error::Proxy(msg.into());
    tracing::error!("{}", error);
    error
  }
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    Error::Http(value)
  }
}

impl From<http::uri::InvalidUri> for Error {
  fn from(value: http::uri::InvalidUri) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::header::InvalidHeaderValue> for Error {
  fn from(value: http::header::InvalidHeaderValue) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<tokio_rustls::rustls::Error> for Error {
  fn from(value: tokio_rustls::rustls::Error) -> Self {
    Error::Tls(value.to_string())
  }
}
