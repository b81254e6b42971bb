//! Flow records: the request/response pair addons observe

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode, Uri, Version};

use crate::conn::ConnContext;
use crate::error::{Error, Result};

static FLOW_IDS: AtomicU64 = AtomicU64::new(1);

/// An HTTP request travelling through the proxy.
///
/// The URI is always absolute: scheme and authority are filled in from the
/// request line, the tunnel target, or the `Host` header. The body holds the
/// exact bytes received; encodings are never touched.
#[derive(Debug, Clone)]
pub struct Request {
  /// Request method
  pub method: Method,
  /// Absolute request URI
  pub uri: Uri,
  /// Protocol version
  pub version: Version,
  /// Request headers as received (hop-by-hop headers are stripped only at
  /// the point of forwarding, so addons see the original set)
  pub headers: HeaderMap<HeaderValue>,
  /// Raw body bytes; empty in streaming mode
  pub body: Bytes,
}

impl Request {
  /// Host component of the request URI.
  pub fn host(&self) -> Option<&str> {
    self.uri.host()
  }

  /// Port of the request URI, defaulting from the scheme when absent.
  pub fn port(&self) -> u16 {
    self
      .uri
      .port_u16()
      .unwrap_or(if self.is_https() { 443 } else { 80 })
  }

  /// Whether the request targets an HTTPS origin.
  pub fn is_https(&self) -> bool {
    self.uri.scheme_str() == Some("https")
  }

  /// `host:port` of the origin this request should be dialed to.
  pub fn host_port(&self) -> Result<String> {
    let host = self
      .host()
      .ok_or_else(|| Error::invalid_request("request uri has no host"))?;
    Ok(format!("{}:{}", host, self.port()))
  }
}

/// An HTTP response travelling through the proxy.
#[derive(Debug, Clone)]
pub struct Response {
  /// Protocol version
  pub version: Version,
  /// Status code
  pub status: StatusCode,
  /// Response headers
  pub headers: HeaderMap<HeaderValue>,
  /// Raw body bytes; empty in streaming mode
  pub body: Bytes,
}

impl Response {
  /// Build a response with the given status and a plain-text body.
  pub fn with_body(status: StatusCode, body: impl Into<Bytes>) -> Self {
    let body = body.into();
    let mut headers = HeaderMap::new();
    headers.insert(
      http::header::CONTENT_TYPE,
      HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    Self {
      version: Version::HTTP_11,
      status,
      headers,
      body,
    }
  }

  /// Synthesize the `502 Bad Gateway` returned when the origin leg fails.
  pub fn bad_gateway(reason: impl AsRef<str>) -> Self {
    Self::with_body(
      StatusCode::BAD_GATEWAY,
      format!("waylay: upstream request failed: {}\n", reason.as_ref()),
    )
  }
}

/// Direction of a streamed body chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDirection {
  /// Request body, client towards origin
  ClientToServer,
  /// Response body, origin towards client
  ServerToClient,
}

/// One request paired with its response (or synthetic failure).
///
/// Created when a full request head has been received, mutated as addon
/// hooks fire, closed when the response has been fully relayed or the
/// connection aborts.
#[derive(Debug)]
pub struct Flow {
  /// Monotonic flow id, unique within the process
  pub id: u64,
  /// The client request
  pub request: Request,
  /// The response; `None` until the origin answers or an addon plants one
  pub response: Option<Response>,
  /// True once a body crossed the buffering threshold
  pub streaming: bool,
  conn: Arc<ConnContext>,
}

impl Flow {
  /// Create a flow bound to its connection context.
  pub fn new(conn: Arc<ConnContext>, request: Request) -> Self {
    Self {
      id: FLOW_IDS.fetch_add(1, Ordering::Relaxed),
      request,
      response: None,
      streaming: false,
      conn,
    }
  }

  /// The connection context this flow belongs to.
  pub fn conn(&self) -> &Arc<ConnContext> {
    &self.conn
  }
}

const HOP_BY_HOP: [HeaderName; 9] = [
  http::header::CONNECTION,
  HeaderName::from_static("proxy-connection"),
  http::header::PROXY_AUTHENTICATE,
  HeaderName::from_static("proxy-authorization"),
  HeaderName::from_static("keep-alive"),
  http::header::TRANSFER_ENCODING,
  http::header::TE,
  http::header::TRAILER,
  http::header::UPGRADE,
];

/// Remove hop-by-hop headers, including any header named by `Connection`.
/// The `Host` header is never touched.
pub fn strip_hop_by_hop(headers: &mut HeaderMap<HeaderValue>) {
  let named: Vec<HeaderName> = headers
    .get_all(http::header::CONNECTION)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .filter_map(|token| HeaderName::try_from(token.trim()).ok())
    .collect();
  for name in named {
    headers.remove(&name);
  }
  for name in &HOP_BY_HOP {
    headers.remove(name);
  }
}

/// Whether the sender of these headers asked for the connection to close.
pub(crate) fn wants_close(headers: &HeaderMap<HeaderValue>, version: Version) -> bool {
  let close = headers
    .get_all(http::header::CONNECTION)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .any(|token| token.trim().eq_ignore_ascii_case("close"));
  if version <= Version::HTTP_10 {
    // HTTP/1.0 closes unless keep-alive is explicit
    let keep_alive = headers
      .get_all(http::header::CONNECTION)
      .iter()
      .filter_map(|v| v.to_str().ok())
      .flat_map(|v| v.split(','))
      .any(|token| token.trim().eq_ignore_ascii_case("keep-alive"));
    return close || !keep_alive;
  }
  close
}
