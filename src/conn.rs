//! Per-client connection state
//!
//! A [`ConnContext`] is created for every accepted socket and owns both
//! sides of the relay: the client record (mutated only while the
//! interceptor completes a handshake) and the lazily attached upstream
//! connection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::BufReader;
use tokio::sync::{Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::flow::Request;
use crate::stream::{MaybeTlsStream, WireStats};
use crate::upstream::{self, TlsClient, UpstreamSelector};

static CONN_IDS: AtomicU64 = AtomicU64::new(1);

/// The accepted client socket's metadata.
#[derive(Debug)]
pub struct ClientConn {
  /// Remote address of the client
  pub peer_addr: SocketAddr,
  tls: AtomicBool,
  sni: StdMutex<Option<String>>,
}

impl ClientConn {
  /// True once the interceptor has TLS-terminated this socket.
  pub fn is_tls(&self) -> bool {
    self.tls.load(Ordering::Acquire)
  }

  /// SNI hostname negotiated during interception, if any.
  pub fn sni(&self) -> Option<String> {
    self.sni.lock().expect("sni lock").clone()
  }

  pub(crate) fn set_tls(&self, sni: Option<String>) {
    *self.sni.lock().expect("sni lock") = sni;
    self.tls.store(true, Ordering::Release);
  }
}

/// The upstream side of a context, recorded on the first successful dial.
#[derive(Debug, Clone)]
pub struct ServerConn {
  /// `host:port` actually dialed (the upstream proxy when one applies)
  pub address: String,
  /// Wire byte counters of the dialed socket
  pub stats: WireStats,
}

/// An established, reusable upstream HTTP/1.1 connection, bound to one
/// origin target.
pub(crate) struct ConnectedUpstream {
  /// Buffered stream; writes pass through the buffer untouched
  pub io: BufReader<MaybeTlsStream>,
  /// `host:port` of the origin this connection serves
  pub target: String,
  /// Requests must be written in absolute form (plain HTTP via a proxy)
  pub absolute_form: bool,
  /// Per-request proxy credentials in absolute form
  pub proxy_auth: Option<http::HeaderValue>,
}

/// Configuration and state of the upstream leg for one context.
pub(crate) struct UpstreamLink {
  selector: Arc<UpstreamSelector>,
  tls_client: TlsClient,
  https: bool,
  connected: Option<ConnectedUpstream>,
}

impl UpstreamLink {
  /// Establish the upstream connection for `req` if not yet connected to
  /// the request's origin. A keep-alive client that switches hosts between
  /// flows forces a redial; the connection is bound to one target.
  /// Returns true when a new dial was performed.
  pub async fn ensure_connected(&mut self, req: &Request, ctx: &ConnContext) -> Result<bool> {
    let host = req
      .host()
      .ok_or_else(|| Error::upstream("request has no host to dial"))?
      .to_string();
    let port = req.port();
    let target = format!("{}:{}", host, port);
    match &self.connected {
      Some(conn) if conn.target == target => return Ok(false),
      Some(_) => {
        tracing::debug!(conn = ctx.id, target = %target, "origin changed, redialing");
        self.disconnect();
      }
      None => {}
    }
    let proxy = self
      .selector
      .resolve(req)
      .map_err(|e| Error::upstream(format!("upstream resolution failed: {}", e)))?;
    let dialed = upstream::dial(&host, port, self.https, proxy.as_ref(), &self.tls_client).await?;
    tracing::debug!(
      conn = ctx.id,
      address = %dialed.address,
      https = self.https,
      "upstream connected"
    );
    ctx.attach_server(ServerConn {
      address: dialed.address,
      stats: dialed.stats,
    });
    self.connected = Some(ConnectedUpstream {
      io: BufReader::new(dialed.stream),
      target,
      absolute_form: dialed.absolute_form,
      proxy_auth: dialed.proxy_auth,
    });
    Ok(true)
  }

  /// The established connection. Call after `ensure_connected`.
  pub fn connection(&mut self) -> Result<&mut ConnectedUpstream> {
    self
      .connected
      .as_mut()
      .ok_or_else(|| Error::upstream("upstream not connected"))
  }

  /// Drop the connection so the next flow dials fresh.
  pub fn disconnect(&mut self) {
    self.connected = None;
  }
}

/// Per-client-connection state: the client record plus the lazily attached
/// upstream. Owned exclusively by the connection's task; lives from accept
/// to socket close.
pub struct ConnContext {
  /// Monotonic connection id, unique within the process
  pub id: u64,
  /// The client side
  pub client: ClientConn,
  server: StdMutex<Option<ServerConn>>,
  upstream: Mutex<Option<UpstreamLink>>,
}

impl ConnContext {
  /// Create a context for an accepted socket.
  pub fn new(peer_addr: SocketAddr) -> Arc<Self> {
    Arc::new(Self {
      id: CONN_IDS.fetch_add(1, Ordering::Relaxed),
      client: ClientConn {
        peer_addr,
        tls: AtomicBool::new(false),
        sni: StdMutex::new(None),
      },
      server: StdMutex::new(None),
      upstream: Mutex::new(None),
    })
  }

  /// The upstream record, reflecting the most recent dial.
  pub fn server(&self) -> Option<ServerConn> {
    self.server.lock().expect("server lock").clone()
  }

  fn attach_server(&self, server: ServerConn) {
    *self.server.lock().expect("server lock") = Some(server);
  }

  /// Prepare the upstream leg for plain-HTTP origins. No-op when already
  /// initialized or when the client socket has been TLS-terminated.
  pub(crate) async fn init_http_upstream(
    &self,
    ssl_insecure: bool,
    selector: Arc<UpstreamSelector>,
  ) -> Result<()> {
    if self.client.is_tls() {
      return Ok(());
    }
    self.init_upstream(ssl_insecure, selector, false).await
  }

  /// Prepare the upstream leg for HTTPS origins. No-op when already
  /// initialized or when the client socket is not TLS-terminated.
  pub(crate) async fn init_https_upstream(
    &self,
    ssl_insecure: bool,
    selector: Arc<UpstreamSelector>,
  ) -> Result<()> {
    if !self.client.is_tls() {
      return Ok(());
    }
    self.init_upstream(ssl_insecure, selector, true).await
  }

  async fn init_upstream(
    &self,
    ssl_insecure: bool,
    selector: Arc<UpstreamSelector>,
    https: bool,
  ) -> Result<()> {
    let mut guard = self.upstream.lock().await;
    if guard.is_some() {
      return Ok(());
    }
    *guard = Some(UpstreamLink {
      selector,
      tls_client: TlsClient::new(ssl_insecure)?,
      https,
      connected: None,
    });
    Ok(())
  }

  /// Exclusive access to the upstream leg; flows on one connection are
  /// serialized, so this lock is uncontended in practice.
  pub(crate) async fn upstream(&self) -> MutexGuard<'_, Option<UpstreamLink>> {
    self.upstream.lock().await
  }
}

impl std::fmt::Debug for ConnContext {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ConnContext")
      .field("id", &self.id)
      .field("peer_addr", &self.client.peer_addr)
      .field("tls", &self.client.is_tls())
      .field("server", &self.server())
      .finish()
  }
}
