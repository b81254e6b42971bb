//! Public-facing listener
//!
//! Accepts client sockets, serves absolute-URI proxy requests directly,
//! routes `CONNECT` tunnels into the interceptor or a raw byte splice, and
//! implements the two shutdown modes: immediate abort and graceful drain.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use bytes::Bytes;
use http::Method;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Notify};

use crate::conn::ConnContext;
use crate::error::{Error, Result};
use crate::flow::{Request, Response};
use crate::handler::{self, ProxyCore};
use crate::http1::{self, RequestHead};
use crate::interceptor;
use crate::stream::PrefixedStream;
use crate::upstream::{self, TlsClient};

const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Listener lifecycle state shared with the public proxy handle.
pub(crate) struct ServerState {
  refusing: watch::Sender<bool>,
  abort: watch::Sender<bool>,
  active: AtomicUsize,
  drained: Notify,
  local_addr: StdMutex<Option<SocketAddr>>,
  closed: AtomicBool,
}

impl ServerState {
  pub fn new() -> Arc<Self> {
    let (refusing, _) = watch::channel(false);
    let (abort, _) = watch::channel(false);
    Arc::new(Self {
      refusing,
      abort,
      active: AtomicUsize::new(0),
      drained: Notify::new(),
      local_addr: StdMutex::new(None),
      closed: AtomicBool::new(false),
    })
  }

  /// Address the listener is bound to, once running.
  pub fn local_addr(&self) -> Option<SocketAddr> {
    *self.local_addr.lock().expect("local_addr lock")
  }

  /// Abort everything immediately. Safe to call repeatedly.
  pub fn close(&self) {
    if self.closed.swap(true, Ordering::SeqCst) {
      return;
    }
    self.refusing.send_replace(true);
    self.abort.send_replace(true);
  }

  /// Refuse new connections, wait for in-flight ones to drain until the
  /// deadline, then abort the remainder. Safe to call repeatedly.
  pub async fn shutdown(&self, timeout: Duration) {
    if self.closed.swap(true, Ordering::SeqCst) {
      return;
    }
    self.refusing.send_replace(true);
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
      let notified = self.drained.notified();
      if self.active.load(Ordering::SeqCst) == 0 {
        break;
      }
      let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
      if remaining.is_zero() {
        break;
      }
      let _ = tokio::time::timeout(remaining, notified).await;
    }
    self.abort.send_replace(true);
  }
}

/// The accept loop. Returns when the proxy is closed or shut down.
pub(crate) async fn run(addr: &str, core: Arc<ProxyCore>, state: Arc<ServerState>) -> Result<()> {
  let listener = TcpListener::bind(addr)
    .await
    .map_err(|e| Error::proxy(format!("failed to bind {}: {}", addr, e)))?;
  let local = listener
    .local_addr()
    .map_err(|e| Error::proxy(format!("listener address: {}", e)))?;
  *state.local_addr.lock().expect("local_addr lock") = Some(local);
  tracing::info!(addr = %local, "proxy listening");

  let mut refusing = state.refusing.subscribe();
  loop {
    if *refusing.borrow() {
      break;
    }
    tokio::select! {
      accepted = listener.accept() => match accepted {
        Ok((stream, peer_addr)) => {
          spawn_connection(stream, peer_addr, core.clone(), state.clone());
        }
        Err(e) => {
          tracing::error!("accept failed: {}", e);
        }
      },
      _ = refusing.changed() => {
        if *refusing.borrow() {
          break;
        }
      }
    }
  }
  tracing::info!(addr = %local, "proxy stopped accepting");
  Ok(())
}

fn spawn_connection(
  stream: TcpStream,
  peer_addr: SocketAddr,
  core: Arc<ProxyCore>,
  state: Arc<ServerState>,
) {
  state.active.fetch_add(1, Ordering::SeqCst);
  let mut abort = state.abort.subscribe();
  tokio::spawn(async move {
    let ctx = ConnContext::new(peer_addr);
    core.chain.client_connected(&ctx).await;
    tokio::select! {
      result = handle_connection(&core, &ctx, stream) => {
        if let Err(e) = result {
          tracing::debug!(conn = ctx.id, "connection ended: {}", e);
        }
      }
      _ = aborted(&mut abort) => {
        tracing::debug!(conn = ctx.id, "connection aborted by shutdown");
      }
    }
    core.chain.client_disconnected(&ctx).await;
    if state.active.fetch_sub(1, Ordering::SeqCst) == 1 {
      state.drained.notify_waiters();
    }
  });
}

async fn aborted(abort: &mut watch::Receiver<bool>) {
  loop {
    if *abort.borrow_and_update() {
      return;
    }
    if abort.changed().await.is_err() {
      // sender dropped; never abort on that alone
      std::future::pending::<()>().await;
    }
  }
}

/// Handle one accepted socket: read the first request head, then dispatch
/// to the tunnel paths or the plain flow pipeline.
async fn handle_connection(
  core: &Arc<ProxyCore>,
  ctx: &Arc<ConnContext>,
  mut stream: TcpStream,
) -> Result<()> {
  let (head, leftover) = {
    let mut reader = BufReader::new(&mut stream);
    let head = match http1::read_request_head(&mut reader).await {
      Ok(Some(head)) => head,
      Ok(None) => return Ok(()),
      Err(e) => {
        drop(reader);
        let response = Response::with_body(
          http::StatusCode::BAD_REQUEST,
          "waylay: malformed request\n",
        );
        let _ = handler::write_response(&mut stream, &response, true).await;
        return Err(e);
      }
    };
    let leftover = Bytes::copy_from_slice(reader.buffer());
    (head, leftover)
  };

  if head.method == Method::CONNECT {
    handle_connect(core, ctx, stream, leftover, head).await
  } else {
    let prefixed = PrefixedStream::new(leftover, stream);
    handler::serve_http(core, ctx, prefixed, None, Some(head)).await
  }
}

async fn handle_connect(
  core: &Arc<ProxyCore>,
  ctx: &Arc<ConnContext>,
  mut stream: TcpStream,
  leftover: Bytes,
  head: RequestHead,
) -> Result<()> {
  let target = head.target.clone();
  let (host, port) = interceptor::split_connect_target(&target)?;

  // The interception rule and the upstream resolver both see the CONNECT
  // as a request for the tunnel authority.
  let pseudo = Request {
    method: Method::CONNECT,
    uri: format!("https://{}:{}/", host, port)
      .parse()
      .map_err(|_| Error::invalid_request(format!("bad connect target {:?}", target)))?,
    version: head.version,
    headers: head.headers,
    body: Bytes::new(),
  };

  if core.intercepts(&pseudo) {
    // Mint before answering so an unmintable host still gets an HTTP error.
    if let Err(e) = core.certs.get_or_create(&host).await {
      let response = Response::bad_gateway(format!("cannot mint certificate for {}: {}", host, e));
      let _ = handler::write_response(&mut stream, &response, true).await;
      return Err(e);
    }
    stream.write_all(CONNECTION_ESTABLISHED).await?;
    stream.flush().await?;
    let prefixed = PrefixedStream::new(leftover, stream);
    interceptor::intercept(core, ctx, prefixed, &target).await
  } else {
    splice_tunnel(core, ctx, stream, leftover, &pseudo, &host, port).await
  }
}

/// Pass-through mode: after `200 Connection Established`, bytes are spliced
/// verbatim between client and origin until either side closes. No flow is
/// created and no addon hooks fire.
async fn splice_tunnel(
  core: &Arc<ProxyCore>,
  ctx: &Arc<ConnContext>,
  mut stream: TcpStream,
  leftover: Bytes,
  pseudo: &Request,
  host: &str,
  port: u16,
) -> Result<()> {
  let proxy = core
    .selector
    .resolve(pseudo)
    .map_err(|e| Error::upstream(format!("upstream resolution failed: {}", e)))?;
  let dialed = match TlsClient::new(core.ssl_insecure) {
    Ok(tls) => upstream::dial_tunnel(host, port, proxy.as_ref(), &tls).await,
    Err(e) => Err(e),
  };
  let (mut origin, address) = match dialed {
    Ok(d) => d,
    Err(Error::ProxyAuth(reason)) => {
      let response = Response::with_body(
        http::StatusCode::PROXY_AUTHENTICATION_REQUIRED,
        format!("waylay: {}\n", reason),
      );
      let _ = handler::write_response(&mut stream, &response, true).await;
      return Err(Error::ProxyAuth(reason));
    }
    Err(e) => {
      let response = Response::bad_gateway(e.to_string());
      let _ = handler::write_response(&mut stream, &response, true).await;
      return Err(e);
    }
  };
  tracing::debug!(conn = ctx.id, address = %address, "tunnel pass-through");

  stream.write_all(CONNECTION_ESTABLISHED).await?;
  stream.flush().await?;
  if !leftover.is_empty() {
    origin.write_all(&leftover).await?;
  }

  let (mut client_read, mut client_write) = stream.split();
  let (mut origin_read, mut origin_write) = tokio::io::split(origin);
  let client_to_origin = tokio::io::copy(&mut client_read, &mut origin_write);
  let origin_to_client = tokio::io::copy(&mut origin_read, &mut client_write);
  tokio::select! {
    _ = client_to_origin => {},
    _ = origin_to_client => {},
  }
  Ok(())
}
