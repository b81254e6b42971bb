//! Addon hooks over flows
//!
//! Addons observe and mutate traffic at defined points in a flow's
//! lifecycle. They are installed before the proxy starts and invoked in
//! registration order.

use std::sync::Arc;
use bytes::Bytes;

use crate::conn::ConnContext;
use crate::error::Result;
use crate::flow::{Flow, StreamDirection};

/// Observer/mutator invoked at defined points of a flow.
///
/// All hooks default to no-ops. Connection hooks are infallible; flow hooks
/// may fail, which aborts the affected flow and closes its connection
/// without disturbing other connections.
#[async_trait::async_trait]
pub trait Addon: Send + Sync {
  /// A client socket was accepted.
  async fn client_connected(&self, _ctx: &ConnContext) {}

  /// The client socket closed (fires exactly once per connection).
  async fn client_disconnected(&self, _ctx: &ConnContext) {}

  /// The upstream dial for this connection completed.
  async fn server_connected(&self, _ctx: &ConnContext) {}

  /// The request line and headers have been read; the body has not.
  async fn request_headers(&self, _flow: &mut Flow) -> Result<()> {
    Ok(())
  }

  /// The request is complete (or switched to streaming with an empty body).
  /// Setting `flow.response` here suppresses the upstream dial.
  async fn request(&self, _flow: &mut Flow) -> Result<()> {
    Ok(())
  }

  /// The response status line and headers have been read; the body has not.
  async fn response_headers(&self, _flow: &mut Flow) -> Result<()> {
    Ok(())
  }

  /// The response is complete (or switched to streaming with an empty body).
  async fn response(&self, _flow: &mut Flow) -> Result<()> {
    Ok(())
  }

  /// One chunk of a streamed body passed through. Chunks are observed, not
  /// mutated; earlier bytes are already on the wire.
  async fn stream_chunk(&self, _flow: &Flow, _direction: StreamDirection, _data: &Bytes) {}
}

/// The installed addons, dispatched in registration order.
#[derive(Default)]
pub struct AddonChain {
  addons: Vec<Arc<dyn Addon>>,
}

impl AddonChain {
  /// Create an empty chain.
  pub fn new(addons: Vec<Arc<dyn Addon>>) -> Self {
    Self { addons }
  }

  /// Whether any addons are installed.
  pub fn is_empty(&self) -> bool {
    self.addons.is_empty()
  }

  pub(crate) async fn client_connected(&self, ctx: &ConnContext) {
    for addon in &self.addons {
      addon.client_connected(ctx).await;
    }
  }

  pub(crate) async fn client_disconnected(&self, ctx: &ConnContext) {
    for addon in &self.addons {
      addon.client_disconnected(ctx).await;
    }
  }

  pub(crate) async fn server_connected(&self, ctx: &ConnContext) {
    for addon in &self.addons {
      addon.server_connected(ctx).await;
    }
  }

  pub(crate) async fn request_headers(&self, flow: &mut Flow) -> Result<()> {
    for addon in &self.addons {
      addon.request_headers(flow).await?;
    }
    Ok(())
  }

  pub(crate) async fn request(&self, flow: &mut Flow) -> Result<()> {
    for addon in &self.addons {
      addon.request(flow).await?;
    }
    Ok(())
  }

  pub(crate) async fn response_headers(&self, flow: &mut Flow) -> Result<()> {
    for addon in &self.addons {
      addon.response_headers(flow).await?;
    }
    Ok(())
  }

  pub(crate) async fn response(&self, flow: &mut Flow) -> Result<()> {
    for addon in &self.addons {
      addon.response(flow).await?;
    }
    Ok(())
  }

  pub(crate) async fn stream_chunk(&self, flow: &Flow, direction: StreamDirection, data: &Bytes) {
    for addon in &self.addons {
      addon.stream_chunk(flow, direction, data).await;
    }
  }
}

/// Addon that traces every flow at debug level.
pub struct LogAddon;

#[async_trait::async_trait]
impl Addon for LogAddon {
  async fn client_connected(&self, ctx: &ConnContext) {
    tracing::debug!(conn = ctx.id, peer = %ctx.client.peer_addr, "client connected");
  }

  async fn client_disconnected(&self, ctx: &ConnContext) {
    match ctx.server() {
      Some(server) => tracing::debug!(
        conn = ctx.id,
        rx = server.stats.bytes_read(),
        tx = server.stats.bytes_written(),
        "client disconnected"
      ),
      None => tracing::debug!(conn = ctx.id, "client disconnected"),
    }
  }

  async fn server_connected(&self, ctx: &ConnContext) {
    if let Some(server) = ctx.server() {
      tracing::debug!(conn = ctx.id, address = %server.address, "server connected");
    }
  }

  async fn request(&self, flow: &mut Flow) -> Result<()> {
    tracing::info!(
      flow = flow.id,
      "{} {}",
      flow.request.method,
      flow.request.uri
    );
    Ok(())
  }

  async fn response(&self, flow: &mut Flow) -> Result<()> {
    if let Some(response) = &flow.response {
      tracing::info!(
        flow = flow.id,
        status = response.status.as_u16(),
        bytes = response.body.len(),
        streaming = flow.streaming,
        "response"
      );
    }
    Ok(())
  }
}
