//! The flow pipeline
//!
//! One entry point, [`serve_http`], drives HTTP/1.1 exchanges for both the
//! plain listener and intercepted tunnels: parse a request, dispatch addon
//! hooks, relay to the origin (buffered or chunk-streamed), and write the
//! response back. Flows on one connection are served strictly in order.

use std::sync::Arc;
use bytes::Bytes;
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::addon::AddonChain;
use crate::ca::CertificateStore;
use crate::conn::{ConnContext, ConnectedUpstream};
use crate::error::{Error, Result};
use crate::flow::{strip_hop_by_hop, wants_close, Flow, Request, Response, StreamDirection};
use crate::http1::{self, BodyLength, BodyRead, Framing, RequestHead, CHUNK_SIZE};
use crate::upstream::UpstreamSelector;

/// Predicate deciding whether a request is intercepted and observed.
pub type InterceptRule = dyn Fn(&Request) -> bool + Send + Sync;

/// Shared, immutable state of a running proxy.
pub(crate) struct ProxyCore {
  pub certs: Arc<CertificateStore>,
  pub chain: Arc<AddonChain>,
  pub selector: Arc<UpstreamSelector>,
  pub ssl_insecure: bool,
  pub stream_large_bodies: u64,
  pub should_intercept: Option<Arc<InterceptRule>>,
}

impl ProxyCore {
  /// Evaluate the interception rule for a request; absent rule intercepts
  /// everything.
  pub fn intercepts(&self, req: &Request) -> bool {
    match &self.should_intercept {
      Some(rule) => rule(req),
      None => true,
    }
  }
}

pub(crate) enum FlowEnd {
  KeepAlive,
  Close,
}

enum RelayOutcome {
  Done,
  /// The origin leg failed before anything reached the client; answer with
  /// this response and close. `headers_hook_fired` records whether the
  /// `response_headers` hook already ran for this flow, so it is not fired
  /// twice.
  Failed {
    response: Response,
    headers_hook_fired: bool,
  },
}

/// Serve HTTP/1.1 exchanges on `stream` until the client hangs up or a flow
/// requires the connection to close.
///
/// `tunnel_authority` carries the `CONNECT` target when the stream is a
/// decrypted tunnel; requests then use origin-form targets and the `https`
/// scheme. `first` replays a request head already consumed by the caller.
pub(crate) async fn serve_http<S>(
  core: &ProxyCore,
  ctx: &Arc<ConnContext>,
  stream: S,
  tunnel_authority: Option<String>,
  mut first: Option<RequestHead>,
) -> Result<()>
where
  S: AsyncRead + AsyncWrite + Unpin + Send,
{
  let (read_half, mut write_half) = tokio::io::split(stream);
  let mut reader = BufReader::new(read_half);
  loop {
    let head = match first.take() {
      Some(head) => head,
      None => match http1::read_request_head(&mut reader).await {
        Ok(Some(head)) => head,
        Ok(None) => return Ok(()),
        Err(e @ Error::InvalidRequest(_)) => {
          let _ = write_response(&mut write_half, &bad_request(), true).await;
          return Err(e);
        }
        Err(e) => return Err(e),
      },
    };
    match serve_one(
      core,
      ctx,
      &mut reader,
      &mut write_half,
      head,
      tunnel_authority.as_deref(),
    )
    .await?
    {
      FlowEnd::KeepAlive => continue,
      FlowEnd::Close => {
        // send close_notify on TLS streams so clients see a clean end
        let _ = write_half.shutdown().await;
        return Ok(());
      }
    }
  }
}

async fn serve_one<R, W>(
  core: &ProxyCore,
  ctx: &Arc<ConnContext>,
  reader: &mut BufReader<R>,
  write_half: &mut W,
  head: RequestHead,
  tunnel_authority: Option<&str>,
) -> Result<FlowEnd>
where
  R: AsyncRead + Unpin + Send,
  W: AsyncWrite + Unpin + Send,
{
  let uri = match http1::absolute_uri(&head.target, tunnel_authority) {
    Ok(uri) => uri,
    Err(e) => {
      let _ = write_response(write_half, &bad_request(), true).await;
      return Err(e);
    }
  };
  let request = Request {
    method: head.method,
    uri,
    version: head.version,
    headers: head.headers,
    body: Bytes::new(),
  };
  // Inside a terminated tunnel the rule is re-evaluated per request; a
  // rejected request is still relayed, just without observers.
  let hooks = tunnel_authority.is_none() || core.intercepts(&request);
  let client_close = wants_close(&request.headers, request.version);

  let mut flow = Flow::new(ctx.clone(), request);
  if hooks {
    core.chain.request_headers(&mut flow).await?;
  }

  let length = match http1::request_body_length(&flow.request.headers) {
    Ok(length) => length,
    Err(e) => {
      let _ = write_response(write_half, &bad_request(), true).await;
      return Err(e);
    }
  };
  let mut request_stream: Option<(BodyLength, Bytes)> = None;
  match http1::read_body(reader, length, core.stream_large_bodies).await? {
    BodyRead::Complete(body) => flow.request.body = body,
    BodyRead::Streaming { prefix } => {
      flow.streaming = true;
      request_stream = Some((length, prefix));
    }
  }

  if hooks {
    core.chain.request(&mut flow).await?;
  }

  if flow.response.is_some() {
    // An addon planted the response: the upstream dial is suppressed.
    if hooks {
      core.chain.response_headers(&mut flow).await?;
      core.chain.response(&mut flow).await?;
    }
    // An unconsumed streamed request body makes the connection unusable.
    let close = client_close || request_stream.is_some();
    let response = flow.response.as_ref().expect("response present");
    write_response(write_half, response, close).await?;
    return Ok(if close {
      FlowEnd::Close
    } else {
      FlowEnd::KeepAlive
    });
  }

  match relay_upstream(
    core,
    ctx,
    &mut flow,
    reader,
    write_half,
    request_stream,
    hooks,
    client_close,
  )
  .await?
  {
    RelayOutcome::Done => Ok(if client_close {
      FlowEnd::Close
    } else {
      FlowEnd::KeepAlive
    }),
    RelayOutcome::Failed {
      response,
      headers_hook_fired,
    } => {
      flow.response = Some(response);
      flow.streaming = false;
      if hooks {
        if !headers_hook_fired {
          core.chain.response_headers(&mut flow).await?;
        }
        core.chain.response(&mut flow).await?;
      }
      let response = flow.response.as_ref().expect("response present");
      write_response(write_half, response, true).await?;
      Ok(FlowEnd::Close)
    }
  }
}

#[allow(clippy::too_many_arguments)]
async fn relay_upstream<R, W>(
  core: &ProxyCore,
  ctx: &Arc<ConnContext>,
  flow: &mut Flow,
  reader: &mut BufReader<R>,
  write_half: &mut W,
  request_stream: Option<(BodyLength, Bytes)>,
  hooks: bool,
  client_close: bool,
) -> Result<RelayOutcome>
where
  R: AsyncRead + Unpin + Send,
  W: AsyncWrite + Unpin + Send,
{
  if ctx.client.is_tls() {
    ctx
      .init_https_upstream(core.ssl_insecure, core.selector.clone())
      .await?;
  } else {
    ctx
      .init_http_upstream(core.ssl_insecure, core.selector.clone())
      .await?;
  }
  let mut guard = ctx.upstream().await;
  let link = guard
    .as_mut()
    .ok_or_else(|| Error::upstream("upstream not initialized"))?;

  let newly_connected = match link.ensure_connected(&flow.request, ctx).await {
    Ok(newly) => newly,
    Err(Error::ProxyAuth(reason)) => {
      return Ok(RelayOutcome::Failed {
        response: Response::with_body(
          StatusCode::PROXY_AUTHENTICATION_REQUIRED,
          format!("waylay: {}\n", reason),
        ),
        headers_hook_fired: false,
      });
    }
    Err(e) => {
      return Ok(RelayOutcome::Failed {
        response: Response::bad_gateway(e.to_string()),
        headers_hook_fired: false,
      })
    }
  };
  if newly_connected {
    core.chain.server_connected(ctx).await;
  }

  // Send the request. An origin-side failure here is still convertible to
  // a 502 because nothing has reached the client yet.
  let sent = send_request(core, link.connection()?, flow, reader, request_stream, hooks).await;
  if let Err(e) = sent {
    link.disconnect();
    return match e {
      Error::Upstream(reason) => Ok(RelayOutcome::Failed {
        response: Response::bad_gateway(reason),
        headers_hook_fired: false,
      }),
      other => Err(other),
    };
  }

  let head = http1::read_response_head(&mut link.connection()?.io).await;
  let head = match head {
    Ok(head) => head,
    Err(e) => {
      link.disconnect();
      return Ok(RelayOutcome::Failed {
        response: Response::bad_gateway(e.to_string()),
        headers_hook_fired: false,
      });
    }
  };
  flow.response = Some(Response {
    version: head.version,
    status: head.status,
    headers: head.headers,
    body: Bytes::new(),
  });
  if hooks {
    core.chain.response_headers(flow).await?;
  }

  let (length, mut upstream_close) = {
    let response = flow.response.as_ref().expect("response present");
    let length =
      match http1::response_body_length(&flow.request.method, response.status, &response.headers) {
        Ok(length) => length,
        Err(e) => {
          link.disconnect();
          return Ok(RelayOutcome::Failed {
            response: Response::bad_gateway(e.to_string()),
            headers_hook_fired: true,
          });
        }
      };
    let close =
      matches!(length, BodyLength::Close) || wants_close(&response.headers, response.version);
    (length, close)
  };

  let body = http1::read_body(
    &mut link.connection()?.io,
    length,
    core.stream_large_bodies,
  )
  .await;
  match body {
    Ok(BodyRead::Complete(body)) => {
      flow.response.as_mut().expect("response present").body = body;
      if hooks {
        core.chain.response(flow).await?;
      }
      let response = flow.response.as_ref().expect("response present");
      write_response(write_half, response, client_close).await?;
    }
    Ok(BodyRead::Streaming { prefix }) => {
      flow.streaming = true;
      if hooks {
        core.chain.response(flow).await?;
      }
      stream_response(
        core,
        flow,
        &mut link.connection()?.io,
        write_half,
        length,
        prefix,
        hooks,
        client_close,
      )
      .await?;
      if matches!(length, BodyLength::Close) {
        upstream_close = true;
      }
    }
    Err(e) => {
      link.disconnect();
      return Ok(RelayOutcome::Failed {
        response: Response::bad_gateway(e.to_string()),
        headers_hook_fired: true,
      });
    }
  }

  if upstream_close {
    link.disconnect();
  }
  Ok(RelayOutcome::Done)
}

/// Write the (possibly streamed) request to the origin.
async fn send_request<R>(
  core: &ProxyCore,
  conn: &mut ConnectedUpstream,
  flow: &Flow,
  reader: &mut BufReader<R>,
  request_stream: Option<(BodyLength, Bytes)>,
  hooks: bool,
) -> Result<()>
where
  R: AsyncRead + Unpin + Send,
{
  let had_framing = flow
    .request
    .headers
    .contains_key(http::header::CONTENT_LENGTH)
    || flow
      .request
      .headers
      .contains_key(http::header::TRANSFER_ENCODING);

  let mut out = flow.request.clone();
  strip_hop_by_hop(&mut out.headers);
  out.headers.remove(http::header::CONTENT_LENGTH);
  if conn.absolute_form {
    if let Some(auth) = &conn.proxy_auth {
      out
        .headers
        .insert(http::header::PROXY_AUTHORIZATION, auth.clone());
    }
  }

  match request_stream {
    None => {
      let framing = if out.body.is_empty() {
        if had_framing {
          Framing::Length(0)
        } else {
          Framing::None
        }
      } else {
        Framing::Length(out.body.len() as u64)
      };
      let head = http1::encode_request_head(&out, conn.absolute_form, framing);
      write_upstream(&mut conn.io, &head).await?;
      if !out.body.is_empty() {
        write_upstream(&mut conn.io, &out.body).await?;
      }
    }
    Some((BodyLength::Known(total), prefix)) => {
      let head = http1::encode_request_head(&out, conn.absolute_form, Framing::Length(total));
      write_upstream(&mut conn.io, &head).await?;
      let mut remaining = total;
      if !prefix.is_empty() {
        if hooks {
          core
            .chain
            .stream_chunk(flow, StreamDirection::ClientToServer, &prefix)
            .await;
        }
        write_upstream(&mut conn.io, &prefix).await?;
        remaining -= prefix.len() as u64;
      }
      let mut buf = vec![0u8; CHUNK_SIZE];
      while remaining > 0 {
        let want = remaining.min(CHUNK_SIZE as u64) as usize;
        let n = reader
          .read(&mut buf[..want])
          .await
          .map_err(|e| Error::connection(format!("client body read: {}", e)))?;
        if n == 0 {
          return Err(Error::connection("client closed mid request body"));
        }
        let chunk = Bytes::copy_from_slice(&buf[..n]);
        if hooks {
          core
            .chain
            .stream_chunk(flow, StreamDirection::ClientToServer, &chunk)
            .await;
        }
        write_upstream(&mut conn.io, &chunk).await?;
        remaining -= n as u64;
      }
    }
    Some((BodyLength::Chunked, prefix)) => {
      let head = http1::encode_request_head(&out, conn.absolute_form, Framing::Chunked);
      write_upstream(&mut conn.io, &head).await?;
      if !prefix.is_empty() {
        if hooks {
          core
            .chain
            .stream_chunk(flow, StreamDirection::ClientToServer, &prefix)
            .await;
        }
        write_upstream_chunk(&mut conn.io, &prefix).await?;
      }
      loop {
        let chunk = http1::read_chunk(reader)
          .await
          .map_err(|e| Error::connection(format!("client body read: {}", e)))?;
        match chunk {
          Some(chunk) => {
            if hooks {
              core
                .chain
                .stream_chunk(flow, StreamDirection::ClientToServer, &chunk)
                .await;
            }
            write_upstream_chunk(&mut conn.io, &chunk).await?;
          }
          None => break,
        }
      }
      http1::write_chunk_end(&mut conn.io)
        .await
        .map_err(|e| Error::upstream(format!("write to origin: {}", e)))?;
    }
    Some((other, _)) => {
      return Err(Error::invalid_request(format!(
        "unstreamable request body framing {:?}",
        other
      )));
    }
  }
  conn
    .io
    .flush()
    .await
    .map_err(|e| Error::upstream(format!("write to origin: {}", e)))?;
  Ok(())
}

/// Relay a streamed response body to the client, firing chunk events.
#[allow(clippy::too_many_arguments)]
async fn stream_response<U, W>(
  core: &ProxyCore,
  flow: &Flow,
  upstream_io: &mut U,
  write_half: &mut W,
  length: BodyLength,
  prefix: Bytes,
  hooks: bool,
  client_close: bool,
) -> Result<()>
where
  U: tokio::io::AsyncBufRead + AsyncWrite + Unpin + Send,
  W: AsyncWrite + Unpin + Send,
{
  let response = flow.response.as_ref().expect("response present");
  let mut out = response.clone();
  strip_hop_by_hop(&mut out.headers);
  out.headers.remove(http::header::CONTENT_LENGTH);
  if client_close {
    out.headers.insert(
      http::header::CONNECTION,
      http::HeaderValue::from_static("close"),
    );
  }
  // Known lengths pass through unchanged; everything else is re-framed
  // with the proxy's own chunked encoding.
  let framing = match length {
    BodyLength::Known(n) => Framing::Length(n),
    _ => Framing::Chunked,
  };
  let rechunk = framing == Framing::Chunked;
  write_client(write_half, &http1::encode_response_head(&out, framing)).await?;

  if !prefix.is_empty() {
    if hooks {
      core
        .chain
        .stream_chunk(flow, StreamDirection::ServerToClient, &prefix)
        .await;
    }
    if rechunk {
      write_client_chunk(write_half, &prefix).await?;
    } else {
      write_client(write_half, &prefix).await?;
    }
  }

  match length {
    BodyLength::Known(total) => {
      let mut remaining = total - prefix.len() as u64;
      let mut buf = vec![0u8; CHUNK_SIZE];
      while remaining > 0 {
        let want = remaining.min(CHUNK_SIZE as u64) as usize;
        let n = upstream_io
          .read(&mut buf[..want])
          .await
          .map_err(|e| Error::connection(format!("origin body read: {}", e)))?;
        if n == 0 {
          return Err(Error::connection("origin closed mid response body"));
        }
        let chunk = Bytes::copy_from_slice(&buf[..n]);
        if hooks {
          core
            .chain
            .stream_chunk(flow, StreamDirection::ServerToClient, &chunk)
            .await;
        }
        write_client(write_half, &chunk).await?;
        remaining -= n as u64;
      }
    }
    BodyLength::Chunked => loop {
      let chunk = http1::read_chunk(upstream_io)
        .await
        .map_err(|e| Error::connection(format!("origin body read: {}", e)))?;
      match chunk {
        Some(chunk) => {
          if hooks {
            core
              .chain
              .stream_chunk(flow, StreamDirection::ServerToClient, &chunk)
              .await;
          }
          write_client_chunk(write_half, &chunk).await?;
        }
        None => {
          write_client_chunk_end(write_half).await?;
          break;
        }
      }
    },
    BodyLength::Close => {
      let mut buf = vec![0u8; CHUNK_SIZE];
      loop {
        let n = upstream_io
          .read(&mut buf)
          .await
          .map_err(|e| Error::connection(format!("origin body read: {}", e)))?;
        if n == 0 {
          write_client_chunk_end(write_half).await?;
          break;
        }
        let chunk = Bytes::copy_from_slice(&buf[..n]);
        if hooks {
          core
            .chain
            .stream_chunk(flow, StreamDirection::ServerToClient, &chunk)
            .await;
        }
        write_client_chunk(write_half, &chunk).await?;
      }
    }
    BodyLength::None => {}
  }
  write_half
    .flush()
    .await
    .map_err(|e| Error::connection(format!("client write: {}", e)))?;
  Ok(())
}

/// Write a fully buffered response to the client.
pub(crate) async fn write_response<W: AsyncWrite + Unpin>(
  write_half: &mut W,
  response: &Response,
  close: bool,
) -> Result<()> {
  let mut out = response.clone();
  strip_hop_by_hop(&mut out.headers);
  out.headers.remove(http::header::CONTENT_LENGTH);
  if close {
    out.headers.insert(
      http::header::CONNECTION,
      http::HeaderValue::from_static("close"),
    );
  }
  let bodyless = out.status.is_informational()
    || out.status == StatusCode::NO_CONTENT
    || out.status == StatusCode::NOT_MODIFIED;
  let framing = if bodyless && out.body.is_empty() {
    Framing::None
  } else {
    Framing::Length(out.body.len() as u64)
  };
  write_client(write_half, &http1::encode_response_head(&out, framing)).await?;
  if !out.body.is_empty() {
    write_client(write_half, &out.body).await?;
  }
  write_half
    .flush()
    .await
    .map_err(|e| Error::connection(format!("client write: {}", e)))?;
  Ok(())
}

fn bad_request() -> Response {
  Response::with_body(StatusCode::BAD_REQUEST, "waylay: malformed request\n")
}

async fn write_upstream<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> Result<()> {
  writer
    .write_all(data)
    .await
    .map_err(|e| Error::upstream(format!("write to origin: {}", e)))
}

async fn write_upstream_chunk<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> Result<()> {
  http1::write_chunk(writer, data)
    .await
    .map_err(|e| Error::upstream(format!("write to origin: {}", e)))
}

async fn write_client<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> Result<()> {
  writer
    .write_all(data)
    .await
    .map_err(|e| Error::connection(format!("client write: {}", e)))
}

async fn write_client_chunk<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> Result<()> {
  http1::write_chunk(writer, data)
    .await
    .map_err(|e| Error::connection(format!("client write: {}", e)))
}

async fn write_client_chunk_end<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<()> {
  http1::write_chunk_end(writer)
    .await
    .map_err(|e| Error::connection(format!("client write: {}", e)))
}
