//! The MITM engine
//!
//! Terminates TLS on a tunneled client socket with a leaf certificate
//! minted for the ClientHello's SNI (falling back to the `CONNECT` target),
//! then re-parses the decrypted stream as HTTP/1.1 and serves it through
//! the shared flow pipeline.

use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::rustls::{self, KeyLogFile, ServerConfig};
use tokio_rustls::LazyConfigAcceptor;

use crate::conn::ConnContext;
use crate::error::{Error, Result};
use crate::handler::{self, ProxyCore};

/// Split a `CONNECT` target into host and port, defaulting the port to 443.
pub(crate) fn split_connect_target(target: &str) -> Result<(String, u16)> {
  // bracketed ipv6 literals keep their colons inside the brackets
  if let Some(rest) = target.strip_prefix('[') {
    let (host, rest) = rest
      .split_once(']')
      .ok_or_else(|| Error::invalid_request(format!("bad connect target {:?}", target)))?;
    let port = match rest.strip_prefix(':') {
      Some(port) => port
        .parse()
        .map_err(|_| Error::invalid_request(format!("bad connect port {:?}", rest)))?,
      None => 443,
    };
    return Ok((host.to_string(), port));
  }
  match target.rsplit_once(':') {
    Some((host, port)) => {
      let port = port
        .parse()
        .map_err(|_| Error::invalid_request(format!("bad connect port {:?}", port)))?;
      Ok((host.to_string(), port))
    }
    None => Ok((target.to_string(), 443)),
  }
}

fn server_config(
  cert_chain: Vec<rustls::pki_types::CertificateDer<'static>>,
  key: rustls::pki_types::PrivateKeyDer<'static>,
) -> Result<Arc<ServerConfig>> {
  let provider = rustls::crypto::CryptoProvider::get_default()
    .cloned()
    .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()));
  let mut config = ServerConfig::builder_with_provider(provider)
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::tls(format!("tls protocol versions: {}", e)))?
    .with_no_client_auth()
    .with_single_cert(cert_chain, key)
    .map_err(|e| Error::tls(format!("server tls config: {}", e)))?;
  // HTTP/1.1 only on the intercepted leg
  config.alpn_protocols = vec![b"http/1.1".to_vec()];
  config.key_log = Arc::new(KeyLogFile::new());
  Ok(Arc::new(config))
}

/// Terminate TLS on a tunneled stream and serve the decrypted requests.
///
/// `target` is the `host:port` from the `CONNECT` line; decrypted requests
/// are parsed with `scheme=https` and this target as their authority.
pub(crate) async fn intercept<S>(
  core: &ProxyCore,
  ctx: &Arc<ConnContext>,
  stream: S,
  target: &str,
) -> Result<()>
where
  S: AsyncRead + AsyncWrite + Unpin + Send,
{
  let (connect_host, _) = split_connect_target(target)?;

  let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream);
  let start = acceptor
    .await
    .map_err(|e| Error::tls(format!("client hello: {}", e)))?;

  let sni = start
    .client_hello()
    .server_name()
    .map(|name| name.to_string());
  let host = sni.clone().unwrap_or(connect_host);

  let (cert_chain, key) = core.certs.get_or_create(&host).await?;
  let config = server_config(cert_chain, key)?;
  let tls_stream = start
    .into_stream(config)
    .await
    .map_err(|e| Error::tls(format!("handshake with {}: {}", host, e)))?;

  ctx.client.set_tls(sni);
  tracing::debug!(conn = ctx.id, host = %host, "tls terminated");

  handler::serve_http(core, ctx, tls_stream, Some(target.to_string()), None).await
}
