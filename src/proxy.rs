//! Proxy configuration and public handle

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::addon::{Addon, AddonChain};
use crate::ca::CertificateStore;
use crate::entry::{self, ServerState};
use crate::error::Result;
use crate::flow::Request;
use crate::handler::{InterceptRule, ProxyCore};
use crate::upstream::{ProxyTarget, UpstreamSelector};

/// Default body-size threshold above which bodies are streamed (5 MiB).
pub const DEFAULT_STREAM_LARGE_BODIES: u64 = 5 * 1024 * 1024;

/// Proxy configuration.
#[derive(Debug, Clone)]
pub struct Options {
  /// Log verbosity (0 = info, 1 = debug, 2+ = trace)
  pub debug: u8,
  /// Listen address
  pub addr: String,
  /// Bodies larger than this many bytes are relayed chunk-wise instead of
  /// buffered; 0 selects the default of 5 MiB
  pub stream_large_bodies: u64,
  /// Skip certificate verification of origins
  pub ssl_insecure: bool,
  /// Directory holding the persisted root key and certificate
  pub ca_root_path: PathBuf,
  /// Optional parent proxy URL for outgoing dials
  pub upstream: Option<String>,
}

impl Default for Options {
  fn default() -> Self {
    Self {
      debug: 0,
      addr: "127.0.0.1:9080".to_string(),
      stream_large_bodies: DEFAULT_STREAM_LARGE_BODIES,
      ssl_insecure: false,
      ca_root_path: PathBuf::from(".waylay"),
      upstream: None,
    }
  }
}

/// The intercepting proxy.
///
/// Construct with [`Proxy::new`], install addons and rules, then call
/// [`Proxy::start`]. `start` runs the accept loop until [`Proxy::close`]
/// or [`Proxy::shutdown`] is called from another task.
pub struct Proxy {
  opts: Options,
  certs: Arc<CertificateStore>,
  addons: Vec<Arc<dyn Addon>>,
  selector: UpstreamSelector,
  should_intercept: Option<Arc<InterceptRule>>,
  state: Arc<ServerState>,
}

impl Proxy {
  /// Create a proxy. Loads or generates the root certificate; a failure
  /// here is fatal.
  pub async fn new(mut opts: Options) -> Result<Self> {
    if opts.stream_large_bodies == 0 {
      opts.stream_large_bodies = DEFAULT_STREAM_LARGE_BODIES;
    }
    let certs = Arc::new(CertificateStore::new(&opts.ca_root_path).await?);
    let selector = UpstreamSelector::new(opts.upstream.as_deref())?;
    Ok(Self {
      opts,
      certs,
      addons: Vec::new(),
      selector,
      should_intercept: None,
      state: ServerState::new(),
    })
  }

  /// Install an addon. Addons fire in installation order.
  pub fn add_addon(&mut self, addon: Arc<dyn Addon>) {
    self.addons.push(addon);
  }

  /// Install the interception rule. Without one, every `CONNECT` is
  /// intercepted.
  pub fn set_should_intercept<F>(&mut self, rule: F)
  where
    F: Fn(&Request) -> bool + Send + Sync + 'static,
  {
    self.should_intercept = Some(Arc::new(rule));
  }

  /// Install an upstream-proxy resolver that overrides both the `upstream`
  /// option and the proxy environment variables.
  pub fn set_upstream_proxy<F>(&mut self, resolver: F)
  where
    F: Fn(&Request) -> Result<Option<ProxyTarget>> + Send + Sync + 'static,
  {
    self.selector.set_resolver(Arc::new(resolver));
  }

  /// Bind the listener and serve until closed or shut down.
  pub async fn start(&self) -> Result<()> {
    let core = Arc::new(ProxyCore {
      certs: self.certs.clone(),
      chain: Arc::new(AddonChain::new(self.addons.clone())),
      selector: Arc::new(self.selector.clone()),
      ssl_insecure: self.opts.ssl_insecure,
      stream_large_bodies: self.opts.stream_large_bodies,
      should_intercept: self.should_intercept.clone(),
    });
    entry::run(&self.opts.addr, core, self.state.clone()).await
  }

  /// Abort the listener and all in-flight connections immediately.
  /// Idempotent.
  pub fn close(&self) {
    self.state.close();
  }

  /// Refuse new connections, let in-flight requests drain until `timeout`,
  /// then abort the remainder. Idempotent.
  pub async fn shutdown(&self, timeout: Duration) {
    self.state.shutdown(timeout).await;
  }

  /// Address the listener is bound to, once [`Proxy::start`] has bound it.
  pub fn local_addr(&self) -> Option<SocketAddr> {
    self.state.local_addr()
  }

  /// The root certificate in PEM form, for client trust stores.
  pub fn ca_cert_pem(&self) -> &str {
    self.certs.root_cert_pem()
  }

  /// Path of the persisted root certificate.
  pub fn ca_cert_path(&self) -> PathBuf {
    self.certs.root_cert_path()
  }

  /// The configuration this proxy was built with.
  pub fn options(&self) -> &Options {
    &self.opts
  }
}
