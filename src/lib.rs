//! # waylay
//!
//! An intercepting HTTP/HTTPS forward proxy: it terminates client
//! connections, observes and optionally rewrites traffic at the HTTP
//! semantic layer, then relays it to origin servers. Clients must be
//! configured to use the listener as an HTTP proxy and to trust the
//! proxy's root certificate.
//!
//! # Features
//!
//! - On-the-fly leaf certificate minting per hostname, cached with
//!   single-flight semantics
//! - `CONNECT` tunnels either TLS-terminated and re-parsed as HTTP/1.1 or
//!   spliced through untouched, per a configurable rule
//! - An addon pipeline with hooks around connections, requests, responses
//!   and streamed body chunks
//! - Optional parent proxy (explicit URL, per-request resolver, or the
//!   standard proxy environment variables)
//!
//! # Example
//!
//! ```no_run
//! use waylay::{Options, Proxy};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), waylay::Error> {
//!   let proxy = Proxy::new(Options::default()).await?;
//!   proxy.start().await
//! }
//! ```

mod addon;
mod ca;
mod conn;
mod entry;
mod error;
mod flow;
mod handler;
mod http1;
mod interceptor;
mod proxy;
mod stream;
mod upstream;

pub use addon::{Addon, AddonChain, LogAddon};
pub use ca::{CertificateAuthority, CertificateStore, LeafCert};
pub use conn::{ClientConn, ConnContext, ServerConn};
pub use error::{Error, Result};
pub use flow::{strip_hop_by_hop, Flow, Request, Response, StreamDirection};
pub use proxy::{Options, Proxy, DEFAULT_STREAM_LARGE_BODIES};
pub use stream::WireStats;
pub use upstream::{proxy_from_env, ProxyTarget, UpstreamSelector};
