//! Command-line entry point

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use waylay::{LogAddon, Options, Proxy};

/// Intercepting HTTP/HTTPS forward proxy
#[derive(Parser, Debug)]
#[command(name = "waylay", version, about, long_about = None)]
struct Cli {
  /// Listen address
  #[arg(long, default_value = "127.0.0.1:9080", env = "WAYLAY_ADDR")]
  addr: String,

  /// Parent proxy URL for outgoing dials (http:// or https://)
  #[arg(long, env = "WAYLAY_UPSTREAM")]
  upstream: Option<String>,

  /// Skip certificate verification of origins
  #[arg(long, env = "WAYLAY_SSL_INSECURE")]
  ssl_insecure: bool,

  /// Directory holding the persisted root key and certificate
  #[arg(long, default_value = ".waylay", env = "WAYLAY_CA_ROOT_PATH")]
  ca_root_path: PathBuf,

  /// Bodies larger than this many bytes are streamed instead of buffered
  #[arg(long, default_value_t = waylay::DEFAULT_STREAM_LARGE_BODIES)]
  stream_large_bodies: u64,

  /// Increase log verbosity (-d = debug, -dd = trace)
  #[arg(short = 'd', long, action = clap::ArgAction::Count)]
  debug: u8,
}

fn init_logging(debug: u8) {
  let default_level = match debug {
    0 => "info",
    1 => "debug",
    _ => "trace",
  };
  let filter = EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| EnvFilter::new(format!("waylay={}", default_level)));
  tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let cli = Cli::parse();
  init_logging(cli.debug);

  tokio_rustls::rustls::crypto::ring::default_provider()
    .install_default()
    .ok();

  let opts = Options {
    debug: cli.debug,
    addr: cli.addr,
    stream_large_bodies: cli.stream_large_bodies,
    ssl_insecure: cli.ssl_insecure,
    ca_root_path: cli.ca_root_path,
    upstream: cli.upstream,
  };

  let mut proxy = Proxy::new(opts).await.context("failed to initialize proxy")?;
  proxy.add_addon(Arc::new(LogAddon));
  tracing::info!(
    ca = %proxy.ca_cert_path().display(),
    "install the root certificate from this path in your client"
  );

  let proxy = Arc::new(proxy);
  let server = {
    let proxy = proxy.clone();
    tokio::spawn(async move { proxy.start().await })
  };

  tokio::signal::ctrl_c()
    .await
    .context("failed to listen for ctrl-c")?;
  tracing::info!("shutting down");
  proxy.shutdown(Duration::from_secs(3)).await;

  server
    .await
    .context("server task panicked")?
    .context("proxy terminated with an error")?;
  Ok(())
}
