//! End-to-end proxy tests against loopback origins

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http::StatusCode;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use waylay::{Addon, ConnContext, Flow, Options, Proxy, Response, StreamDirection};

fn test_options(name: &str) -> Options {
  let dir = std::env::temp_dir().join(format!("waylay-proxy-{}", name));
  if dir.exists() {
    std::fs::remove_dir_all(&dir).ok();
  }
  Options {
    ca_root_path: PathBuf::from(dir),
    ssl_insecure: true,
    ..Options::default()
  }
}

async fn start_proxy(
  mut opts: Options,
  configure: impl FnOnce(&mut Proxy),
) -> (Arc<Proxy>, SocketAddr) {
  opts.addr = "127.0.0.1:0".to_string();
  let mut proxy = Proxy::new(opts).await.expect("create proxy");
  configure(&mut proxy);
  let proxy = Arc::new(proxy);
  {
    let proxy = proxy.clone();
    tokio::spawn(async move {
      let _ = proxy.start().await;
    });
  }
  for _ in 0..400 {
    if let Some(addr) = proxy.local_addr() {
      return (proxy, addr);
    }
    tokio::time::sleep(Duration::from_millis(5)).await;
  }
  panic!("proxy did not start");
}

/// A keep-alive plain HTTP origin that answers every request with the same
/// bytes and reports each received request (head plus buffered body).
struct Origin {
  addr: SocketAddr,
  requests: mpsc::UnboundedReceiver<String>,
}

async fn plain_origin(response: Vec<u8>) -> Origin {
  let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind origin");
  let addr = listener.local_addr().expect("origin addr");
  let (tx, requests) = mpsc::unbounded_channel();
  tokio::spawn(async move {
    loop {
      let Ok((mut sock, _)) = listener.accept().await else {
        break;
      };
      let tx = tx.clone();
      let response = response.clone();
      tokio::spawn(async move {
        let (read, mut write) = sock.split();
        let mut reader = BufReader::new(read);
        loop {
          let mut head = String::new();
          let mut line = String::new();
          match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => head.push_str(&line),
          }
          let mut content_length = 0usize;
          loop {
            let mut header = String::new();
            match reader.read_line(&mut header).await {
              Ok(0) | Err(_) => return,
              Ok(_) => {}
            }
            if header == "\r\n" {
              break;
            }
            let lower = header.to_ascii_lowercase();
            if let Some(value) = lower.strip_prefix("content-length:") {
              content_length = value.trim().parse().unwrap_or(0);
            }
            head.push_str(&header);
          }
          if content_length > 0 {
            let mut body = vec![0u8; content_length];
            if reader.read_exact(&mut body).await.is_err() {
              return;
            }
            head.push_str(&String::from_utf8_lossy(&body));
          }
          let _ = tx.send(head);
          if write.write_all(&response).await.is_err() {
            return;
          }
        }
      });
    }
  });
  Origin { addr, requests }
}

/// A TLS origin with a self-signed certificate, answering one request per
/// connection.
async fn tls_origin(response: Vec<u8>) -> SocketAddr {
  let key = rcgen::KeyPair::generate().expect("origin key");
  let mut params = rcgen::CertificateParams::default();
  params.subject_alt_names = vec![rcgen::SanType::IpAddress("127.0.0.1".parse().unwrap())];
  let cert = params.self_signed(&key).expect("origin cert");
  let certs = vec![CertificateDer::from(cert.der().to_vec())];
  let key = PrivateKeyDer::try_from(key.serialize_der()).expect("origin key der");
  let config = ServerConfig::builder()
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .expect("origin tls config");
  let acceptor = TlsAcceptor::from(Arc::new(config));

  let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind origin");
  let addr = listener.local_addr().expect("origin addr");
  tokio::spawn(async move {
    loop {
      let Ok((sock, _)) = listener.accept().await else {
        break;
      };
      let acceptor = acceptor.clone();
      let response = response.clone();
      tokio::spawn(async move {
        let Ok(mut tls) = acceptor.accept(sock).await else {
          return;
        };
        let mut buf = vec![0u8; 8192];
        let mut seen = Vec::new();
        loop {
          let Ok(n) = tls.read(&mut buf).await else {
            return;
          };
          if n == 0 {
            return;
          }
          seen.extend_from_slice(&buf[..n]);
          if seen.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
          }
        }
        let _ = tls.write_all(&response).await;
        let _ = tls.shutdown().await;
      });
    }
  });
  addr
}

/// An address nothing is listening on.
async fn refused_addr() -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
  let addr = listener.local_addr().expect("addr");
  drop(listener);
  addr
}

async fn read_until_blank_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> String {
  let mut head = String::new();
  loop {
    let mut line = String::new();
    if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
      break;
    }
    if line == "\r\n" {
      break;
    }
    head.push_str(&line);
  }
  head
}

/// Read one content-length framed response.
async fn read_one_response<R: AsyncBufRead + Unpin>(reader: &mut R) -> (String, Vec<u8>) {
  let head = read_until_blank_line(reader).await;
  let content_length = head
    .lines()
    .find_map(|line| {
      let lower = line.to_ascii_lowercase();
      lower
        .strip_prefix("content-length:")
        .map(|v| v.trim().parse::<usize>().unwrap_or(0))
    })
    .unwrap_or(0);
  let mut body = vec![0u8; content_length];
  if content_length > 0 {
    reader.read_exact(&mut body).await.expect("response body");
  }
  (head, body)
}

async fn roundtrip_close(proxy_addr: SocketAddr, request: &[u8]) -> Vec<u8> {
  let mut stream = TcpStream::connect(proxy_addr).await.expect("connect proxy");
  stream.write_all(request).await.expect("send request");
  let mut out = Vec::new();
  stream.read_to_end(&mut out).await.expect("read response");
  out
}

fn split_head_body(raw: &[u8]) -> (String, Vec<u8>) {
  let pos = raw
    .windows(4)
    .position(|w| w == b"\r\n\r\n")
    .expect("response head terminator");
  (
    String::from_utf8_lossy(&raw[..pos]).to_string(),
    raw[pos + 4..].to_vec(),
  )
}

/// Records every hook invocation for assertions on ordering and payloads.
#[derive(Default)]
struct Recorder {
  events: Mutex<Vec<(u64, &'static str)>>,
  connects: AtomicU64,
  disconnects: AtomicU64,
  server_connects: AtomicU64,
  planned_seen: AtomicU64,
  wire_bytes: AtomicU64,
  response_chunk_bytes: AtomicU64,
  request_chunk_bytes: AtomicU64,
  responses: Mutex<Vec<(u64, StatusCode, usize, bool)>>,
}

impl Recorder {
  fn push(&self, flow: &Flow, event: &'static str) {
    self.events.lock().unwrap().push((flow.id, event));
  }
}

#[async_trait::async_trait]
impl Addon for Recorder {
  async fn client_connected(&self, _ctx: &ConnContext) {
    self.connects.fetch_add(1, Ordering::SeqCst);
  }

  async fn client_disconnected(&self, ctx: &ConnContext) {
    self.disconnects.fetch_add(1, Ordering::SeqCst);
    if let Some(server) = ctx.server() {
      self
        .wire_bytes
        .fetch_add(server.stats.bytes_read() + server.stats.bytes_written(), Ordering::SeqCst);
    }
  }

  async fn server_connected(&self, _ctx: &ConnContext) {
    self.server_connects.fetch_add(1, Ordering::SeqCst);
  }

  async fn request_headers(&self, flow: &mut Flow) -> waylay::Result<()> {
    self.push(flow, "request_headers");
    Ok(())
  }

  async fn request(&self, flow: &mut Flow) -> waylay::Result<()> {
    self.push(flow, "request");
    if flow.response.is_some() {
      self.planned_seen.fetch_add(1, Ordering::SeqCst);
    }
    Ok(())
  }

  async fn response_headers(&self, flow: &mut Flow) -> waylay::Result<()> {
    self.push(flow, "response_headers");
    Ok(())
  }

  async fn response(&self, flow: &mut Flow) -> waylay::Result<()> {
    self.push(flow, "response");
    if let Some(response) = &flow.response {
      self.responses.lock().unwrap().push((
        flow.id,
        response.status,
        response.body.len(),
        flow.streaming,
      ));
    }
    Ok(())
  }

  async fn stream_chunk(&self, _flow: &Flow, direction: StreamDirection, data: &Bytes) {
    match direction {
      StreamDirection::ServerToClient => {
        self
          .response_chunk_bytes
          .fetch_add(data.len() as u64, Ordering::SeqCst);
      }
      StreamDirection::ClientToServer => {
        self
          .request_chunk_bytes
          .fetch_add(data.len() as u64, Ordering::SeqCst);
      }
    }
  }
}

/// Plants a response during the request hook.
struct ShortCircuit;

#[async_trait::async_trait]
impl Addon for ShortCircuit {
  async fn request(&self, flow: &mut Flow) -> waylay::Result<()> {
    flow.response = Some(Response::with_body(StatusCode::OK, "planted"));
    Ok(())
  }
}

#[tokio::test]
async fn s1_plain_get_roundtrip() {
  let mut origin = plain_origin(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello".to_vec()).await;
  let recorder = Arc::new(Recorder::default());
  let (proxy, addr) = start_proxy(test_options("s1"), {
    let recorder = recorder.clone();
    move |proxy| proxy.add_addon(recorder)
  })
  .await;

  let request = format!(
    "GET http://{}/ HTTP/1.1\r\nHost: {}\r\nAccept: */*\r\nProxy-Connection: keep-alive\r\nConnection: close\r\n\r\n",
    origin.addr, origin.addr
  );
  let raw = roundtrip_close(addr, request.as_bytes()).await;
  let (head, body) = split_head_body(&raw);

  assert!(head.starts_with("HTTP/1.1 200 OK"), "head: {}", head);
  assert!(head.to_ascii_lowercase().contains("content-length: 5"));
  assert_eq!(body, b"hello");

  let seen = origin.requests.recv().await.expect("origin request");
  assert!(seen.starts_with("GET / HTTP/1.1"), "origin saw: {}", seen);
  let seen_lower = seen.to_ascii_lowercase();
  assert!(
    seen_lower.contains(&format!("host: {}", origin.addr)),
    "host must be preserved"
  );
  assert!(!seen_lower.contains("proxy-connection"));
  assert!(!seen_lower.contains("connection:"));

  let events = recorder.events.lock().unwrap().clone();
  let kinds: Vec<&str> = events.iter().map(|(_, kind)| *kind).collect();
  assert_eq!(
    kinds,
    vec!["request_headers", "request", "response_headers", "response"]
  );

  // the disconnect hook fires shortly after the socket closes and reports
  // wire-level byte counts for the upstream dial
  for _ in 0..200 {
    if recorder.disconnects.load(Ordering::SeqCst) > 0 {
      break;
    }
    tokio::time::sleep(Duration::from_millis(5)).await;
  }
  assert_eq!(recorder.disconnects.load(Ordering::SeqCst), 1);
  assert!(
    recorder.wire_bytes.load(Ordering::SeqCst) > 0,
    "upstream wire counters must have recorded traffic"
  );
  proxy.close();
}

#[tokio::test]
async fn hook_order_holds_across_many_flows() {
  let mut origin =
    plain_origin(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok".to_vec()).await;
  let recorder = Arc::new(Recorder::default());
  let (proxy, addr) = start_proxy(test_options("hook-order"), {
    let recorder = recorder.clone();
    move |proxy| proxy.add_addon(recorder)
  })
  .await;

  const CONNECTIONS: usize = 5;
  const PER_CONNECTION: usize = 200;
  for _ in 0..CONNECTIONS {
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    let (read, mut write) = stream.split();
    let mut reader = BufReader::new(read);
    for i in 0..PER_CONNECTION {
      let request = format!(
        "GET http://{}/item/{} HTTP/1.1\r\nHost: {}\r\n\r\n",
        origin.addr, i, origin.addr
      );
      write.write_all(request.as_bytes()).await.expect("send");
      let (head, body) = read_one_response(&mut reader).await;
      assert!(head.starts_with("HTTP/1.1 200"), "head: {}", head);
      assert_eq!(body, b"ok");
    }
  }
  origin.requests.close();

  let events = recorder.events.lock().unwrap().clone();
  assert_eq!(events.len(), CONNECTIONS * PER_CONNECTION * 4);

  // per flow the sequence is exact, and flows never interleave
  let mut index = 0;
  while index < events.len() {
    let flow_id = events[index].0;
    let window: Vec<&str> = events[index..index + 4].iter().map(|(_, k)| *k).collect();
    assert_eq!(
      window,
      vec!["request_headers", "request", "response_headers", "response"],
      "flow {} out of order",
      flow_id
    );
    assert!(
      events[index..index + 4].iter().all(|(id, _)| *id == flow_id),
      "flow {} interleaved with another flow",
      flow_id
    );
    index += 4;
  }
  assert_eq!(recorder.connects.load(Ordering::SeqCst), CONNECTIONS as u64);
  proxy.close();
}

#[tokio::test]
async fn keep_alive_connection_follows_origin_changes() {
  let mut origin_a =
    plain_origin(b"HTTP/1.1 200 OK\r\nContent-Length: 8\r\n\r\nfrom - a".to_vec()).await;
  let mut origin_b =
    plain_origin(b"HTTP/1.1 200 OK\r\nContent-Length: 8\r\n\r\nfrom - b".to_vec()).await;
  let recorder = Arc::new(Recorder::default());
  let (proxy, addr) = start_proxy(test_options("multi-origin"), {
    let recorder = recorder.clone();
    move |proxy| proxy.add_addon(recorder)
  })
  .await;

  // one persistent client connection, three flows across two origins
  let mut stream = TcpStream::connect(addr).await.expect("connect");
  let (read, mut write) = stream.split();
  let mut reader = BufReader::new(read);
  let sequence = [
    (origin_a.addr, &b"from - a"[..]),
    (origin_b.addr, &b"from - b"[..]),
    (origin_a.addr, &b"from - a"[..]),
  ];
  for (origin_addr, expected) in sequence {
    let request = format!(
      "GET http://{}/ HTTP/1.1\r\nHost: {}\r\n\r\n",
      origin_addr, origin_addr
    );
    write.write_all(request.as_bytes()).await.expect("send");
    let (head, body) = read_one_response(&mut reader).await;
    assert!(head.starts_with("HTTP/1.1 200"), "head: {}", head);
    assert_eq!(body, expected, "wrong origin answered");
  }
  drop(reader);
  drop(write);

  // each switch of origin is a fresh dial
  assert_eq!(recorder.server_connects.load(Ordering::SeqCst), 3);
  assert!(origin_a.requests.recv().await.is_some());
  assert!(origin_b.requests.recv().await.is_some());
  assert!(origin_a.requests.recv().await.is_some());
  proxy.close();
}

#[tokio::test]
async fn s2_connect_interception_end_to_end() {
  tokio_rustls::rustls::crypto::ring::default_provider()
    .install_default()
    .ok();

  let origin_addr = tls_origin(
    b"HTTP/1.1 200 OK\r\nContent-Length: 7\r\n\r\nsecrets".to_vec(),
  )
  .await;
  let recorder = Arc::new(Recorder::default());
  let (proxy, addr) = start_proxy(test_options("s2"), {
    let recorder = recorder.clone();
    move |proxy| proxy.add_addon(recorder)
  })
  .await;

  // trust the proxy root
  let mut roots = RootCertStore::empty();
  for cert in rustls_pemfile::certs(&mut proxy.ca_cert_pem().as_bytes()) {
    roots.add(cert.expect("root pem")).expect("add root");
  }
  let config = ClientConfig::builder()
    .with_root_certificates(roots)
    .with_no_client_auth();
  let connector = TlsConnector::from(Arc::new(config));

  let mut stream = TcpStream::connect(addr).await.expect("connect proxy");
  stream
    .write_all(format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\n", origin_addr, origin_addr).as_bytes())
    .await
    .expect("send connect");
  let mut reader = BufReader::new(&mut stream);
  let established = read_until_blank_line(&mut reader).await;
  assert!(
    established.starts_with("HTTP/1.1 200 Connection Established"),
    "connect reply: {}",
    established
  );

  // the handshake verifies the minted leaf against the proxy root, so a
  // successful connect proves CN/SAN and chain correctness
  let tls = connector
    .connect(ServerName::try_from("localhost").unwrap(), stream)
    .await
    .expect("mitm handshake");
  let mut tls = BufReader::new(tls);
  tls
    .write_all(
      format!(
        "GET /inside HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        origin_addr
      )
      .as_bytes(),
    )
    .await
    .expect("tunneled request");
  let (head, body) = read_one_response(&mut tls).await;
  assert!(head.starts_with("HTTP/1.1 200 OK"), "head: {}", head);
  assert_eq!(body, b"secrets");

  let events = recorder.events.lock().unwrap().clone();
  let kinds: Vec<&str> = events.iter().map(|(_, kind)| *kind).collect();
  assert_eq!(
    kinds,
    vec!["request_headers", "request", "response_headers", "response"]
  );
  assert_eq!(recorder.server_connects.load(Ordering::SeqCst), 1);
  proxy.close();
}

#[tokio::test]
async fn s3_passthrough_splices_raw_bytes() {
  // byte-echoing origin: the first bytes after the tunnel opens must be
  // exactly what the client wrote
  let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind origin");
  let origin_addr = listener.local_addr().expect("origin addr");
  tokio::spawn(async move {
    let Ok((mut sock, _)) = listener.accept().await else {
      return;
    };
    let mut buf = [0u8; 8];
    if sock.read_exact(&mut buf).await.is_ok() {
      assert_eq!(&buf, b"ping-raw");
      let _ = sock.write_all(b"pong-raw").await;
    }
  });

  let recorder = Arc::new(Recorder::default());
  let (proxy, addr) = start_proxy(test_options("s3"), {
    let recorder = recorder.clone();
    move |proxy| {
      proxy.add_addon(recorder);
      proxy.set_should_intercept(|_req| false);
    }
  })
  .await;

  let mut stream = TcpStream::connect(addr).await.expect("connect proxy");
  stream
    .write_all(format!("CONNECT {} HTTP/1.1\r\n\r\n", origin_addr).as_bytes())
    .await
    .expect("send connect");
  let mut reader = BufReader::new(&mut stream);
  let established = read_until_blank_line(&mut reader).await;
  assert!(established.starts_with("HTTP/1.1 200 Connection Established"));

  stream.write_all(b"ping-raw").await.expect("tunnel write");
  let mut reply = [0u8; 8];
  stream.read_exact(&mut reply).await.expect("tunnel read");
  assert_eq!(&reply, b"pong-raw");

  // no flow hooks fire in pass-through mode
  assert!(recorder.events.lock().unwrap().is_empty());
  proxy.close();
}

#[tokio::test]
async fn s4_large_body_streams_in_chunks() {
  const THRESHOLD: u64 = 64 * 1024;
  const BODY_SIZE: usize = 256 * 1024;
  let body: Vec<u8> = (0..BODY_SIZE).map(|i| (i * 31 % 251) as u8).collect();
  let mut response =
    format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", BODY_SIZE).into_bytes();
  response.extend_from_slice(&body);
  let origin = plain_origin(response).await;

  let recorder = Arc::new(Recorder::default());
  let mut opts = test_options("s4");
  opts.stream_large_bodies = THRESHOLD;
  let (proxy, addr) = start_proxy(opts, {
    let recorder = recorder.clone();
    move |proxy| proxy.add_addon(recorder)
  })
  .await;

  let request = format!(
    "GET http://{}/big HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
    origin.addr, origin.addr
  );
  let raw = roundtrip_close(addr, request.as_bytes()).await;
  let (head, received) = split_head_body(&raw);
  assert!(head.starts_with("HTTP/1.1 200 OK"));
  assert_eq!(received.len(), BODY_SIZE, "body must be relayed byte-exact");
  assert_eq!(received, body);

  // the response hook never saw the buffered body; chunks carried it all
  let responses = recorder.responses.lock().unwrap().clone();
  assert_eq!(responses.len(), 1);
  let (_, status, hook_body_len, streaming) = responses[0];
  assert_eq!(status, StatusCode::OK);
  assert_eq!(hook_body_len, 0);
  assert!(streaming);
  assert_eq!(
    recorder.response_chunk_bytes.load(Ordering::SeqCst),
    BODY_SIZE as u64
  );
  proxy.close();
}

#[tokio::test]
async fn s5_upstream_refusal_becomes_502() {
  let origin_addr = refused_addr().await;
  let recorder = Arc::new(Recorder::default());
  let (proxy, addr) = start_proxy(test_options("s5"), {
    let recorder = recorder.clone();
    move |proxy| proxy.add_addon(recorder)
  })
  .await;

  let request = format!(
    "GET http://{}/ HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
    origin_addr, origin_addr
  );
  let raw = roundtrip_close(addr, request.as_bytes()).await;
  let (head, body) = split_head_body(&raw);
  assert!(head.starts_with("HTTP/1.1 502 Bad Gateway"), "head: {}", head);
  assert!(
    String::from_utf8_lossy(&body).contains("upstream request failed"),
    "body must carry a human-readable error"
  );

  let responses = recorder.responses.lock().unwrap().clone();
  assert_eq!(responses.len(), 1);
  assert_eq!(responses[0].1, StatusCode::BAD_GATEWAY);
  proxy.close();
}

#[tokio::test]
async fn s6_addon_short_circuit_suppresses_dial() {
  let origin_addr = refused_addr().await;
  let recorder = Arc::new(Recorder::default());
  let (proxy, addr) = start_proxy(test_options("s6"), {
    let recorder = recorder.clone();
    move |proxy| {
      proxy.add_addon(Arc::new(ShortCircuit));
      proxy.add_addon(recorder);
    }
  })
  .await;

  let request = format!(
    "GET http://{}/ HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
    origin_addr, origin_addr
  );
  let raw = roundtrip_close(addr, request.as_bytes()).await;
  let (head, body) = split_head_body(&raw);
  assert!(head.starts_with("HTTP/1.1 200 OK"), "head: {}", head);
  assert_eq!(body, b"planted");

  // the later addon's request hook observed the planned response, its
  // response hooks still fired, and no upstream dial happened
  assert_eq!(recorder.planned_seen.load(Ordering::SeqCst), 1);
  let responses = recorder.responses.lock().unwrap().clone();
  assert_eq!(responses.len(), 1);
  assert_eq!(responses[0].1, StatusCode::OK);
  assert_eq!(recorder.server_connects.load(Ordering::SeqCst), 0);
  proxy.close();
}

#[tokio::test]
async fn hop_by_hop_headers_are_stripped_both_ways() {
  let mut origin = plain_origin(
    b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nKeep-Alive: timeout=5\r\nTrailer: X-Checksum\r\nUpgrade: h2c\r\nConnection: x-internal\r\nX-Internal: 1\r\nX-Public: yes\r\n\r\nok"
      .to_vec(),
  )
  .await;
  let (proxy, addr) = start_proxy(test_options("hop-by-hop"), |_proxy| {}).await;

  let request = format!(
    "GET http://{}/ HTTP/1.1\r\nHost: {}\r\nTE: trailers\r\nKeep-Alive: timeout=5\r\nProxy-Authorization: Basic Zm9vOmJhcg==\r\nConnection: close, x-tracked\r\nX-Tracked: 1\r\nX-Kept: yes\r\n\r\n",
    origin.addr, origin.addr
  );
  let raw = roundtrip_close(addr, request.as_bytes()).await;
  let (head, body) = split_head_body(&raw);
  assert_eq!(body, b"ok");

  let lower = head.to_ascii_lowercase();
  assert!(!lower.contains("keep-alive"));
  assert!(!lower.contains("trailer"));
  assert!(!lower.contains("upgrade"));
  assert!(!lower.contains("x-internal"));
  assert!(lower.contains("x-public: yes"));

  let seen = origin.requests.recv().await.expect("origin request").to_ascii_lowercase();
  assert!(!seen.contains("te:"));
  assert!(!seen.contains("keep-alive"));
  assert!(!seen.contains("proxy-authorization"));
  assert!(!seen.contains("x-tracked"));
  assert!(seen.contains("x-kept: yes"));
  assert!(seen.contains(&format!("host: {}", origin.addr)));
  proxy.close();
}

#[tokio::test]
async fn binary_bodies_and_content_encoding_pass_untouched() {
  let body: Vec<u8> = (0..32 * 1024).map(|i| (i * 17 % 256) as u8).collect();
  let mut response = format!(
    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nContent-Encoding: gzip\r\n\r\n",
    body.len()
  )
  .into_bytes();
  response.extend_from_slice(&body);
  let origin = plain_origin(response).await;
  let (proxy, addr) = start_proxy(test_options("fidelity"), |_proxy| {}).await;

  let request = format!(
    "GET http://{}/blob HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
    origin.addr, origin.addr
  );
  let raw = roundtrip_close(addr, request.as_bytes()).await;
  let (head, received) = split_head_body(&raw);
  assert!(head.to_ascii_lowercase().contains("content-encoding: gzip"));
  assert_eq!(received, body, "compressed bytes must pass through untouched");
  proxy.close();
}

#[tokio::test]
async fn chunked_origin_response_is_buffered_below_threshold() {
  let origin = plain_origin(
    b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n"
      .to_vec(),
  )
  .await;
  let (proxy, addr) = start_proxy(test_options("chunked"), |_proxy| {}).await;

  let request = format!(
    "GET http://{}/ HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
    origin.addr, origin.addr
  );
  let raw = roundtrip_close(addr, request.as_bytes()).await;
  let (head, body) = split_head_body(&raw);
  let lower = head.to_ascii_lowercase();
  assert!(lower.contains("content-length: 11"), "head: {}", head);
  assert!(!lower.contains("transfer-encoding"));
  assert_eq!(body, b"hello world");
  proxy.close();
}

#[tokio::test]
async fn post_body_reaches_origin_byte_exact() {
  let mut origin =
    plain_origin(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_vec()).await;
  let (proxy, addr) = start_proxy(test_options("post"), |_proxy| {}).await;

  let payload = "name=waylay&kind=proxy";
  let request = format!(
    "POST http://{}/submit HTTP/1.1\r\nHost: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
    origin.addr,
    origin.addr,
    payload.len(),
    payload
  );
  let raw = roundtrip_close(addr, request.as_bytes()).await;
  let (head, _) = split_head_body(&raw);
  assert!(head.starts_with("HTTP/1.1 200 OK"));

  let seen = origin.requests.recv().await.expect("origin request");
  assert!(seen.starts_with("POST /submit HTTP/1.1"));
  assert!(seen.ends_with(payload), "origin saw: {}", seen);
  proxy.close();
}

#[tokio::test]
async fn malformed_request_line_answers_400() {
  let (proxy, addr) = start_proxy(test_options("malformed"), |_proxy| {}).await;
  let raw = roundtrip_close(addr, b"this is not http\r\n\r\n").await;
  let head = String::from_utf8_lossy(&raw);
  assert!(head.starts_with("HTTP/1.1 400 Bad Request"), "got: {}", head);
  proxy.close();
}

#[tokio::test]
async fn relative_target_without_tunnel_answers_400() {
  let (proxy, addr) = start_proxy(test_options("relative"), |_proxy| {}).await;
  let raw = roundtrip_close(addr, b"GET /not-absolute HTTP/1.1\r\nHost: x\r\n\r\n").await;
  let head = String::from_utf8_lossy(&raw);
  assert!(head.starts_with("HTTP/1.1 400 Bad Request"), "got: {}", head);
  proxy.close();
}

#[tokio::test]
async fn close_and_shutdown_are_idempotent() {
  let origin = plain_origin(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok".to_vec()).await;
  let (proxy, addr) = start_proxy(test_options("shutdown"), |_proxy| {}).await;

  let request = format!(
    "GET http://{}/ HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
    origin.addr, origin.addr
  );
  let raw = roundtrip_close(addr, request.as_bytes()).await;
  assert!(raw.starts_with(b"HTTP/1.1 200 OK"));

  proxy.shutdown(Duration::from_millis(200)).await;
  proxy.shutdown(Duration::from_millis(200)).await;
  proxy.close();
  proxy.close();

  // the listener no longer serves new connections
  tokio::time::sleep(Duration::from_millis(50)).await;
  let refused = match TcpStream::connect(addr).await {
    Err(_) => true,
    Ok(mut stream) => {
      // accepted by a dying listener backlog at worst; it must go nowhere
      stream.write_all(request.as_bytes()).await.ok();
      let mut buf = Vec::new();
      matches!(stream.read_to_end(&mut buf).await, Ok(0)) || buf.is_empty()
    }
  };
  assert!(refused, "proxy must not serve after close");
}
