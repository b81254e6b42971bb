//! HTTP/1.1 wire codec
//!
//! Parses request and response heads from buffered readers, reads bodies
//! under the buffering threshold, and serializes messages back onto the
//! wire. Bodies above the threshold are left on the reader for the caller
//! to relay chunk-wise.

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode, Uri, Version};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::flow::{Request, Response};

/// Maximum accepted request-line length.
pub const MAX_REQUEST_LINE: usize = 8 * 1024;
/// Maximum accepted total header size.
pub const MAX_HEADER_BYTES: usize = 64 * 1024;
/// Read granularity for body relays.
pub const CHUNK_SIZE: usize = 16 * 1024;

const CR_LF: &[u8] = b"\r\n";
const COLON_SPACE: &[u8] = b": ";

/// Parsed request line and headers.
#[derive(Debug)]
pub struct RequestHead {
  /// Request method
  pub method: Method,
  /// Request target exactly as it appeared on the request line
  pub target: String,
  /// Protocol version
  pub version: Version,
  /// Request headers
  pub headers: HeaderMap<HeaderValue>,
}

/// Parsed status line and headers.
#[derive(Debug)]
pub struct ResponseHead {
  /// Protocol version
  pub version: Version,
  /// Status code
  pub status: StatusCode,
  /// Response headers
  pub headers: HeaderMap<HeaderValue>,
}

/// How a message body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLength {
  /// No body
  None,
  /// `Content-Length` declared
  Known(u64),
  /// `Transfer-Encoding: chunked`
  Chunked,
  /// Delimited by connection close (responses only)
  Close,
}

/// Result of reading a body under the buffering threshold.
#[derive(Debug)]
pub enum BodyRead {
  /// The entire body fit under the threshold.
  Complete(Bytes),
  /// The body crossed the threshold; `prefix` holds the decoded bytes
  /// already consumed and the rest is still on the reader.
  Streaming {
    /// Decoded bytes consumed before the threshold was crossed
    prefix: Bytes,
  },
}

fn parse_version(token: &[u8]) -> Result<Version> {
  match token {
    b"HTTP/1.0" => Ok(Version::HTTP_10),
    b"HTTP/1.1" => Ok(Version::HTTP_11),
    _ => Err(Error::invalid_request(format!(
      "unsupported http version {:?}",
      String::from_utf8_lossy(token)
    ))),
  }
}

fn parse_header(line: &[u8]) -> Result<(HeaderName, HeaderValue)> {
  let line = line.strip_suffix(CR_LF).unwrap_or(line);
  let line = line.strip_suffix(b"\n").unwrap_or(line);
  let idx = line
    .iter()
    .position(|b| *b == b':')
    .ok_or_else(|| Error::invalid_request("header line without colon"))?;
  let name = HeaderName::from_bytes(&line[..idx])
    .map_err(|e| Error::invalid_request(format!("bad header name: {}", e)))?;
  let mut value = &line[idx + 1..];
  while value.first() == Some(&b' ') || value.first() == Some(&b'\t') {
    value = &value[1..];
  }
  let value = HeaderValue::from_bytes(value)
    .map_err(|e| Error::invalid_request(format!("bad header value: {}", e)))?;
  Ok((name, value))
}

async fn read_headers<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<HeaderMap<HeaderValue>> {
  let mut headers = HeaderMap::new();
  let mut line = Vec::new();
  let mut total = 0usize;
  loop {
    line.clear();
    let n = reader.read_until(b'\n', &mut line).await?;
    if n == 0 {
      return Err(Error::connection("eof while reading headers"));
    }
    if line == b"\r\n" || line == b"\n" {
      return Ok(headers);
    }
    total += n;
    if total > MAX_HEADER_BYTES {
      return Err(Error::invalid_request("headers exceed maximum size"));
    }
    let (name, value) = parse_header(&line)?;
    headers.append(name, value);
  }
}

/// Read one request head.
///
/// Returns `Ok(None)` on a clean end of stream before any byte of a new
/// request, which is how a keep-alive client hangs up.
pub async fn read_request_head<R: AsyncBufRead + Unpin>(
  reader: &mut R,
) -> Result<Option<RequestHead>> {
  let mut line = Vec::new();
  let n = reader.read_until(b'\n', &mut line).await?;
  if n == 0 {
    return Ok(None);
  }
  if n > MAX_REQUEST_LINE {
    return Err(Error::invalid_request("request line too long"));
  }
  let trimmed = line
    .strip_suffix(CR_LF)
    .or_else(|| line.strip_suffix(b"\n"))
    .unwrap_or(&line);
  let mut parts = trimmed.split(|b| *b == b' ').filter(|p| !p.is_empty());
  let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
    (Some(m), Some(t), Some(v)) => (m, t, v),
    _ => return Err(Error::invalid_request("malformed request line")),
  };
  let method = Method::from_bytes(method)
    .map_err(|e| Error::invalid_request(format!("bad method: {}", e)))?;
  let target = String::from_utf8(target.to_vec())
    .map_err(|_| Error::invalid_request("request target is not utf-8"))?;
  let version = parse_version(version)?;
  let headers = read_headers(reader).await?;
  Ok(Some(RequestHead {
    method,
    target,
    version,
    headers,
  }))
}

/// Read one response head (status line and headers).
pub async fn read_response_head<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<ResponseHead> {
  let mut line = Vec::new();
  let n = reader.read_until(b'\n', &mut line).await?;
  if n == 0 {
    return Err(Error::connection("eof while reading status line"));
  }
  let trimmed = line
    .strip_suffix(CR_LF)
    .or_else(|| line.strip_suffix(b"\n"))
    .unwrap_or(&line);
  let mut parts = trimmed.splitn(3, |b| *b == b' ');
  let (version, status) = match (parts.next(), parts.next()) {
    (Some(v), Some(s)) => (parse_version(v)?, s),
    _ => return Err(Error::invalid_request("malformed status line")),
  };
  let status = StatusCode::from_bytes(status)
    .map_err(|e| Error::invalid_request(format!("bad status code: {}", e)))?;
  let headers = read_headers(reader).await?;
  Ok(ResponseHead {
    version,
    status,
    headers,
  })
}

fn is_chunked(headers: &HeaderMap<HeaderValue>) -> bool {
  headers
    .get_all(http::header::TRANSFER_ENCODING)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .any(|token| token.trim().eq_ignore_ascii_case("chunked"))
}

fn content_length(headers: &HeaderMap<HeaderValue>) -> Result<Option<u64>> {
  match headers.get(http::header::CONTENT_LENGTH) {
    None => Ok(None),
    Some(v) => v
      .to_str()
      .ok()
      .and_then(|v| v.trim().parse::<u64>().ok())
      .map(Some)
      .ok_or_else(|| Error::invalid_request("bad content-length")),
  }
}

/// Determine how a request body is delimited.
pub fn request_body_length(headers: &HeaderMap<HeaderValue>) -> Result<BodyLength> {
  if is_chunked(headers) {
    return Ok(BodyLength::Chunked);
  }
  match content_length(headers)? {
    Some(0) | None => Ok(BodyLength::None),
    Some(n) => Ok(BodyLength::Known(n)),
  }
}

/// Determine how a response body is delimited, given the request method.
pub fn response_body_length(
  method: &Method,
  status: StatusCode,
  headers: &HeaderMap<HeaderValue>,
) -> Result<BodyLength> {
  if method == Method::HEAD
    || status.is_informational()
    || status == StatusCode::NO_CONTENT
    || status == StatusCode::NOT_MODIFIED
  {
    return Ok(BodyLength::None);
  }
  if is_chunked(headers) {
    return Ok(BodyLength::Chunked);
  }
  match content_length(headers)? {
    Some(0) => Ok(BodyLength::None),
    Some(n) => Ok(BodyLength::Known(n)),
    None => Ok(BodyLength::Close),
  }
}

/// Read one decoded chunk of a chunked body.
///
/// Returns `Ok(None)` after consuming the terminal zero chunk and any
/// trailers.
pub async fn read_chunk<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<Bytes>> {
  let mut size_line = Vec::new();
  let n = reader.read_until(b'\n', &mut size_line).await?;
  if n == 0 {
    return Err(Error::connection("eof while reading chunk size"));
  }
  let size_str = String::from_utf8_lossy(&size_line);
  let size_str = size_str.trim();
  // chunk extensions after ';' are ignored
  let size_str = size_str.split(';').next().unwrap_or("").trim();
  let size = usize::from_str_radix(size_str, 16)
    .map_err(|_| Error::invalid_request(format!("bad chunk size {:?}", size_str)))?;
  if size == 0 {
    // consume trailers up to the blank line
    let mut trailer = Vec::new();
    loop {
      trailer.clear();
      let n = reader.read_until(b'\n', &mut trailer).await?;
      if n == 0 || trailer == b"\r\n" || trailer == b"\n" {
        return Ok(None);
      }
    }
  }
  let mut data = vec![0u8; size];
  reader.read_exact(&mut data).await?;
  let mut crlf = [0u8; 2];
  reader.read_exact(&mut crlf).await?;
  Ok(Some(Bytes::from(data)))
}

/// Read a body, buffering it in memory as long as it stays under `limit`.
pub async fn read_body<R: AsyncBufRead + Unpin>(
  reader: &mut R,
  length: BodyLength,
  limit: u64,
) -> Result<BodyRead> {
  match length {
    BodyLength::None => Ok(BodyRead::Complete(Bytes::new())),
    BodyLength::Known(n) => {
      if n > limit {
        return Ok(BodyRead::Streaming {
          prefix: Bytes::new(),
        });
      }
      let mut body = vec![0u8; n as usize];
      reader.read_exact(&mut body).await?;
      Ok(BodyRead::Complete(Bytes::from(body)))
    }
    BodyLength::Chunked => {
      let mut body = Vec::new();
      while let Some(chunk) = read_chunk(reader).await? {
        body.extend_from_slice(&chunk);
        if body.len() as u64 > limit {
          return Ok(BodyRead::Streaming {
            prefix: Bytes::from(body),
          });
        }
      }
      Ok(BodyRead::Complete(Bytes::from(body)))
    }
    BodyLength::Close => {
      let mut body = Vec::new();
      let mut buf = [0u8; CHUNK_SIZE];
      loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
          return Ok(BodyRead::Complete(Bytes::from(body)));
        }
        body.extend_from_slice(&buf[..n]);
        if body.len() as u64 > limit {
          return Ok(BodyRead::Streaming {
            prefix: Bytes::from(body),
          });
        }
      }
    }
  }
}

/// Body framing to declare when serializing a message head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
  /// No body-framing headers
  None,
  /// `Content-Length: n`
  Length(u64),
  /// `Transfer-Encoding: chunked`
  Chunked,
}

fn extend_headers(out: &mut Vec<u8>, headers: &HeaderMap<HeaderValue>, framing: Framing) {
  for (name, value) in headers {
    out.extend(name.as_str().as_bytes());
    out.extend(COLON_SPACE);
    out.extend(value.as_bytes());
    out.extend(CR_LF);
  }
  match framing {
    Framing::None => {}
    Framing::Length(n) => {
      out.extend(b"content-length: ");
      out.extend(n.to_string().as_bytes());
      out.extend(CR_LF);
    }
    Framing::Chunked => {
      out.extend(b"transfer-encoding: chunked");
      out.extend(CR_LF);
    }
  }
  out.extend(CR_LF);
}

/// Serialize a request head. `absolute_form` selects the proxy request-line
/// form used towards an upstream HTTP proxy. The caller is responsible for
/// having stripped framing headers before choosing `framing`.
pub fn encode_request_head(req: &Request, absolute_form: bool, framing: Framing) -> Vec<u8> {
  let mut out = Vec::with_capacity(256);
  out.extend(req.method.as_str().as_bytes());
  out.push(b' ');
  if absolute_form {
    out.extend(req.uri.to_string().as_bytes());
  } else {
    let path = req
      .uri
      .path_and_query()
      .map(|pq| pq.as_str())
      .unwrap_or("/");
    out.extend(path.as_bytes());
  }
  out.push(b' ');
  out.extend(format!("{:?}", req.version).as_bytes());
  out.extend(CR_LF);
  if req.headers.get(http::header::HOST).is_none() {
    if let Some(authority) = req.uri.authority() {
      out.extend(b"host: ");
      out.extend(authority.as_str().as_bytes());
      out.extend(CR_LF);
    }
  }
  extend_headers(&mut out, &req.headers, framing);
  out
}

/// Serialize a response head.
pub fn encode_response_head(resp: &Response, framing: Framing) -> Vec<u8> {
  let mut out = Vec::with_capacity(256);
  out.extend(format!("{:?}", resp.version).as_bytes());
  out.push(b' ');
  out.extend(resp.status.as_str().as_bytes());
  out.push(b' ');
  out.extend(
    resp
      .status
      .canonical_reason()
      .unwrap_or("Unknown")
      .as_bytes(),
  );
  out.extend(CR_LF);
  extend_headers(&mut out, &resp.headers, framing);
  out
}

/// Write one chunk in chunked framing.
pub async fn write_chunk<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> Result<()> {
  if data.is_empty() {
    return Ok(());
  }
  writer
    .write_all(format!("{:x}\r\n", data.len()).as_bytes())
    .await?;
  writer.write_all(data).await?;
  writer.write_all(CR_LF).await?;
  Ok(())
}

/// Terminate a chunked body.
pub async fn write_chunk_end<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<()> {
  writer.write_all(b"0\r\n\r\n").await?;
  Ok(())
}

/// Build an absolute URI for a request received by the proxy.
///
/// Inside an intercepted tunnel the target is origin-form and the authority
/// comes from the tunnel; on the plain listener the target must already be
/// absolute (a proxy-style request line).
pub fn absolute_uri(target: &str, tunnel_authority: Option<&str>) -> Result<Uri> {
  if let Some(authority) = tunnel_authority {
    if target.starts_with('/') {
      return format!("https://{}{}", authority, target)
        .parse::<Uri>()
        .map_err(|e| Error::invalid_request(format!("bad request target: {}", e)));
    }
  }
  let uri: Uri = target
    .parse()
    .map_err(|e| Error::invalid_request(format!("bad request target: {}", e)))?;
  if uri.scheme().is_none() || uri.authority().is_none() {
    return Err(Error::invalid_request(
      "proxy requests must use an absolute uri",
    ));
  }
  Ok(uri)
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Cursor;
  use tokio::io::BufReader;

  #[tokio::test]
  async fn parses_request_head() {
    let raw = b"GET http://example.test/a?b=1 HTTP/1.1\r\nHost: example.test\r\nAccept: */*\r\n\r\n";
    let mut reader = BufReader::new(Cursor::new(&raw[..]));
    let head = read_request_head(&mut reader).await.unwrap().unwrap();
    assert_eq!(head.method, Method::GET);
    assert_eq!(head.target, "http://example.test/a?b=1");
    assert_eq!(head.version, Version::HTTP_11);
    assert_eq!(
      head.headers.get(http::header::HOST).unwrap(),
      "example.test"
    );
  }

  #[tokio::test]
  async fn eof_before_request_is_none() {
    let mut reader = BufReader::new(Cursor::new(&b""[..]));
    assert!(read_request_head(&mut reader).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn parses_response_head_and_body() {
    let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
    let mut reader = BufReader::new(Cursor::new(&raw[..]));
    let head = read_response_head(&mut reader).await.unwrap();
    assert_eq!(head.status, StatusCode::OK);
    let length = response_body_length(&Method::GET, head.status, &head.headers).unwrap();
    assert_eq!(length, BodyLength::Known(5));
    match read_body(&mut reader, length, 1024).await.unwrap() {
      BodyRead::Complete(body) => assert_eq!(&body[..], b"hello"),
      other => panic!("unexpected body state: {:?}", other),
    }
  }

  #[tokio::test]
  async fn chunked_body_decodes() {
    let raw = b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
    let mut reader = BufReader::new(Cursor::new(&raw[..]));
    match read_body(&mut reader, BodyLength::Chunked, 1024).await.unwrap() {
      BodyRead::Complete(body) => assert_eq!(&body[..], b"hello world"),
      other => panic!("unexpected body state: {:?}", other),
    }
  }

  #[tokio::test]
  async fn large_known_body_switches_to_streaming() {
    let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n";
    let mut reader = BufReader::new(Cursor::new(&raw[..]));
    let head = read_response_head(&mut reader).await.unwrap();
    let length = response_body_length(&Method::GET, head.status, &head.headers).unwrap();
    match read_body(&mut reader, length, 10).await.unwrap() {
      BodyRead::Streaming { prefix } => assert!(prefix.is_empty()),
      other => panic!("unexpected body state: {:?}", other),
    }
  }

  #[tokio::test]
  async fn chunked_body_over_limit_keeps_prefix() {
    let raw = b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
    let mut reader = BufReader::new(Cursor::new(&raw[..]));
    match read_body(&mut reader, BodyLength::Chunked, 4).await.unwrap() {
      BodyRead::Streaming { prefix } => assert_eq!(&prefix[..], b"hello"),
      other => panic!("unexpected body state: {:?}", other),
    }
  }

  #[test]
  fn head_no_body_even_with_content_length() {
    let mut headers = HeaderMap::new();
    headers.insert(
      http::header::CONTENT_LENGTH,
      HeaderValue::from_static("1234"),
    );
    let length = response_body_length(&Method::HEAD, StatusCode::OK, &headers).unwrap();
    assert_eq!(length, BodyLength::None);
  }

  #[test]
  fn absolute_uri_rules() {
    assert!(absolute_uri("/path", None).is_err());
    assert!(absolute_uri("http://example.test/", None).is_ok());
    let uri = absolute_uri("/path", Some("example.test:443")).unwrap();
    assert_eq!(uri.scheme_str(), Some("https"));
    assert_eq!(uri.host(), Some("example.test"));
  }
}
