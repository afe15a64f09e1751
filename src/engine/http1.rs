//! Minimal HTTP/1.1 message codec used on both sides of the proxy

use crate::errors::{Error, Result};
use crate::request::Headers;
use bytes::Bytes;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound for a request or status line plus headers
pub(crate) const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Parsed request line and headers
#[derive(Debug, Clone)]
pub(crate) struct RequestHead {
  pub method: String,
  pub target: String,
  pub version: String,
  pub headers: Headers,
}

/// Parsed status line and headers
#[derive(Debug, Clone)]
pub(crate) struct ResponseHead {
  pub version: String,
  pub status: u16,
  pub reason: String,
  pub headers: Headers,
}

/// How the length of a message body is delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyKind {
  Empty,
  Length(u64),
  Chunked,
  UntilClose,
}

impl RequestHead {
  /// Whether the client wants to reuse the connection afterwards
  pub fn keep_alive(&self) -> bool {
    wants_keep_alive(&self.version, &self.headers)
  }
}

impl ResponseHead {
  /// Whether the server allows reusing the connection afterwards
  pub fn keep_alive(&self) -> bool {
    wants_keep_alive(&self.version, &self.headers)
  }
}

pub(crate) fn wants_keep_alive(version: &str, headers: &Headers) -> bool {
  let connection = headers.get_all("connection").collect::<Vec<_>>().join(",");
  let has = |token: &str| {
    connection
      .split(',')
      .any(|t| t.trim().eq_ignore_ascii_case(token))
  };
  if version == "HTTP/1.0" {
    has("keep-alive")
  } else {
    !has("close")
  }
}

fn is_chunked(headers: &Headers) -> bool {
  headers
    .get_all("transfer-encoding")
    .flat_map(|v| v.split(','))
    .last()
    .map(|t| t.trim().eq_ignore_ascii_case("chunked"))
    .unwrap_or(false)
}

fn content_length(headers: &Headers) -> Result<Option<u64>> {
  match headers.get("content-length") {
    Some(value) => value
      .trim()
      .parse::<u64>()
      .map(Some)
      .map_err(|_| Error::invalid_request(format!("Invalid Content-Length: {}", value))),
    None => Ok(None),
  }
}

/// Body framing of a request
pub(crate) fn request_body_kind(headers: &Headers) -> Result<BodyKind> {
  if is_chunked(headers) {
    return Ok(BodyKind::Chunked);
  }
  Ok(match content_length(headers)? {
    Some(0) | None => BodyKind::Empty,
    Some(n) => BodyKind::Length(n),
  })
}

/// Responses that never carry a body, whatever their headers say
pub(crate) fn is_bodiless(method: &str, status: u16) -> bool {
  method.eq_ignore_ascii_case("HEAD") || (100..200).contains(&status) || status == 204 || status == 304
}

/// Body framing of a response to a `method` request
pub(crate) fn response_body_kind(method: &str, status: u16, headers: &Headers) -> Result<BodyKind> {
  if is_bodiless(method, status) {
    return Ok(BodyKind::Empty);
  }
  if is_chunked(headers) {
    return Ok(BodyKind::Chunked);
  }
  Ok(match content_length(headers)? {
    Some(0) => BodyKind::Empty,
    Some(n) => BodyKind::Length(n),
    None => BodyKind::UntilClose,
  })
}

async fn read_line<R>(reader: &mut R, budget: usize) -> Result<Option<String>>
where
  R: AsyncBufRead + Unpin,
{
  let mut line = Vec::new();
  let n = (&mut *reader)
    .take(budget as u64 + 1)
    .read_until(b'\n', &mut line)
    .await?;
  if n == 0 {
    return Ok(None);
  }
  if n > budget {
    return Err(Error::invalid_request("Message head too large"));
  }
  let text = String::from_utf8_lossy(&line);
  Ok(Some(text.trim_end_matches(['\r', '\n']).to_string()))
}

/// Read a start line and header lines. `None` when the peer closed cleanly
/// before sending anything.
async fn read_head<R>(reader: &mut R) -> Result<Option<(String, Headers)>>
where
  R: AsyncBufRead + Unpin,
{
  let mut used = 0usize;
  let start = loop {
    match read_line(reader, MAX_HEAD_SIZE.saturating_sub(used)).await? {
      None => return Ok(None),
      // tolerate stray CRLF between messages
      Some(line) if line.is_empty() => used += 2,
      Some(line) => {
        used += line.len() + 2;
        break line;
      }
    }
  };
  let mut headers = Headers::new();
  let mut last: Option<(String, String)> = None;
  loop {
    let line = read_line(reader, MAX_HEAD_SIZE.saturating_sub(used))
      .await?
      .ok_or_else(|| Error::invalid_request("Connection closed inside message head"))?;
    used += line.len() + 2;
    if line.is_empty() {
      break;
    }
    if line.starts_with([' ', '\t']) {
      // obsolete line folding
      if let Some((_, value)) = last.as_mut() {
        value.push(' ');
        value.push_str(line.trim());
      }
      continue;
    }
    if let Some((name, value)) = last.take() {
      headers.add(name, value);
    }
    let (name, value) = line
      .split_once(':')
      .ok_or_else(|| Error::invalid_request(format!("Invalid header line: {}", line)))?;
    last = Some((name.trim().to_string(), value.trim().to_string()));
  }
  if let Some((name, value)) = last {
    headers.add(name, value);
  }
  Ok(Some((start, headers)))
}

/// Read the next request head from a client connection
pub(crate) async fn read_request_head<R>(reader: &mut R) -> Result<Option<RequestHead>>
where
  R: AsyncBufRead + Unpin,
{
  let Some((line, headers)) = read_head(reader).await? else {
    return Ok(None);
  };
  let parts: Vec<&str> = line.split_whitespace().collect();
  if parts.len() != 3 || !parts[2].starts_with("HTTP/") {
    return Err(Error::invalid_request(format!("Invalid request line: {}", line)));
  }
  Ok(Some(RequestHead {
    method: parts[0].to_string(),
    target: parts[1].to_string(),
    version: parts[2].to_string(),
    headers,
  }))
}

/// Read a response head from an upstream connection
pub(crate) async fn read_response_head<R>(reader: &mut R) -> Result<ResponseHead>
where
  R: AsyncBufRead + Unpin,
{
  let (line, headers) = read_head(reader)
    .await?
    .ok_or_else(|| Error::connection_error("Upstream closed the connection without a response"))?;
  let mut parts = line.splitn(3, ' ');
  let version = parts.next().unwrap_or_default();
  if !version.starts_with("HTTP/") {
    return Err(Error::invalid_request(format!("Invalid status line: {}", line)));
  }
  let status = parts
    .next()
    .and_then(|s| s.parse::<u16>().ok())
    .ok_or_else(|| Error::invalid_request(format!("Invalid status line: {}", line)))?;
  Ok(ResponseHead {
    version: version.to_string(),
    status,
    reason: parts.next().unwrap_or_default().to_string(),
    headers,
  })
}

async fn read_chunk_size<R>(reader: &mut R) -> Result<u64>
where
  R: AsyncBufRead + Unpin,
{
  let line = read_line(reader, 1024)
    .await?
    .ok_or_else(|| Error::invalid_request("Connection closed inside chunked body"))?;
  let size = line.split(';').next().unwrap_or_default().trim();
  u64::from_str_radix(size, 16).map_err(|_| Error::invalid_request(format!("Invalid chunk size: {}", line)))
}

async fn skip_trailers<R>(reader: &mut R) -> Result<()>
where
  R: AsyncBufRead + Unpin,
{
  while let Some(line) = read_line(reader, MAX_HEAD_SIZE).await? {
    if line.is_empty() {
      break;
    }
  }
  Ok(())
}

fn too_large(limit: usize) -> Error {
  Error::invalid_request(format!("Body exceeds {} bytes", limit))
}

/// Read a whole body into memory, removing any chunked framing
pub(crate) async fn read_body<R>(reader: &mut R, kind: BodyKind, limit: usize) -> Result<Bytes>
where
  R: AsyncBufRead + Unpin,
{
  match kind {
    BodyKind::Empty => Ok(Bytes::new()),
    BodyKind::Length(len) => {
      if len > limit as u64 {
        return Err(too_large(limit));
      }
      let mut buf = vec![0u8; len as usize];
      reader.read_exact(&mut buf).await?;
      Ok(buf.into())
    }
    BodyKind::Chunked => {
      let mut buf = Vec::new();
      loop {
        let size = read_chunk_size(reader).await?;
        if size == 0 {
          skip_trailers(reader).await?;
          break;
        }
        match (buf.len() as u64).checked_add(size) {
          Some(total) if total <= limit as u64 => {}
          _ => return Err(too_large(limit)),
        }
        let start = buf.len();
        buf.resize(start + size as usize, 0);
        reader.read_exact(&mut buf[start..]).await?;
        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf).await?;
      }
      Ok(buf.into())
    }
    BodyKind::UntilClose => {
      let mut buf = Vec::new();
      (&mut *reader)
        .take(limit as u64 + 1)
        .read_to_end(&mut buf)
        .await?;
      if buf.len() > limit {
        return Err(too_large(limit));
      }
      Ok(buf.into())
    }
  }
}

/// Copy a body from `reader` to `writer` as is, framing included
pub(crate) async fn relay_body<R, W>(reader: &mut R, writer: &mut W, kind: BodyKind) -> Result<u64>
where
  R: AsyncBufRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let copied = match kind {
    BodyKind::Empty => 0,
    BodyKind::Length(len) => {
      let copied = tokio::io::copy(&mut (&mut *reader).take(len), writer).await?;
      if copied != len {
        return Err(Error::connection_error("Body ended before Content-Length"));
      }
      copied
    }
    BodyKind::Chunked => {
      let mut copied = 0;
      loop {
        let size = read_chunk_size(reader).await?;
        writer.write_all(format!("{:x}\r\n", size).as_bytes()).await?;
        if size == 0 {
          while let Some(line) = read_line(reader, MAX_HEAD_SIZE).await? {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\r\n").await?;
            if line.is_empty() {
              break;
            }
          }
          break;
        }
        let framed = size
          .checked_add(2)
          .ok_or_else(|| Error::invalid_request(format!("Chunk size {:x} out of range", size)))?;
        copied += tokio::io::copy(&mut (&mut *reader).take(framed), writer).await?;
      }
      copied
    }
    BodyKind::UntilClose => tokio::io::copy(reader, writer).await?,
  };
  writer.flush().await?;
  Ok(copied)
}

fn push_headers(buf: &mut Vec<u8>, headers: &Headers) {
  for (name, value) in headers.iter() {
    buf.extend_from_slice(name.as_bytes());
    buf.extend_from_slice(b": ");
    buf.extend_from_slice(value.as_bytes());
    buf.extend_from_slice(b"\r\n");
  }
  buf.extend_from_slice(b"\r\n");
}

/// Make `headers` describe a fully buffered body of `len` bytes
pub(crate) fn frame_buffered(headers: &mut Headers, len: usize, always: bool) {
  headers.remove("transfer-encoding");
  if always || len > 0 || headers.contains("content-length") {
    headers.set("Content-Length", len.to_string());
  }
}

/// Write a request head
pub(crate) async fn write_request_head<W>(
  writer: &mut W,
  method: &str,
  target: &str,
  headers: &Headers,
) -> Result<()>
where
  W: AsyncWrite + Unpin,
{
  let mut buf = format!("{} {} HTTP/1.1\r\n", method, target).into_bytes();
  push_headers(&mut buf, headers);
  writer.write_all(&buf).await?;
  Ok(())
}

/// Write a response head
pub(crate) async fn write_response_head<W>(
  writer: &mut W,
  status: u16,
  reason: &str,
  headers: &Headers,
) -> Result<()>
where
  W: AsyncWrite + Unpin,
{
  let mut buf = format!("HTTP/1.1 {} {}\r\n", status, reason).into_bytes();
  push_headers(&mut buf, headers);
  writer.write_all(&buf).await?;
  Ok(())
}

/// Write a complete response with a buffered body and flush it
pub(crate) async fn write_response<W>(
  writer: &mut W,
  status: u16,
  reason: &str,
  headers: &Headers,
  body: &[u8],
) -> Result<()>
where
  W: AsyncWrite + Unpin,
{
  let mut headers = headers.clone();
  frame_buffered(&mut headers, body.len(), true);
  write_response_head(writer, status, reason, &headers).await?;
  writer.write_all(body).await?;
  writer.flush().await?;
  Ok(())
}

/// Answer the client with a plain text error
pub(crate) async fn write_error<W>(writer: &mut W, status: u16, message: &str) -> Result<()>
where
  W: AsyncWrite + Unpin,
{
  let reason = http::StatusCode::from_u16(status)
    .ok()
    .and_then(|s| s.canonical_reason())
    .unwrap_or("");
  let headers = Headers::from_iter([
    ("Content-Type", "text/plain; charset=utf-8"),
    ("Connection", "close"),
  ]);
  write_response(writer, status, reason, &headers, message.as_bytes()).await
}
