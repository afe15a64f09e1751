//! The live flow model the engine hands to hooks

use crate::request::{Headers, MessageContent};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use rustls_pki_types::CertificateDer;
use url::Url;

/// Stable identity of a flow for as long as the engine tracks it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowId(u64);

impl FlowId {
  pub(crate) fn next() -> Self {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    FlowId(NEXT.fetch_add(1, Ordering::Relaxed))
  }
}

impl fmt::Display for FlowId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "flow-{}", self.0)
  }
}

/// The request as it will be sent upstream
#[derive(Debug, Clone)]
pub struct HttpRequest {
  /// Method
  pub method: String,
  /// Absolute URL
  pub url: String,
  /// Protocol version from the request line
  pub http_version: String,
  /// Header lines in wire order
  pub headers: Headers,
  /// Buffered body; empty while streaming
  pub body: Bytes,
  /// Relay the body without buffering it
  pub stream: bool,
  /// When the request line was read
  pub timestamp_start: DateTime<Utc>,
  /// When the body was fully read
  pub timestamp_end: Option<DateTime<Utc>>,
}

impl HttpRequest {
  /// Change the URL, keeping the `Host` header in line with the new authority
  pub fn set_url(&mut self, url: &str) {
    if let Ok(parsed) = Url::parse(url) {
      if let Some(host) = parsed.host_str() {
        let authority = match parsed.port() {
          Some(port) => format!("{}:{}", host, port),
          None => host.to_string(),
        };
        if self.headers.get("host") != Some(authority.as_str()) && self.headers.contains("host") {
          self.headers.set("Host", authority);
        }
      }
    }
    self.url = url.to_string();
  }

  /// Whether the client asked for a WebSocket upgrade
  pub fn is_websocket_upgrade(&self) -> bool {
    self
      .headers
      .get("upgrade")
      .map(|v| v.eq_ignore_ascii_case("websocket"))
      .unwrap_or(false)
  }
}

/// The response as it will be sent to the client
#[derive(Debug, Clone)]
pub struct HttpResponse {
  /// Status code
  pub status_code: u16,
  /// Reason phrase
  pub reason: String,
  /// Protocol version from the status line
  pub http_version: String,
  /// Header lines in wire order
  pub headers: Headers,
  /// Buffered body; empty while streaming
  pub body: Bytes,
  /// Relay the body without buffering it
  pub stream: bool,
  /// When the status line was read
  pub timestamp_start: DateTime<Utc>,
  /// When the body was fully read
  pub timestamp_end: Option<DateTime<Utc>>,
}

impl HttpResponse {
  /// A complete response produced by the proxy itself
  pub fn make(status_code: u16, headers: Headers, body: impl Into<Bytes>) -> Self {
    let now = Utc::now();
    let reason = http::StatusCode::from_u16(status_code)
      .ok()
      .and_then(|s| s.canonical_reason())
      .unwrap_or("")
      .to_string();
    Self {
      status_code,
      reason,
      http_version: "HTTP/1.1".to_string(),
      headers,
      body: body.into(),
      stream: false,
      timestamp_start: now,
      timestamp_end: Some(now),
    }
  }
}

/// What the engine knows about the upstream server connection
#[derive(Debug, Clone, Default)]
pub struct ServerConn {
  /// Peer address of the upstream connection
  pub address: Option<SocketAddr>,
  /// Certificate chain presented during the TLS handshake
  pub certificates: Vec<CertificateDer<'static>>,
  /// When connecting started
  pub timestamp_start: Option<DateTime<Utc>>,
  /// When the TCP connection was established
  pub timestamp_tcp_setup: Option<DateTime<Utc>>,
  /// When the TLS handshake finished
  pub timestamp_tls_setup: Option<DateTime<Utc>>,
}

/// One WebSocket message relayed by the engine
#[derive(Debug, Clone)]
pub struct FlowMessage {
  /// Sent by the client
  pub from_client: bool,
  /// Payload
  pub content: MessageContent,
  /// When the message was relayed
  pub timestamp: DateTime<Utc>,
}

/// Messages of an upgraded connection, in relay order
#[derive(Debug, Clone, Default)]
pub struct WebSocketData {
  /// Every message seen so far
  pub messages: Vec<FlowMessage>,
}

/// One proxied exchange
#[derive(Debug, Clone)]
pub struct Flow {
  /// Identity used to correlate hook invocations
  pub id: FlowId,
  /// Browser side address
  pub client_addr: SocketAddr,
  /// Live request
  pub request: HttpRequest,
  /// Live response, set by upstream or by a hook
  pub response: Option<HttpResponse>,
  /// Upstream connection details
  pub server_conn: ServerConn,
  /// Present once the connection was upgraded to WebSocket
  pub websocket: Option<WebSocketData>,
}

impl Flow {
  /// Start a flow for a freshly read request head
  pub fn new(client_addr: SocketAddr, request: HttpRequest) -> Self {
    Self {
      id: FlowId::next(),
      client_addr,
      request,
      response: None,
      server_conn: ServerConn::default(),
      websocket: None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn request(url: &str) -> HttpRequest {
    HttpRequest {
      method: "GET".to_string(),
      url: url.to_string(),
      http_version: "HTTP/1.1".to_string(),
      headers: Headers::from_iter([("Host", "example.com")]),
      body: Bytes::new(),
      stream: true,
      timestamp_start: Utc::now(),
      timestamp_end: None,
    }
  }

  #[test]
  fn test_set_url_updates_host() {
    let mut req = request("http://example.com/a");
    req.set_url("http://other.org:8080/b");
    assert_eq!(req.headers.get("host"), Some("other.org:8080"));
    assert_eq!(req.url, "http://other.org:8080/b");
  }

  #[test]
  fn test_flow_ids_are_unique() {
    let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
    let a = Flow::new(addr, request("http://example.com/"));
    let b = Flow::new(addr, request("http://example.com/"));
    assert_ne!(a.id, b.id);
  }

  #[test]
  fn test_make_response() {
    let response = HttpResponse::make(404, Headers::new(), "gone");
    assert_eq!(response.reason, "Not Found");
    assert!(!response.stream);
  }
}
