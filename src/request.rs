//! Captured request/response records
//!
//! These are the snapshots handed to interceptors and persisted by the
//! [`CaptureStore`](crate::storage::CaptureStore). They are detached from the
//! live proxy flow: mutating a record only affects the proxied traffic when the
//! interception pipeline writes it back.

use crate::decode::decode;
use crate::errors::{Error, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;
use uuid::Uuid;

/// Opaque correlation id linking a request to its response, messages and HAR entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
  /// Generate a fresh random id
  pub fn new() -> Self {
    RequestId(Uuid::new_v4())
  }
}

impl Default for RequestId {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Display for RequestId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0.simple())
  }
}

impl std::str::FromStr for RequestId {
  type Err = uuid::Error;

  fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
    Uuid::parse_str(s).map(RequestId)
  }
}

/// Ordered header list with case-insensitive lookup.
///
/// Duplicate header names are preserved in the order they were received.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
  /// Empty header list
  pub fn new() -> Self {
    Headers(Vec::new())
  }

  /// First value for `name`
  pub fn get(&self, name: &str) -> Option<&str> {
    self
      .0
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// Every value for `name`, in order
  pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    self
      .0
      .iter()
      .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// Whether a header named `name` is present
  pub fn contains(&self, name: &str) -> bool {
    self.get(name).is_some()
  }

  /// Replace every header named `name` with a single value.
  ///
  /// The new value takes the position of the first replaced header, or is
  /// appended when the header was absent.
  pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
    let name = name.into();
    let value = value.into();
    match self.0.iter().position(|(k, _)| k.eq_ignore_ascii_case(&name)) {
      Some(first) => {
        self.0[first] = (name.clone(), value);
        let mut index = 0;
        self.0.retain(|(k, _)| {
          let keep = index <= first || !k.eq_ignore_ascii_case(&name);
          index += 1;
          keep
        });
      }
      None => self.0.push((name, value)),
    }
  }

  /// Append a header, keeping existing ones with the same name
  pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
    self.0.push((name.into(), value.into()));
  }

  /// Remove every header named `name`, returning how many were removed
  pub fn remove(&mut self, name: &str) -> usize {
    let before = self.0.len();
    self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    before - self.0.len()
  }

  /// Iterate `(name, value)` pairs in order
  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
  }

  /// Number of header lines
  pub fn len(&self) -> usize {
    self.0.len()
  }

  /// Whether there are no headers
  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
  fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
    Headers(
      iter
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect(),
    )
  }
}

impl IntoIterator for Headers {
  type Item = (String, String);
  type IntoIter = std::vec::IntoIter<(String, String)>;

  fn into_iter(self) -> Self::IntoIter {
    self.0.into_iter()
  }
}

pub(crate) mod bytes_serde {
  use base64::prelude::BASE64_STANDARD;
  use base64::Engine;
  use bytes::Bytes;
  use serde::{Deserialize, Deserializer, Serializer};

  pub fn serialize<S: Serializer>(v: &[u8], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&BASE64_STANDARD.encode(v))
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Bytes, D::Error> {
    let encoded = String::deserialize(d)?;
    BASE64_STANDARD
      .decode(encoded.as_bytes())
      .map(Bytes::from)
      .map_err(serde::de::Error::custom)
  }
}

/// A summary of one certificate presented by the upstream server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateInfo {
  /// Subject distinguished name
  pub subject: String,
  /// Issuer distinguished name
  pub issuer: String,
  /// Serial number as colon separated hex
  pub serial: String,
  /// Public key algorithm, e.g. `RSA` or `EC`
  pub key_algorithm: String,
  /// Public key size in bits
  pub key_size: usize,
  /// Start of the validity window
  pub not_before: DateTime<Utc>,
  /// End of the validity window
  pub not_after: DateTime<Utc>,
  /// Whether the certificate had expired when it was captured
  pub expired: bool,
  /// Subject organization
  pub organization: Option<String>,
  /// Subject common name
  pub common_name: Option<String>,
  /// DNS names and IP addresses from the subject alternative name extension
  pub alt_names: Vec<String>,
}

impl CertificateInfo {
  /// Parse a DER encoded certificate
  pub fn from_der(der: &[u8]) -> Result<Self> {
    use x509_parser::prelude::*;
    use x509_parser::public_key::PublicKey;

    let (_, cert) = X509Certificate::from_der(der)
      .map_err(|e| Error::certificate_error(format!("Failed to parse certificate: {}", e)))?;
    let subject = cert.subject();
    let validity = cert.validity();
    let to_utc = |time: &ASN1Time| DateTime::from_timestamp(time.timestamp(), 0).unwrap_or_default();

    let (key_algorithm, key_size) = match cert.public_key().parsed() {
      Ok(key @ PublicKey::RSA(_)) => ("RSA".to_string(), key.key_size()),
      Ok(key @ PublicKey::EC(_)) => ("EC".to_string(), key.key_size()),
      Ok(key @ PublicKey::DSA(_)) => ("DSA".to_string(), key.key_size()),
      Ok(key) => (
        cert.public_key().algorithm.algorithm.to_id_string(),
        key.key_size(),
      ),
      Err(_) => (cert.public_key().algorithm.algorithm.to_id_string(), 0),
    };

    let mut alt_names = Vec::new();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
      for name in &san.value.general_names {
        match name {
          GeneralName::DNSName(dns) => alt_names.push(dns.to_string()),
          GeneralName::IPAddress(raw) => {
            if let Some(ip) = ip_from_bytes(raw) {
              alt_names.push(ip.to_string());
            }
          }
          _ => {}
        }
      }
    }

    let organization = subject
      .iter_organization()
      .next()
      .and_then(|o| o.as_str().ok())
      .map(str::to_string);
    let common_name = subject
      .iter_common_name()
      .next()
      .and_then(|cn| cn.as_str().ok())
      .map(str::to_string);
    let info = CertificateInfo {
      subject: subject.to_string(),
      issuer: cert.issuer().to_string(),
      serial: cert.raw_serial_as_string(),
      key_algorithm,
      key_size,
      not_before: to_utc(&validity.not_before),
      not_after: to_utc(&validity.not_after),
      expired: !validity.is_valid(),
      organization,
      common_name,
      alt_names,
    };
    Ok(info)
  }
}

fn ip_from_bytes(raw: &[u8]) -> Option<std::net::IpAddr> {
  match raw.len() {
    4 => <[u8; 4]>::try_from(raw).ok().map(std::net::IpAddr::from),
    16 => <[u8; 16]>::try_from(raw).ok().map(std::net::IpAddr::from),
    _ => None,
  }
}

/// Payload of a WebSocket message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageContent {
  /// Text frame
  Text(String),
  /// Binary frame
  Binary(#[serde(with = "bytes_serde")] Bytes),
}

impl fmt::Display for MessageContent {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      MessageContent::Text(text) => f.write_str(text),
      MessageContent::Binary(data) => write!(f, "{}", data.escape_ascii()),
    }
  }
}

/// One WebSocket message observed on a captured connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebSocketMessage {
  /// Whether the browser sent this message
  pub from_client: bool,
  /// Message payload
  pub content: MessageContent,
  /// When the proxy saw the message
  pub date: DateTime<Utc>,
}

impl fmt::Display for WebSocketMessage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    self.content.fmt(f)
  }
}

/// A captured HTTP response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedResponse {
  /// Status code
  pub status_code: u16,
  /// Reason phrase
  pub reason: String,
  /// Response headers
  pub headers: Headers,
  /// Raw (still encoded) body
  #[serde(with = "bytes_serde")]
  pub body: Bytes,
  /// When the response was captured
  pub date: DateTime<Utc>,
  /// Certificate chain presented by the upstream server
  #[serde(default)]
  pub certificates: Vec<CertificateInfo>,
}

impl CapturedResponse {
  /// Create a response stamped with the current time
  pub fn new(status_code: u16, reason: impl Into<String>, headers: Headers, body: impl Into<Bytes>) -> Self {
    Self {
      status_code,
      reason: reason.into(),
      headers,
      body: body.into(),
      date: Utc::now(),
      certificates: Vec::new(),
    }
  }

  /// Body decoded according to its `Content-Encoding` header
  pub fn decoded_body(&self) -> Result<Bytes> {
    decode(&self.body, self.headers.get("content-encoding").unwrap_or("identity"))
  }
}

impl fmt::Display for CapturedResponse {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.status_code, self.reason)
  }
}

/// A captured HTTP request, optionally carrying its response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedRequest {
  /// Correlation id, assigned when the request is persisted
  pub id: Option<RequestId>,
  /// Request method
  pub method: String,
  /// Absolute request URL
  pub url: String,
  /// Request headers
  pub headers: Headers,
  /// Raw request body
  #[serde(with = "bytes_serde")]
  pub body: Bytes,
  /// When the request was captured
  pub date: DateTime<Utc>,
  /// WebSocket messages exchanged after an upgrade
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub ws_messages: Vec<WebSocketMessage>,
  /// Response, once one has been captured or mocked
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub response: Option<CapturedResponse>,
}

impl CapturedRequest {
  /// Create a request snapshot stamped with the current time
  pub fn new(method: impl Into<String>, url: impl Into<String>, headers: Headers, body: impl Into<Bytes>) -> Self {
    Self {
      id: None,
      method: method.into(),
      url: url.into(),
      headers,
      body: body.into(),
      date: Utc::now(),
      ws_messages: Vec::new(),
      response: None,
    }
  }

  fn parsed_url(&self) -> Result<Url> {
    Ok(Url::parse(&self.url)?)
  }

  /// Query string of the URL without the leading `?`
  pub fn querystring(&self) -> String {
    self
      .parsed_url()
      .ok()
      .and_then(|u| u.query().map(str::to_string))
      .unwrap_or_default()
  }

  /// Replace the query string of the URL
  pub fn set_querystring(&mut self, qs: &str) -> Result<()> {
    let mut url = self.parsed_url()?;
    url.set_query(if qs.is_empty() { None } else { Some(qs) });
    self.url = url.into();
    Ok(())
  }

  /// Host part of the URL
  pub fn host(&self) -> String {
    self
      .parsed_url()
      .ok()
      .and_then(|u| u.host_str().map(str::to_string))
      .unwrap_or_default()
  }

  /// Path of the URL
  pub fn path(&self) -> String {
    self
      .parsed_url()
      .map(|u| u.path().to_string())
      .unwrap_or_default()
  }

  /// Replace the path of the URL, keeping the query string
  pub fn set_path(&mut self, path: &str) -> Result<()> {
    let mut url = self.parsed_url()?;
    url.set_path(path);
    self.url = url.into();
    Ok(())
  }

  fn is_form_post(&self) -> bool {
    self.method.eq_ignore_ascii_case("POST")
      && self
        .headers
        .get("content-type")
        .map(|ct| ct.starts_with("application/x-www-form-urlencoded"))
        .unwrap_or(false)
  }

  /// Request parameters, read from a form encoded POST body or from the query string
  pub fn params(&self) -> Vec<(String, String)> {
    if self.is_form_post() {
      url::form_urlencoded::parse(&self.body)
        .into_owned()
        .collect()
    } else {
      self
        .parsed_url()
        .map(|u| u.query_pairs().into_owned().collect())
        .unwrap_or_default()
    }
  }

  /// Replace the request parameters in the body or query string, whichever [`params`](Self::params) reads
  pub fn set_params<K: AsRef<str>, V: AsRef<str>>(&mut self, params: &[(K, V)]) -> Result<()> {
    let encoded = url::form_urlencoded::Serializer::new(String::new())
      .extend_pairs(params.iter().map(|(k, v)| (k.as_ref(), v.as_ref())))
      .finish();
    if self.is_form_post() {
      self.body = Bytes::from(encoded);
      if self.headers.contains("content-length") {
        self.headers.set("Content-Length", self.body.len().to_string());
      }
      Ok(())
    } else {
      self.set_querystring(&encoded)
    }
  }

  /// Body decoded according to its `Content-Encoding` header
  pub fn decoded_body(&self) -> Result<Bytes> {
    decode(&self.body, self.headers.get("content-encoding").unwrap_or("identity"))
  }

  /// Answer the request with a mock response instead of forwarding it upstream.
  ///
  /// Only meaningful from a request interceptor.
  pub fn create_response(
    &mut self,
    status_code: u16,
    headers: Headers,
    body: impl Into<Bytes>,
  ) -> Result<()> {
    if !(100..=599).contains(&status_code) {
      return Err(Error::InvalidStatus(status_code));
    }
    let reason = http::StatusCode::from_u16(status_code)
      .ok()
      .and_then(|s| s.canonical_reason())
      .unwrap_or("");
    self.response = Some(CapturedResponse::new(status_code, reason, headers, body));
    Ok(())
  }

  /// Answer the request with an empty error response, `403` being the usual choice
  pub fn abort(&mut self, status_code: u16) -> Result<()> {
    self.create_response(status_code, Headers::new(), Bytes::new())
  }
}

impl fmt::Display for CapturedRequest {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.url)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn form_request() -> CapturedRequest {
    CapturedRequest::new(
      "POST",
      "https://example.com/login?next=%2Fhome",
      Headers::from_iter([
        ("Content-Type", "application/x-www-form-urlencoded"),
        ("Content-Length", "21"),
      ]),
      "user=admin&pass=s%21d",
    )
  }

  #[test]
  fn test_headers_preserve_duplicates() {
    let mut headers = Headers::new();
    headers.add("Set-Cookie", "a=1");
    headers.add("X-Other", "v");
    headers.add("set-cookie", "b=2");
    assert_eq!(headers.get("SET-COOKIE"), Some("a=1"));
    assert_eq!(headers.get_all("Set-Cookie").collect::<Vec<_>>(), vec!["a=1", "b=2"]);

    headers.set("Set-Cookie", "c=3");
    assert_eq!(headers.get_all("set-cookie").collect::<Vec<_>>(), vec!["c=3"]);
    assert_eq!(headers.iter().next(), Some(("Set-Cookie", "c=3")));
    assert_eq!(headers.remove("x-other"), 1);
    assert_eq!(headers.len(), 1);
  }

  #[test]
  fn test_url_helpers() {
    let mut request = CapturedRequest::new(
      "GET",
      "https://www.example.com:8443/some/path?foo=bar&spam=eggs",
      Headers::new(),
      Bytes::new(),
    );
    assert_eq!(request.host(), "www.example.com");
    assert_eq!(request.path(), "/some/path");
    assert_eq!(request.querystring(), "foo=bar&spam=eggs");

    request.set_path("/other").unwrap();
    assert_eq!(request.url, "https://www.example.com:8443/other?foo=bar&spam=eggs");

    request.set_querystring("").unwrap();
    assert_eq!(request.url, "https://www.example.com:8443/other");
  }

  #[test]
  fn test_params_from_query_and_form() {
    let get = CapturedRequest::new("GET", "http://h/p?a=1&b=two", Headers::new(), Bytes::new());
    assert_eq!(
      get.params(),
      vec![("a".to_string(), "1".to_string()), ("b".to_string(), "two".to_string())]
    );

    let mut post = form_request();
    assert_eq!(post.params()[1], ("pass".to_string(), "s!d".to_string()));
    post.set_params(&[("user", "guest")]).unwrap();
    assert_eq!(post.body, Bytes::from_static(b"user=guest"));
    assert_eq!(post.headers.get("content-length"), Some("10"));
    assert_eq!(post.querystring(), "next=%2Fhome");
  }

  #[test]
  fn test_create_response_validates_status() {
    let mut request = form_request();
    assert!(matches!(
      request.create_response(900, Headers::new(), "x"),
      Err(Error::InvalidStatus(900))
    ));
    assert!(request.response.is_none());

    request.abort(403).unwrap();
    let response = request.response.as_ref().unwrap();
    assert_eq!(response.to_string(), "403 Forbidden");
    assert!(response.body.is_empty());
  }

  #[test]
  fn test_json_round_trip_keeps_binary_body() {
    let mut request = form_request();
    request.id = Some(RequestId::new());
    request.body = Bytes::from_static(&[0, 159, 146, 150]);
    let json = serde_json::to_string(&request).unwrap();
    let back: CapturedRequest = serde_json::from_str(&json).unwrap();
    assert_eq!(back, request);
  }

  #[test]
  fn test_display() {
    let request = form_request();
    assert_eq!(request.to_string(), "https://example.com/login?next=%2Fhome");
    let message = WebSocketMessage {
      from_client: true,
      content: MessageContent::Text("hello".into()),
      date: Utc::now(),
    };
    assert_eq!(message.to_string(), "hello");
  }
}
