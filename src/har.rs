//! HAR 1.2 export

use crate::decode::decode;
use crate::engine::Flow;
use crate::errors::Result;
use crate::request::Headers;
use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Name recorded as the HAR creator
pub const CREATOR_NAME: &str = "Slinger Wire HAR dump";

/// A name/value pair used for headers, cookies and parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarPair {
  /// Name
  pub name: String,
  /// Value
  pub value: String,
}

/// Request body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarPostData {
  /// Content type of the body
  pub mime_type: String,
  /// Form parameters of a form encoded body
  pub params: Vec<HarPair>,
  /// Body as text
  pub text: String,
}

/// Request part of an entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarRequest {
  /// Method
  pub method: String,
  /// Absolute URL
  pub url: String,
  /// Protocol version
  pub http_version: String,
  /// Cookies from the `Cookie` header
  pub cookies: Vec<HarPair>,
  /// Header lines
  pub headers: Vec<HarPair>,
  /// Query parameters
  pub query_string: Vec<HarPair>,
  /// Size of the request head, `-1` when unknown
  pub headers_size: i64,
  /// Size of the body
  pub body_size: i64,
  /// Body, when there is one
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub post_data: Option<HarPostData>,
}

/// Response body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarContent {
  /// Decoded size
  pub size: i64,
  /// Bytes saved by content encoding
  pub compression: i64,
  /// Content type
  pub mime_type: String,
  /// Decoded body, base64 when it is not text
  pub text: String,
  /// `base64` when `text` is base64
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub encoding: Option<String>,
}

/// Response part of an entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarResponse {
  /// Status code
  pub status: u16,
  /// Reason phrase
  pub status_text: String,
  /// Protocol version
  pub http_version: String,
  /// Cookies from `Set-Cookie` headers
  pub cookies: Vec<HarPair>,
  /// Header lines
  pub headers: Vec<HarPair>,
  /// Body
  pub content: HarContent,
  /// Target of a redirect
  #[serde(rename = "redirectURL")]
  pub redirect_url: String,
  /// Size of the response head, `-1` when unknown
  pub headers_size: i64,
  /// Size of the body as received
  pub body_size: i64,
}

/// Phase durations in milliseconds, `-1` when a phase did not happen
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarTimings {
  /// Sending the request
  pub send: f64,
  /// Waiting for the first response byte
  pub wait: f64,
  /// Reading the response
  pub receive: f64,
  /// Establishing the TCP connection
  pub connect: f64,
  /// TLS handshake
  pub ssl: f64,
}

/// One exchange in HAR form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarEntry {
  /// When the request started
  pub started_date_time: DateTime<Utc>,
  /// Sum of the known timings in milliseconds
  pub time: f64,
  /// Request
  pub request: HarRequest,
  /// Response
  pub response: HarResponse,
  /// Cache state, always empty
  pub cache: serde_json::Map<String, serde_json::Value>,
  /// Timings
  pub timings: HarTimings,
  /// Address of the upstream server
  #[serde(rename = "serverIPAddress", default, skip_serializing_if = "Option::is_none")]
  pub server_ip_address: Option<String>,
}

fn pairs(headers: &Headers) -> Vec<HarPair> {
  headers
    .iter()
    .map(|(name, value)| HarPair {
      name: name.to_string(),
      value: value.to_string(),
    })
    .collect()
}

fn request_cookies(headers: &Headers) -> Vec<HarPair> {
  headers
    .get_all("cookie")
    .flat_map(|line| line.split(';'))
    .filter_map(|kv| {
      let (name, value) = kv.trim().split_once('=')?;
      Some(HarPair {
        name: name.to_string(),
        value: value.to_string(),
      })
    })
    .collect()
}

fn response_cookies(headers: &Headers) -> Vec<HarPair> {
  headers
    .get_all("set-cookie")
    .filter_map(|line| {
      let first = line.split(';').next()?;
      let (name, value) = first.trim().split_once('=')?;
      Some(HarPair {
        name: name.to_string(),
        value: value.to_string(),
      })
    })
    .collect()
}

fn millis(from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> f64 {
  match (from, to) {
    (Some(from), Some(to)) if to >= from => (to - from).num_microseconds().unwrap_or(0) as f64 / 1000.0,
    _ => -1.0,
  }
}

fn head_size(start_line: usize, headers: &Headers) -> i64 {
  let lines: usize = headers.iter().map(|(k, v)| k.len() + v.len() + 4).sum();
  (start_line + 2 + lines + 2) as i64
}

/// Derive a HAR entry from a flow that has a response.
///
/// Returns `None` for flows without a response.
pub fn create_har_entry(flow: &Flow) -> Option<HarEntry> {
  let request = &flow.request;
  let response = flow.response.as_ref()?;

  let query_string = url::Url::parse(&request.url)
    .map(|u| {
      u.query_pairs()
        .map(|(name, value)| HarPair {
          name: name.into_owned(),
          value: value.into_owned(),
        })
        .collect()
    })
    .unwrap_or_default();

  let post_data = if request.body.is_empty() {
    None
  } else {
    let mime_type = request.headers.get("content-type").unwrap_or("").to_string();
    let params = if mime_type.starts_with("application/x-www-form-urlencoded") {
      url::form_urlencoded::parse(&request.body)
        .map(|(name, value)| HarPair {
          name: name.into_owned(),
          value: value.into_owned(),
        })
        .collect()
    } else {
      Vec::new()
    };
    Some(HarPostData {
      mime_type,
      params,
      text: String::from_utf8_lossy(&request.body).into_owned(),
    })
  };

  let encoding = response.headers.get("content-encoding").unwrap_or("identity");
  let decoded = match decode(&response.body, encoding) {
    Ok(decoded) => decoded,
    Err(e) => {
      tracing::debug!("HAR content left encoded for {}: {}", request.url, e);
      response.body.clone()
    }
  };
  let (text, text_encoding) = match std::str::from_utf8(&decoded) {
    Ok(text) => (text.to_string(), None),
    Err(_) => (BASE64_STANDARD.encode(&decoded), Some("base64".to_string())),
  };

  let server = &flow.server_conn;
  let timings = HarTimings {
    send: millis(Some(request.timestamp_start), request.timestamp_end),
    wait: millis(request.timestamp_end, Some(response.timestamp_start)),
    receive: millis(Some(response.timestamp_start), response.timestamp_end),
    connect: millis(server.timestamp_start, server.timestamp_tcp_setup),
    ssl: millis(server.timestamp_tcp_setup, server.timestamp_tls_setup),
  };
  let time: f64 = [
    timings.send,
    timings.wait,
    timings.receive,
    timings.connect,
    timings.ssl,
  ]
  .iter()
  .filter(|t| **t > -1.0)
  .sum();

  let request_line = request.method.len() + request.url.len() + request.http_version.len() + 2;
  let status_line = response.http_version.len() + 3 + response.reason.len() + 2;

  Some(HarEntry {
    started_date_time: request.timestamp_start,
    time,
    request: HarRequest {
      method: request.method.clone(),
      url: request.url.clone(),
      http_version: request.http_version.clone(),
      cookies: request_cookies(&request.headers),
      headers: pairs(&request.headers),
      query_string,
      headers_size: head_size(request_line, &request.headers),
      body_size: request.body.len() as i64,
      post_data,
    },
    response: HarResponse {
      status: response.status_code,
      status_text: response.reason.clone(),
      http_version: response.http_version.clone(),
      cookies: response_cookies(&response.headers),
      headers: pairs(&response.headers),
      content: HarContent {
        size: decoded.len() as i64,
        compression: response.body.len() as i64 - decoded.len() as i64,
        mime_type: response.headers.get("content-type").unwrap_or("").to_string(),
        text,
        encoding: text_encoding,
      },
      redirect_url: response.headers.get("location").unwrap_or("").to_string(),
      headers_size: head_size(status_line, &response.headers),
      body_size: response.body.len() as i64,
    },
    cache: serde_json::Map::new(),
    timings,
    server_ip_address: server.address.map(|a| a.ip().to_string()),
  })
}

#[derive(Serialize)]
struct HarCreator {
  name: &'static str,
  version: &'static str,
  comment: String,
}

#[derive(Serialize)]
struct HarLog<'a> {
  version: &'static str,
  creator: HarCreator,
  entries: &'a [HarEntry],
}

#[derive(Serialize)]
struct HarDocument<'a> {
  log: HarLog<'a>,
}

/// Wrap entries into a complete HAR document
pub fn generate_har(entries: &[HarEntry]) -> Result<String> {
  let version = env!("CARGO_PKG_VERSION");
  let document = HarDocument {
    log: HarLog {
      version: "1.2",
      creator: HarCreator {
        name: CREATOR_NAME,
        version,
        comment: format!("Slinger Wire version {}", version),
      },
      entries,
    },
  };
  Ok(serde_json::to_string_pretty(&document)?)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::engine::{HttpRequest, HttpResponse};
  use bytes::Bytes;
  use chrono::Duration;
  use flate2::write::GzEncoder;
  use flate2::Compression;
  use std::io::Write;

  fn flow() -> Flow {
    let start = Utc::now();
    let request = HttpRequest {
      method: "POST".to_string(),
      url: "https://example.com/form?x=1".to_string(),
      http_version: "HTTP/1.1".to_string(),
      headers: Headers::from_iter([
        ("Host", "example.com"),
        ("Cookie", "a=1; b=2"),
        ("Content-Type", "application/x-www-form-urlencoded"),
      ]),
      body: Bytes::from_static(b"name=wire"),
      stream: false,
      timestamp_start: start,
      timestamp_end: Some(start + Duration::milliseconds(2)),
    };
    let mut gz = GzEncoder::new(Vec::new(), Compression::default());
    gz.write_all(b"hello").unwrap();
    let mut response = HttpResponse::make(
      302,
      Headers::from_iter([
        ("Content-Encoding", "gzip"),
        ("Content-Type", "text/plain"),
        ("Location", "/next"),
        ("Set-Cookie", "sid=abc; Path=/"),
      ]),
      gz.finish().unwrap(),
    );
    response.timestamp_start = start + Duration::milliseconds(10);
    response.timestamp_end = Some(start + Duration::milliseconds(15));
    let mut flow = Flow::new("127.0.0.1:5000".parse().unwrap(), request);
    flow.response = Some(response);
    flow.server_conn.address = Some("93.184.216.34:443".parse().unwrap());
    flow
  }

  #[test]
  fn test_entry_fields() {
    let entry = create_har_entry(&flow()).unwrap();
    assert_eq!(entry.request.cookies.len(), 2);
    assert_eq!(entry.request.query_string[0].name, "x");
    assert_eq!(entry.request.post_data.as_ref().unwrap().params[0].value, "wire");
    assert_eq!(entry.response.status, 302);
    assert_eq!(entry.response.redirect_url, "/next");
    assert_eq!(entry.response.cookies[0].value, "abc");
    assert_eq!(entry.response.content.text, "hello");
    assert_eq!(entry.response.content.size, 5);
    assert_eq!(entry.timings.connect, -1.0);
    assert_eq!(entry.timings.send, 2.0);
    assert_eq!(entry.timings.wait, 8.0);
    assert_eq!(entry.time, 15.0);
    assert_eq!(entry.server_ip_address.as_deref(), Some("93.184.216.34"));
  }

  #[test]
  fn test_flow_without_response() {
    let mut flow = flow();
    flow.response = None;
    assert!(create_har_entry(&flow).is_none());
  }

  #[test]
  fn test_document_shape() {
    let entry = create_har_entry(&flow()).unwrap();
    let har = generate_har(&[entry]).unwrap();
    let value: serde_json::Value = serde_json::from_str(&har).unwrap();
    assert_eq!(value["log"]["version"], "1.2");
    assert_eq!(value["log"]["creator"]["name"], CREATOR_NAME);
    assert!(value["log"]["creator"]["comment"]
      .as_str()
      .unwrap()
      .starts_with("Slinger Wire version"));
    assert_eq!(value["log"]["entries"][0]["response"]["redirectURL"], "/next");
    assert!(value["log"]["entries"][0]["serverIPAddress"].is_string());
  }
}
