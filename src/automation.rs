//! Browser automation handoff
//!
//! The proxy address shaped as WebDriver capabilities, ready to be merged
//! into a new session request.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// `host:port` usable in a URL, with IPv6 hosts bracketed
pub fn urlsafe_address(addr: &SocketAddr) -> String {
  match addr {
    SocketAddr::V4(v4) => format!("{}:{}", v4.ip(), v4.port()),
    SocketAddr::V6(v6) => format!("[{}]:{}", v6.ip(), v6.port()),
  }
}

/// The WebDriver `proxy` capability
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxySettings {
  /// Always `manual`
  pub proxy_type: String,
  /// Proxy for plain HTTP traffic
  pub http_proxy: String,
  /// Proxy for TLS traffic
  pub ssl_proxy: String,
  /// Hosts the browser reaches directly
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub no_proxy: Option<Vec<String>>,
}

/// Capabilities pointing a browser at the capture proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyCapabilities {
  /// Proxy settings
  pub proxy: ProxySettings,
  /// The proxy presents certificates signed by its own root
  pub accept_insecure_certs: bool,
}

impl ProxyCapabilities {
  /// Capabilities for a proxy listening on `addr`, bypassing `no_proxy`
  pub fn new(addr: &SocketAddr, no_proxy: &[String]) -> Self {
    let address = urlsafe_address(addr);
    ProxyCapabilities {
      proxy: ProxySettings {
        proxy_type: "manual".to_string(),
        http_proxy: address.clone(),
        ssl_proxy: address,
        no_proxy: if no_proxy.is_empty() {
          None
        } else {
          Some(no_proxy.to_vec())
        },
      },
      accept_insecure_certs: true,
    }
  }

  /// JSON form of the capabilities
  pub fn to_json(&self) -> serde_json::Value {
    serde_json::json!({
      "proxy": &self.proxy,
      "acceptInsecureCerts": self.accept_insecure_certs,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_urlsafe_address() {
    assert_eq!(urlsafe_address(&"127.0.0.1:8080".parse().unwrap()), "127.0.0.1:8080");
    assert_eq!(urlsafe_address(&"[::1]:8080".parse().unwrap()), "[::1]:8080");
  }

  #[test]
  fn test_capabilities_json() {
    let addr = "127.0.0.1:12345".parse().unwrap();
    let caps = ProxyCapabilities::new(&addr, &[]);
    assert_eq!(
      caps.to_json(),
      serde_json::json!({
        "proxy": {
          "proxyType": "manual",
          "httpProxy": "127.0.0.1:12345",
          "sslProxy": "127.0.0.1:12345",
        },
        "acceptInsecureCerts": true,
      })
    );

    let caps = ProxyCapabilities::new(&addr, &["localhost".to_string()]);
    let json = serde_json::to_value(&caps).unwrap();
    assert_eq!(json["proxy"]["noProxy"], serde_json::json!(["localhost"]));
  }
}
