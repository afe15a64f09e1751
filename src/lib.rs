#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # slinger-wire
//!
//! Capture, inspect and rewrite the traffic of an automated browser.
//!
//! A [`MitmProxy`] runs an intercepting HTTP(S)/WebSocket proxy in the
//! background. Requests in scope are captured into a [`CaptureStore`] and can
//! be rewritten in flight by interceptors; the captured traffic can then be
//! queried from the automation code driving the browser.
//!
//! - Scope rules with [include/exclude URL patterns](#scope)
//! - Request and response [interceptors](#interceptors), including mocked
//!   responses that never reach the server
//! - Disk or size bounded memory [storage](storage)
//! - [HAR](har) export
//! - Upstream proxy chaining, swappable while running
//!
//! ## Capturing requests
//!
//! ```no_run
//! use slinger_wire::WireOptions;
//! use std::time::Duration;
//!
//! fn main() -> slinger_wire::Result<()> {
//!   let proxy = slinger_wire::create(WireOptions::default())?;
//!   // hand proxy.capabilities()? to the WebDriver session, browse...
//!   let request = proxy.wait_for_request("/anything/", Duration::from_secs(10))?;
//!   println!("{} {}", request.method, request);
//!   for request in proxy.iter_requests() {
//!     if let Some(response) = &request.response {
//!       println!("{} -> {}", request.url, response);
//!     }
//!   }
//!   proxy.shutdown()
//! }
//! ```
//!
//! ## Scope
//!
//! Patterns are regular expressions matched from the start of the URL. With
//! include patterns set only matching requests are captured, exclude
//! patterns always win. Requests using one of `ignore_http_methods`
//! (`OPTIONS` by default) are never captured.
//!
//! ```no_run
//! # fn run(proxy: &slinger_wire::MitmProxy) -> slinger_wire::Result<()> {
//! proxy.set_include_urls([".*example\\.com.*"])?;
//! proxy.set_exclude_urls(".*\\.png")?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Interceptors
//!
//! ```no_run
//! use slinger_wire::{CapturedRequest, CapturedResponse, Headers};
//!
//! # fn run(proxy: &slinger_wire::MitmProxy) {
//! proxy.set_request_interceptor(|request: &mut CapturedRequest| {
//!   if request.url.ends_with("/ads.js") {
//!     return request.abort(403);
//!   }
//!   request.headers.set("X-Test", "1");
//!   Ok(())
//! });
//! proxy.set_response_interceptor(|_: &CapturedRequest, response: &mut CapturedResponse| {
//!   response.headers.remove("content-security-policy");
//! });
//! # }
//! ```
mod automation;
mod decode;
/// The proxy engine the session runs
pub mod engine;
mod errors;
/// HTTP Archive export
pub mod har;
mod interceptor;
mod options;
mod pipeline;
mod proxy;
mod request;
mod scope;
/// Capture stores
pub mod storage;
mod upstream;

pub use automation::{urlsafe_address, ProxyCapabilities, ProxySettings};
pub use decode::decode;
pub use errors::{BoxError, Error, Result};
pub use interceptor::{InterceptOutcome, RequestInterceptor, ResponseInterceptor};
pub use options::{EngineOptions, ProxyConfig, StorageKind, WireOptions};
pub use pipeline::InterceptionPipeline;
pub use proxy::{create, MitmProxy};
pub use request::{
  CapturedRequest, CapturedResponse, CertificateInfo, Headers, MessageContent, RequestId,
  WebSocketMessage,
};
pub use scope::{IntoPatterns, ScopeFilter, UrlPattern};
pub use storage::CaptureStore;
pub use upstream::{resolve_upstream, Credentials, ProxyScheme, UpstreamProxy};
