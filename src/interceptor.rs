//! User supplied request and response interceptors
//!
//! Interceptors run synchronously on the flow's own processing path and see
//! the capture snapshot, not the live flow. Whatever they change is written
//! back to the flow before it continues.
//!
//! Closures are interceptors too, returning either `()` or
//! [`Result<()>`](crate::Result):
//!
//! ```rust
//! use slinger_wire::{CapturedRequest, CapturedResponse, RequestInterceptor, ResponseInterceptor};
//!
//! fn takes_request(_: impl RequestInterceptor) {}
//! fn takes_response(_: impl ResponseInterceptor) {}
//!
//! takes_request(|request: &mut CapturedRequest| {
//!   request.headers.set("X-Captured", "1");
//! });
//! takes_response(|_request: &CapturedRequest, response: &mut CapturedResponse| {
//!   if response.status_code == 404 {
//!     response.status_code = 200;
//!   }
//! });
//! ```

use crate::errors::{Error, Result};
use crate::request::{CapturedRequest, CapturedResponse};

/// Inspect and mutate a request before it is captured and sent upstream.
///
/// Calling [`CapturedRequest::create_response`] answers the request without
/// contacting the upstream server.
pub trait RequestInterceptor: Send + Sync {
  /// Intercept one request
  fn intercept_request(&self, request: &mut CapturedRequest) -> Result<()>;
}

/// Inspect and mutate a response before it is captured and sent to the client
pub trait ResponseInterceptor: Send + Sync {
  /// Intercept one response; `request` is the captured request it answers
  fn intercept_response(&self, request: &CapturedRequest, response: &mut CapturedResponse) -> Result<()>;
}

/// What an interceptor closure may return
pub trait InterceptOutcome {
  /// Normalise into a `Result`
  fn into_result(self) -> Result<()>;
}

impl InterceptOutcome for () {
  fn into_result(self) -> Result<()> {
    Ok(())
  }
}

impl InterceptOutcome for Result<()> {
  fn into_result(self) -> Result<()> {
    self
  }
}

impl<F, O> RequestInterceptor for F
where
  F: Fn(&mut CapturedRequest) -> O + Send + Sync,
  O: InterceptOutcome,
{
  fn intercept_request(&self, request: &mut CapturedRequest) -> Result<()> {
    self(request).into_result()
  }
}

impl<F, O> ResponseInterceptor for F
where
  F: Fn(&CapturedRequest, &mut CapturedResponse) -> O + Send + Sync,
  O: InterceptOutcome,
{
  fn intercept_response(&self, request: &CapturedRequest, response: &mut CapturedResponse) -> Result<()> {
    self(request, response).into_result()
  }
}

/// Every interceptor failure surfaces as [`Error::Interceptor`]
pub(crate) fn interceptor_error(error: Error) -> Error {
  match error {
    Error::Interceptor(_) => error,
    other => Error::Interceptor(Box::new(other)),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::request::Headers;

  #[test]
  fn test_closure_outcomes() {
    let plain = |request: &mut CapturedRequest| {
      request.method = "PUT".to_string();
    };
    let fallible = |request: &mut CapturedRequest| -> Result<()> { request.abort(999) };

    let mut request = CapturedRequest::new("GET", "https://example.com/", Headers::new(), "");
    plain.intercept_request(&mut request).unwrap();
    assert_eq!(request.method, "PUT");

    let error = fallible.intercept_request(&mut request).unwrap_err();
    assert!(matches!(error, Error::InvalidStatus(999)));
    assert!(matches!(interceptor_error(error), Error::Interceptor(_)));
  }

  #[test]
  fn test_response_closure() {
    let interceptor = |request: &CapturedRequest, response: &mut CapturedResponse| {
      response.headers.add("X-Url", request.url.clone());
    };
    let request = CapturedRequest::new("GET", "https://example.com/", Headers::new(), "");
    let mut response = CapturedResponse::new(200, "OK", Headers::new(), "");
    interceptor.intercept_response(&request, &mut response).unwrap();
    assert_eq!(response.headers.get("x-url"), Some("https://example.com/"));
  }
}
