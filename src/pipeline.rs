//! Scope evaluation, interceptor invocation and capture of engine flows

use crate::engine::{Flow, FlowHooks, FlowId, HttpResponse};
use crate::errors::Result;
use crate::har::create_har_entry;
use crate::interceptor::{interceptor_error, RequestInterceptor, ResponseInterceptor};
use crate::request::{CapturedRequest, CapturedResponse, CertificateInfo, RequestId, WebSocketMessage};
use crate::scope::ScopeFilter;
use crate::storage::CaptureStore;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;

/// A flow whose request was captured
struct Captured {
  id: RequestId,
  request: CapturedRequest,
  /// WebSocket messages already persisted
  ws_seen: usize,
}

/// Captures in-scope flows into a [`CaptureStore`] and runs the user
/// interceptors on them.
///
/// Shared state is only touched to clone out the current scope and
/// interceptors, interceptors themselves run without any lock held.
pub struct InterceptionPipeline {
  store: Arc<dyn CaptureStore>,
  scope: RwLock<Arc<ScopeFilter>>,
  request_interceptor: RwLock<Option<Arc<dyn RequestInterceptor>>>,
  response_interceptor: RwLock<Option<Arc<dyn ResponseInterceptor>>>,
  disable_encoding: bool,
  enable_har: bool,
  captured: DashMap<FlowId, Captured>,
}

impl InterceptionPipeline {
  /// Create a pipeline writing into `store`
  pub fn new(store: Arc<dyn CaptureStore>, scope: ScopeFilter, disable_encoding: bool, enable_har: bool) -> Self {
    Self {
      store,
      scope: RwLock::new(Arc::new(scope)),
      request_interceptor: RwLock::new(None),
      response_interceptor: RwLock::new(None),
      disable_encoding,
      enable_har,
      captured: DashMap::new(),
    }
  }

  /// The capture store
  pub fn store(&self) -> &Arc<dyn CaptureStore> {
    &self.store
  }

  /// Current scope rules
  pub fn scope(&self) -> Arc<ScopeFilter> {
    self.scope.read().clone()
  }

  /// Replace the scope rules
  pub fn set_scope(&self, scope: ScopeFilter) {
    *self.scope.write() = Arc::new(scope);
  }

  /// Derive new scope rules from the current ones and install them
  pub fn update_scope<F>(&self, f: F) -> Result<()>
  where
    F: FnOnce(&ScopeFilter) -> Result<ScopeFilter>,
  {
    let mut scope = self.scope.write();
    *scope = Arc::new(f(&scope)?);
    Ok(())
  }

  /// Install or remove the request interceptor
  pub fn set_request_interceptor(&self, interceptor: Option<Arc<dyn RequestInterceptor>>) {
    *self.request_interceptor.write() = interceptor;
  }

  /// Install or remove the response interceptor
  pub fn set_response_interceptor(&self, interceptor: Option<Arc<dyn ResponseInterceptor>>) {
    *self.response_interceptor.write() = interceptor;
  }

  /// Whether a request interceptor is installed
  pub fn has_request_interceptor(&self) -> bool {
    self.request_interceptor.read().is_some()
  }

  /// Whether a response interceptor is installed
  pub fn has_response_interceptor(&self) -> bool {
    self.response_interceptor.read().is_some()
  }

  /// Flows captured and still tracked by the engine
  pub fn active_flows(&self) -> usize {
    self.captured.len()
  }

  /// Forget every tracked flow, for when the engine that raised them is gone
  pub fn abandon_flows(&self) {
    let abandoned = self.captured.len();
    self.captured.clear();
    if abandoned > 0 {
      tracing::debug!("Abandoned {} unfinished flows", abandoned);
    }
  }

  fn in_scope(&self, flow: &Flow) -> bool {
    self.scope().in_scope(&flow.request.method, &flow.request.url)
  }

  fn snapshot_response(flow: &Flow) -> Option<CapturedResponse> {
    let response = flow.response.as_ref()?;
    let mut snapshot = CapturedResponse::new(
      response.status_code,
      response.reason.clone(),
      response.headers.clone(),
      response.body.clone(),
    );
    for der in &flow.server_conn.certificates {
      match CertificateInfo::from_der(der) {
        Ok(info) => snapshot.certificates.push(info),
        Err(e) => tracing::warn!("[{}] skipping server certificate: {}", flow.id, e),
      }
    }
    Some(snapshot)
  }
}

impl FlowHooks for InterceptionPipeline {
  fn request_headers(&self, flow: &mut Flow) -> Result<()> {
    if self.in_scope(flow) {
      flow.request.stream = false;
    }
    Ok(())
  }

  fn request(&self, flow: &mut Flow) -> Result<()> {
    let live = &mut flow.request;
    let mut request = CapturedRequest::new(
      live.method.clone(),
      live.url.clone(),
      live.headers.clone(),
      live.body.clone(),
    );
    if !self.scope().in_scope(&request.method, &request.url) {
      tracing::debug!("Not capturing {} request: {}", request.method, request.url);
      live.headers.remove("proxy-connection");
      return Ok(());
    }

    let interceptor = self.request_interceptor.read().clone();
    if let Some(interceptor) = interceptor {
      interceptor
        .intercept_request(&mut request)
        .map_err(interceptor_error)?;
      match &request.response {
        Some(mock) => {
          let mut response = HttpResponse::make(mock.status_code, mock.headers.clone(), mock.body.clone());
          response.reason = mock.reason.clone();
          flow.response = Some(response);
        }
        None => {
          let live = &mut flow.request;
          live.method = request.method.clone();
          live.set_url(&request.url.replacen("wss://", "https://", 1));
          live.headers = request.headers.clone();
          live.body = request.body.clone();
        }
      }
    }

    tracing::info!("Capturing request: {}", request.url);
    let id = self.store.save_request(&mut request)?;
    if let Some(mock) = &request.response {
      self.store.save_response(id, mock)?;
    }

    let live = &mut flow.request;
    if self.disable_encoding {
      live.headers.set("Accept-Encoding", "identity");
    }
    live.headers.remove("proxy-connection");

    request.response = None;
    self.captured.insert(
      flow.id,
      Captured {
        id,
        request,
        ws_seen: 0,
      },
    );
    Ok(())
  }

  fn response_headers(&self, flow: &mut Flow) -> Result<()> {
    if self.in_scope(flow) {
      if let Some(response) = flow.response.as_mut() {
        response.stream = false;
      }
    }
    Ok(())
  }

  fn response(&self, flow: &mut Flow) -> Result<()> {
    let Some((id, request)) = self
      .captured
      .get(&flow.id)
      .map(|captured| (captured.id, captured.request.clone()))
    else {
      return Ok(());
    };
    let Some(mut response) = Self::snapshot_response(flow) else {
      return Ok(());
    };

    let interceptor = self.response_interceptor.read().clone();
    if let (Some(interceptor), Some(live)) = (interceptor, flow.response.as_mut()) {
      interceptor
        .intercept_response(&request, &mut response)
        .map_err(interceptor_error)?;
      live.status_code = response.status_code;
      live.reason = response.reason.clone();
      live.headers = response.headers.clone();
      live.body = response.body.clone();
    }

    tracing::info!(
      "Capturing response: {} {} {}",
      request.url,
      response.status_code,
      response.reason
    );
    self.store.save_response(id, &response)?;

    if self.enable_har {
      if let Some(entry) = create_har_entry(flow) {
        self.store.save_har_entry(id, &entry)?;
      }
    }
    Ok(())
  }

  fn websocket_message(&self, flow: &mut Flow) -> Result<()> {
    let Some(messages) = flow.websocket.as_ref().map(|ws| &ws.messages) else {
      return Ok(());
    };
    // no shard guard is held while writing to the store
    let Some((id, seen)) = self.captured.get(&flow.id).map(|c| (c.id, c.ws_seen)) else {
      return Ok(());
    };
    for message in messages.iter().skip(seen) {
      let message = WebSocketMessage {
        from_client: message.from_client,
        content: message.content.clone(),
        date: message.timestamp,
      };
      let direction = if message.from_client {
        "(client -> server)"
      } else {
        "(server -> client)"
      };
      tracing::debug!("Capturing websocket message {}: {}", direction, message);
      self.store.save_ws_message(id, &message)?;
    }
    if let Some(mut captured) = self.captured.get_mut(&flow.id) {
      captured.ws_seen = captured.ws_seen.max(messages.len());
    }
    Ok(())
  }

  fn flow_finished(&self, flow: &Flow) {
    self.captured.remove(&flow.id);
  }
}
