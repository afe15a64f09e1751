//! Per-flow lifecycle hooks

use super::flow::{Flow, FlowMessage};
use crate::errors::{Error, Result};
use std::sync::Arc;

/// Lifecycle events the engine raises for every flow.
///
/// Hooks run on the flow's own task, one flow never waits for another
/// flow's hooks. Returning an error aborts the flow: the client receives a
/// `502 Bad Gateway` carrying the error text and the connection is closed.
pub trait FlowHooks: Send + Sync {
  /// The request head was read, the body was not
  fn request_headers(&self, _flow: &mut Flow) -> Result<()> {
    Ok(())
  }

  /// The request is complete and about to be sent upstream.
  ///
  /// Setting `flow.response` here answers the client directly and nothing is
  /// sent upstream.
  fn request(&self, _flow: &mut Flow) -> Result<()> {
    Ok(())
  }

  /// The response head was read, the body was not
  fn response_headers(&self, _flow: &mut Flow) -> Result<()> {
    Ok(())
  }

  /// The response is complete and about to be sent to the client
  fn response(&self, _flow: &mut Flow) -> Result<()> {
    Ok(())
  }

  /// A WebSocket message was relayed; it is the last one in `flow.websocket`
  fn websocket_message(&self, _flow: &mut Flow) -> Result<()> {
    Ok(())
  }

  /// The engine no longer tracks the flow
  fn flow_finished(&self, _flow: &Flow) {}
}

/// Ordered list of hooks, each event is passed to every hook in turn.
///
/// Dispatch stops at the first hook returning an error.
#[derive(Clone, Default)]
pub struct HookDispatcher {
  hooks: Vec<Arc<dyn FlowHooks>>,
}

impl HookDispatcher {
  /// An empty dispatcher
  pub fn new() -> Self {
    Self::default()
  }

  /// Append a hook
  pub fn register(&mut self, hooks: Arc<dyn FlowHooks>) {
    self.hooks.push(hooks);
  }

  /// Number of registered hooks
  pub fn len(&self) -> usize {
    self.hooks.len()
  }

  /// Whether no hook is registered
  pub fn is_empty(&self) -> bool {
    self.hooks.is_empty()
  }

  fn each<F>(&self, flow: &mut Flow, f: F) -> Result<()>
  where
    F: Fn(&dyn FlowHooks, &mut Flow) -> Result<()>,
  {
    for hooks in &self.hooks {
      f(hooks.as_ref(), flow)?;
    }
    Ok(())
  }
}

impl FlowHooks for HookDispatcher {
  fn request_headers(&self, flow: &mut Flow) -> Result<()> {
    self.each(flow, |h, f| h.request_headers(f))
  }

  fn request(&self, flow: &mut Flow) -> Result<()> {
    self.each(flow, |h, f| h.request(f))
  }

  fn response_headers(&self, flow: &mut Flow) -> Result<()> {
    self.each(flow, |h, f| h.response_headers(f))
  }

  fn response(&self, flow: &mut Flow) -> Result<()> {
    self.each(flow, |h, f| h.response(f))
  }

  fn websocket_message(&self, flow: &mut Flow) -> Result<()> {
    self.each(flow, |h, f| h.websocket_message(f))
  }

  fn flow_finished(&self, flow: &Flow) {
    for hooks in &self.hooks {
      hooks.flow_finished(flow);
    }
  }
}

/// A hook aborted the flow
pub(crate) struct HookFailure {
  /// `None` when the hook panicked and took the flow with it
  pub flow: Option<Flow>,
  pub error: Error,
}

/// Run one hook event off the async workers.
///
/// Hooks are plain blocking code, so they get a blocking thread and the flow
/// is moved there and back.
pub(crate) async fn run_hook<F>(
  hooks: &Arc<dyn FlowHooks>,
  flow: Flow,
  event: F,
) -> std::result::Result<Flow, HookFailure>
where
  F: FnOnce(&dyn FlowHooks, &mut Flow) -> Result<()> + Send + 'static,
{
  let hooks = hooks.clone();
  let id = flow.id;
  let joined = tokio::task::spawn_blocking(move || {
    let mut flow = flow;
    let result = event(hooks.as_ref(), &mut flow);
    (flow, result)
  })
  .await;
  match joined {
    Ok((flow, Ok(()))) => Ok(flow),
    Ok((flow, Err(error))) => Err(HookFailure {
      flow: Some(flow),
      error,
    }),
    Err(e) => {
      tracing::error!("[{}] hook panicked: {}", id, e);
      Err(HookFailure {
        flow: None,
        error: Error::Interceptor(format!("hook panicked: {}", e).into()),
      })
    }
  }
}

/// Logs every flow event through `tracing`
pub struct FlowLogger;

impl FlowHooks for FlowLogger {
  fn request(&self, flow: &mut Flow) -> Result<()> {
    tracing::debug!(
      "[{}] {} {} ({} bytes)",
      flow.id,
      flow.request.method,
      flow.request.url,
      flow.request.body.len()
    );
    Ok(())
  }

  fn response(&self, flow: &mut Flow) -> Result<()> {
    if let Some(response) = &flow.response {
      tracing::debug!(
        "[{}] {} {} <- {} {}",
        flow.id,
        flow.request.method,
        flow.request.url,
        response.status_code,
        response.reason
      );
    }
    Ok(())
  }

  fn websocket_message(&self, flow: &mut Flow) -> Result<()> {
    if let Some(FlowMessage {
      from_client,
      content,
      ..
    }) = flow.websocket.as_ref().and_then(|ws| ws.messages.last())
    {
      let arrow = if *from_client { "->" } else { "<-" };
      tracing::debug!("[{}] ws {} {}", flow.id, arrow, content);
    }
    Ok(())
  }
}
