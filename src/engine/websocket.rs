//! WebSocket relay for upgraded connections
//!
//! Both sides are already past the HTTP upgrade. Frames are parsed on each
//! side, data messages are forwarded and reported to the flow hooks in relay
//! order. Control frames are answered locally by each side's codec.

use super::flow::{Flow, FlowMessage, WebSocketData};
use super::hooks::{run_hook, FlowHooks};
use crate::request::MessageContent;
use chrono::Utc;
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

/// What to do after handling one message
enum Relay {
  Continue,
  Closed,
}

fn content_of(message: &Message) -> Option<MessageContent> {
  match message {
    Message::Text(text) => Some(MessageContent::Text(text.as_str().to_owned())),
    Message::Binary(data) => Some(MessageContent::Binary(bytes::Bytes::copy_from_slice(data))),
    _ => None,
  }
}

async fn forward<S>(
  message: Message,
  from_client: bool,
  sink: &mut S,
  events: &mpsc::UnboundedSender<FlowMessage>,
) -> Relay
where
  S: Sink<Message, Error = WsError> + Unpin,
{
  match &message {
    Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => return Relay::Continue,
    Message::Close(_) => {
      let _ = sink.send(message).await;
      return Relay::Closed;
    }
    _ => {}
  }
  if let Some(content) = content_of(&message) {
    let event = FlowMessage {
      from_client,
      content,
      timestamp: Utc::now(),
    };
    // the collector is gone once a hook failed, stop relaying then
    if events.send(event).is_err() {
      return Relay::Closed;
    }
  }
  match sink.send(message).await {
    Ok(()) => Relay::Continue,
    Err(e) => {
      tracing::debug!("WebSocket peer went away: {}", e);
      Relay::Closed
    }
  }
}

async fn pump<R, W>(
  mut source: R,
  mut sink: W,
  from_client: bool,
  events: mpsc::UnboundedSender<FlowMessage>,
) where
  R: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
  W: Sink<Message, Error = WsError> + Unpin,
{
  while let Some(message) = source.next().await {
    let message = match message {
      Ok(message) => message,
      Err(e) => {
        tracing::debug!("WebSocket read failed: {}", e);
        let _ = sink.close().await;
        break;
      }
    };
    if let Relay::Closed = forward(message, from_client, &mut sink, &events).await {
      break;
    }
  }
}

async fn collect(
  mut flow: Flow,
  hooks: Arc<dyn FlowHooks>,
  mut events: mpsc::UnboundedReceiver<FlowMessage>,
) {
  while let Some(message) = events.recv().await {
    flow
      .websocket
      .get_or_insert_with(WebSocketData::default)
      .messages
      .push(message);
    match run_hook(&hooks, flow, |h, f| h.websocket_message(f)).await {
      Ok(next) => flow = next,
      Err(failure) => {
        tracing::error!("WebSocket hook failed: {}", failure.error);
        if let Some(flow) = failure.flow {
          hooks.flow_finished(&flow);
        }
        return;
      }
    }
  }
  hooks.flow_finished(&flow);
}

/// Relay messages between the two upgraded connections until either side
/// closes, then finish the flow.
pub(crate) async fn relay<C, S>(client: C, server: S, mut flow: Flow, hooks: Arc<dyn FlowHooks>)
where
  C: AsyncRead + AsyncWrite + Unpin + Send,
  S: AsyncRead + AsyncWrite + Unpin + Send,
{
  flow.websocket.get_or_insert_with(WebSocketData::default);
  let id = flow.id;
  let client = WebSocketStream::from_raw_socket(client, Role::Server, None).await;
  let server = WebSocketStream::from_raw_socket(server, Role::Client, None).await;
  let (client_tx, client_rx) = client.split();
  let (server_tx, server_rx) = server.split();

  let (events_tx, events_rx) = mpsc::unbounded_channel();
  let collector = tokio::spawn(collect(flow, hooks, events_rx));

  tracing::debug!("[{}] relaying WebSocket", id);
  tokio::select! {
    _ = pump(client_rx, server_tx, true, events_tx.clone()) => {},
    _ = pump(server_rx, client_tx, false, events_tx.clone()) => {},
  }
  drop(events_tx);
  if let Err(e) = collector.await {
    tracing::error!("[{}] WebSocket collector failed: {}", id, e);
  }
  tracing::debug!("[{}] WebSocket closed", id);
}
