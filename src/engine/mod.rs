//! Intercepting proxy engine
//!
//! A HTTP/1.1 forward proxy that terminates TLS of `CONNECT` tunnels with
//! certificates issued by its own [`CertificateAuthority`], relays WebSocket
//! upgrades and reports every exchange as a [`Flow`] to a set of
//! [`FlowHooks`].

mod ca;
mod connector;
mod flow;
mod hooks;
mod http1;
mod server;
mod websocket;

pub use ca::{CertificateAuthority, CA_CERT_FILE, CA_KEY_FILE};
pub use flow::{Flow, FlowId, FlowMessage, HttpRequest, HttpResponse, ServerConn, WebSocketData};
pub use hooks::{FlowHooks, FlowLogger, HookDispatcher};
pub use server::{EngineConfig, EngineStatus, ProxyEngine};
