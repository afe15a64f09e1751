//! Accept loop and per-connection request handling

use super::ca::CertificateAuthority;
use super::connector::{authority, Connector};
use super::flow::{Flow, HttpRequest, HttpResponse, WebSocketData};
use super::hooks::{run_hook, FlowHooks, HookFailure};
use super::http1::{self, BodyKind, RequestHead};
use super::websocket;
use crate::errors::{Error, Result};
use crate::options::EngineOptions;
use crate::upstream::UpstreamProxy;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use url::Url;

const ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
/// First byte of a TLS handshake record
const TLS_HANDSHAKE: u8 = 0x16;

/// Everything an engine instance needs to run
#[derive(Debug, Clone)]
pub struct EngineConfig {
  /// Listen host
  pub host: String,
  /// Listen port, `0` for an ephemeral one
  pub port: u16,
  /// Upstream proxy all traffic is chained through
  pub upstream: Option<UpstreamProxy>,
  /// Verify upstream server certificates
  pub verify_ssl: bool,
  /// Tunables
  pub options: EngineOptions,
}

/// Listening state shared between a running engine and its owner
#[derive(Debug, Default)]
pub struct EngineStatus {
  local_addr: RwLock<Option<SocketAddr>>,
}

impl EngineStatus {
  /// The bound address while the engine is accepting connections
  pub fn local_addr(&self) -> Option<SocketAddr> {
    *self.local_addr.read()
  }
}

/// Where requests read from a client connection are headed
enum Origin {
  /// Plain proxy connection, requests carry absolute URLs
  Proxy,
  /// Inside a `CONNECT` tunnel to `host:port`
  Tunnel { tls: bool, host: String, port: u16 },
}

/// HTTP/1.1 intercepting proxy raising [`FlowHooks`] events
pub struct ProxyEngine {
  config: EngineConfig,
  ca: Arc<CertificateAuthority>,
  connector: Connector,
  hooks: Arc<dyn FlowHooks>,
}

impl ProxyEngine {
  /// Create an engine, nothing is bound until [`ProxyEngine::serve`]
  pub fn new(config: EngineConfig, ca: Arc<CertificateAuthority>, hooks: Arc<dyn FlowHooks>) -> Result<Self> {
    let connector = Connector::new(
      config.upstream.clone(),
      config.verify_ssl,
      config.options.connect_timeout(),
    )?;
    Ok(Self {
      config,
      ca,
      connector,
      hooks,
    })
  }

  /// Engine configuration
  pub fn config(&self) -> &EngineConfig {
    &self.config
  }

  /// Bind, then accept connections until `shutdown` fires or its sender is
  /// dropped. Open connections are aborted on the way out and the listening
  /// socket is released before this returns.
  pub async fn serve(self: Arc<Self>, status: Arc<EngineStatus>, mut shutdown: oneshot::Receiver<()>) -> Result<()> {
    let addr = authority(&self.config.host, self.config.port);
    let host = self.config.host.trim_matches(|c| c == '[' || c == ']');
    let listener = TcpListener::bind((host, self.config.port))
      .await
      .map_err(|e| Error::bind(addr.clone(), e))?;
    let local = listener.local_addr()?;
    *status.local_addr.write() = Some(local);
    tracing::info!("Proxy listening on {}", local);

    let permits = Arc::new(Semaphore::new(self.config.options.max_connections));
    let mut connections = JoinSet::new();
    loop {
      tokio::select! {
        _ = &mut shutdown => break,
        accepted = listener.accept() => match accepted {
          Ok((stream, peer)) => {
            let Ok(permit) = permits.clone().try_acquire_owned() else {
              tracing::warn!("Connection limit reached, dropping {}", peer);
              continue;
            };
            let engine = self.clone();
            connections.spawn(async move {
              let _permit = permit;
              if let Err(e) = engine.handle_client(stream, peer).await {
                tracing::debug!("Connection from {} ended: {}", peer, e);
              }
            });
          }
          Err(e) => tracing::error!("Failed to accept connection: {}", e),
        },
        Some(_) = connections.join_next(), if !connections.is_empty() => {}
      }
    }
    *status.local_addr.write() = None;
    drop(listener);
    connections.shutdown().await;
    tracing::info!("Proxy on {} stopped", local);
    Ok(())
  }

  async fn handle_client(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
    let mut client = BufReader::new(stream);
    loop {
      let Some(head) = http1::read_request_head(&mut client).await? else {
        return Ok(());
      };
      if head.method.eq_ignore_ascii_case("CONNECT") {
        let (host, port) = match parse_authority(&head.target) {
          Ok(target) => target,
          Err(e) => {
            http1::write_error(&mut client, 400, &e.to_string()).await?;
            return Ok(());
          }
        };
        if self.config.options.https_interception {
          client.write_all(ESTABLISHED).await?;
          client.flush().await?;
          return self.intercept(client, peer, host, port).await;
        }
        return self.blind_tunnel(client, host, port).await;
      }
      if !self.exchange(&mut client, peer, head, &Origin::Proxy).await? {
        return Ok(());
      }
    }
  }

  async fn intercept(&self, mut client: BufReader<TcpStream>, peer: SocketAddr, host: String, port: u16) -> Result<()> {
    let is_tls = match client.fill_buf().await?.first() {
      None => return Ok(()),
      Some(byte) => *byte == TLS_HANDSHAKE,
    };
    if !is_tls {
      // e.g. ws:// sent through a tunnel
      let origin = Origin::Tunnel { tls: false, host, port };
      return self.serve_tunnel(client, peer, &origin).await;
    }
    let config = self.ca.server_config(&host).await?;
    let tls = TlsAcceptor::from(config)
      .accept(client)
      .await
      .map_err(|e| Error::Tls(format!("Client handshake for {} failed: {}", host, e)))?;
    let origin = Origin::Tunnel { tls: true, host, port };
    self.serve_tunnel(BufReader::new(tls), peer, &origin).await
  }

  async fn serve_tunnel<S>(&self, mut client: BufReader<S>, peer: SocketAddr, origin: &Origin) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin + Send,
  {
    while let Some(head) = http1::read_request_head(&mut client).await? {
      if head.method.eq_ignore_ascii_case("CONNECT") {
        http1::write_error(&mut client, 400, "CONNECT inside a tunnel").await?;
        break;
      }
      if !self.exchange(&mut client, peer, head, origin).await? {
        break;
      }
    }
    let _ = client.shutdown().await;
    Ok(())
  }

  async fn blind_tunnel(&self, mut client: BufReader<TcpStream>, host: String, port: u16) -> Result<()> {
    let mut upstream = match self.connector.tunnel(&host, port).await {
      Ok(upstream) => upstream,
      Err(e) => {
        http1::write_error(&mut client, 502, &e.to_string()).await?;
        return Ok(());
      }
    };
    client.write_all(ESTABLISHED).await?;
    client.flush().await?;
    let buffered = client.buffer().to_vec();
    let mut client = client.into_inner();
    if !buffered.is_empty() {
      upstream.write_all(&buffered).await?;
    }
    if let Err(e) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
      tracing::debug!("Tunnel to {}:{} closed: {}", host, port, e);
    }
    Ok(())
  }

  async fn abort<S>(&self, client: &mut BufReader<S>, failure: HookFailure) -> Result<bool>
  where
    S: AsyncRead + AsyncWrite + Unpin + Send,
  {
    tracing::error!("Flow aborted: {}", failure.error);
    http1::write_error(client, 502, &failure.error.to_string()).await?;
    if let Some(flow) = failure.flow {
      self.hooks.flow_finished(&flow);
    }
    Ok(false)
  }

  /// Stop tracking `flow` when the exchange fails half way
  fn finish_on_err<T>(&self, flow: &Flow, result: Result<T>) -> Result<T> {
    if result.is_err() {
      self.hooks.flow_finished(flow);
    }
    result
  }

  async fn upstream_failed<S>(&self, client: &mut BufReader<S>, flow: &Flow, error: Error) -> Result<bool>
  where
    S: AsyncRead + AsyncWrite + Unpin + Send,
  {
    http1::write_error(client, 502, &error.to_string()).await?;
    self.hooks.flow_finished(flow);
    Ok(false)
  }

  /// Handle one request/response exchange. Returns whether the client
  /// connection can be reused.
  async fn exchange<S>(&self, client: &mut BufReader<S>, peer: SocketAddr, head: RequestHead, origin: &Origin) -> Result<bool>
  where
    S: AsyncRead + AsyncWrite + Unpin + Send,
  {
    let url = match request_url(&head, origin) {
      Ok(url) => url,
      Err(e) => {
        http1::write_error(client, 400, &e.to_string()).await?;
        return Ok(false);
      }
    };
    let keep_alive = head.keep_alive();
    let body_kind = http1::request_body_kind(&head.headers)?;
    let max_body = self.config.options.max_body_size;
    let flow = Flow::new(
      peer,
      HttpRequest {
        method: head.method,
        url,
        http_version: head.version,
        headers: head.headers,
        body: Bytes::new(),
        stream: true,
        timestamp_start: Utc::now(),
        timestamp_end: None,
      },
    );

    let mut flow = match run_hook(&self.hooks, flow, |h, f| h.request_headers(f)).await {
      Ok(flow) => flow,
      Err(failure) => return self.abort(client, failure).await,
    };
    if !flow.request.stream {
      flow.request.body = self.finish_on_err(&flow, http1::read_body(client, body_kind, max_body).await)?;
      flow.request.timestamp_end = Some(Utc::now());
    }
    let flow = match run_hook(&self.hooks, flow, |h, f| h.request(f)).await {
      Ok(flow) => flow,
      Err(failure) => return self.abort(client, failure).await,
    };

    if let Some(response) = &flow.response {
      // answered by a hook, upstream never sees this request
      if flow.request.stream {
        let drained = http1::relay_body(client, &mut tokio::io::sink(), body_kind).await;
        self.finish_on_err(&flow, drained)?;
      }
      let sent = send_buffered(client, &flow.request.method, response).await;
      self.finish_on_err(&flow, sent)?;
      let keep = keep_alive && http1::wants_keep_alive("HTTP/1.1", &response.headers);
      self.hooks.flow_finished(&flow);
      return Ok(keep);
    }

    let target = match Url::parse(&flow.request.url) {
      Ok(target) if target.host_str().is_some() => target,
      _ => {
        let error = Error::invalid_request(format!("Cannot route {}", flow.request.url));
        return self.upstream_failed(client, &flow, error).await;
      }
    };
    let tls = matches!(target.scheme(), "https" | "wss");
    let host = target.host_str().unwrap_or_default().to_string();
    let port = target.port_or_known_default().unwrap_or(if tls { 443 } else { 80 });
    let mut flow = flow;
    let connected = match self.connector.connect(tls, &host, port).await {
      Ok(connected) => connected,
      Err(e) => return self.upstream_failed(client, &flow, e).await,
    };
    flow.server_conn = connected.server_conn;
    let mut upstream = BufReader::new(connected.stream);
    if let Err(e) = self
      .send_request(&mut upstream, &flow.request, &target, connected.via_proxy, client, body_kind)
      .await
    {
      return self.upstream_failed(client, &flow, e).await;
    }

    let head = loop {
      let head = match http1::read_response_head(&mut upstream).await {
        Ok(head) => head,
        Err(e) => return self.upstream_failed(client, &flow, e).await,
      };
      // interim responses are not relayed
      if (100..200).contains(&head.status) && head.status != 101 {
        continue;
      }
      break head;
    };
    let kind = match http1::response_body_kind(&flow.request.method, head.status, &head.headers) {
      Ok(kind) => kind,
      Err(e) => return self.upstream_failed(client, &flow, e).await,
    };
    let upstream_keep_alive = head.keep_alive();
    flow.response = Some(HttpResponse {
      status_code: head.status,
      reason: head.reason,
      http_version: head.version,
      headers: head.headers,
      body: Bytes::new(),
      stream: true,
      timestamp_start: Utc::now(),
      timestamp_end: None,
    });
    let mut flow = match run_hook(&self.hooks, flow, |h, f| h.response_headers(f)).await {
      Ok(flow) => flow,
      Err(failure) => return self.abort(client, failure).await,
    };
    let streaming = flow.response.as_ref().map(|r| r.stream).unwrap_or(true);

    if flow.response.as_ref().map(|r| r.status_code) == Some(101) {
      flow.websocket = Some(WebSocketData::default());
      let flow = match run_hook(&self.hooks, flow, |h, f| h.response(f)).await {
        Ok(flow) => flow,
        Err(failure) => return self.abort(client, failure).await,
      };
      if let Some(response) = &flow.response {
        let written = http1::write_response_head(client, response.status_code, &response.reason, &response.headers).await;
        self.finish_on_err(&flow, written)?;
        self.finish_on_err(&flow, client.flush().await.map_err(Error::from))?;
      }
      websocket::relay(&mut *client, upstream, flow, self.hooks.clone()).await;
      return Ok(false);
    }

    if streaming {
      let relayed = match &flow.response {
        Some(response) => {
          match http1::write_response_head(client, response.status_code, &response.reason, &response.headers).await {
            Ok(()) => http1::relay_body(&mut upstream, client, kind).await.map(|_| ()),
            Err(e) => Err(e),
          }
        }
        None => Ok(()),
      };
      self.finish_on_err(&flow, relayed)?;
      if let Some(response) = flow.response.as_mut() {
        response.timestamp_end = Some(Utc::now());
      }
      // already sent, hooks can only observe
      match run_hook(&self.hooks, flow, |h, f| h.response(f)).await {
        Ok(flow) => self.hooks.flow_finished(&flow),
        Err(failure) => {
          tracing::error!("Flow aborted after response was sent: {}", failure.error);
          if let Some(flow) = failure.flow {
            self.hooks.flow_finished(&flow);
          }
          return Ok(false);
        }
      }
      return Ok(keep_alive && upstream_keep_alive && kind != BodyKind::UntilClose);
    }

    let body = match http1::read_body(&mut upstream, kind, max_body).await {
      Ok(body) => body,
      Err(e) => return self.upstream_failed(client, &flow, e).await,
    };
    if let Some(response) = flow.response.as_mut() {
      response.body = body;
      response.timestamp_end = Some(Utc::now());
    }
    let flow = match run_hook(&self.hooks, flow, |h, f| h.response(f)).await {
      Ok(flow) => flow,
      Err(failure) => return self.abort(client, failure).await,
    };
    let sent = match &flow.response {
      Some(response) => send_buffered(client, &flow.request.method, response)
        .await
        .map(|()| keep_alive && http1::wants_keep_alive("HTTP/1.1", &response.headers)),
      None => http1::write_error(client, 502, "Response dropped by a hook")
        .await
        .map(|()| false),
    };
    self.hooks.flow_finished(&flow);
    sent
  }

  async fn send_request<S, U>(
    &self,
    upstream: &mut U,
    request: &HttpRequest,
    target: &Url,
    via_proxy: bool,
    client: &mut BufReader<S>,
    body_kind: BodyKind,
  ) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    U: AsyncWrite + Unpin + Send,
  {
    let path = if via_proxy {
      target.as_str().to_string()
    } else {
      origin_form(target)
    };
    let mut headers = request.headers.clone();
    if !headers.contains("host") {
      let host = target.host_str().unwrap_or_default();
      let host = match target.port() {
        Some(port) => authority(host, port),
        None => host.to_string(),
      };
      headers.set("Host", host);
    }
    if via_proxy {
      if let Some(auth) = self.connector.upstream().and_then(|p| p.authorization()) {
        headers.set("Proxy-Authorization", auth);
      }
    }
    if request.stream {
      http1::write_request_head(upstream, &request.method, &path, &headers).await?;
      http1::relay_body(client, upstream, body_kind).await?;
    } else {
      http1::frame_buffered(&mut headers, request.body.len(), false);
      http1::write_request_head(upstream, &request.method, &path, &headers).await?;
      upstream.write_all(&request.body).await?;
      upstream.flush().await?;
    }
    Ok(())
  }
}

async fn send_buffered<W>(client: &mut W, method: &str, response: &HttpResponse) -> Result<()>
where
  W: AsyncWrite + Unpin,
{
  if http1::is_bodiless(method, response.status_code) {
    http1::write_response_head(client, response.status_code, &response.reason, &response.headers).await?;
    client.flush().await?;
    return Ok(());
  }
  http1::write_response(
    client,
    response.status_code,
    &response.reason,
    &response.headers,
    &response.body,
  )
  .await
}

fn origin_form(url: &Url) -> String {
  match url.query() {
    Some(query) => format!("{}?{}", url.path(), query),
    None => url.path().to_string(),
  }
}

fn is_absolute(target: &str) -> bool {
  ["http://", "https://", "ws://", "wss://"]
    .iter()
    .any(|scheme| target.len() > scheme.len() && target[..scheme.len()].eq_ignore_ascii_case(scheme))
}

/// Absolute URL of a request read from `origin`
fn request_url(head: &RequestHead, origin: &Origin) -> Result<String> {
  if is_absolute(&head.target) {
    return Ok(head.target.clone());
  }
  if !head.target.starts_with('/') {
    return Err(Error::invalid_request(format!("Unsupported request target: {}", head.target)));
  }
  match origin {
    Origin::Proxy => {
      let host = head
        .headers
        .get("host")
        .ok_or_else(|| Error::invalid_request("Request without Host header"))?;
      Ok(format!("http://{}{}", host, head.target))
    }
    Origin::Tunnel { tls, host, port } => {
      let (scheme, default_port) = if *tls { ("https", 443) } else { ("http", 80) };
      let authority = if *port == default_port {
        authority(host, *port).trim_end_matches(&format!(":{}", port)).to_string()
      } else {
        authority(host, *port)
      };
      Ok(format!("{}://{}{}", scheme, authority, head.target))
    }
  }
}

/// Split a `CONNECT` target into host and port
fn parse_authority(target: &str) -> Result<(String, u16)> {
  let (host, port) = target
    .rsplit_once(':')
    .ok_or_else(|| Error::invalid_request(format!("Invalid CONNECT target: {}", target)))?;
  let port = port
    .parse::<u16>()
    .map_err(|_| Error::invalid_request(format!("Invalid port: {}", port)))?;
  let host = host.trim_start_matches('[').trim_end_matches(']');
  if host.is_empty() {
    return Err(Error::invalid_request(format!("Invalid CONNECT target: {}", target)));
  }
  Ok((host.to_string(), port))
}
