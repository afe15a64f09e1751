//! Lifecycle of a capture session and the query surface over its captures

use crate::automation::ProxyCapabilities;
use crate::engine::{
  CertificateAuthority, EngineConfig, EngineStatus, FlowHooks, FlowLogger, HookDispatcher,
  ProxyEngine,
};
use crate::errors::{Error, Result};
use crate::har::generate_har;
use crate::interceptor::InterceptOutcome;
use crate::options::{EngineOptions, ProxyConfig, WireOptions};
use crate::pipeline::InterceptionPipeline;
use crate::request::{CapturedRequest, CapturedResponse};
use crate::scope::{IntoPatterns, ScopeFilter};
use crate::storage::{self, CaptureStore, RequestIter};
use crate::upstream::{resolve_upstream, UpstreamProxy};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Poll interval while waiting for the engine to listen
const START_POLL: Duration = Duration::from_millis(10);
/// Poll interval of [`MitmProxy::wait_for_request`]
const WAIT_POLL: Duration = Duration::from_millis(200);

/// A started engine instance
struct Running {
  shutdown: oneshot::Sender<()>,
  task: JoinHandle<Result<()>>,
  status: Arc<EngineStatus>,
}

/// A capture session: one running proxy engine, its capture store and the
/// interception pipeline between them.
///
/// The engine runs on a runtime owned by the session, every method here is
/// blocking and must not be called from inside an async runtime. Lifecycle
/// methods ([`start`](Self::start), [`update_server_mode`](Self::update_server_mode),
/// [`shutdown`](Self::shutdown)) are expected to be called from one thread
/// at a time.
///
/// ```no_run
/// use slinger_wire::{CapturedRequest, WireOptions};
/// use std::time::Duration;
///
/// # fn main() -> slinger_wire::Result<()> {
/// let proxy = slinger_wire::create(WireOptions::default())?;
/// proxy.set_request_interceptor(|request: &mut CapturedRequest| {
///   request.headers.set("X-Captured-By", "slinger-wire");
/// });
/// println!("point the browser at {}", proxy.address()?);
/// let request = proxy.wait_for_request("/api/login", Duration::from_secs(10))?;
/// println!("{} -> {:?}", request, request.response);
/// proxy.shutdown()?;
/// # Ok(())
/// # }
/// ```
pub struct MitmProxy {
  options: WireOptions,
  engine_options: EngineOptions,
  runtime: Runtime,
  store: Arc<dyn CaptureStore>,
  pipeline: Arc<InterceptionPipeline>,
  hooks: Arc<dyn FlowHooks>,
  ca: Arc<CertificateAuthority>,
  upstream: Mutex<Option<UpstreamProxy>>,
  listen: Mutex<(String, u16)>,
  running: Mutex<Option<Running>>,
  closed: AtomicBool,
}

impl MitmProxy {
  /// Set up a session without starting the engine.
  ///
  /// Configuration problems are reported here, before anything listens.
  pub fn new(options: WireOptions) -> Result<Self> {
    Self::with_env(options, |name| std::env::var(name).ok())
  }

  /// Like [`new`](Self::new), reading `HTTP_PROXY` / `HTTPS_PROXY` through
  /// `env` instead of the process environment
  pub fn with_env<F>(options: WireOptions, env: F) -> Result<Self>
  where
    F: Fn(&str) -> Option<String>,
  {
    options.validate()?;
    let engine_options = options.engine()?;
    let upstream = resolve_upstream(options.upstream_proxy.as_ref(), env)?;

    let store = storage::create(&options)?;
    let ca = match (&options.ca_cert, &options.ca_key) {
      (Some(cert), Some(key)) => CertificateAuthority::from_files(cert, key)?,
      _ => CertificateAuthority::load_or_generate(store.home_dir())?,
    };

    let mut scope = ScopeFilter::new(options.ignore_http_methods.iter().cloned());
    if options.disable_capture {
      scope = scope.with_exclude(".*")?;
    }
    let pipeline = Arc::new(InterceptionPipeline::new(
      store.clone(),
      scope,
      options.disable_response_encoding,
      options.enable_har,
    ));
    let mut dispatcher = HookDispatcher::new();
    dispatcher.register(Arc::new(FlowLogger));
    dispatcher.register(pipeline.clone());

    let runtime = tokio::runtime::Builder::new_multi_thread()
      .enable_all()
      .thread_name("slinger-wire")
      .build()?;

    Ok(Self {
      listen: Mutex::new((options.host.clone(), options.port)),
      options,
      engine_options,
      runtime,
      store,
      pipeline,
      hooks: Arc::new(dispatcher),
      ca: Arc::new(ca),
      upstream: Mutex::new(upstream),
      running: Mutex::new(None),
      closed: AtomicBool::new(false),
    })
  }

  /// Bind the listen address and start the engine, returning once it
  /// accepts connections.
  ///
  /// Port `0` binds an ephemeral port, see [`address`](Self::address). An
  /// address already in use is an [`Error::Bind`]. Starting a running
  /// session does nothing.
  pub fn start(&self) -> Result<()> {
    if self.closed.load(Ordering::SeqCst) {
      return Err(Error::NotRunning);
    }
    let mut running = self.running.lock();
    if running.is_some() {
      return Ok(());
    }
    let (host, port) = self.listen.lock().clone();
    let config = EngineConfig {
      host,
      port,
      upstream: self.upstream.lock().clone(),
      verify_ssl: self.options.verify_ssl,
      options: self.engine_options.clone(),
    };
    let engine = Arc::new(ProxyEngine::new(config, self.ca.clone(), self.hooks.clone())?);
    let status = Arc::new(EngineStatus::default());
    let (shutdown, signal) = oneshot::channel();
    let task = self.runtime.spawn(engine.serve(status.clone(), signal));

    while status.local_addr().is_none() {
      if task.is_finished() {
        // the engine stopped before listening, most likely a bind error
        return match self.runtime.block_on(task) {
          Ok(Err(e)) => Err(e),
          Ok(Ok(())) => Err(Error::NotRunning),
          Err(e) => Err(Error::Io(std::io::Error::other(e))),
        };
      }
      std::thread::sleep(START_POLL);
    }
    *running = Some(Running {
      shutdown,
      task,
      status,
    });
    Ok(())
  }

  /// The address the engine is listening on
  pub fn address(&self) -> Result<SocketAddr> {
    self
      .running
      .lock()
      .as_ref()
      .and_then(|running| running.status.local_addr())
      .ok_or(Error::NotRunning)
  }

  /// Whether the engine is accepting connections
  pub fn is_running(&self) -> bool {
    self.address().is_ok()
  }

  /// Stop the engine, waiting until its socket is released
  fn stop_engine(&self) -> Result<()> {
    let Some(running) = self.running.lock().take() else {
      return Ok(());
    };
    let _ = running.shutdown.send(());
    let stopped = match self.runtime.block_on(running.task) {
      Ok(result) => result,
      Err(e) if e.is_cancelled() => Ok(()),
      Err(e) => Err(Error::Io(std::io::Error::other(e))),
    };
    // connections were aborted without finishing their flows
    self.pipeline.abandon_flows();
    stopped
  }

  /// Replace the upstream proxy while keeping the listen address.
  ///
  /// The running engine is stopped and a new one is started on the same
  /// address. Flows in flight are abandoned, captures are kept.
  pub fn update_server_mode(&self, upstream: Option<UpstreamProxy>) -> Result<()> {
    let addr = self.address()?;
    self.stop_engine()?;
    *self.listen.lock() = (addr.ip().to_string(), addr.port());
    *self.upstream.lock() = upstream;
    tracing::info!(
      "Restarting proxy on {} with upstream {}",
      addr,
      self
        .upstream
        .lock()
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "none".to_string())
    );
    self.start()
  }

  /// Route traffic through an upstream proxy from now on
  pub fn set_upstream_proxy(&self, config: ProxyConfig) -> Result<()> {
    let upstream = resolve_upstream(Some(&config), |_| None)?;
    self.update_server_mode(upstream)
  }

  /// Connect directly to servers from now on
  pub fn remove_upstream_proxy(&self) -> Result<()> {
    self.update_server_mode(None)
  }

  /// The upstream proxy currently in use
  pub fn upstream_proxy(&self) -> Option<UpstreamProxy> {
    self.upstream.lock().clone()
  }

  /// Stop the engine and release everything the capture store holds.
  ///
  /// A second call does nothing.
  pub fn shutdown(&self) -> Result<()> {
    if self.closed.swap(true, Ordering::SeqCst) {
      tracing::debug!("Proxy already shut down");
      return Ok(());
    }
    let stopped = self.stop_engine();
    self.store.cleanup()?;
    stopped
  }

  /// Session options
  pub fn options(&self) -> &WireOptions {
    &self.options
  }

  /// The pipeline, for installing interceptor trait objects directly
  pub fn pipeline(&self) -> &Arc<InterceptionPipeline> {
    &self.pipeline
  }

  /// The capture store
  pub fn store(&self) -> &Arc<dyn CaptureStore> {
    &self.store
  }

  /// Root certificate the browser must trust, in PEM format
  pub fn ca_cert_pem(&self) -> &str {
    self.ca.ca_cert_pem()
  }

  /// WebDriver capabilities pointing at this proxy, when `auto_config` is set
  pub fn capabilities(&self) -> Result<Option<ProxyCapabilities>> {
    if !self.options.auto_config {
      return Ok(None);
    }
    let addr = self.address()?;
    Ok(Some(ProxyCapabilities::new(&addr, &self.options.exclude_hosts)))
  }

  /// Every captured request in capture order
  pub fn requests(&self) -> Result<Vec<CapturedRequest>> {
    self.store.load_requests()
  }

  /// Lazily iterate the captured requests
  pub fn iter_requests(&self) -> RequestIter<'_> {
    self.store.iter_requests()
  }

  /// The most recently captured request
  pub fn last_request(&self) -> Result<Option<CapturedRequest>> {
    self.store.load_last_request()
  }

  /// Forget every captured request
  pub fn clear_requests(&self) -> Result<()> {
    self.store.clear_requests()
  }

  /// Wait for a request whose URL contains a match for `pattern` and that
  /// has a response.
  ///
  /// The earliest matching request is returned. Fails with
  /// [`Error::Timeout`] when none shows up within `timeout`.
  pub fn wait_for_request(&self, pattern: &str, timeout: Duration) -> Result<CapturedRequest> {
    let start = Instant::now();
    loop {
      if let Some(request) = self.store.find(pattern, true)? {
        return Ok(request);
      }
      if start.elapsed() >= timeout {
        return Err(Error::Timeout(format!(
          "Timed out after {:?} waiting for request matching {}",
          timeout, pattern
        )));
      }
      std::thread::sleep(WAIT_POLL.min(timeout.saturating_sub(start.elapsed())));
    }
  }

  /// HAR document of the captured exchanges, empty unless `enable_har` is set
  pub fn har(&self) -> Result<String> {
    generate_har(&self.store.load_har_entries()?)
  }

  /// URL patterns a request must match to be captured
  pub fn include_urls(&self) -> Vec<String> {
    self.pipeline.scope().include()
  }

  /// Replace the include patterns
  pub fn set_include_urls(&self, patterns: impl IntoPatterns) -> Result<()> {
    self.pipeline.update_scope(|scope| scope.with_include(patterns))
  }

  /// Remove every include pattern
  pub fn clear_include_urls(&self) -> Result<()> {
    self.set_include_urls(Vec::<String>::new())
  }

  /// URL patterns excluded from capture
  pub fn exclude_urls(&self) -> Vec<String> {
    self.pipeline.scope().exclude()
  }

  /// Replace the exclude patterns
  pub fn set_exclude_urls(&self, patterns: impl IntoPatterns) -> Result<()> {
    self.pipeline.update_scope(|scope| scope.with_exclude(patterns))
  }

  /// Remove every exclude pattern
  pub fn clear_exclude_urls(&self) -> Result<()> {
    self.set_exclude_urls(Vec::<String>::new())
  }

  /// Intercept every in-scope request.
  ///
  /// The interceptor may return `()` or a [`Result`]; an error aborts the
  /// flow it was called for.
  pub fn set_request_interceptor<F, O>(&self, interceptor: F)
  where
    F: Fn(&mut CapturedRequest) -> O + Send + Sync + 'static,
    O: InterceptOutcome,
  {
    self.pipeline.set_request_interceptor(Some(Arc::new(interceptor)));
  }

  /// Stop intercepting requests
  pub fn clear_request_interceptor(&self) {
    self.pipeline.set_request_interceptor(None);
  }

  /// Intercept the response of every captured request.
  ///
  /// The interceptor receives the captured request and the response.
  /// Anything else is rejected when the call is compiled:
  ///
  /// ```compile_fail
  /// # use slinger_wire::{CapturedResponse, MitmProxy, WireOptions};
  /// # let proxy = MitmProxy::new(WireOptions::default()).unwrap();
  /// proxy.set_response_interceptor(|response: &mut CapturedResponse| {
  ///   response.status_code = 200;
  /// });
  /// ```
  pub fn set_response_interceptor<F, O>(&self, interceptor: F)
  where
    F: Fn(&CapturedRequest, &mut CapturedResponse) -> O + Send + Sync + 'static,
    O: InterceptOutcome,
  {
    self.pipeline.set_response_interceptor(Some(Arc::new(interceptor)));
  }

  /// Stop intercepting responses
  pub fn clear_response_interceptor(&self) {
    self.pipeline.set_response_interceptor(None);
  }
}

impl Drop for MitmProxy {
  fn drop(&mut self) {
    if let Err(e) = self.shutdown() {
      tracing::warn!("Failed to shut down proxy: {}", e);
    }
  }
}

/// Create a session and start it
pub fn create(options: WireOptions) -> Result<MitmProxy> {
  let proxy = MitmProxy::new(options)?;
  proxy.start()?;
  tracing::info!("Created proxy listening on {}", proxy.address()?);
  Ok(proxy)
}
