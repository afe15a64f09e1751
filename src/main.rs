use clap::Parser;
use slinger_wire::{MitmProxy, WireOptions};
use std::path::PathBuf;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "slinger-wire")]
#[command(author, version, about = "Capture browser traffic through an intercepting proxy", long_about = None)]
struct Cli {
  /// Options file (TOML)
  #[arg(short, long, env = "SLINGER_WIRE_CONFIG")]
  config: Option<PathBuf>,

  /// Listen port, overrides the options file
  #[arg(short, long)]
  port: Option<u16>,

  /// Write a HAR archive of the session here on exit (enables HAR capture)
  #[arg(long)]
  har: Option<PathBuf>,

  /// Write the root certificate here so it can be trusted by the browser
  #[arg(long)]
  export_ca: Option<PathBuf>,

  /// Log level (trace, debug, info, warn, error)
  #[arg(long, default_value = "info", env = "SLINGER_WIRE_LOG_LEVEL")]
  log_level: String,

  /// Enable JSON structured logging
  #[arg(long, env = "SLINGER_WIRE_LOG_JSON")]
  log_json: bool,
}

fn init_logging(cli: &Cli) {
  let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
  let subscriber = tracing_subscriber::registry().with(env_filter);
  if cli.log_json {
    subscriber.with(fmt::layer().json()).init();
  } else {
    subscriber.with(fmt::layer().with_target(false)).init();
  }
}

fn wait_for_ctrl_c() -> std::io::Result<()> {
  tokio::runtime::Builder::new_current_thread()
    .enable_all()
    .build()?
    .block_on(tokio::signal::ctrl_c())
}

fn run(cli: Cli) -> slinger_wire::Result<()> {
  let mut options = match &cli.config {
    Some(path) => WireOptions::load(path)?,
    None => WireOptions::default(),
  };
  if let Some(port) = cli.port {
    options.port = port;
  }
  if cli.har.is_some() {
    options.enable_har = true;
  }

  let proxy = MitmProxy::new(options)?;
  if let Some(path) = &cli.export_ca {
    std::fs::write(path, proxy.ca_cert_pem())?;
    tracing::info!("Root certificate written to {}", path.display());
  }
  proxy.start()?;
  tracing::info!("Proxy listening on {}", proxy.address()?);
  if let Some(capabilities) = proxy.capabilities()? {
    tracing::info!("WebDriver capabilities: {}", capabilities.to_json());
  }

  wait_for_ctrl_c()?;
  tracing::info!("Captured {} requests", proxy.requests()?.len());
  if let Some(path) = &cli.har {
    std::fs::write(path, proxy.har()?)?;
    tracing::info!("HAR written to {}", path.display());
  }
  proxy.shutdown()
}

fn main() {
  let cli = Cli::parse();
  init_logging(&cli);
  if let Err(e) = run(cli) {
    tracing::error!("{}", e);
    std::process::exit(1);
  }
}
