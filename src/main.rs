//! slotgate server binary.
//!
//! # Architecture Overview
//!
//! ```text
//!     Browser ──HTTPS──▶ access log → ip limit → timeout → body limit
//!                          │
//!                          ├─ /auth/*            login, callback, status, logout
//!                          ├─ /sock              ticket → upgrade → framed topics
//!                          └─ /api/v1/...        session → cache → role → group → handler
//!                                                                         │
//!                                                                 Tx / Batch executor
//!
//!     Identity provider ──unix socket──▶ webhook handlers (one Tx per event)
//!     Plain HTTP ──────────────────────▶ 301 to the public host
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;

use slotgate::config::load_config;
use slotgate::lifecycle::{spawn_signal_handler, Application, Backends, Services, Shutdown};
use slotgate::observability::{init_logging, metrics::init_metrics};
use slotgate::routing::{HandlerRegistry, ServiceRegistry, ServiceSchema};

const DEFAULT_CONFIG: &str = "config.toml";

#[derive(Parser)]
#[command(name = "slotgate")]
#[command(about = "Session-aware API gateway", long_about = None)]
struct Args {
    /// TOML config file; `config.toml` is used when present.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Service schema (JSON); overrides `schema_path` from the config.
    #[arg(short, long)]
    schema: Option<PathBuf>,

    /// Validate the config and schema, then exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config_path = args
        .config
        .or_else(|| Path::new(DEFAULT_CONFIG).exists().then(|| PathBuf::from(DEFAULT_CONFIG)));
    let mut config = load_config(config_path.as_deref())?;
    if let Some(schema) = args.schema {
        config.schema_path = Some(schema.to_string_lossy().into_owned());
    }

    let _guards = init_logging(&config.observability)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "slotgate starting");

    if args.check {
        let schema = match config.schema_path.as_deref() {
            Some(path) => ServiceSchema::load(Path::new(path))?,
            None => ServiceSchema::default(),
        };
        let registry = ServiceRegistry::build(&schema, &HandlerRegistry::new(), &config.cache.api_path)?;
        tracing::info!(endpoints = registry.endpoints().len(), "Configuration OK");
        return Ok(());
    }

    tracing::info!(
        bind_address = %config.listener.bind_address,
        redirect_address = ?config.listener.redirect_address,
        webhook = ?config.webhook.unix_path,
        database = config.database.url.is_some(),
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let backends = Backends::connect(&config).await?;
    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    let app = Application::build(config, backends, Services::default())?;

    let shutdown = Arc::new(Shutdown::new());
    spawn_signal_handler(shutdown.clone());

    app.run(listener, &shutdown).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
