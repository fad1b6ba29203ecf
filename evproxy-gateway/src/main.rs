//! EV charger proxy entry point.
//!
//! Wires the components together: session store, arbitration engine, event
//! pipeline, outbound service supervisor and the HTTP edge. Exits zero on a
//! clean SIGTERM/SIGINT shutdown, non-zero on a configuration error.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use evproxy_core::{SessionLog, Settings};
use evproxy_gateway::charger::ChargerGateway;
use evproxy_gateway::http::{build_router, AppState};
use evproxy_gateway::registry::Registry;
use evproxy_gateway::{arbiter, automation, pipeline, services, store};

/// Protocol-aware proxy between one EV charger and competing backends
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (overrides CONFIG_FILE)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to bind (overrides PORT, default 9000)
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Configuration problems are fatal before anything binds.
    let settings = Settings::load(args.config, args.port)?;
    let settings = Arc::new(settings);

    let log = SessionLog::open(&settings.log_db_path)?;
    info!(path = %settings.log_db_path.display(), "session log ready");

    let charger = Arc::new(ChargerGateway::new());
    let registry = Arc::new(Registry::new());
    let store = store::spawn(log);

    let (presence, override_source, notifier) = automation::from_settings(&settings);
    let arbiter = arbiter::spawn(
        settings.proxy.clone(),
        registry.clone(),
        charger.clone(),
        presence,
        override_source,
    );

    let _pipeline = pipeline::spawn(
        charger.clone(),
        arbiter.clone(),
        store.clone(),
        registry.clone(),
        notifier,
    );
    let _services = services::spawn_all(&settings.proxy, registry.clone(), arbiter.clone());

    let app = build_router(AppState {
        settings: settings.clone(),
        charger,
        registry,
        arbiter,
        store,
    });

    let listener = TcpListener::bind(("0.0.0.0", settings.port)).await?;
    info!(port = settings.port, "proxy listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
