//! Carrier - multi-tenant broker consumption service

use carrier::broker::BrokerConnector;
use carrier::config::merge_config_with_args;
use carrier::server::{create_router, AppState};
use carrier::{
    AmqpConnector, CarrierError, ConfigFile, ConnectionGuardian, LogHandler, MemoryConnector,
    Result, ServerArgs, ServerConfig, TenantManager,
};
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn print_playground_banner(config: &ServerConfig) {
    println!();
    println!("  Carrier - IN-MEMORY MODE - for development and exploration");
    println!();
    println!("  Admin API:   http://localhost:{}", config.listen_addr.port());
    println!(
        "    Health:    http://localhost:{}/health",
        config.listen_addr.port()
    );
    println!(
        "    Metrics:   http://localhost:{}/metrics",
        config.listen_addr.port()
    );
    println!();
    println!("  Quick Start:");
    println!(
        "    curl -X POST localhost:{}/api/v1/tenants \\",
        config.listen_addr.port()
    );
    println!("      -H 'Content-Type: application/json' \\");
    println!("      -d '{{\"name\": \"acme\", \"worker_count\": 3}}'");
    println!();
    println!("  Note: the in-memory broker does not persist across restarts.");
    println!();
}

fn main() -> ExitCode {
    if let Err(e) = run() {
        eprintln!("Carrier failed to start: {e}");
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn run() -> Result<()> {
    let mut args = ServerArgs::parse();

    if args.generate_config {
        println!("{}", ConfigFile::generate_example());
        return Ok(());
    }

    // Load configuration file if specified or from default locations
    let config_file = if let Some(ref path) = args.config {
        match ConfigFile::load(path) {
            Ok(config) => {
                eprintln!("Loaded configuration from {:?}", path);
                Some(config)
            }
            Err(e) => {
                eprintln!("Error loading configuration file: {}", e);
                return Err(e);
            }
        }
    } else {
        ConfigFile::load_default()
    };

    // Merge config file values with CLI args (CLI takes precedence)
    if let Some(ref config) = config_file {
        args = merge_config_with_args(args, config);
    }

    let log_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(log_filter)
        .init();

    if config_file.is_some() {
        info!("Configuration loaded from file");
    }

    let config = match ServerConfig::from_args(args, config_file.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to create configuration");
            return Err(e);
        }
    };
    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(e);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| CarrierError::Server(format!("Failed to create Tokio runtime: {}", e)))?;

    runtime.block_on(run_server(config))
}

async fn run_server(config: ServerConfig) -> Result<()> {
    let prometheus = match carrier::metrics::init_prometheus() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "Metrics recorder unavailable, /metrics disabled");
            None
        }
    };

    let connector: Arc<dyn BrokerConnector> = if config.in_memory {
        info!("Using in-memory broker");
        Arc::new(MemoryConnector::new())
    } else {
        info!(url = %config.broker_url, "Using AMQP broker");
        Arc::new(AmqpConnector::new(&config.broker_url))
    };

    let guardian = ConnectionGuardian::connect(connector, config.reconnect.clone()).await?;
    let manager = TenantManager::new(
        guardian,
        config.max_redeliveries,
        Arc::new(LogHandler),
    );

    let app = create_router(AppState {
        manager: manager.clone(),
        prometheus,
    });
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Admin API listening");

    if config.in_memory {
        print_playground_banner(&config);
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| CarrierError::Server(e.to_string()))?;

    info!("Shutting down, draining tenants");
    manager.close(config.shutdown_timeout).await;
    info!("Shutdown complete");
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
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl-C"),
        () = terminate => info!("Received SIGTERM"),
    }
}
