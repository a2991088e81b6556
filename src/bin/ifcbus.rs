//! ifcbus router daemon
//!
//! Loads configuration, starts the process router, accepts downstream
//! peers on the configured listeners and optionally attaches upstream.

use clap::Parser;
use ifcbus::{Config, Port, Router, TcpListenerService, TcpTransport};
use std::path::PathBuf;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, EnvFilter};

/// ifcbus message router daemon
#[derive(Parser, Debug)]
#[command(name = "ifcbus", version, about)]
struct Args {
    /// Path to configuration file (overrides default search paths)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Additional listen address for downstream peers
    #[arg(short, long, value_name = "ADDR")]
    listen: Vec<String>,

    /// Print the effective configuration and exit
    #[arg(long)]
    show_config: bool,
}

#[tokio::main]
async fn main() {
    // Initialize logging
    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let args = Args::parse();

    info!("ifcbus starting");

    // Load configuration
    let (mut config, loaded_paths) = if let Some(config_path) = &args.config {
        // Explicit config file specified - load only that file
        match Config::load_file(config_path) {
            Ok(config) => (config, vec![config_path.clone()]),
            Err(e) => {
                error!("Failed to load configuration from {}: {}", config_path.display(), e);
                std::process::exit(1);
            }
        }
    } else {
        match Config::load() {
            Ok(result) => result,
            Err(e) => {
                error!("Failed to load configuration: {}", e);
                std::process::exit(1);
            }
        }
    };

    if loaded_paths.is_empty() {
        info!("No config files found, using defaults");
    } else {
        for path in &loaded_paths {
            info!(path = %path.display(), "Loaded config file");
        }
    }
    config.transports.listen.extend(args.listen);

    if args.show_config {
        match config.to_yaml() {
            Ok(yaml) => print!("{}", yaml),
            Err(e) => {
                error!("Failed to render configuration: {}", e);
                std::process::exit(1);
            }
        }
        return;
    }

    let router = match Router::new(config.router.clone()) {
        Ok(router) => router,
        Err(e) => {
            error!("Failed to create router: {}", e);
            std::process::exit(1);
        }
    };

    // Attach upstream before accepting peers: an upstream refuses to bind
    // once subnets have been delegated.
    let upstream = match &config.transports.upstream {
        Some(up) => {
            info!(addr = %up.addr, domain = %up.domain, "Connecting upstream");
            let port = Port::new(router.clone(), TcpTransport::connect(up.addr.clone()));
            if let Err(e) = port.init_upstream(&up.domain).await {
                error!("Failed to attach upstream {}: {}", up.addr, e);
                std::process::exit(1);
            }
            Some(port)
        }
        None => None,
    };

    let mut listeners = Vec::new();
    for addr in &config.transports.listen {
        match TcpListenerService::bind(addr, router.clone()).await {
            Ok(listener) => listeners.push(listener),
            Err(e) => {
                error!("Failed to listen on {}: {}", addr, e);
                std::process::exit(1);
            }
        }
    }
    if listeners.is_empty() && upstream.is_none() {
        warn!("No transports configured, router is isolated");
    }

    info!(
        net_addr = %router.net_addr(),
        prefix_len = router.prefix_len(),
        own_host = %router.own_host(),
        "ifcbus running, press Ctrl+C to exit"
    );

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }

    info!("ifcbus shutting down");
    for listener in &listeners {
        listener.shutdown().await;
    }
    if let Some(port) = upstream {
        port.finish().await;
    }
    router.shutdown();

    let stats = router.stats();
    info!(
        delivered = stats.delivered_local,
        forwarded = stats.forwarded,
        dropped = stats.dropped,
        "ifcbus shutdown complete"
    );
}
