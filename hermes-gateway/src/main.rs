//! # Hermes Gateway Binary
//!
//! Boots the gateway: parse arguments, initialize tracing, load and
//! validate configuration, open the store, bind the listener, serve until
//! interrupted, then drain the log sink and checkpoint the WAL.
//!
//! Exit codes: `0` clean shutdown, `1` bootstrap failure (port bind,
//! database open), `2` invalid configuration.

use clap::Parser;
use hermes_gateway::config::Config;
use hermes_gateway::server::create_server;
use std::net::SocketAddr;

#[derive(Parser)]
#[command(author, version, about = "OpenAI-compatible AI gateway", long_about = None)]
struct Args {
    /// Path to the TOML configuration file. Missing file means defaults
    /// plus environment overrides.
    #[arg(short, long, default_value = "hermes.toml")]
    config: String,

    /// Override the bind host.
    #[arg(long)]
    host: Option<String>,

    /// Override the bind port.
    #[arg(short, long)]
    port: Option<u16>,

    /// Logging filter, e.g. "info" or "hermes_core=debug,info".
    #[arg(long)]
    log_level: Option<String>,
}

const EXIT_BOOTSTRAP: i32 = 1;
const EXIT_CONFIG: i32 = 2;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let mut config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            std::process::exit(EXIT_CONFIG);
        }
    };
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
        )
        .init();

    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "configuration rejected");
        std::process::exit(EXIT_CONFIG);
    }

    let addr: SocketAddr = match config.server.host.parse() {
        Ok(ip) => SocketAddr::new(ip, config.server.port),
        Err(_) => {
            tracing::error!(host = %config.server.host, "server.host is not an IP address");
            std::process::exit(EXIT_CONFIG);
        }
    };

    let (app, state) = match create_server(config).await {
        Ok(built) => built,
        Err(e) => {
            tracing::error!(error = %e, "bootstrap failed");
            std::process::exit(EXIT_BOOTSTRAP);
        }
    };

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, %addr, "failed to bind");
            std::process::exit(EXIT_BOOTSTRAP);
        }
    };
    tracing::info!(%addr, "hermes gateway listening");

    let serve = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
    });

    if let Err(e) = serve.await {
        tracing::error!(error = %e, "server error");
        state.shutdown().await;
        std::process::exit(EXIT_BOOTSTRAP);
    }

    state.shutdown().await;
}
