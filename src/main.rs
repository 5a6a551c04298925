//! goldenbridge - WebSocket bridge for the TurboGOLDEN legacy host.
//!
//! Runs a single daemon: an axum HTTP/WebSocket server that opens, logs
//! into, and relays one telnet session per connected browser client.
//! Serving the terminal page itself is someone else's job; point any
//! xterm.js front end at `ws://<bind>/ws`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use goldenbridge::{
    api,
    config::BridgeConfig,
    session::SessionRegistry,
    shutdown::ShutdownCoordinator,
};

/// goldenbridge - WebSocket bridge for the TurboGOLDEN legacy host.
///
/// Flags override the config file; environment variables fill in where
/// flags are absent.
#[derive(Parser, Debug)]
#[command(name = "goldenbridge", version, about, long_about = None)]
struct Cli {
    /// Address to bind the WebSocket gateway
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// TurboGOLDEN host address
    #[arg(long, env = "TURBOGOLDEN_HOST")]
    host: Option<String>,

    /// TurboGOLDEN telnet port
    #[arg(long, env = "TURBOGOLDEN_PORT")]
    port: Option<u16>,

    /// Authentication token for non-localhost bindings
    #[arg(long, env = "GOLDENBRIDGE_TOKEN")]
    token: Option<String>,

    /// Account the telnet layer logs into before the application starts
    #[arg(long)]
    linux_user: Option<String>,

    /// Path to a TOML config file
    #[arg(long)]
    config: Option<PathBuf>,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "goldenbridge=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn is_loopback(addr: &SocketAddr) -> bool {
    addr.ip().is_loopback()
}

/// Resolve the gateway token: an explicit token always wins, loopback binds
/// need none, and anything else gets a generated one printed to stderr.
fn resolve_token(bind: &SocketAddr, user_token: Option<String>) -> Option<String> {
    if let Some(token) = user_token {
        return Some(token);
    }
    if is_loopback(bind) {
        return None;
    }
    use rand::Rng;
    let token: String = rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(32)
        .map(char::from)
        .collect();
    eprintln!("goldenbridge: gateway token (required for non-localhost): {token}");
    Some(token)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => BridgeConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?
            .with_context(|| format!("config file not found: {}", path.display()))?,
        None => BridgeConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(linux_user) = cli.linux_user {
        config.linux_user = linux_user;
    }
    let token = resolve_token(&config.bind, cli.token.or_else(|| config.token.clone()));
    if token.is_some() {
        tracing::info!("gateway token configured");
    }

    let sessions = SessionRegistry::new(config.host_config());
    let shutdown = ShutdownCoordinator::new();
    let state = api::AppState {
        sessions: sessions.clone(),
        shutdown: shutdown.clone(),
    };
    let app = api::router(state, token);

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;
    tracing::info!(
        addr = %config.bind,
        host = %config.host,
        port = config.port,
        "goldenbridge listening"
    );

    // Oneshot channel for server shutdown.
    let (server_shutdown_tx, server_shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let http_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                server_shutdown_rx.await.ok();
            })
            .await
    });

    tokio::signal::ctrl_c().await.context("waiting for Ctrl+C")?;
    tracing::info!("received Ctrl+C");

    // Signal WebSocket handlers first so close frames go out before the
    // listener stops.
    shutdown.shutdown();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let _ = server_shutdown_tx.send(());

    sessions.drain();

    http_handle
        .await
        .context("HTTP server task panicked")?
        .context("HTTP server error")?;

    tracing::info!("goldenbridge exiting");
    Ok(())
}
