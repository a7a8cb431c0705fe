use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use ubridge_core::config::{BridgeConfig, SHUTDOWN_GRACE_SECS};
use ubridge_gateway::app::{self, AppState};

#[derive(Parser)]
#[command(name = "ubridge-gateway", about = "Universal LLM bridge server")]
struct Args {
    /// Path to a TOML config file (env vars still apply on top).
    #[arg(long)]
    config: Option<String>,
    /// Override the listen port.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ubridge_gateway=info,tower_http=warn".into()),
        )
        .init();

    let args = Args::parse();

    let mut config = match BridgeConfig::load(args.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "config load failed");
            std::process::exit(1);
        }
    };
    if let Some(port) = args.port {
        config.server.port = port;
    }

    let state = match AppState::init(config) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "startup failed");
            std::process::exit(1);
        }
    };
    app::spawn_background(&state);

    let router = app::build_router(state.clone());
    let addr: SocketAddr = match format!("{}:{}", state.config.server.host, state.config.server.port)
        .parse()
    {
        Ok(addr) => addr,
        Err(e) => {
            error!(error = %e, "invalid listen address");
            std::process::exit(1);
        }
    };

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, %addr, "bind failed");
            std::process::exit(1);
        }
    };
    info!(%addr, "ubridge gateway listening");

    let shutdown = state.shutdown.clone();
    let serve = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(state.clone()));

    if let Err(e) = serve.await {
        error!(error = %e, "server failed");
        std::process::exit(2);
    }

    // Give in-flight streams a moment to observe the token, then flush.
    shutdown.cancel();
    tokio::time::sleep(Duration::from_millis(50)).await;
    tokio::time::timeout(
        Duration::from_secs(SHUTDOWN_GRACE_SECS),
        state.capture.flush_all(),
    )
    .await
    .ok();
    info!("shutdown complete");
}

async fn shutdown_signal(state: Arc<AppState>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        if let Ok(mut term) = signal(SignalKind::terminate()) {
            term.recv().await;
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("signal received, starting graceful shutdown");
    // Streaming responses observe this and close with finishReason "cancelled".
    state.shutdown.cancel();
}
