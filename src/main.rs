//! Realm Server
//!
//! Persistent multiplayer world server accepting binary-protocol clients over
//! TCP and WebSocket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use realm_server::config::{ServerConfig, StoreBackend};
use realm_server::net::handler::ConnectionHandler;
use realm_server::state::AppState;
use realm_server::store::{KvBackend, MemoryBackend, RedisBackend, SharedBackend};
use realm_server::VERSION;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let config = ServerConfig::load().await?;
    init_logging(&config.log_format);

    info!(version = VERSION, "Realm server starting");
    info!(
        "Configuration loaded from: {}",
        config.config_path.display()
    );

    let backend = create_backend(&config).await?;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let state = Arc::new(AppState::new(config.clone(), backend, shutdown_tx.clone()));

    // Start the game world tick. It stops on its own signal, after the
    // sessions have drained.
    let (world_stop_tx, mut world_stop_rx) = broadcast::channel::<()>(1);
    let world = state.world.clone();
    let world_handle = tokio::spawn(async move {
        world.run(&mut world_stop_rx).await;
    });

    let game_addr: SocketAddr = format!("0.0.0.0:{}", config.game_port).parse()?;
    let game_listener = TcpListener::bind(game_addr).await?;
    info!("Game server listening on: {}", game_addr);

    let ws_addr: SocketAddr = format!("0.0.0.0:{}", config.websocket_port).parse()?;
    let ws_listener = TcpListener::bind(ws_addr).await?;
    info!("WebSocket server listening on: {}", ws_addr);

    let game_state = state.clone();
    let mut game_shutdown_rx = shutdown_tx.subscribe();
    let game_handle = tokio::spawn(async move {
        accept_connections(game_listener, game_state, false, &mut game_shutdown_rx).await;
    });

    let ws_state = state.clone();
    let mut ws_shutdown_rx = shutdown_tx.subscribe();
    let ws_handle = tokio::spawn(async move {
        accept_connections(ws_listener, ws_state, true, &mut ws_shutdown_rx).await;
    });

    info!(
        world_id = config.world_id,
        name = %config.server_name,
        "Server startup complete"
    );

    wait_for_shutdown(shutdown_tx.clone()).await;

    info!("Shutting down server...");
    let _ = game_handle.await;
    let _ = ws_handle.await;

    state.sessions.close_all();
    info!(sessions = state.sessions.count(), "All sessions asked to close");

    let grace = Duration::from_secs(config.net.shutdown_grace_secs);
    if state.sessions.drain(grace).await {
        info!("All sessions torn down");
    } else {
        warn!(
            remaining = state.sessions.count(),
            grace_secs = grace.as_secs(),
            "Sessions still open after shutdown grace period"
        );
    }

    let _ = world_stop_tx.send(());
    let _ = world_handle.await;

    info!("Server shutdown complete. Goodbye!");
    Ok(())
}

/// Initialize the logging/tracing system
fn init_logging(format: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,realm_server=debug"));

    let builder = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_level(true);

    if format.eq_ignore_ascii_case("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Build the configured key-value backend
async fn create_backend(config: &ServerConfig) -> Result<SharedBackend> {
    match config.store.backend {
        StoreBackend::Memory => {
            warn!("Using in-memory store - nothing survives a restart");
            Ok(Arc::new(MemoryBackend::new()))
        }
        StoreBackend::Redis => {
            let backend = RedisBackend::new(&config.redis)
                .with_context(|| format!("Failed to create Redis pool for {}", config.redis.url()))?;
            backend
                .ping()
                .await
                .with_context(|| format!("Redis not reachable at {}", config.redis.url()))?;
            info!(url = %config.redis.url(), "Connected to Redis");
            Ok(Arc::new(backend))
        }
    }
}

/// Accept incoming connections until shutdown
async fn accept_connections(
    listener: TcpListener,
    state: Arc<AppState>,
    websocket: bool,
    shutdown_rx: &mut broadcast::Receiver<()>,
) {
    let kind = if websocket { "WebSocket" } else { "game" };
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        info!("New {} connection from: {}", kind, addr);
                        let handler = ConnectionHandler::new(state.clone());
                        tokio::spawn(async move {
                            let result = if websocket {
                                handler.handle_websocket(stream, addr).await
                            } else {
                                handler.handle_tcp(stream, addr).await
                            };
                            if let Err(e) = result {
                                warn!("{} connection error from {}: {}", kind, addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept {} connection: {}", kind, e);
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("{} connection acceptor shutting down", kind);
                break;
            }
        }
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn wait_for_shutdown(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    // Signal all tasks to shut down
    let _ = shutdown_tx.send(());
}
