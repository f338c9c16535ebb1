//! Broadcast Chat Server - Entry Point
//!
//! Recovers persisted history, starts the ChatRoom actor and its background
//! tasks, then accepts connections until Ctrl-C.

use std::env;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use broadcast_chat::{
    handle_connection, AppError, ChatRoom, Config, ConnectionContext, InactivityReaper,
    PersistenceLog, RoomSettings, SessionStore, SnapshotTicker,
};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=broadcast_chat=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("broadcast_chat=info")),
        )
        .init();

    let mut config = Config::from_env()?;
    // Bind address from the command line wins over the environment
    if let Some(addr) = env::args().nth(1) {
        config.listen_addr = addr;
    }
    let config = Arc::new(config);

    let (persistence, recovered) = PersistenceLog::open(&config.data_dir)?;
    let sessions = SessionStore::new(config.session_expiry);
    let (room, room_task) = ChatRoom::spawn(
        persistence,
        recovered,
        sessions.clone(),
        RoomSettings::from(config.as_ref()),
        config.command_buffer,
    );
    info!("ChatRoom actor started");

    tokio::spawn(
        InactivityReaper::new(room.clone(), config.reaper_interval, config.idle_timeout).run(),
    );
    tokio::spawn(SnapshotTicker::new(room.clone(), config.snapshot_interval).run());

    let listener = TcpListener::bind(&config.listen_addr).await?;
    info!("Chat server listening on {}", config.listen_addr);

    let ctx = ConnectionContext {
        room: room.clone(),
        sessions,
        config: Arc::clone(&config),
    };

    // Connection accept loop
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    info!("New connection from {}", addr);
                    let ctx = ctx.clone();

                    // Spawn handler task for each connection
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, ctx).await {
                            warn!(%addr, error = %e, "Connection ended with error");
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
        }
    }

    if let Err(e) = room.shutdown().await {
        error!(error = %e, "Room shutdown failed");
    }
    let _ = room_task.await;
    info!("Shutdown complete");
    Ok(())
}
