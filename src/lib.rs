//! Broadcast Chat Server Library
//!
//! A line-oriented TCP chat room: one global room, broadcast to every
//! connected client, private messages, durable history and reconnect tokens.
//!
//! # Features
//! - Plain-text protocol over TCP (newline-terminated UTF-8)
//! - Username handshake, or `reconnect:<username>:<token>` to resume
//! - Broadcast chat with per-client bounded mailboxes (slow clients drop,
//!   they never stall the room)
//! - Slash commands: `/users`, `/stats`, `/history [N]`, `/msg`, `/token`,
//!   `/simulate crash`, `/quit`
//! - Write-ahead log with fsync per message, periodic compacted snapshots,
//!   crash recovery on startup
//! - Idle client eviction
//!
//! # Architecture
//! Uses the Actor pattern with `mpsc` channels:
//! - `ChatRoom` is the central actor owning the registry and history
//! - Each connection runs a read pump and a write pump talking to the room
//!   through a `RoomHandle`
//! - The session table is the only state shared outside the actor, behind a
//!   narrow mutex
//!
//! # Example
//! ```ignore
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//! use broadcast_chat::{handle_connection, ChatRoom, Config, ConnectionContext,
//!     PersistenceLog, RoomSettings, SessionStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let (log, recovered) = PersistenceLog::open(&config.data_dir)?;
//!     let sessions = SessionStore::new(config.session_expiry);
//!     let (room, _task) = ChatRoom::spawn(log, recovered, sessions.clone(),
//!         RoomSettings::from(&config), config.command_buffer);
//!
//!     let listener = TcpListener::bind(&config.listen_addr).await?;
//!     let ctx = ConnectionContext { room, sessions, config: Arc::new(config) };
//!     while let Ok((stream, _)) = listener.accept().await {
//!         tokio::spawn(handle_connection(stream, ctx.clone()));
//!     }
//!     Ok(())
//! }
//! ```

pub mod background;
pub mod client;
pub mod command;
pub mod config;
pub mod error;
pub mod handle;
pub mod handler;
pub mod message;
pub mod persistence;
pub mod room;
pub mod server;
pub mod session;
pub mod types;

// Re-export main types for convenience
pub use background::{InactivityReaper, SnapshotTicker};
pub use client::{Client, ClientStats};
pub use command::{Command, Handshake};
pub use config::Config;
pub use error::{AppError, PersistenceError, RoomError, SendError, SessionError};
pub use handle::RoomHandle;
pub use handler::{handle_connection, ConnectionContext};
pub use message::{Channel, ChatMessage};
pub use persistence::{PersistenceLog, Recovered};
pub use room::RoomState;
pub use server::{ChatRoom, LeaveReason, RoomCommand, RoomSettings};
pub use session::{Session, SessionStore};
pub use types::{ClientId, ReconnectToken};
