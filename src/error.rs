//! Error types for the chat server
//!
//! Defines connection-level errors, actor errors, persistence and session
//! errors, and mailbox send errors. Uses thiserror for ergonomic error
//! definitions.

use std::path::PathBuf;

use thiserror::Error;

/// Connection and process level errors
///
/// Every variant ends at most one connection (or aborts startup); none of
/// them reach the room actor.
#[derive(Debug, Error)]
pub enum AppError {
    /// IO error (fatal for the connection)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Line framing error (over-long line or IO underneath)
    #[error("Line codec error: {0}")]
    Codec(#[from] tokio_util::codec::LinesCodecError),

    /// No handshake line arrived in time
    #[error("Handshake timed out")]
    HandshakeTimeout,

    /// Peer closed the connection before the handshake completed
    #[error("Peer disconnected during handshake")]
    Disconnected,

    /// `reconnect:` line without exactly three fields
    #[error("Malformed reconnect line")]
    InvalidReconnect,

    /// Name that could not be reconnected or addressed by `/msg`
    #[error("Invalid username: {0:?}")]
    InvalidUsername(String),

    /// Token did not validate (mismatch, unknown user or expired session)
    #[error("Reconnect rejected for {username}: {source}")]
    ReconnectRejected {
        username: String,
        #[source]
        source: SessionError,
    },

    /// Username already has an active client
    #[error("Username already connected: {0}")]
    UsernameTaken(String),

    /// Room actor error
    #[error("Room error: {0}")]
    Room(#[from] RoomError),

    /// Persistence error (startup recovery)
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Errors returned through a `RoomHandle`
#[derive(Debug, Error)]
pub enum RoomError {
    /// The actor has shut down
    #[error("Room actor is no longer running")]
    ChannelClosed,

    /// Join refused because the username is active
    #[error("Username already connected: {0}")]
    UsernameTaken(String),

    /// Snapshot or WAL failure reported back to the caller
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// WAL and snapshot errors
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error on {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// WAL handle was closed at shutdown
    #[error("WAL is closed")]
    WalClosed,
}

impl PersistenceError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.into(),
            source,
        }
    }
}

/// Reconnect validation failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("no session for this username")]
    NotFound,

    #[error("token does not match")]
    TokenMismatch,

    /// Last seen outside the expiry window; the session has been removed
    #[error("session expired")]
    Expired,
}

/// Mailbox send errors
///
/// Occurs when a non-blocking send to a client mailbox does not go through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    /// Mailbox is at capacity (slow consumer)
    #[error("Mailbox full")]
    MailboxFull,

    /// The receiving end of the channel has been closed
    #[error("Channel closed")]
    ChannelClosed,
}

impl<T> From<tokio::sync::mpsc::error::TrySendError<T>> for SendError {
    fn from(err: tokio::sync::mpsc::error::TrySendError<T>) -> Self {
        match err {
            tokio::sync::mpsc::error::TrySendError::Full(_) => SendError::MailboxFull,
            tokio::sync::mpsc::error::TrySendError::Closed(_) => SendError::ChannelClosed,
        }
    }
}
