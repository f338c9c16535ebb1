//! Client struct definition
//!
//! Represents a registered client: its identity, username, and the sending
//! side of its mailbox. The registry entry is the only strong owner of the
//! mailbox sender, so dropping the entry is what closes the mailbox.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::SendError;
use crate::types::ClientId;

/// Counters and activity clock for one connection
///
/// Shared between the room actor (sent counter, idle checks) and the
/// connection's read pump (received counter, activity marks, `/stats`).
#[derive(Debug)]
pub struct ClientStats {
    sent: AtomicU64,
    received: AtomicU64,
    last_active: Mutex<Instant>,
    slow: bool,
}

impl ClientStats {
    pub fn new(slow: bool) -> Self {
        Self {
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            last_active: Mutex::new(Instant::now()),
            slow,
        }
    }

    /// Messages delivered to this client's mailbox
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Lines received from this client
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_active(&self) {
        *self
            .last_active
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Time since the last activity mark
    pub fn idle_for(&self) -> Duration {
        self.last_active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    pub fn is_idle(&self, threshold: Duration) -> bool {
        self.idle_for() > threshold
    }

    /// Whether the write pump throttles this client
    pub fn is_slow(&self) -> bool {
        self.slow
    }
}

/// Registered client
#[derive(Debug)]
pub struct Client {
    /// Unique identifier for this connection
    pub id: ClientId,
    pub username: String,
    /// Room → connection mailbox
    mailbox: mpsc::Sender<String>,
    pub stats: Arc<ClientStats>,
}

impl Client {
    /// Create a new client with the given ID, username and mailbox
    pub fn new(
        id: ClientId,
        username: impl Into<String>,
        mailbox: mpsc::Sender<String>,
        stats: Arc<ClientStats>,
    ) -> Self {
        Self {
            id,
            username: username.into(),
            mailbox,
            stats,
        }
    }

    /// Non-blocking delivery of a broadcast or direct message.
    ///
    /// Counts towards the client's sent counter on success.
    pub fn deliver(&self, text: String) -> Result<(), SendError> {
        self.mailbox.try_send(text)?;
        self.stats.record_sent();
        Ok(())
    }

    /// Non-blocking delivery of a private reply (history, lists, command
    /// results). Not counted.
    pub fn notify(&self, text: String) -> Result<(), SendError> {
        self.mailbox.try_send(text).map_err(SendError::from)
    }
}
