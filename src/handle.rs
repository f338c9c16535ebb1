//! Client interface for interacting with the ChatRoom actor.
//!
//! `RoomHandle` is a cheap-to-clone wrapper around the actor's command
//! channel. Connection handlers, the inactivity reaper and the snapshot
//! ticker each hold one.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::client::Client;
use crate::error::RoomError;
use crate::server::{LeaveReason, RoomCommand};
use crate::types::ClientId;

#[derive(Debug, Clone)]
pub struct RoomHandle {
    sender: mpsc::Sender<RoomCommand>,
}

impl RoomHandle {
    pub fn new(sender: mpsc::Sender<RoomCommand>) -> Self {
        Self { sender }
    }

    async fn send(&self, cmd: RoomCommand) -> Result<(), RoomError> {
        self.sender
            .send(cmd)
            .await
            .map_err(|_| RoomError::ChannelClosed)
    }

    /// Register a client.
    ///
    /// # Errors
    ///
    /// - `RoomError::UsernameTaken` if the username is active and
    ///   `replace_existing` is false
    /// - `RoomError::ChannelClosed` if the actor has shut down
    pub async fn join(&self, client: Client, replace_existing: bool) -> Result<(), RoomError> {
        let (tx, rx) = oneshot::channel();
        self.send(RoomCommand::Join {
            client,
            replace_existing,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| RoomError::ChannelClosed)?
    }

    /// Deregister a client. Safe to call more than once.
    pub async fn leave(&self, client_id: ClientId, reason: LeaveReason) {
        let _ = self.send(RoomCommand::Leave { client_id, reason }).await;
    }

    pub async fn broadcast(&self, text: impl Into<String>) -> Result<(), RoomError> {
        self.send(RoomCommand::Broadcast { text: text.into() }).await
    }

    pub async fn list_users(&self, client_id: ClientId) {
        let _ = self.send(RoomCommand::ListUsers { client_id }).await;
    }

    pub async fn history(&self, client_id: ClientId, count: usize) {
        let _ = self.send(RoomCommand::History { client_id, count }).await;
    }

    /// Deliver a private message; the outcome is reported to the sender's
    /// mailbox by the actor.
    pub async fn direct_message(&self, from: ClientId, to: impl Into<String>, text: impl Into<String>) {
        let _ = self
            .send(RoomCommand::DirectMessage {
                from,
                to: to.into(),
                text: text.into(),
            })
            .await;
    }

    /// Returns false if the actor is gone
    pub async fn is_username_active(&self, username: &str) -> bool {
        let (tx, rx) = oneshot::channel();
        if self
            .send(RoomCommand::IsActive {
                username: username.to_string(),
                respond_to: tx,
            })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn idle_clients(&self, threshold: Duration) -> Result<Vec<ClientId>, RoomError> {
        let (tx, rx) = oneshot::channel();
        self.send(RoomCommand::IdleClients {
            threshold,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| RoomError::ChannelClosed)
    }

    /// Ask the actor to compact history. Returns whether a snapshot was
    /// written.
    pub async fn snapshot(&self, force: bool) -> Result<bool, RoomError> {
        let (tx, rx) = oneshot::channel();
        self.send(RoomCommand::Snapshot {
            force,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| RoomError::ChannelClosed)?
    }

    /// Final snapshot and WAL close; resolves once done
    pub async fn shutdown(&self) -> Result<(), RoomError> {
        let (tx, rx) = oneshot::channel();
        self.send(RoomCommand::Shutdown { respond_to: tx }).await?;
        rx.await.map_err(|_| RoomError::ChannelClosed)
    }
}
