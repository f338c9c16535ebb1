//! ChatRoom Actor implementation
//!
//! The central actor that owns the client registry and message history.
//! Commands are processed strictly one at a time, which is the only
//! synchronization the room state needs. Persistence is invoked
//! synchronously from inside the loop.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::client::Client;
use crate::config::Config;
use crate::error::{PersistenceError, RoomError, SendError};
use crate::handle::RoomHandle;
use crate::message::{as_line, format_duration, format_history, format_private, format_system, parse_broadcast};
use crate::persistence::{PersistenceLog, Recovered};
use crate::room::RoomState;
use crate::session::SessionStore;
use crate::types::ClientId;

/// Why a client is being removed from the registry (for logs)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
    /// Read side closed, errored or timed out
    Disconnected,
    /// Write pump stopped (socket error or mailbox closed)
    WriteClosed,
    /// `/quit`
    Quit,
    /// `/simulate crash`
    Crashed,
    /// Evicted by the inactivity reaper
    Idle,
    /// Same username reconnected with a valid token
    Replaced,
}

/// Commands sent to the ChatRoom actor
#[derive(Debug)]
pub enum RoomCommand {
    /// Register a client after a successful handshake
    Join {
        client: Client,
        /// Evict an active client with the same username instead of refusing
        replace_existing: bool,
        respond_to: oneshot::Sender<Result<(), RoomError>>,
    },
    /// Deregister a client; no-op if already gone
    Leave {
        client_id: ClientId,
        reason: LeaveReason,
    },
    /// Record, persist and fan out a line of text
    Broadcast { text: String },
    /// Send the user list to one client
    ListUsers { client_id: ClientId },
    /// Send the last `count` history entries to one client
    History { client_id: ClientId, count: usize },
    /// Private message from one client to a username
    DirectMessage {
        from: ClientId,
        to: String,
        text: String,
    },
    /// Whether a username has an active client
    IsActive {
        username: String,
        respond_to: oneshot::Sender<bool>,
    },
    /// Ids of clients idle beyond `threshold`
    IdleClients {
        threshold: Duration,
        respond_to: oneshot::Sender<Vec<ClientId>>,
    },
    /// Compact history into a snapshot; unconditional when `force` is set,
    /// otherwise only above the configured threshold
    Snapshot {
        force: bool,
        respond_to: oneshot::Sender<Result<bool, RoomError>>,
    },
    /// Final snapshot, close the WAL and stop the loop
    Shutdown { respond_to: oneshot::Sender<()> },
}

/// Tunables the actor needs from `Config`
#[derive(Debug, Clone, Copy)]
pub struct RoomSettings {
    /// History entries sent to a client on join
    pub join_history: usize,
    /// Listed as idle in `/users` beyond this
    pub idle_display_after: Duration,
    /// Periodic snapshots only when history is longer than this
    pub snapshot_threshold: usize,
}

impl From<&Config> for RoomSettings {
    fn from(config: &Config) -> Self {
        Self {
            join_history: config.join_history,
            idle_display_after: config.idle_display_after,
            snapshot_threshold: config.snapshot_threshold,
        }
    }
}

/// The main ChatRoom actor
pub struct ChatRoom {
    state: RoomState,
    persistence: PersistenceLog,
    sessions: SessionStore,
    settings: RoomSettings,
    receiver: mpsc::Receiver<RoomCommand>,
    shut_down: bool,
}

impl ChatRoom {
    /// Create a ChatRoom seeded with recovered history
    pub fn new(
        receiver: mpsc::Receiver<RoomCommand>,
        persistence: PersistenceLog,
        recovered: Recovered,
        sessions: SessionStore,
        settings: RoomSettings,
    ) -> Self {
        Self {
            state: RoomState::new(recovered.history, recovered.next_message_id),
            persistence,
            sessions,
            settings,
            receiver,
            shut_down: false,
        }
    }

    /// Build the actor, spawn its loop and return a handle to it
    pub fn spawn(
        persistence: PersistenceLog,
        recovered: Recovered,
        sessions: SessionStore,
        settings: RoomSettings,
        buffer: usize,
    ) -> (RoomHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(buffer);
        let room = Self::new(receiver, persistence, recovered, sessions, settings);
        let task = tokio::spawn(room.run());
        (RoomHandle::new(sender), task)
    }

    /// Run the ChatRoom event loop
    ///
    /// Runs until a `Shutdown` command arrives or every handle is dropped.
    /// Either way the final snapshot is taken before returning.
    pub async fn run(mut self) {
        info!(
            history = self.state.history().len(),
            next_id = self.state.next_message_id(),
            "ChatRoom started"
        );

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
            if self.shut_down {
                break;
            }
        }

        self.shutdown();
        info!("ChatRoom stopped");
    }

    /// Process a single command
    fn handle_command(&mut self, cmd: RoomCommand) {
        match cmd {
            RoomCommand::Join {
                client,
                replace_existing,
                respond_to,
            } => {
                let result = self.handle_join(client, replace_existing);
                let _ = respond_to.send(result);
            }
            RoomCommand::Leave { client_id, reason } => {
                self.handle_leave(client_id, reason);
            }
            RoomCommand::Broadcast { text } => {
                self.handle_broadcast(&text);
            }
            RoomCommand::ListUsers { client_id } => {
                self.handle_list_users(client_id);
            }
            RoomCommand::History { client_id, count } => {
                self.send_history(client_id, count);
            }
            RoomCommand::DirectMessage { from, to, text } => {
                self.handle_direct_message(from, &to, &text);
            }
            RoomCommand::IsActive {
                username,
                respond_to,
            } => {
                let _ = respond_to.send(self.state.is_username_active(&username));
            }
            RoomCommand::IdleClients {
                threshold,
                respond_to,
            } => {
                let _ = respond_to.send(self.state.idle_clients(threshold));
            }
            RoomCommand::Snapshot { force, respond_to } => {
                let result = self.handle_snapshot(force).map_err(RoomError::from);
                let _ = respond_to.send(result);
            }
            RoomCommand::Shutdown { respond_to } => {
                self.shutdown();
                let _ = respond_to.send(());
            }
        }
    }

    /// Handle a client joining
    fn handle_join(&mut self, client: Client, replace_existing: bool) -> Result<(), RoomError> {
        if let Some(existing) = self.state.find_by_username(&client.username).map(|c| c.id) {
            if !replace_existing {
                debug!(username = %client.username, "Join refused, username active");
                return Err(RoomError::UsernameTaken(client.username));
            }
            self.handle_leave(existing, LeaveReason::Replaced);
        }

        let client_id = client.id;
        let username = client.username.clone();
        client.stats.mark_active();
        self.state.register(client);

        info!(
            %client_id,
            username = %username,
            total = self.state.client_count(),
            "Client joined"
        );

        self.send_history(client_id, self.settings.join_history);
        self.handle_broadcast(&format_system(&format!("{} joined the chat", username)));
        Ok(())
    }

    /// Handle a client leaving. Dropping the registry entry closes its mailbox.
    fn handle_leave(&mut self, client_id: ClientId, reason: LeaveReason) {
        let Some(client) = self.state.remove(client_id) else {
            debug!(%client_id, ?reason, "Leave for absent client ignored");
            return;
        };

        self.sessions.touch(&client.username);
        let username = client.username.clone();
        drop(client);

        info!(
            %client_id,
            username = %username,
            ?reason,
            total = self.state.client_count(),
            "Client left"
        );

        self.handle_broadcast(&format_system(&format!("{} left the chat", username)));
    }

    /// Record a message, persist it, then fan it out.
    ///
    /// A persistence failure is logged and delivery still happens. A full
    /// mailbox drops the message for that client only.
    fn handle_broadcast(&mut self, text: &str) {
        let (from, content) = parse_broadcast(text);
        let msg = self.state.record(from, content);

        if let Err(e) = self.persistence.append(&msg) {
            error!(id = msg.id, error = %e, "Failed to persist message");
        }

        let line = as_line(text);
        let mut delivered = 0usize;
        for client in self.state.clients() {
            match client.deliver(line.clone()) {
                Ok(()) => delivered += 1,
                Err(SendError::MailboxFull) => {
                    warn!(username = %client.username, id = msg.id, "Skipped slow client (mailbox full)");
                }
                Err(SendError::ChannelClosed) => {
                    debug!(username = %client.username, "Mailbox closed, leave pending");
                }
            }
        }

        debug!(
            id = msg.id,
            delivered,
            clients = self.state.client_count(),
            "Broadcast"
        );
    }

    /// Send a history block privately (best effort)
    fn send_history(&self, client_id: ClientId, count: usize) {
        let Some(client) = self.state.get(client_id) else {
            return;
        };
        let block = format_history(self.state.recent(count));
        if client.notify(block).is_err() {
            debug!(username = %client.username, "Couldn't send history");
        }
    }

    fn handle_list_users(&self, client_id: ClientId) {
        let Some(client) = self.state.get(client_id) else {
            return;
        };

        let mut list = String::from("Users online:\n");
        for c in self.state.clients_by_name() {
            let status = if c.stats.is_idle(self.settings.idle_display_after) {
                " (idle)"
            } else {
                ""
            };
            list.push_str(&format!("  - {}{}\n", c.username, status));
        }
        list.push_str(&format!("\nTotal messages: {}\n", self.state.total_messages()));
        list.push_str(&format!("Uptime: {}\n", format_duration(self.state.uptime())));

        if client.notify(list).is_err() {
            debug!(username = %client.username, "Couldn't send user list");
        }
    }

    /// Resolve, deliver and confirm a private message in one step.
    ///
    /// Failures are reported to the sender only.
    fn handle_direct_message(&self, from: ClientId, to: &str, text: &str) {
        let Some(sender) = self.state.get(from) else {
            return;
        };

        let reply = match self.state.find_by_username(to) {
            None => format!("User '{}' not found\n", to),
            Some(target) if target.id == from => "Can't message yourself!\n".to_string(),
            Some(target) => match target.deliver(format_private(&sender.username, text)) {
                Ok(()) => format!("Message sent to {}\n", to),
                Err(e) => {
                    debug!(from = %sender.username, to, error = %e, "Couldn't deliver DM");
                    format!("{}'s inbox is full\n", to)
                }
            },
        };

        let _ = sender.notify(reply);
    }

    /// Returns whether a snapshot was written
    fn handle_snapshot(&mut self, force: bool) -> Result<bool, PersistenceError> {
        let len = self.state.history().len();
        if !force && len <= self.settings.snapshot_threshold {
            debug!(len, threshold = self.settings.snapshot_threshold, "Snapshot not needed");
            return Ok(false);
        }
        self.persistence.snapshot(self.state.history())?;
        Ok(true)
    }

    fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        info!("Shutting down");

        if let Err(e) = self.handle_snapshot(true) {
            error!(error = %e, "Final snapshot failed");
        }
        if let Err(e) = self.persistence.close() {
            error!(error = %e, "Failed to close WAL");
        }
    }
}
