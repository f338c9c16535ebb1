//! TCP connection handler
//!
//! Handles individual client connections: the one-line handshake, then two
//! independently scheduled pumps. The read pump turns lines into room
//! commands; the write pump drains the client's mailbox to the socket.
//! Whichever pump finishes first ends the connection, and exactly one leave
//! is sent to the room for it.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, error, info, warn};

use crate::client::{Client, ClientStats};
use crate::command::{Command, Handshake};
use crate::config::Config;
use crate::error::{AppError, RoomError};
use crate::handle::RoomHandle;
use crate::message::{format_chat, format_duration, format_system};
use crate::server::LeaveReason;
use crate::session::SessionStore;
use crate::types::{guest_name, ClientId};

/// Longest accepted input line in bytes
pub const MAX_LINE_LENGTH: usize = 4096;

/// Pause between queuing the crash notice and dropping the socket
const CRASH_DELAY: Duration = Duration::from_millis(100);

const HANDSHAKE_PROMPT: &str =
    "Enter username (or 'reconnect:<username>:<token>' to reconnect): \n";

const WELCOME_COMMANDS: &str = concat!(
    "Commands:\n",
    "  /users - List all users\n",
    "  /history [N] - Show last N messages\n",
    "  /msg <user> <msg> - Private message\n",
    "  /token - Show your reconnect token\n",
    "  /stats - Show your stats\n",
    "  /simulate crash - Test crash handling\n",
    "  /quit - Leave\n",
);

type Lines<S> = FramedRead<ReadHalf<S>, LinesCodec>;
type Writer<S> = BufWriter<WriteHalf<S>>;

/// Shared dependencies of every connection
#[derive(Clone)]
pub struct ConnectionContext {
    pub room: RoomHandle,
    pub sessions: SessionStore,
    pub config: Arc<Config>,
}

/// How the read pump ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadOutcome {
    /// EOF, read error or line too long
    Disconnected,
    TimedOut,
    Quit,
    Crash,
}

/// Outcome of a successful handshake
struct Admitted {
    username: String,
    reconnected: bool,
}

/// Handle a new connection
///
/// Performs the handshake, registers the client with the room, runs both
/// pumps and deregisters the client once either pump stops.
pub async fn handle_connection<S>(stream: S, ctx: ConnectionContext) -> Result<(), AppError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut lines = FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    let mut writer = BufWriter::new(write_half);

    let admitted = match handshake(&mut lines, &mut writer, &ctx).await {
        Ok(admitted) => admitted,
        Err(e) => {
            let _ = writer.shutdown().await;
            return Err(e);
        }
    };
    let username = admitted.username;

    let client_id = ClientId::new();
    let slow = ctx.config.slow_client_ratio > 0.0
        && rand::thread_rng().gen_bool(ctx.config.slow_client_ratio);
    if slow {
        info!(%client_id, username = %username, "Client designated as slow (testing mode)");
    }
    let stats = Arc::new(ClientStats::new(slow));

    let (mailbox_tx, mailbox_rx) = mpsc::channel::<String>(ctx.config.mailbox_capacity);
    // Queued first so it precedes the join history and announcement
    let _ = mailbox_tx.try_send(format!("Welcome, {}!\n{}", username, WELCOME_COMMANDS));
    let reply_tx = mailbox_tx.downgrade();

    let client = Client::new(client_id, username.clone(), mailbox_tx, Arc::clone(&stats));
    match ctx.room.join(client, admitted.reconnected).await {
        Ok(()) => {}
        Err(RoomError::UsernameTaken(name)) => {
            write_line(&mut writer, "Username already connected. Use reconnect if you lost connection\n").await?;
            let _ = writer.shutdown().await;
            return Err(AppError::UsernameTaken(name));
        }
        Err(e) => return Err(e.into()),
    }

    info!(%client_id, username = %username, reconnected = admitted.reconnected, "Client connected");

    let pump = ReadPump {
        room: ctx.room.clone(),
        sessions: ctx.sessions.clone(),
        client_id,
        username: username.clone(),
        stats: Arc::clone(&stats),
        replies: reply_tx,
        read_timeout: ctx.config.read_timeout,
    };
    let mut read_task = tokio::spawn(pump.run(lines));
    let mut write_task = tokio::spawn(write_pump(
        mailbox_rx,
        writer,
        username.clone(),
        slow.then_some(ctx.config.slow_client_max_delay),
    ));

    // Wait for either pump to complete
    let reason = tokio::select! {
        res = &mut read_task => {
            let outcome = res.unwrap_or_else(|e| {
                error!(%client_id, error = %e, "Read pump failed");
                ReadOutcome::Disconnected
            });
            debug!(%client_id, ?outcome, "Read pump completed");
            match outcome {
                ReadOutcome::Quit => {
                    // Let the goodbye drain: leaving closes the mailbox,
                    // which ends the write pump once it is empty
                    ctx.room.leave(client_id, LeaveReason::Quit).await;
                    if timeout(ctx.config.quit_drain_timeout, &mut write_task).await.is_err() {
                        write_task.abort();
                    }
                    info!(%client_id, username = %username, "Client quit");
                    return Ok(());
                }
                ReadOutcome::Crash => LeaveReason::Crashed,
                ReadOutcome::Disconnected | ReadOutcome::TimedOut => LeaveReason::Disconnected,
            }
        }
        res = &mut write_task => {
            if let Err(e) = res {
                error!(%client_id, error = %e, "Write pump failed");
            }
            debug!(%client_id, "Write pump completed");
            read_task.abort();
            LeaveReason::WriteClosed
        }
    };

    write_task.abort();
    ctx.room.leave(client_id, reason).await;
    info!(%client_id, username = %username, ?reason, "Client disconnected");
    Ok(())
}

/// Read the first line, check it against sessions and the registry, and
/// tell the client its reconnect token.
async fn handshake<S>(
    lines: &mut Lines<S>,
    writer: &mut Writer<S>,
    ctx: &ConnectionContext,
) -> Result<Admitted, AppError>
where
    S: AsyncRead + AsyncWrite,
{
    write_line(writer, HANDSHAKE_PROMPT).await?;

    let line = match timeout(ctx.config.handshake_timeout, lines.next()).await {
        Err(_) => return Err(AppError::HandshakeTimeout),
        Ok(None) => return Err(AppError::Disconnected),
        Ok(Some(line)) => line?,
    };

    let handshake = match Handshake::parse(&line) {
        Ok(handshake) => handshake,
        Err(e @ AppError::InvalidUsername(_)) => {
            write_line(writer, "Invalid username. Names cannot contain spaces, ':', '[' or ']'\n").await?;
            return Err(e);
        }
        Err(e) => {
            write_line(writer, "Invalid reconnect format. Use: reconnect:<username>:<token>\n").await?;
            return Err(e);
        }
    };

    let mut username = handshake.username().to_string();
    if username.is_empty() {
        username = guest_name();
    }

    if let Handshake::Reconnect { token, .. } = &handshake {
        return match ctx.sessions.validate(&username, token) {
            Ok(()) => {
                info!(username = %username, "Reconnected successfully");
                write_line(writer, &format!("Welcome back, {}!\n", username)).await?;
                Ok(Admitted {
                    username,
                    reconnected: true,
                })
            }
            Err(source) => {
                write_line(writer, "Invalid reconnect token or session expired.\n").await?;
                Err(AppError::ReconnectRejected { username, source })
            }
        };
    }

    if ctx.room.is_username_active(&username).await {
        write_line(writer, "Username already connected. Use reconnect if you lost connection\n").await?;
        return Err(AppError::UsernameTaken(username));
    }

    let notice = match ctx.sessions.token_for(&username) {
        Some(token) => format!(
            "Tip: Save this reconnect token: {}\n   To reconnect later: reconnect:{}:{}\n",
            token, username, token
        ),
        None => {
            let token = ctx.sessions.create(&username);
            format!(
                "Your reconnect token: {}\n   Save this to reconnect: reconnect:{}:{}\n",
                token, username, token
            )
        }
    };
    write_line(writer, &notice).await?;

    Ok(Admitted {
        username,
        reconnected: false,
    })
}

async fn write_line<W>(writer: &mut W, text: &str) -> Result<(), AppError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(text.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Socket → room
struct ReadPump {
    room: RoomHandle,
    sessions: SessionStore,
    client_id: ClientId,
    username: String,
    stats: Arc<ClientStats>,
    /// Weak so that only the registry entry keeps the mailbox open
    replies: mpsc::WeakSender<String>,
    read_timeout: Duration,
}

impl ReadPump {
    async fn run<S>(self, mut lines: Lines<S>) -> ReadOutcome
    where
        S: AsyncRead + Send,
    {
        loop {
            let line = match timeout(self.read_timeout, lines.next()).await {
                Err(_) => {
                    info!(username = %self.username, "Read timed out");
                    return ReadOutcome::TimedOut;
                }
                Ok(None) => {
                    debug!(username = %self.username, "Peer closed connection");
                    return ReadOutcome::Disconnected;
                }
                Ok(Some(Err(e))) => {
                    warn!(username = %self.username, error = %e, "Read failed");
                    return ReadOutcome::Disconnected;
                }
                Ok(Some(Ok(line))) => line,
            };

            self.stats.mark_active();
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            self.stats.record_received();

            let sent = match Command::parse(line) {
                Some(command) => match self.handle_command(command).await {
                    Ok(Some(outcome)) => return outcome,
                    Ok(None) => Ok(()),
                    Err(e) => Err(e),
                },
                None => self.room.broadcast(format_chat(&self.username, line)).await,
            };
            if sent.is_err() {
                warn!(username = %self.username, "Room closed, ending read pump");
                return ReadOutcome::Disconnected;
            }
        }
    }

    /// Returns `Some` when the command ends the connection
    async fn handle_command(&self, command: Command) -> Result<Option<ReadOutcome>, RoomError> {
        debug!(username = %self.username, ?command, "Command");
        match command {
            Command::Users => self.room.list_users(self.client_id).await,
            Command::Stats => self.reply(self.stats_block()),
            Command::History(count) => self.room.history(self.client_id, count).await,
            Command::Msg { target, text } => {
                if target == self.username {
                    self.reply("Can't message yourself!\n".to_string());
                } else {
                    self.room.direct_message(self.client_id, target, text).await;
                }
            }
            Command::Token => {
                let reply = match self.sessions.token_for(&self.username) {
                    Some(token) => format!(
                        "Your reconnect token:\n   reconnect:{}:{}\n   Use this to reconnect if you disconnect.\n",
                        self.username, token
                    ),
                    None => "No session found\n".to_string(),
                };
                self.reply(reply);
            }
            Command::SimulateCrash => {
                warn!(username = %self.username, "Simulating crash");
                self.reply("Simulating crash...\n".to_string());
                sleep(CRASH_DELAY).await;
                return Ok(Some(ReadOutcome::Crash));
            }
            Command::Quit => {
                self.room
                    .broadcast(format_system(&format!("{} has quit", self.username)))
                    .await?;
                self.reply("Goodbye!\n".to_string());
                return Ok(Some(ReadOutcome::Quit));
            }
            Command::Usage(usage) => self.reply(format!("{}\n", usage)),
            Command::Unknown(name) => {
                self.reply(format!("Unknown command: {}. Type a message or one of /users /stats /history /msg /token /quit\n", name));
            }
        }
        Ok(None)
    }

    fn stats_block(&self) -> String {
        let mut stats = String::from("Your Stats:\n");
        stats.push_str(&format!("  Messages sent: {}\n", self.stats.sent()));
        stats.push_str(&format!("  Messages received: {}\n", self.stats.received()));
        stats.push_str(&format!(
            "  Last active: {} ago\n",
            format_duration(self.stats.idle_for())
        ));
        if self.stats.is_slow() {
            stats.push_str("  You are a SLOW CLIENT (test mode)\n");
        }
        stats
    }

    /// Private reply on this client's mailbox; dropped if full or closed
    fn reply(&self, text: String) {
        if let Some(tx) = self.replies.upgrade() {
            if tx.try_send(text).is_err() {
                debug!(username = %self.username, "Reply dropped");
            }
        }
    }
}

/// Mailbox → socket. Ends when the mailbox closes or a write fails.
async fn write_pump<S>(
    mut mailbox: mpsc::Receiver<String>,
    mut writer: Writer<S>,
    username: String,
    slow_delay: Option<Duration>,
) where
    S: AsyncWrite,
{
    while let Some(text) = mailbox.recv().await {
        if let Some(max) = slow_delay {
            let millis = rand::thread_rng().gen_range(0..max.as_millis().max(1) as u64);
            sleep(Duration::from_millis(millis)).await;
        }

        if let Err(e) = writer.write_all(text.as_bytes()).await {
            warn!(username = %username, error = %e, "Write error");
            return;
        }
        if let Err(e) = writer.flush().await {
            warn!(username = %username, error = %e, "Flush error");
            return;
        }
    }

    debug!(username = %username, "Mailbox closed, ending write pump");
    let _ = writer.shutdown().await;
}
