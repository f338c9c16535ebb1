//! End-to-end tests over real TCP connections.
//!
//! Each test starts a room with its own temporary data directory and an
//! accept loop on an ephemeral port, then drives it with plain line-based
//! clients.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use broadcast_chat::{
    handle_connection, ChatMessage, ChatRoom, Config, ConnectionContext, PersistenceLog,
    RoomHandle, RoomSettings, SessionStore,
};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;

// ============================================================================
// Test Helpers
// ============================================================================

const LINE_TIMEOUT: Duration = Duration::from_secs(3);

struct TestServer {
    addr: SocketAddr,
    room: RoomHandle,
    room_task: JoinHandle<()>,
    accept_task: JoinHandle<()>,
    dir: TempDir,
}

impl TestServer {
    async fn start() -> Self {
        Self::start_in(TempDir::new().unwrap(), Config::default()).await
    }

    async fn start_in(dir: TempDir, config: Config) -> Self {
        let config = Config {
            data_dir: dir.path().to_path_buf(),
            ..config
        };
        let (log, recovered) = PersistenceLog::open(&config.data_dir).unwrap();
        let sessions = SessionStore::new(config.session_expiry);
        let (room, room_task) = ChatRoom::spawn(
            log,
            recovered,
            sessions.clone(),
            RoomSettings::from(&config),
            config.command_buffer,
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let ctx = ConnectionContext {
            room: room.clone(),
            sessions,
            config: Arc::new(config),
        };
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(handle_connection(stream, ctx.clone()));
            }
        });

        Self {
            addr,
            room,
            room_task,
            accept_task,
            dir,
        }
    }

    /// Final snapshot, then hand back the data directory
    async fn stop(self) -> TempDir {
        self.accept_task.abort();
        self.room.shutdown().await.unwrap();
        self.room_task.await.unwrap();
        self.dir
    }
}

struct TestClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, writer) = stream.into_split();
        Self {
            lines: BufReader::new(read).lines(),
            writer,
        }
    }

    /// Connect and complete a plain username handshake
    async fn join(addr: SocketAddr, username: &str) -> Self {
        let mut client = Self::connect(addr).await;
        client.send(username).await;
        client
            .expect(&format!("*** {} joined the chat ***", username))
            .await;
        client
    }

    async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{}\n", line).as_bytes())
            .await
            .unwrap();
    }

    async fn next_line(&mut self) -> Option<String> {
        timeout(LINE_TIMEOUT, self.lines.next_line())
            .await
            .expect("timed out waiting for a line")
            .ok()
            .flatten()
    }

    /// Read until a line containing `needle`, returning the lines before it
    async fn expect(&mut self, needle: &str) -> Vec<String> {
        let mut seen = Vec::new();
        loop {
            match self.next_line().await {
                Some(line) if line.contains(needle) => return seen,
                Some(line) => seen.push(line),
                None => panic!("connection closed waiting for {:?}; saw {:?}", needle, seen),
            }
        }
    }

    async fn expect_closed(&mut self) {
        while self.next_line().await.is_some() {}
    }
}

fn read_snapshot(dir: &TempDir) -> Vec<ChatMessage> {
    let raw = std::fs::read_to_string(dir.path().join("snapshot.json")).unwrap();
    serde_json::from_str(&raw).unwrap()
}

// ============================================================================
// Broadcast
// ============================================================================

#[tokio::test]
async fn test_two_clients_receive_chat_exactly_once() {
    let server = TestServer::start().await;
    let mut a = TestClient::join(server.addr, "A").await;
    let mut b = TestClient::join(server.addr, "B").await;
    a.expect("*** B joined the chat ***").await;

    a.send("hi").await;
    a.send("done").await;

    for client in [&mut a, &mut b] {
        let mut before_done = client.expect("[A]: done").await;
        before_done.retain(|l| l == "[A]: hi");
        assert_eq!(before_done, vec!["[A]: hi".to_string()]);
    }
}

#[tokio::test]
async fn test_remaining_clients_unaffected_by_disconnect() {
    let server = TestServer::start().await;
    let mut a = TestClient::join(server.addr, "A").await;
    let mut b = TestClient::join(server.addr, "B").await;
    let c = TestClient::join(server.addr, "C").await;

    // C vanishes without reading anything
    drop(c);
    a.expect("*** C left the chat ***").await;
    b.expect("*** C left the chat ***").await;

    for i in 0..5 {
        a.send(&format!("msg {}", i)).await;
    }
    let started = tokio::time::Instant::now();
    b.expect("[A]: msg 4").await;
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(!server.room.is_username_active("C").await);
}

// ============================================================================
// Handshake
// ============================================================================

#[tokio::test]
async fn test_duplicate_username_rejected() {
    let server = TestServer::start().await;
    let _alice = TestClient::join(server.addr, "alice").await;

    let mut imposter = TestClient::connect(server.addr).await;
    imposter.send("alice").await;
    imposter.expect("Username already connected").await;
    imposter.expect_closed().await;

    assert!(server.room.is_username_active("alice").await);
}

#[tokio::test]
async fn test_malformed_reconnect_closes_connection() {
    let server = TestServer::start().await;
    let mut client = TestClient::connect(server.addr).await;

    client.send("reconnect:alice").await;
    client.expect("Invalid reconnect format").await;
    client.expect_closed().await;
}

#[tokio::test]
async fn test_reconnect_with_token() {
    let server = TestServer::start().await;

    let mut first = TestClient::connect(server.addr).await;
    first.send("alice").await;
    first.expect("Your reconnect token:").await;
    let token_line = first.next_line().await.unwrap();
    let reconnect = token_line
        .split_whitespace()
        .find(|w| w.starts_with("reconnect:"))
        .unwrap()
        .to_string();
    first.expect("*** alice joined the chat ***").await;
    drop(first);

    // Wait for the room to notice
    let mut watcher = TestClient::join(server.addr, "watcher").await;
    while server.room.is_username_active("alice").await {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let mut again = TestClient::connect(server.addr).await;
    again.send(&reconnect).await;
    again.expect("Welcome back, alice!").await;
    again.expect("*** alice joined the chat ***").await;
    watcher.expect("*** alice joined the chat ***").await;

    // Plain join after a previous session reshows the same token
    again.send("/quit").await;
    again.expect_closed().await;
    while server.room.is_username_active("alice").await {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let mut returning = TestClient::connect(server.addr).await;
    returning.send("alice").await;
    let tip = returning.expect("To reconnect later").await;
    assert!(tip.iter().any(|l| l.starts_with("Tip: Save this reconnect token:")));
}

#[tokio::test]
async fn test_reconnect_with_wrong_token_rejected() {
    let server = TestServer::start().await;
    let _alice = TestClient::join(server.addr, "alice").await;

    let mut attacker = TestClient::connect(server.addr).await;
    attacker.send("reconnect:alice:0000").await;
    attacker.expect("Invalid reconnect token or session expired.").await;
    attacker.expect_closed().await;
}

#[tokio::test]
async fn test_reconnect_replaces_stale_connection() {
    let server = TestServer::start().await;

    let mut stale = TestClient::connect(server.addr).await;
    stale.send("alice").await;
    stale.expect("Your reconnect token:").await;
    let token_line = stale.next_line().await.unwrap();
    let reconnect = token_line
        .split_whitespace()
        .find(|w| w.starts_with("reconnect:"))
        .unwrap()
        .to_string();
    stale.expect("*** alice joined the chat ***").await;

    let mut fresh = TestClient::connect(server.addr).await;
    fresh.send(&reconnect).await;
    fresh.expect("Welcome back, alice!").await;

    // Old connection is wound down through its closed mailbox
    stale.expect_closed().await;
    fresh.send("still here").await;
    fresh.expect("[alice]: still here").await;
}

// ============================================================================
// Commands
// ============================================================================

#[tokio::test]
async fn test_private_message() {
    let server = TestServer::start().await;
    let mut alice = TestClient::join(server.addr, "alice").await;
    let mut bob = TestClient::join(server.addr, "bob").await;

    alice.send("/msg bob see you at noon").await;
    alice.expect("Message sent to bob").await;
    bob.expect("[From alice]: see you at noon").await;

    alice.send("/msg nobody hello").await;
    alice.expect("User 'nobody' not found").await;
}

#[tokio::test]
async fn test_users_list() {
    let server = TestServer::start().await;
    let mut alice = TestClient::join(server.addr, "alice").await;
    let _bob = TestClient::join(server.addr, "bob").await;
    alice.expect("*** bob joined the chat ***").await;

    alice.send("/users").await;
    alice.expect("Users online:").await;
    assert_eq!(alice.next_line().await.unwrap(), "  - alice");
    assert_eq!(alice.next_line().await.unwrap(), "  - bob");
    alice.expect("Total messages: 2").await;
    alice.expect("Uptime:").await;
}

#[tokio::test]
async fn test_unknown_command_keeps_connection() {
    let server = TestServer::start().await;
    let mut alice = TestClient::join(server.addr, "alice").await;

    alice.send("/dance").await;
    alice.expect("Unknown command: /dance").await;
    alice.send("still connected").await;
    alice.expect("[alice]: still connected").await;
}

// ============================================================================
// Persistence
// ============================================================================

#[tokio::test]
async fn test_history_survives_restart() {
    let server = TestServer::start().await;
    let mut alice = TestClient::join(server.addr, "alice").await;
    alice.send("remember me").await;
    alice.expect("[alice]: remember me").await;
    drop(alice);
    let dir = server.stop().await;

    let before = read_snapshot(&dir);
    assert!(before.iter().any(|m| m.from == "alice" && m.content == "remember me"));

    let server = TestServer::start_in(dir, Config::default()).await;
    let mut bob = TestClient::connect(server.addr).await;
    bob.send("bob").await;
    let history = bob.expect("*** bob joined the chat ***").await;
    assert!(history.contains(&" [alice]: remember me".to_string()));

    let dir = server.stop().await;
    let after = read_snapshot(&dir);
    assert_eq!(after[..before.len()], before[..]);
    let ids: Vec<u64> = after.iter().map(|m| m.id).collect();
    assert_eq!(ids, (0..after.len() as u64).collect::<Vec<u64>>());
}

#[tokio::test]
async fn test_snapshot_compacts_wal() {
    let server = TestServer::start_in(
        TempDir::new().unwrap(),
        Config {
            snapshot_threshold: 100,
            ..Config::default()
        },
    )
    .await;

    for i in 0..150 {
        server.room.broadcast(format!("[load]: {}", i)).await.unwrap();
    }
    assert!(server.room.snapshot(false).await.unwrap());

    let wal = server.dir.path().join("messages.wal");
    assert_eq!(std::fs::metadata(&wal).unwrap().len(), 0);
    assert_eq!(read_snapshot(&server.dir).len(), 150);
}
