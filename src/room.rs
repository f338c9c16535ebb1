//! Room state owned by the actor
//!
//! The single global room: registry of active clients, ordered message
//! history and counters. Only the `ChatRoom` actor holds a `RoomState`, so
//! nothing here needs a lock.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::client::Client;
use crate::message::ChatMessage;
use crate::types::ClientId;

#[derive(Debug)]
pub struct RoomState {
    /// Active clients: ClientId -> Client
    clients: HashMap<ClientId, Client>,
    /// History in id order
    history: Vec<ChatMessage>,
    next_message_id: u64,
    /// Broadcasts accepted since start
    total_messages: u64,
    started_at: Instant,
}

impl RoomState {
    /// Create room state seeded with recovered history
    pub fn new(history: Vec<ChatMessage>, next_message_id: u64) -> Self {
        Self {
            clients: HashMap::new(),
            history,
            next_message_id,
            total_messages: 0,
            started_at: Instant::now(),
        }
    }

    /// Add a client. The caller has already checked username uniqueness.
    pub fn register(&mut self, client: Client) {
        self.clients.insert(client.id, client);
    }

    /// Remove a client, returning it if it was registered
    pub fn remove(&mut self, client_id: ClientId) -> Option<Client> {
        self.clients.remove(&client_id)
    }

    pub fn get(&self, client_id: ClientId) -> Option<&Client> {
        self.clients.get(&client_id)
    }

    pub fn find_by_username(&self, username: &str) -> Option<&Client> {
        self.clients.values().find(|c| c.username == username)
    }

    pub fn is_username_active(&self, username: &str) -> bool {
        self.find_by_username(username).is_some()
    }

    pub fn clients(&self) -> impl Iterator<Item = &Client> {
        self.clients.values()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Clients sorted by username, for stable listings
    pub fn clients_by_name(&self) -> Vec<&Client> {
        let mut clients: Vec<&Client> = self.clients.values().collect();
        clients.sort_by(|a, b| a.username.cmp(&b.username));
        clients
    }

    /// Ids of clients idle for longer than `threshold`
    pub fn idle_clients(&self, threshold: Duration) -> Vec<ClientId> {
        self.clients
            .values()
            .filter(|c| c.stats.is_idle(threshold))
            .map(|c| c.id)
            .collect()
    }

    /// Create the next message, append it to history and return a copy
    pub fn record(&mut self, from: &str, content: &str) -> ChatMessage {
        let msg = ChatMessage::new(self.next_message_id, from, content);
        self.next_message_id += 1;
        self.total_messages += 1;
        self.history.push(msg.clone());
        msg
    }

    /// The last `count` messages (fewer if history is shorter)
    pub fn recent(&self, count: usize) -> &[ChatMessage] {
        let start = self.history.len().saturating_sub(count);
        &self.history[start..]
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    pub fn next_message_id(&self) -> u64 {
        self.next_message_id
    }

    pub fn total_messages(&self) -> u64 {
        self.total_messages
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use super::*;
    use crate::client::ClientStats;

    fn client(name: &str) -> Client {
        let (tx, _rx) = mpsc::channel(1);
        Client::new(ClientId::new(), name, tx, Arc::new(ClientStats::new(false)))
    }

    #[test]
    fn test_register_and_remove() {
        let mut state = RoomState::new(Vec::new(), 0);
        let alice = client("alice");
        let alice_id = alice.id;

        state.register(alice);
        assert_eq!(state.client_count(), 1);
        assert!(state.is_username_active("alice"));
        assert_eq!(state.get(alice_id).map(|c| c.username.as_str()), Some("alice"));

        assert!(state.remove(alice_id).is_some());
        assert!(state.remove(alice_id).is_none());
        assert!(!state.is_username_active("alice"));
    }

    #[test]
    fn test_record_assigns_sequential_ids() {
        let mut state = RoomState::new(vec![ChatMessage::new(4, "system", "old")], 5);

        let a = state.record("alice", "one");
        let b = state.record("system", "two");

        assert_eq!((a.id, b.id), (5, 6));
        assert_eq!(state.next_message_id(), 7);
        assert_eq!(state.total_messages(), 2);
        assert_eq!(state.history().len(), 3);
    }

    #[test]
    fn test_recent_window() {
        let mut state = RoomState::new(Vec::new(), 0);
        for i in 0..5 {
            state.record("a", &i.to_string());
        }

        let ids: Vec<u64> = state.recent(2).iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![3, 4]);
        assert_eq!(state.recent(50).len(), 5);
        assert!(state.recent(0).is_empty());
    }

    #[test]
    fn test_clients_by_name_sorted() {
        let mut state = RoomState::new(Vec::new(), 0);
        state.register(client("carol"));
        state.register(client("alice"));
        state.register(client("bob"));

        let names: Vec<&str> = state
            .clients_by_name()
            .iter()
            .map(|c| c.username.as_str())
            .collect();
        assert_eq!(names, vec!["alice", "bob", "carol"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_clients() {
        let mut state = RoomState::new(Vec::new(), 0);
        let idle = client("idle");
        let idle_id = idle.id;
        let busy = client("busy");
        let busy_stats = Arc::clone(&busy.stats);
        state.register(idle);
        state.register(busy);

        tokio::time::advance(Duration::from_secs(301)).await;
        busy_stats.mark_active();

        assert_eq!(state.idle_clients(Duration::from_secs(300)), vec![idle_id]);
    }
}
