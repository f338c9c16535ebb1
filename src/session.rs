//! Reconnect-token sessions
//!
//! One session per username ever seen. The table is shared between
//! connection handlers (handshake, `/token`) and the room actor (last-seen
//! on leave), so it sits behind a mutex that is never held across an await.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::SessionError;
use crate::types::ReconnectToken;

#[derive(Debug, Clone)]
pub struct Session {
    pub username: String,
    pub token: ReconnectToken,
    pub created_at: Instant,
    pub last_seen: Instant,
}

/// Cheap-to-clone handle to the shared session table
#[derive(Debug, Clone)]
pub struct SessionStore {
    sessions: Arc<Mutex<HashMap<String, Session>>>,
    expiry: Duration,
}

impl SessionStore {
    /// Create an empty store. Sessions unseen for longer than `expiry`
    /// fail validation.
    pub fn new(expiry: Duration) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            expiry,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create (or replace) the session for `username` with a fresh token.
    ///
    /// The returned token is shown to the client once.
    pub fn create(&self, username: &str) -> ReconnectToken {
        let token = ReconnectToken::generate();
        let now = Instant::now();
        self.lock().insert(
            username.to_string(),
            Session {
                username: username.to_string(),
                token: token.clone(),
                created_at: now,
                last_seen: now,
            },
        );
        info!(username, token = token.prefix(), "Created session");
        token
    }

    /// Check a reconnect attempt.
    ///
    /// An expired session is removed whatever token was supplied. On
    /// success last-seen is refreshed.
    pub fn validate(&self, username: &str, token: &ReconnectToken) -> Result<(), SessionError> {
        let mut sessions = self.lock();
        let session = sessions.get_mut(username).ok_or(SessionError::NotFound)?;

        if session.last_seen.elapsed() > self.expiry {
            sessions.remove(username);
            debug!(username, "Session expired and removed");
            return Err(SessionError::Expired);
        }

        if session.token != *token {
            return Err(SessionError::TokenMismatch);
        }

        session.last_seen = Instant::now();
        Ok(())
    }

    /// Update last-seen, e.g. on disconnect
    pub fn touch(&self, username: &str) {
        if let Some(session) = self.lock().get_mut(username) {
            session.last_seen = Instant::now();
        }
    }

    /// Current token for `username`, if a session exists
    pub fn token_for(&self, username: &str) -> Option<ReconnectToken> {
        self.lock().get(username).map(|s| s.token.clone())
    }

    pub fn get(&self, username: &str) -> Option<Session> {
        self.lock().get(username).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
