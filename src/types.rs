//! Basic type definitions for the chat server
//!
//! Provides newtype wrappers for type safety:
//! - `ClientId`: UUID-based unique connection identifier
//! - `ReconnectToken`: 32-character hex credential for resuming a session

use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use uuid::Uuid;

/// Number of random bytes in a reconnect token
const TOKEN_BYTES: usize = 16;

/// Unique connection identifier (newtype pattern)
///
/// Wraps a UUID v4. Two connections from the same username always get
/// different ids, which is what lets a stale leave be told apart from a
/// fresh join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub Uuid);

impl ClientId {
    /// Create a new random client ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reconnect token (lowercase hex of 16 bytes from the OS RNG)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReconnectToken(pub String);

impl ReconnectToken {
    /// Generate a new cryptographically random token
    pub fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        let hex = bytes.iter().map(|b| format!("{:02x}", b)).collect();
        Self(hex)
    }

    /// Wrap a token supplied by a client
    pub fn from_string(token: String) -> Self {
        Self(token)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, safe to put in logs
    pub fn prefix(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl std::fmt::Display for ReconnectToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Generate a placeholder name for clients that sent an empty username
pub fn guest_name() -> String {
    format!("Guest{}", rand::thread_rng().gen_range(0..1000))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id_unique() {
        let id1 = ClientId::new();
        let id2 = ClientId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_token_length_and_charset() {
        let token = ReconnectToken::generate();
        assert_eq!(token.as_str().len(), 32);
        assert!(token.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(token.prefix().len(), 8);
    }

    #[test]
    fn test_tokens_differ() {
        assert_ne!(ReconnectToken::generate(), ReconnectToken::generate());
    }

    #[test]
    fn test_short_token_prefix() {
        let token = ReconnectToken::from_string("abc".to_string());
        assert_eq!(token.prefix(), "abc");
    }

    #[test]
    fn test_guest_name_shape() {
        let name = guest_name();
        let number: u32 = name
            .strip_prefix("Guest")
            .and_then(|n| n.parse().ok())
            .unwrap();
        assert!(number < 1000);
    }
}
