//! Client input grammar
//!
//! Two shapes of input arrive from a client: the single handshake line, and
//! after that ordinary lines, some of which are slash commands.

use crate::error::AppError;
use crate::types::ReconnectToken;

/// Default number of entries for `/history`
pub const DEFAULT_HISTORY_COUNT: usize = 20;

/// Upper bound for `/history N`
pub const MAX_HISTORY_COUNT: usize = 100;

const RECONNECT_PREFIX: &str = "reconnect:";

/// Usernames end up in `reconnect:` lines, `/msg` targets and `[name]: `
/// prefixes, so none of those separators may appear in one.
pub fn is_valid_username(name: &str) -> bool {
    !name.is_empty()
        && !name
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || matches!(c, ':' | '[' | ']'))
}

/// First line sent by a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handshake {
    /// Plain username; may be empty (a guest name is assigned later)
    Join { username: String },
    /// `reconnect:<username>:<token>`
    Reconnect {
        username: String,
        token: ReconnectToken,
    },
}

impl Handshake {
    /// Parse a handshake line. Surrounding whitespace is ignored.
    ///
    /// A line starting with `reconnect:` must have exactly three
    /// colon-separated fields.
    pub fn parse(line: &str) -> Result<Self, AppError> {
        let line = line.trim();
        if !line.starts_with(RECONNECT_PREFIX) {
            if !line.is_empty() && !is_valid_username(line) {
                return Err(AppError::InvalidUsername(line.to_string()));
            }
            return Ok(Handshake::Join {
                username: line.to_string(),
            });
        }

        let parts: Vec<&str> = line.split(':').collect();
        match parts.as_slice() {
            [_, username, _] if !is_valid_username(username) => {
                Err(AppError::InvalidUsername(username.to_string()))
            }
            [_, username, token] => Ok(Handshake::Reconnect {
                username: username.to_string(),
                token: ReconnectToken::from_string(token.to_string()),
            }),
            _ => Err(AppError::InvalidReconnect),
        }
    }

    pub fn username(&self) -> &str {
        match self {
            Handshake::Join { username } | Handshake::Reconnect { username, .. } => username,
        }
    }
}

/// A slash command typed by a connected client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Users,
    Stats,
    /// Count already defaulted and capped
    History(usize),
    Msg { target: String, text: String },
    Token,
    SimulateCrash,
    Quit,
    /// Known command with missing or wrong arguments
    Usage(&'static str),
    Unknown(String),
}

impl Command {
    /// Parse a line as a command. Returns `None` when the line is not a
    /// command (does not start with `/`).
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if !line.starts_with('/') {
            return None;
        }

        let (name, rest) = match line.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim()),
            None => (line, ""),
        };

        let command = match name {
            "/users" => Command::Users,
            "/stats" => Command::Stats,
            "/history" => Command::History(parse_history_count(rest)),
            "/msg" => match rest.split_once(char::is_whitespace) {
                Some((target, text)) if !text.trim().is_empty() => Command::Msg {
                    target: target.to_string(),
                    text: text.trim().to_string(),
                },
                _ => Command::Usage("Usage: /msg <username> <message>"),
            },
            "/token" => Command::Token,
            "/simulate" => match rest.split_whitespace().next() {
                Some("crash") => Command::SimulateCrash,
                _ => Command::Usage("Usage: /simulate crash"),
            },
            "/quit" => Command::Quit,
            other => Command::Unknown(other.to_string()),
        };
        Some(command)
    }
}

fn parse_history_count(args: &str) -> usize {
    args.split_whitespace()
        .next()
        .and_then(|n| n.parse::<usize>().ok())
        .unwrap_or(DEFAULT_HISTORY_COUNT)
        .min(MAX_HISTORY_COUNT)
}
