//! Message record and wire text formatting
//!
//! `ChatMessage` is the unit of history: it is what the WAL and the snapshot
//! store (one JSON object per WAL line, a pretty-printed array in the
//! snapshot). The wire protocol itself is free-form text lines, so the rest of
//! this module is the handful of line shapes the server writes.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sender name for messages not attributed to a user
pub const SYSTEM_SENDER: &str = "system";

/// A broadcast accepted by the room. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: u64,
    pub from: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub channel: Channel,
}

impl ChatMessage {
    /// Create a global-channel message stamped with the current time
    pub fn new(id: u64, from: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id,
            from: from.into(),
            content: content.into(),
            timestamp: Utc::now(),
            channel: Channel::Global,
        }
    }
}

/// Channel tag, stored as `"global"` or `"private:<username>"`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Channel {
    Global,
    Private(String),
}

const PRIVATE_PREFIX: &str = "private:";

impl From<Channel> for String {
    fn from(channel: Channel) -> Self {
        match channel {
            Channel::Global => "global".to_string(),
            Channel::Private(user) => format!("{}{}", PRIVATE_PREFIX, user),
        }
    }
}

impl TryFrom<String> for Channel {
    type Error = String;

    fn try_from(tag: String) -> Result<Self, Self::Error> {
        if tag == "global" {
            return Ok(Channel::Global);
        }
        match tag.strip_prefix(PRIVATE_PREFIX) {
            Some(user) if !user.is_empty() => Ok(Channel::Private(user.to_string())),
            _ => Err(format!("unknown channel tag '{}'", tag)),
        }
    }
}

/// Split broadcast text into `(sender, content)`.
///
/// Text of the form `[alice]: hello` is attributed to `alice`; anything
/// else belongs to `system`. The trailing newline is not part of the content.
pub fn parse_broadcast(text: &str) -> (&str, &str) {
    let text = text.trim_end_matches(['\r', '\n']);
    if let Some(rest) = text.strip_prefix('[') {
        if let Some((sender, content)) = rest.split_once("]: ") {
            if !sender.is_empty() {
                return (sender, content);
            }
        }
    }
    (SYSTEM_SENDER, text)
}

/// `[<username>]: <text>\n`
pub fn format_chat(username: &str, text: &str) -> String {
    format!("[{}]: {}\n", username, text)
}

/// `*** <text> ***\n`
pub fn format_system(text: &str) -> String {
    format!("*** {} ***\n", text)
}

/// `[From <username>]: <text>\n`
pub fn format_private(from: &str, text: &str) -> String {
    format!("[From {}]: {}\n", from, text)
}

/// Render a history block for a client
pub fn format_history(messages: &[ChatMessage]) -> String {
    let mut block = String::from("Recent messages:\n");
    for msg in messages {
        block.push_str(&format!(" [{}]: {}\n", msg.from, msg.content));
    }
    block
}

/// Ensure a wire line ends with exactly one newline
pub fn as_line(text: &str) -> String {
    let mut line = text.trim_end_matches(['\r', '\n']).to_string();
    line.push('\n');
    line
}

/// Human readable duration rounded to whole seconds, e.g. `1h 2m 3s`
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs() + u64::from(duration.subsec_millis() >= 500);
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{}h {}m {}s", h, m, s)
    } else if m > 0 {
        format!("{}m {}s", m, s)
    } else {
        format!("{}s", s)
    }
}
