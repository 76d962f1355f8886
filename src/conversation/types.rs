//! Conversation data types: messages and per-user logs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who authored a message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One stored turn in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Ordered message log for one user.
///
/// Messages are kept in non-decreasing timestamp order; `push` clamps a
/// timestamp that would go backwards to the previous message's timestamp.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct ConversationLog {
    messages: Vec<Message>,
}

impl ConversationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a log from stored messages, restoring timestamp order.
    ///
    /// The sort is stable, so messages sharing a timestamp keep their
    /// stored order.
    pub fn from_messages(mut messages: Vec<Message>) -> Self {
        messages.sort_by_key(|message| message.timestamp);
        Self { messages }
    }

    pub fn push(&mut self, mut message: Message) {
        if let Some(last) = self.messages.last() {
            if message.timestamp < last.timestamp {
                message.timestamp = last.timestamp;
            }
        }
        self.messages.push(message);
    }

    /// Drop the oldest messages until at most `cap` remain.
    pub fn truncate_to(&mut self, cap: usize) {
        if self.messages.len() > cap {
            let excess = self.messages.len() - cap;
            self.messages.drain(..excess);
        }
    }

    /// The `limit` most recent messages, oldest first.
    pub fn recent(&self, limit: usize) -> &[Message] {
        let start = self.messages.len().saturating_sub(limit);
        &self.messages[start..]
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn push_clamps_backwards_timestamps() {
        let mut log = ConversationLog::new();
        let first = Message::user("first");
        let first_at = first.timestamp;
        log.push(first);

        let mut late = Message::assistant("second");
        late.timestamp = first_at - Duration::seconds(30);
        log.push(late);

        assert_eq!(log.messages()[1].timestamp, first_at);
    }

    #[test]
    fn truncate_drops_from_the_head() {
        let mut log = ConversationLog::new();
        for index in 0..5 {
            log.push(Message::user(format!("m{index}")));
        }
        log.truncate_to(3);

        let contents: Vec<_> = log.messages().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn recent_returns_tail_in_order() {
        let mut log = ConversationLog::new();
        for index in 0..4 {
            log.push(Message::user(format!("m{index}")));
        }

        let recent: Vec<_> = log.recent(2).iter().map(|m| m.content.as_str()).collect();
        assert_eq!(recent, vec!["m2", "m3"]);
        assert_eq!(log.recent(10).len(), 4);
        assert!(log.recent(0).is_empty());
    }

    #[test]
    fn serializes_as_plain_array() {
        let mut log = ConversationLog::new();
        log.push(Message::user("hello"));

        let json = serde_json::to_value(&log).unwrap();
        assert!(json.is_array());
        assert_eq!(json[0]["role"], "user");
        assert_eq!(json[0]["content"], "hello");
    }
}
