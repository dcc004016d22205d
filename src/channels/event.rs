//! Canonical inbound event: the platform-agnostic form of a message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What produced an inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// The bot was addressed in a shared conversation.
    Mention,
    /// A one-to-one conversation with the bot.
    DirectMessage,
    /// Fired by a scheduled trigger rather than a person.
    Scheduled,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Mention => "mention",
            Self::DirectMessage => "direct_message",
            Self::Scheduled => "scheduled",
        };
        write!(f, "{s}")
    }
}

/// A file or media item attached to an inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Immutable, normalized inbound event. Produced once per occurrence by a
/// binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    pub kind: EventKind,
    pub channel_id: String,
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl CanonicalEvent {
    pub fn new(
        kind: EventKind,
        channel_id: impl Into<String>,
        user_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            channel_id: channel_id.into(),
            timestamp: Utc::now(),
            user_id: user_id.into(),
            text: text.into(),
            attachments: Vec::new(),
        }
    }

    /// Event fired by a scheduled trigger.
    pub fn scheduled(channel_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(EventKind::Scheduled, channel_id, "scheduler", text)
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Whether the text asks to stop the conversation's current run.
    pub fn is_stop_command(&self) -> bool {
        let text = self.text.trim();
        text.eq_ignore_ascii_case("stop") || text.eq_ignore_ascii_case("/stop")
    }
}
