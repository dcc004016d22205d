//! Binding abstraction: the per-platform message primitives.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ChannelError;

/// Opaque handle of a message a binding created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageHandle(String);

impl MessageHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Formatting instructions handed to the agent engine when a binding does not
/// provide its own.
pub const DEFAULT_FORMATTING: &str =
    "Reply in plain text. Keep messages short; long output is split by the platform.";

/// A thin platform transport.
///
/// Implementations execute message primitives and nothing else: ordering,
/// throttling and retries are the caller's concern. One `post` creates exactly
/// one platform message, so text handed to `post` or `edit` must fit in
/// [`Binding::max_message_len`]; callers split longer text with
/// [`split_message`].
#[async_trait]
pub trait Binding: Send + Sync {
    /// Short platform name used in logs ("telegram", "memory", ...).
    fn name(&self) -> &str;

    /// Largest message body the platform accepts, in characters.
    fn max_message_len(&self) -> usize {
        4000
    }

    /// Formatting guidance for the agent engine.
    fn formatting_instructions(&self) -> &str {
        DEFAULT_FORMATTING
    }

    /// Post a new message. Oversized text is rejected, not split.
    async fn post(&self, channel_id: &str, text: &str) -> Result<MessageHandle, ChannelError>;

    /// Replace the text of a message previously posted by this binding.
    async fn edit(
        &self,
        channel_id: &str,
        handle: &MessageHandle,
        text: &str,
    ) -> Result<(), ChannelError>;

    /// Remove a message previously posted by this binding.
    async fn delete(&self, channel_id: &str, handle: &MessageHandle) -> Result<(), ChannelError>;

    /// Upload a local file.
    async fn upload(
        &self,
        channel_id: &str,
        path: &Path,
        title: &str,
    ) -> Result<MessageHandle, ChannelError>;

    /// Show a lightweight "typing" indicator. Silent where unsupported.
    async fn typing(&self, _channel_id: &str) -> Result<(), ChannelError> {
        Ok(())
    }

    /// Secondary surface for verbose detail (thread reply, collapsible block,
    /// inline log). Suppressed where unsupported.
    async fn detail(
        &self,
        _channel_id: &str,
        _parent: Option<&MessageHandle>,
        _text: &str,
    ) -> Result<(), ChannelError> {
        Ok(())
    }
}

/// Split text into chunks of at most `max_chars` characters.
///
/// Prefers a newline, then a space, as the cut point; falls back to a hard
/// cut. Whitespace at a cut is dropped.
pub fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut remaining = text;

    loop {
        let Some((boundary, _)) = remaining.char_indices().nth(max_chars) else {
            if !remaining.is_empty() || chunks.is_empty() {
                chunks.push(remaining.to_string());
            }
            break;
        };

        let window = &remaining[..boundary];
        let split_at = if remaining[boundary..].starts_with(char::is_whitespace) {
            boundary
        } else {
            window
                .rfind('\n')
                .or_else(|| window.rfind(' '))
                .filter(|&i| i > 0)
                .unwrap_or(boundary)
        };

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}
