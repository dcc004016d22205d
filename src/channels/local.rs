//! Local binding: a console surface for development.
//!
//! Inbound messages arrive as JSON on the local webhook; replies are written
//! to the log. Nothing is retained between operations.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use axum::http::HeaderMap;
use serde::Deserialize;
use tracing::info;

use crate::channels::Inbound;
use crate::channels::binding::{Binding, MessageHandle};
use crate::channels::event::{CanonicalEvent, EventKind};
use crate::error::ChannelError;

/// Prefix that routes outbound sends to the local binding.
pub const LOCAL_PREFIX: &str = "local:";

const LOCAL_MAX_MESSAGE_LENGTH: usize = 4000;

/// Binding that logs every operation and keeps no history.
pub struct LocalBinding {
    next_id: AtomicU64,
}

impl LocalBinding {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
        }
    }

    fn next_handle(&self) -> MessageHandle {
        MessageHandle::new(format!("local-{}", self.next_id.fetch_add(1, Ordering::Relaxed)))
    }
}

impl Default for LocalBinding {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Binding for LocalBinding {
    fn name(&self) -> &str {
        "local"
    }

    fn max_message_len(&self) -> usize {
        LOCAL_MAX_MESSAGE_LENGTH
    }

    async fn post(&self, channel_id: &str, text: &str) -> Result<MessageHandle, ChannelError> {
        if text.chars().count() > LOCAL_MAX_MESSAGE_LENGTH {
            return Err(ChannelError::SendFailed {
                name: "local".into(),
                reason: format!("text exceeds {LOCAL_MAX_MESSAGE_LENGTH} characters"),
            });
        }
        let handle = self.next_handle();
        info!(channel_id, handle = %handle, text, "Local post");
        Ok(handle)
    }

    async fn edit(
        &self,
        channel_id: &str,
        handle: &MessageHandle,
        text: &str,
    ) -> Result<(), ChannelError> {
        if text.chars().count() > LOCAL_MAX_MESSAGE_LENGTH {
            return Err(ChannelError::EditFailed {
                name: "local".into(),
                handle: handle.to_string(),
                reason: format!("text exceeds {LOCAL_MAX_MESSAGE_LENGTH} characters"),
            });
        }
        info!(channel_id, handle = %handle, text, "Local edit");
        Ok(())
    }

    async fn delete(&self, channel_id: &str, handle: &MessageHandle) -> Result<(), ChannelError> {
        info!(channel_id, handle = %handle, "Local delete");
        Ok(())
    }

    async fn upload(
        &self,
        channel_id: &str,
        path: &Path,
        title: &str,
    ) -> Result<MessageHandle, ChannelError> {
        if !tokio::fs::try_exists(path).await? {
            return Err(ChannelError::UploadFailed {
                name: "local".into(),
                reason: format!("no such file: {}", path.display()),
            });
        }
        let handle = self.next_handle();
        info!(channel_id, handle = %handle, path = %path.display(), title, "Local upload");
        Ok(handle)
    }

    async fn detail(
        &self,
        channel_id: &str,
        parent: Option<&MessageHandle>,
        text: &str,
    ) -> Result<(), ChannelError> {
        info!(
            channel_id,
            parent = parent.map(MessageHandle::as_str).unwrap_or("-"),
            text,
            "Local detail"
        );
        Ok(())
    }
}

/// Body accepted by the local webhook.
#[derive(Debug, Deserialize)]
struct LocalMessage {
    channel_id: String,
    #[serde(default = "default_local_user")]
    user_id: String,
    text: String,
    #[serde(default = "default_local_kind")]
    kind: EventKind,
}

fn default_local_user() -> String {
    "local".to_string()
}

fn default_local_kind() -> EventKind {
    EventKind::DirectMessage
}

/// Parse a local webhook body. Blank text is valid but carries nothing.
pub(crate) fn parse_local_message(body: &[u8]) -> Result<Option<CanonicalEvent>, ChannelError> {
    let message: LocalMessage = serde_json::from_slice(body)
        .map_err(|e| ChannelError::InvalidMessage(format!("local message: {e}")))?;
    if message.channel_id.trim().is_empty() {
        return Err(ChannelError::InvalidMessage("empty channel_id".into()));
    }
    if message.text.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(CanonicalEvent::new(
        message.kind,
        message.channel_id,
        message.user_id,
        message.text,
    )))
}

impl Inbound for LocalBinding {
    fn normalize(
        &self,
        _headers: &HeaderMap,
        body: &[u8],
    ) -> Result<Option<CanonicalEvent>, ChannelError> {
        parse_local_message(body)
    }
}
