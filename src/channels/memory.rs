//! In-memory binding: records every operation instead of performing I/O.
//!
//! Keeps the full history for the life of the binding, so it is meant for
//! tests that need to observe exactly which platform operations a run
//! produced. The binary uses [`super::LocalBinding`] instead.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::http::HeaderMap;

use crate::channels::Inbound;
use crate::channels::binding::{Binding, MessageHandle};
use crate::channels::event::CanonicalEvent;
use crate::channels::local::parse_local_message;
use crate::error::ChannelError;

/// One platform operation, as observed by the in-memory binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Post {
        channel_id: String,
        handle: MessageHandle,
        text: String,
    },
    Edit {
        channel_id: String,
        handle: MessageHandle,
        text: String,
    },
    Delete {
        channel_id: String,
        handle: MessageHandle,
    },
    Upload {
        channel_id: String,
        handle: MessageHandle,
        path: PathBuf,
        title: String,
    },
    Typing {
        channel_id: String,
    },
    Detail {
        channel_id: String,
        text: String,
    },
}

#[derive(Default)]
struct State {
    log: Vec<Operation>,
    /// Messages currently visible on the "platform", keyed by handle.
    visible: BTreeMap<String, String>,
    /// Handles whose deletion fails as if removed out-of-band.
    vanished: HashSet<String>,
}

/// Binding that keeps all state in memory.
pub struct MemoryBinding {
    name: String,
    max_len: usize,
    next_id: AtomicU64,
    latency: Option<Duration>,
    fail_edits: AtomicBool,
    fail_posts: AtomicBool,
    state: Mutex<State>,
}

impl MemoryBinding {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_len: 4000,
            next_id: AtomicU64::new(1),
            latency: None,
            fail_edits: AtomicBool::new(false),
            fail_posts: AtomicBool::new(false),
            state: Mutex::new(State::default()),
        }
    }

    /// Delay every operation, simulating a network round trip.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn with_max_message_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    /// Make every subsequent edit fail.
    pub fn fail_edits(&self, fail: bool) {
        self.fail_edits.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent post fail.
    pub fn fail_posts(&self, fail: bool) {
        self.fail_posts.store(fail, Ordering::SeqCst);
    }

    /// Remove a message behind the binding's back: it disappears from the
    /// platform and a later delete reports it as not found.
    pub fn vanish(&self, handle: &MessageHandle) {
        let mut state = self.lock();
        state.visible.remove(handle.as_str());
        state.vanished.insert(handle.as_str().to_string());
    }

    /// Every operation in the order it was performed.
    pub fn operations(&self) -> Vec<Operation> {
        self.lock().log.clone()
    }

    /// Text of every message still visible, in creation order.
    pub fn visible_messages(&self) -> Vec<String> {
        let state = self.lock();
        let mut entries: Vec<(u64, String)> = state
            .visible
            .iter()
            .map(|(k, v)| (k.trim_start_matches('m').parse().unwrap_or(0), v.clone()))
            .collect();
        entries.sort_by_key(|(id, _)| *id);
        entries.into_iter().map(|(_, text)| text).collect()
    }

    /// Current text of a message, if still visible.
    pub fn message_text(&self, handle: &MessageHandle) -> Option<String> {
        self.lock().visible.get(handle.as_str()).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_len(&self, text: &str) -> Result<(), ChannelError> {
        if text.chars().count() > self.max_len {
            return Err(ChannelError::SendFailed {
                name: self.name.clone(),
                reason: format!("text exceeds {} characters", self.max_len),
            });
        }
        Ok(())
    }

    fn next_handle(&self) -> MessageHandle {
        MessageHandle::new(format!("m{}", self.next_id.fetch_add(1, Ordering::SeqCst)))
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl Binding for MemoryBinding {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_message_len(&self) -> usize {
        self.max_len
    }

    async fn post(&self, channel_id: &str, text: &str) -> Result<MessageHandle, ChannelError> {
        self.simulate_latency().await;
        if self.fail_posts.load(Ordering::SeqCst) {
            return Err(ChannelError::SendFailed {
                name: self.name.clone(),
                reason: "post rejected".into(),
            });
        }

        self.check_len(text)?;

        let handle = self.next_handle();
        let mut state = self.lock();
        state
            .visible
            .insert(handle.as_str().to_string(), text.to_string());
        state.log.push(Operation::Post {
            channel_id: channel_id.to_string(),
            handle: handle.clone(),
            text: text.to_string(),
        });
        Ok(handle)
    }

    async fn edit(
        &self,
        channel_id: &str,
        handle: &MessageHandle,
        text: &str,
    ) -> Result<(), ChannelError> {
        self.simulate_latency().await;
        if self.fail_edits.load(Ordering::SeqCst) {
            return Err(ChannelError::EditFailed {
                name: self.name.clone(),
                handle: handle.to_string(),
                reason: "edit rejected".into(),
            });
        }
        if text.chars().count() > self.max_len {
            return Err(ChannelError::EditFailed {
                name: self.name.clone(),
                handle: handle.to_string(),
                reason: format!("text exceeds {} characters", self.max_len),
            });
        }

        let mut state = self.lock();
        let Some(current) = state.visible.get_mut(handle.as_str()) else {
            return Err(ChannelError::MessageNotFound {
                name: self.name.clone(),
                handle: handle.to_string(),
            });
        };
        *current = text.to_string();
        state.log.push(Operation::Edit {
            channel_id: channel_id.to_string(),
            handle: handle.clone(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn delete(&self, channel_id: &str, handle: &MessageHandle) -> Result<(), ChannelError> {
        self.simulate_latency().await;
        let mut state = self.lock();
        if state.visible.remove(handle.as_str()).is_none() {
            return Err(ChannelError::MessageNotFound {
                name: self.name.clone(),
                handle: handle.to_string(),
            });
        }
        state.log.push(Operation::Delete {
            channel_id: channel_id.to_string(),
            handle: handle.clone(),
        });
        Ok(())
    }

    async fn upload(
        &self,
        channel_id: &str,
        path: &Path,
        title: &str,
    ) -> Result<MessageHandle, ChannelError> {
        self.simulate_latency().await;
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(ChannelError::UploadFailed {
                name: self.name.clone(),
                reason: format!("no such file: {}", path.display()),
            });
        }

        let handle = self.next_handle();
        let mut state = self.lock();
        state
            .visible
            .insert(handle.as_str().to_string(), format!("[file] {title}"));
        state.log.push(Operation::Upload {
            channel_id: channel_id.to_string(),
            handle: handle.clone(),
            path: path.to_path_buf(),
            title: title.to_string(),
        });
        Ok(handle)
    }

    async fn typing(&self, channel_id: &str) -> Result<(), ChannelError> {
        self.lock().log.push(Operation::Typing {
            channel_id: channel_id.to_string(),
        });
        Ok(())
    }

    async fn detail(
        &self,
        channel_id: &str,
        _parent: Option<&MessageHandle>,
        text: &str,
    ) -> Result<(), ChannelError> {
        self.simulate_latency().await;
        self.lock().log.push(Operation::Detail {
            channel_id: channel_id.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }
}

impl Inbound for MemoryBinding {
    fn normalize(
        &self,
        _headers: &HeaderMap,
        body: &[u8],
    ) -> Result<Option<CanonicalEvent>, ChannelError> {
        parse_local_message(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn oversized_text_is_rejected() {
        let binding = MemoryBinding::new("memory").with_max_message_len(5);
        assert!(matches!(
            binding.post("C1", "123456").await,
            Err(ChannelError::SendFailed { .. })
        ));
        let handle = binding.post("C1", "12345").await.unwrap();
        assert!(matches!(
            binding.edit("C1", &handle, "123456").await,
            Err(ChannelError::EditFailed { .. })
        ));
        assert_eq!(binding.message_text(&handle).as_deref(), Some("12345"));
    }

    #[test]
    fn local_webhook_normalization() {
        let binding = MemoryBinding::new("local");
        let headers = HeaderMap::new();

        let event = binding
            .normalize(&headers, br#"{"channel_id":"dev","text":"hi"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, crate::channels::EventKind::DirectMessage);
        assert_eq!(event.user_id, "local");

        assert!(binding.normalize(&headers, br#"{"channel_id":"dev","text":"  "}"#).unwrap().is_none());
        assert!(matches!(
            binding.normalize(&headers, b"not json"),
            Err(ChannelError::InvalidMessage(_))
        ));
    }

    #[tokio::test]
    async fn post_edit_delete_roundtrip() {
        let binding = MemoryBinding::new("memory");
        let handle = binding.post("C1", "hello").await.unwrap();
        binding.edit("C1", &handle, "hello again").await.unwrap();
        assert_eq!(binding.message_text(&handle).as_deref(), Some("hello again"));

        binding.delete("C1", &handle).await.unwrap();
        assert!(binding.visible_messages().is_empty());
        assert_eq!(binding.operations().len(), 3);
    }

    #[tokio::test]
    async fn vanished_message_reports_not_found() {
        let binding = MemoryBinding::new("memory");
        let handle = binding.post("C1", "gone soon").await.unwrap();
        binding.vanish(&handle);

        let err = binding.delete("C1", &handle).await.unwrap_err();
        assert!(matches!(err, ChannelError::MessageNotFound { .. }));
    }

    #[tokio::test]
    async fn injected_edit_failure() {
        let binding = MemoryBinding::new("memory");
        let handle = binding.post("C1", "x").await.unwrap();
        binding.fail_edits(true);
        assert!(binding.edit("C1", &handle, "y").await.is_err());
        assert_eq!(binding.message_text(&handle).as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn visible_messages_in_creation_order() {
        let binding = MemoryBinding::new("memory");
        for i in 1..=11 {
            binding.post("C1", &format!("msg {i}")).await.unwrap();
        }
        let visible = binding.visible_messages();
        assert_eq!(visible.first().map(String::as_str), Some("msg 1"));
        assert_eq!(visible.last().map(String::as_str), Some("msg 11"));
    }
}
