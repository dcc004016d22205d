//! Rendering state machine for one run.
//!
//! `RenderState` is owned by exactly one pipeline worker (see
//! [`super::pipeline`]) so every method runs to completion before the next
//! begins; no locking is needed and platform operations are issued in
//! production order.
//!
//! Throttling uses explicit deadlines: the time of the last edit is tracked,
//! and an edit requested inside the minimum interval sets a single deadline
//! at the next allowed instant. Further requests before that deadline only
//! mark the message dirty, so they coalesce into the one pending flush.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::channels::{Binding, MessageHandle, split_message};
use crate::config::RenderPolicy;
use crate::error::ChannelError;
use crate::render::RenderInstruction;
use crate::render::status::StatusBoard;

/// Observable phase of a rendering instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitingFirstContent,
    AccumulatingStatus,
    StreamingFinal,
    Finalized,
}

/// A message that is edited on a cadence.
#[derive(Debug, Default)]
struct Throttled {
    handle: Option<MessageHandle>,
    last_edit: Option<Instant>,
    deadline: Option<Instant>,
    dirty: bool,
}

impl Throttled {
    /// Decide whether an edit may go out now; otherwise arm the deadline.
    fn request(&mut self, now: Instant, interval: std::time::Duration) -> bool {
        self.dirty = true;
        if self.deadline.is_some() {
            return false;
        }
        match self.last_edit {
            Some(last) if now < last + interval => {
                self.deadline = Some(last + interval);
                false
            }
            _ => true,
        }
    }

    fn due(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| d <= now)
    }

    fn cancel(&mut self) {
        self.deadline = None;
    }
}

/// Per-run rendering state.
pub struct RenderState {
    binding: Arc<dyn Binding>,
    channel_id: String,
    policy: RenderPolicy,
    finalized: bool,

    board: StatusBoard,
    status: Throttled,

    /// Interim text not yet committed anywhere.
    pending: String,
    stream: Throttled,
    streaming_disabled: bool,

    /// Messages carrying the final answer, one per chunk.
    final_handles: Vec<MessageHandle>,
    /// Whether anything durable (answer, committed text, upload) exists.
    durable: bool,
    /// Every message this instance created, in creation order. The stop
    /// indicator is not tracked here: it belongs to the coordinator.
    created: Vec<MessageHandle>,

    detail_tx: mpsc::UnboundedSender<(Option<MessageHandle>, String)>,
}

impl RenderState {
    pub fn new(binding: Arc<dyn Binding>, channel_id: impl Into<String>, policy: RenderPolicy) -> Self {
        let channel_id = channel_id.into();
        let detail_tx = spawn_detail_lane(Arc::clone(&binding), channel_id.clone());
        Self {
            board: StatusBoard::new(policy.status_header.clone(), policy.status_window),
            binding,
            channel_id,
            policy,
            finalized: false,
            status: Throttled::default(),
            pending: String::new(),
            stream: Throttled::default(),
            streaming_disabled: false,
            final_handles: Vec::new(),
            durable: false,
            created: Vec::new(),
            detail_tx,
        }
    }

    pub fn phase(&self) -> Phase {
        if self.finalized {
            Phase::Finalized
        } else if self.stream.handle.is_some() {
            Phase::StreamingFinal
        } else if self.status.handle.is_some() || self.board.entries().next().is_some() {
            Phase::AccumulatingStatus
        } else {
            Phase::AwaitingFirstContent
        }
    }

    /// Earliest pending flush, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.status.deadline, self.stream.deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Apply one instruction.
    pub async fn apply(&mut self, instruction: RenderInstruction) {
        if self.finalized {
            debug!(
                channel_id = %self.channel_id,
                kind = instruction.kind(),
                "Ignoring render instruction after finalize"
            );
            return;
        }

        if !matches!(
            instruction,
            RenderInstruction::ContentAppend(_) | RenderInstruction::Replace(_) | RenderInstruction::Delete
        ) {
            // Anything other than more content proves buffered text was interim.
            self.flush_pending().await;
        }

        match instruction {
            RenderInstruction::StatusUpdate(label) => self.status_update(label).await,
            RenderInstruction::ContentAppend(text) => self.content_append(&text).await,
            RenderInstruction::Replace(text) => self.replace(&text).await,
            RenderInstruction::ThreadDetail(text) => {
                let parent = self
                    .final_handles
                    .first()
                    .cloned()
                    .or_else(|| self.status.handle.clone());
                if self.detail_tx.send((parent, text)).is_err() {
                    debug!(channel_id = %self.channel_id, "Detail lane closed");
                }
            }
            RenderInstruction::Typing(on) => self.typing(on).await,
            RenderInstruction::Upload { path, title } => {
                match self.binding.upload(&self.channel_id, &path, &title).await {
                    Ok(handle) => {
                        self.created.push(handle);
                        self.durable = true;
                    }
                    Err(e) => warn!(
                        channel_id = %self.channel_id,
                        path = %path.display(),
                        error = %e,
                        "Upload failed"
                    ),
                }
            }
            RenderInstruction::Delete => self.delete_all().await,
        }
    }

    /// Run any flush whose deadline has passed.
    pub async fn on_deadline(&mut self, now: Instant) {
        if self.status.due(now) {
            self.status.cancel();
            if self.status.dirty {
                self.edit_status(now).await;
            }
        }
        if self.stream.due(now) {
            self.stream.cancel();
            if self.stream.dirty {
                self.edit_stream(now).await;
            }
        }
    }

    /// End of run. Idempotent.
    pub async fn finalize(&mut self) {
        if self.finalized {
            return;
        }

        self.flush_pending().await;
        self.status.cancel();
        self.stream.cancel();

        if let Some(handle) = self.status.handle.clone() {
            if !self.board.has_body() {
                // Progress entries are transient once the run is over.
                self.discard(&handle).await;
                self.status.handle = None;
            } else if self.status.dirty {
                self.edit_status(Instant::now()).await;
            }
        }

        self.finalized = true;
        debug!(
            channel_id = %self.channel_id,
            messages = self.created.len(),
            durable = self.durable,
            "Rendering finalized"
        );
    }

    /// Post the transient stop indicator and return its handle.
    pub async fn show_stopping(&mut self) -> Option<MessageHandle> {
        match self
            .binding
            .post(&self.channel_id, &self.policy.stopping_text)
            .await
        {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(channel_id = %self.channel_id, error = %e, "Failed to post stop indicator");
                None
            }
        }
    }

    /// Turn the stop indicator into its terminal form.
    pub async fn mark_stopped(&mut self, handle: &MessageHandle) {
        if let Err(e) = self
            .binding
            .edit(&self.channel_id, handle, &self.policy.stopped_text)
            .await
        {
            warn!(channel_id = %self.channel_id, error = %e, "Failed to finalize stop indicator");
        }
    }

    // ── Instructions ────────────────────────────────────────────────

    async fn status_update(&mut self, label: String) {
        if !self.final_handles.is_empty() {
            debug!(channel_id = %self.channel_id, "Status after final answer ignored");
            return;
        }
        self.board.push(label);
        self.request_status_flush(Instant::now()).await;
    }

    async fn content_append(&mut self, text: &str) {
        self.pending.push_str(text);

        if !self.policy.streaming || self.streaming_disabled {
            return;
        }

        let len = self.pending.chars().count();
        if len > self.binding.max_message_len() {
            self.demote_stream("buffer exceeds platform message size").await;
            return;
        }

        let now = Instant::now();
        if self.stream.handle.is_none() {
            if len < self.policy.stream_min_chars {
                return;
            }
            match self.binding.post(&self.channel_id, &self.pending).await {
                Ok(handle) => {
                    debug!(channel_id = %self.channel_id, "Streaming started");
                    self.created.push(handle.clone());
                    self.stream.handle = Some(handle);
                    self.stream.last_edit = Some(now);
                    self.stream.dirty = false;
                }
                Err(e) => {
                    warn!(channel_id = %self.channel_id, error = %e, "Stream post failed");
                    self.streaming_disabled = true;
                }
            }
        } else if self.stream.request(now, self.policy.stream_edit_interval) {
            self.edit_stream(now).await;
        }
    }

    async fn replace(&mut self, text: &str) {
        self.status.cancel();
        self.stream.cancel();
        self.stream.dirty = false;
        self.pending.clear();

        let previous = match self.stream.handle.take() {
            Some(handle) => vec![handle],
            None => std::mem::take(&mut self.final_handles),
        };
        let chunks = split_message(text, self.binding.max_message_len());
        let delivered = self.deliver_chunks(&chunks, previous).await;

        if let Some(first) = delivered.first() {
            info!(
                channel_id = %self.channel_id,
                handle = %first,
                parts = delivered.len(),
                chars = text.chars().count(),
                response = %preview(text, 120),
                "Final response delivered"
            );
            self.final_handles = delivered;
            self.durable = true;
        }
    }

    async fn typing(&mut self, on: bool) {
        if !on || !self.created.is_empty() {
            return;
        }
        if let Err(e) = self.binding.typing(&self.channel_id).await {
            debug!(channel_id = %self.channel_id, error = %e, "Typing indicator failed");
        }
        if self.status.handle.is_none() {
            self.request_status_flush(Instant::now()).await;
        }
    }

    async fn delete_all(&mut self) {
        self.status.cancel();
        self.stream.cancel();
        self.pending.clear();

        let created = std::mem::take(&mut self.created);
        for handle in &created {
            self.delete_message(handle).await;
        }

        self.board.clear();
        self.status = Throttled::default();
        self.stream = Throttled::default();
        self.final_handles.clear();
        self.durable = false;
        info!(channel_id = %self.channel_id, removed = created.len(), "Run output deleted");
    }

    // ── Helpers ─────────────────────────────────────────────────────

    /// Commit buffered interim text: into the live stream message if one
    /// exists, otherwise into the status body.
    async fn flush_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let text = std::mem::take(&mut self.pending);

        if let Some(handle) = self.stream.handle.take() {
            self.stream.cancel();
            if self.stream.dirty
                && let Err(e) = self.binding.edit(&self.channel_id, &handle, &text).await
            {
                warn!(channel_id = %self.channel_id, error = %e, "Final stream edit failed");
            }
            self.stream = Throttled::default();
            self.durable = true;
            return;
        }

        if text.trim().is_empty() {
            return;
        }

        let max = self.binding.max_message_len();
        if self.board.body_chars_after(&text) > max {
            // Too long for the status message: block delivery.
            for chunk in split_message(&text, max) {
                self.post_tracked(&chunk, "Block delivery post failed").await;
            }
            self.durable = true;
            return;
        }
        self.board.append_body(&text);
        self.durable = true;
        self.request_status_flush(Instant::now()).await;
    }

    async fn request_status_flush(&mut self, now: Instant) {
        let Some(_) = self.status.handle else {
            match self.binding.post(&self.channel_id, &self.status_text()).await {
                Ok(handle) => {
                    self.created.push(handle.clone());
                    self.status.handle = Some(handle);
                    self.status.last_edit = Some(now);
                    self.status.dirty = false;
                }
                Err(e) => {
                    warn!(channel_id = %self.channel_id, error = %e, "Status post failed");
                }
            }
            return;
        };

        if self.status.request(now, self.policy.min_edit_interval) {
            self.edit_status(now).await;
        }
    }

    async fn edit_status(&mut self, now: Instant) {
        let Some(handle) = self.status.handle.clone() else {
            return;
        };
        self.status.dirty = false;
        self.status.last_edit = Some(now);
        if let Err(e) = self
            .binding
            .edit(&self.channel_id, &handle, &self.status_text())
            .await
        {
            warn!(channel_id = %self.channel_id, error = %e, "Status edit failed");
        }
    }

    async fn edit_stream(&mut self, now: Instant) {
        let Some(handle) = self.stream.handle.clone() else {
            return;
        };
        self.stream.dirty = false;
        self.stream.last_edit = Some(now);
        if let Err(e) = self.binding.edit(&self.channel_id, &handle, &self.pending).await {
            warn!(channel_id = %self.channel_id, error = %e, "Stream edit failed");
            self.demote_stream("edit failure").await;
        }
    }

    /// Stop streaming for the rest of the run. The partial live message is
    /// removed so block delivery does not duplicate it.
    async fn demote_stream(&mut self, reason: &str) {
        info!(channel_id = %self.channel_id, reason, "Streaming demoted to block delivery");
        self.streaming_disabled = true;
        if let Some(handle) = self.stream.handle.take() {
            self.discard(&handle).await;
        }
        self.stream = Throttled::default();
    }

    fn status_text(&self) -> String {
        self.board.compose_within(self.binding.max_message_len())
    }

    /// Best-effort delete; a message that is already gone is not an error.
    async fn delete_message(&self, handle: &MessageHandle) {
        match self.binding.delete(&self.channel_id, handle).await {
            Ok(()) => {}
            Err(ChannelError::MessageNotFound { .. }) => {
                debug!(channel_id = %self.channel_id, handle = %handle, "Message already removed");
            }
            Err(e) => {
                warn!(channel_id = %self.channel_id, handle = %handle, error = %e, "Delete failed");
            }
        }
    }

    /// Delete a message this instance created and stop tracking it.
    async fn discard(&mut self, handle: &MessageHandle) {
        self.delete_message(handle).await;
        self.created.retain(|h| h != handle);
    }

    async fn post_tracked(&mut self, text: &str, failure: &'static str) -> Option<MessageHandle> {
        match self.binding.post(&self.channel_id, text).await {
            Ok(handle) => {
                self.created.push(handle.clone());
                Some(handle)
            }
            Err(e) => {
                warn!(channel_id = %self.channel_id, error = %e, "{failure}");
                None
            }
        }
    }

    /// Put `chunks` on the platform, editing `previous` messages in place
    /// where possible. Leftover previous messages are removed. After a failed
    /// edit the rest is posted fresh so the chunks stay in reading order.
    async fn deliver_chunks(
        &mut self,
        chunks: &[String],
        previous: Vec<MessageHandle>,
    ) -> Vec<MessageHandle> {
        let mut reusable = previous.into_iter();
        let mut delivered = Vec::with_capacity(chunks.len());

        for chunk in chunks {
            if let Some(handle) = reusable.next() {
                match self.binding.edit(&self.channel_id, &handle, chunk).await {
                    Ok(()) => {
                        delivered.push(handle);
                        continue;
                    }
                    Err(e) => {
                        warn!(
                            channel_id = %self.channel_id,
                            error = %e,
                            "Edit of final message failed; posting a new one"
                        );
                        self.discard(&handle).await;
                        for stale in reusable.by_ref() {
                            self.discard(&stale).await;
                        }
                    }
                }
            }
            if let Some(handle) = self.post_tracked(chunk, "Final response post failed").await {
                delivered.push(handle);
            }
        }

        for stale in reusable {
            self.discard(&stale).await;
        }
        delivered
    }
}

/// Secondary lane for thread detail so slow detail posts never hold up the
/// primary state machine.
fn spawn_detail_lane(
    binding: Arc<dyn Binding>,
    channel_id: String,
) -> mpsc::UnboundedSender<(Option<MessageHandle>, String)> {
    let (tx, mut rx) = mpsc::unbounded_channel::<(Option<MessageHandle>, String)>();
    tokio::spawn(async move {
        while let Some((parent, text)) = rx.recv().await {
            if let Err(e) = binding.detail(&channel_id, parent.as_ref(), &text).await {
                warn!(channel_id = %channel_id, error = %e, "Thread detail failed");
            }
        }
    });
    tx
}

fn preview(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    match collapsed.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &collapsed[..idx]),
        None => collapsed,
    }
}
