//! Event queue: per-conversation FIFO with a strictly sequential drain loop.
//!
//! Each conversation owns one [`ConversationQueue`]. Work items are futures;
//! nothing runs until the drain loop polls it, and the loop awaits each item
//! to completion before popping the next. Distinct conversations drain on
//! their own tasks and never wait on each other.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::{debug, error, warn};

use crate::config::DEFAULT_EXTERNAL_QUEUE_CAPACITY;

/// A unit of queued work.
pub type WorkItem = BoxFuture<'static, anyhow::Result<()>>;

struct Queued {
    work: WorkItem,
    external: bool,
}

#[derive(Default)]
struct Inner {
    items: VecDeque<Queued>,
    draining: bool,
    /// Items accepted and not yet completed (queued or executing).
    outstanding: usize,
    /// Externally sourced items accepted and not yet completed.
    external_outstanding: usize,
}

/// FIFO of pending work for one conversation.
pub struct ConversationQueue {
    channel_id: String,
    external_capacity: usize,
    inner: Mutex<Inner>,
}

impl ConversationQueue {
    /// Create a queue whose externally sourced items are capped at
    /// `external_capacity`.
    pub fn new(channel_id: impl Into<String>, external_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            channel_id: channel_id.into(),
            external_capacity,
            inner: Mutex::new(Inner::default()),
        })
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Append a work item and start the drain loop if idle. Never rejects.
    pub fn enqueue<F>(self: &Arc<Self>, work: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.push(Box::pin(work), false);
    }

    /// Append an externally sourced work item.
    ///
    /// Returns `false` without queueing when the conversation already holds
    /// `external_capacity` external items that have not completed.
    pub fn try_enqueue_external<F>(self: &Arc<Self>, work: F) -> bool
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.push(Box::pin(work), true)
    }

    /// Number of items accepted and not yet completed.
    pub fn outstanding(&self) -> usize {
        self.lock().outstanding
    }

    /// Number of items waiting behind the one currently executing.
    pub fn pending(&self) -> usize {
        self.lock().items.len()
    }

    /// Whether the drain loop is currently active.
    pub fn is_draining(&self) -> bool {
        self.lock().draining
    }

    fn push(self: &Arc<Self>, work: WorkItem, external: bool) -> bool {
        let start = {
            let mut inner = self.lock();
            if external {
                if inner.external_outstanding >= self.external_capacity {
                    warn!(
                        channel_id = %self.channel_id,
                        capacity = self.external_capacity,
                        "External event rejected: queue full"
                    );
                    return false;
                }
                inner.external_outstanding += 1;
            }
            inner.items.push_back(Queued { work, external });
            inner.outstanding += 1;
            let start = !inner.draining;
            inner.draining = true;
            start
        };

        if start {
            debug!(channel_id = %self.channel_id, "Starting drain loop");
            tokio::spawn(Arc::clone(self).drain());
        }
        true
    }

    async fn drain(self: Arc<Self>) {
        loop {
            let next = {
                let mut inner = self.lock();
                match inner.items.pop_front() {
                    Some(item) => item,
                    None => {
                        inner.draining = false;
                        return;
                    }
                }
            };

            match AssertUnwindSafe(next.work).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(channel_id = %self.channel_id, error = %e, "Queued work failed");
                }
                Err(_) => {
                    error!(channel_id = %self.channel_id, "Queued work panicked");
                }
            }

            let mut inner = self.lock();
            inner.outstanding -= 1;
            if next.external {
                inner.external_outstanding -= 1;
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Registry of conversation queues, created lazily on first use.
pub struct EventQueues {
    external_capacity: usize,
    queues: Mutex<HashMap<String, Arc<ConversationQueue>>>,
}

impl EventQueues {
    pub fn new(external_capacity: usize) -> Self {
        Self {
            external_capacity,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// The queue for a conversation, creating it if needed.
    pub fn queue(&self, channel_id: &str) -> Arc<ConversationQueue> {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            queues
                .entry(channel_id.to_string())
                .or_insert_with(|| ConversationQueue::new(channel_id, self.external_capacity)),
        )
    }

    /// Number of conversations seen so far.
    pub fn len(&self) -> usize {
        self.queues.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventQueues {
    fn default() -> Self {
        Self::new(DEFAULT_EXTERNAL_QUEUE_CAPACITY)
    }
}
