//! Rendering pipeline: one worker task per run owns the [`RenderState`].
//!
//! Every public call is a message on a single channel, so platform
//! operations happen in the order calls were made even when callers do not
//! await them. Throttle deadlines are served by the same loop.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::debug;

use crate::channels::{Binding, MessageHandle};
use crate::config::RenderPolicy;
use crate::render::RenderInstruction;
use crate::render::machine::RenderState;

enum Command {
    Apply(RenderInstruction),
    Finalize(oneshot::Sender<()>),
    ShowStopping(oneshot::Sender<Option<MessageHandle>>),
    MarkStopped(MessageHandle, oneshot::Sender<()>),
    Settled(oneshot::Sender<()>),
}

/// Handle to a run's rendering worker. Cheap to clone.
///
/// The worker finalizes and exits once every handle has been dropped.
#[derive(Clone)]
pub struct Renderer {
    channel_id: Arc<str>,
    tx: mpsc::UnboundedSender<Command>,
}

impl Renderer {
    /// Start the worker for one run.
    pub fn spawn(binding: Arc<dyn Binding>, channel_id: &str, policy: RenderPolicy) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = RenderState::new(binding, channel_id, policy);
        tokio::spawn(run_worker(state, rx));
        Self {
            channel_id: Arc::from(channel_id),
            tx,
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Queue an instruction. Never blocks.
    pub fn apply(&self, instruction: RenderInstruction) {
        if self.tx.send(Command::Apply(instruction)).is_err() {
            debug!(channel_id = %self.channel_id, "Render worker gone; instruction dropped");
        }
    }

    /// Finalize after everything queued so far has been applied.
    pub async fn finalize(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(Command::Finalize(done)).is_ok() {
            let _ = wait.await;
        }
    }

    /// Post the transient stop indicator.
    pub async fn show_stopping(&self) -> Option<MessageHandle> {
        let (reply, wait) = oneshot::channel();
        self.tx.send(Command::ShowStopping(reply)).ok()?;
        wait.await.ok().flatten()
    }

    /// Edit the stop indicator into its terminal form.
    pub async fn mark_stopped(&self, handle: MessageHandle) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(Command::MarkStopped(handle, done)).is_ok() {
            let _ = wait.await;
        }
    }

    /// Wait until every instruction queued so far has been applied.
    pub async fn settled(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(Command::Settled(done)).is_ok() {
            let _ = wait.await;
        }
    }

    /// The write-only view handed to the agent engine.
    pub fn sink(&self) -> RenderSink {
        RenderSink {
            renderer: self.clone(),
        }
    }
}

async fn run_worker(mut state: RenderState, mut rx: mpsc::UnboundedReceiver<Command>) {
    loop {
        let deadline = state.next_deadline();
        tokio::select! {
            biased;

            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                state.on_deadline(Instant::now()).await;
            }

            command = rx.recv() => match command {
                Some(Command::Apply(instruction)) => state.apply(instruction).await,
                Some(Command::Finalize(done)) => {
                    state.finalize().await;
                    let _ = done.send(());
                }
                Some(Command::ShowStopping(reply)) => {
                    let handle = state.show_stopping().await;
                    let _ = reply.send(handle);
                }
                Some(Command::MarkStopped(handle, done)) => {
                    state.mark_stopped(&handle).await;
                    let _ = done.send(());
                }
                Some(Command::Settled(done)) => {
                    let _ = done.send(());
                }
                None => {
                    state.finalize().await;
                    break;
                }
            },
        }
    }
}

/// Ordered sink of render instructions for one run.
#[derive(Clone)]
pub struct RenderSink {
    renderer: Renderer,
}

impl RenderSink {
    pub fn emit(&self, instruction: RenderInstruction) {
        self.renderer.apply(instruction);
    }

    pub fn channel_id(&self) -> &str {
        self.renderer.channel_id()
    }
}
