//! Agent engine boundary.
//!
//! The relay does not reason; it hands one event to an engine and renders
//! whatever the engine emits.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::channels::CanonicalEvent;
use crate::coordinator::AbortSignal;
use crate::render::{RenderInstruction, RenderSink};

/// How an engine run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Aborted,
}

/// Produces an ordered stream of render instructions for one event.
///
/// Implementations check `abort` between their own steps and return
/// [`RunOutcome::Aborted`] once it fires. Errors are logged by the caller and
/// never shown to the user.
#[async_trait]
pub trait AgentEngine: Send + Sync {
    async fn run(
        &self,
        event: &CanonicalEvent,
        formatting: &str,
        sink: RenderSink,
        abort: AbortSignal,
    ) -> anyhow::Result<RunOutcome>;
}

/// Engine that echoes the event text back.
#[derive(Debug, Clone, Default)]
pub struct EchoEngine {
    think_time: Duration,
}

impl EchoEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pause between steps, so stop requests have something to interrupt.
    pub fn with_think_time(mut self, think_time: Duration) -> Self {
        self.think_time = think_time;
        self
    }

    /// Wait `think_time`, returning `false` if a stop arrives first.
    async fn pause(&self, abort: &AbortSignal) -> bool {
        if abort.is_aborted() {
            return false;
        }
        if self.think_time.is_zero() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(self.think_time) => true,
            _ = abort.aborted() => false,
        }
    }
}

#[async_trait]
impl AgentEngine for EchoEngine {
    async fn run(
        &self,
        event: &CanonicalEvent,
        formatting: &str,
        sink: RenderSink,
        abort: AbortSignal,
    ) -> anyhow::Result<RunOutcome> {
        debug!(
            channel_id = %event.channel_id,
            kind = %event.kind,
            formatting_chars = formatting.len(),
            "Echo engine run"
        );

        sink.emit(RenderInstruction::Typing(true));
        if !self.pause(&abort).await {
            return Ok(RunOutcome::Aborted);
        }

        sink.emit(RenderInstruction::StatusUpdate("reading message".into()));
        if !event.attachments.is_empty() {
            sink.emit(RenderInstruction::StatusUpdate(format!(
                "{} attachment(s)",
                event.attachments.len()
            )));
        }
        if !self.pause(&abort).await {
            return Ok(RunOutcome::Aborted);
        }

        let reply = match event.text.trim() {
            "" => "(empty message)".to_string(),
            text => format!("You said: {text}"),
        };
        sink.emit(RenderInstruction::Replace(reply));
        Ok(RunOutcome::Completed)
    }
}
