//! Run coordinator: per-conversation run flag, stop requests and abort
//! signals.
//!
//! The registry is a plain `Mutex<HashMap>`: every read is synchronous and no
//! lock is ever held across an await.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channels::MessageHandle;
use crate::error::RunError;
use crate::render::Renderer;

/// Cooperative cancellation signal handed to the agent engine.
#[derive(Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once a stop has been requested.
    pub async fn aborted(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|aborted| *aborted).await.is_err() {
            // Run completed without a stop.
            std::future::pending::<()>().await;
        }
    }
}

/// How a run ended, as reported to [`RunCoordinator::complete_run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunCompletion {
    Completed,
    AbortedByStop,
    Failed,
}

/// Result of a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    Stopping,
    NothingToStop,
}

struct RunRecord {
    run_id: Uuid,
    abort: watch::Sender<bool>,
    stop_requested: bool,
    stop_marker: Option<MessageHandle>,
    renderer: Option<Renderer>,
}

/// Registry of active runs, keyed by conversation id.
#[derive(Default)]
pub struct RunCoordinator {
    runs: Mutex<HashMap<String, RunRecord>>,
}

impl RunCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self, channel_id: &str) -> bool {
        self.lock().contains_key(channel_id)
    }

    /// Conversation ids with an active run, sorted.
    pub fn running_conversations(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Mark a conversation as running and hand back its abort signal.
    pub fn begin_run(&self, channel_id: &str) -> Result<AbortSignal, RunError> {
        let mut runs = self.lock();
        if runs.contains_key(channel_id) {
            return Err(RunError::AlreadyRunning {
                channel_id: channel_id.to_string(),
            });
        }

        let (abort, rx) = watch::channel(false);
        let run_id = Uuid::new_v4();
        runs.insert(
            channel_id.to_string(),
            RunRecord {
                run_id,
                abort,
                stop_requested: false,
                stop_marker: None,
                renderer: None,
            },
        );
        debug!(channel_id = %channel_id, run_id = %run_id, "Run started");
        Ok(AbortSignal { rx })
    }

    /// Link the run's renderer so a stop request can surface its indicator.
    pub fn attach_renderer(&self, channel_id: &str, renderer: Renderer) -> Result<(), RunError> {
        let mut runs = self.lock();
        let record = runs.get_mut(channel_id).ok_or_else(|| RunError::NotRunning {
            channel_id: channel_id.to_string(),
        })?;
        record.renderer = Some(renderer);
        Ok(())
    }

    /// Ask the active run to stop.
    ///
    /// Idle conversations are left untouched.
    pub async fn request_stop(&self, channel_id: &str) -> StopOutcome {
        let (run_id, renderer) = {
            let mut runs = self.lock();
            let Some(record) = runs.get_mut(channel_id) else {
                debug!(channel_id = %channel_id, "Stop requested with no active run");
                return StopOutcome::NothingToStop;
            };
            if record.stop_requested {
                return StopOutcome::Stopping;
            }
            record.stop_requested = true;
            let _ = record.abort.send(true);
            (record.run_id, record.renderer.clone())
        };
        info!(channel_id = %channel_id, run_id = %run_id, "Stop requested");

        let Some(renderer) = renderer else {
            return StopOutcome::Stopping;
        };
        let Some(marker) = renderer.show_stopping().await else {
            return StopOutcome::Stopping;
        };

        let orphaned = {
            let mut runs = self.lock();
            match runs.get_mut(channel_id) {
                Some(record) if record.run_id == run_id => {
                    record.stop_marker = Some(marker.clone());
                    false
                }
                _ => true,
            }
        };
        if orphaned {
            // The run ended while the indicator was being posted.
            renderer.mark_stopped(marker).await;
        }
        StopOutcome::Stopping
    }

    /// Mark the run finished and resolve any stop indicator.
    pub async fn complete_run(
        &self,
        channel_id: &str,
        completion: RunCompletion,
    ) -> Result<(), RunError> {
        let record = self
            .lock()
            .remove(channel_id)
            .ok_or_else(|| RunError::NotRunning {
                channel_id: channel_id.to_string(),
            })?;

        info!(
            channel_id = %channel_id,
            run_id = %record.run_id,
            completion = ?completion,
            "Run completed"
        );

        if completion == RunCompletion::AbortedByStop
            && let Some(marker) = record.stop_marker
        {
            match record.renderer {
                Some(renderer) => renderer.mark_stopped(marker).await,
                None => warn!(channel_id = %channel_id, "Stop indicator without a renderer"),
            }
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, RunRecord>> {
        self.runs.lock().unwrap_or_else(|e| e.into_inner())
    }
}
