//! Channel hub: wires inbound events to queues, runs and renderers.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use axum::Json;
use axum::response::{IntoResponse, Response};
use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::channels::{Binding, CanonicalEvent, Inbound};
use crate::config::RenderPolicy;
use crate::coordinator::{AbortSignal, RunCompletion, RunCoordinator, StopOutcome};
use crate::engine::{AgentEngine, RunOutcome};
use crate::error::GatewayError;
use crate::gateway::{InboundRequest, RouteHandler};
use crate::queue::EventQueues;
use crate::render::Renderer;

/// What happened to an inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Dispatch {
    Queued,
    Stopping,
}

/// Owns the per-conversation registries and drives each run.
pub struct ChannelHub {
    coordinator: Arc<RunCoordinator>,
    queues: EventQueues,
    engine: Arc<dyn AgentEngine>,
    policy: RenderPolicy,
}

impl ChannelHub {
    pub fn new(
        engine: Arc<dyn AgentEngine>,
        policy: RenderPolicy,
        external_capacity: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            coordinator: Arc::new(RunCoordinator::new()),
            queues: EventQueues::new(external_capacity),
            engine,
            policy,
        })
    }

    pub fn coordinator(&self) -> &Arc<RunCoordinator> {
        &self.coordinator
    }

    /// Route a user event: a stop command for a running conversation stops
    /// it, anything else is queued behind the conversation's earlier work.
    pub async fn dispatch(self: &Arc<Self>, binding: Arc<dyn Binding>, event: CanonicalEvent) -> Dispatch {
        if event.is_stop_command() && self.coordinator.is_running(&event.channel_id) {
            self.coordinator.request_stop(&event.channel_id).await;
            return Dispatch::Stopping;
        }

        debug!(
            channel_id = %event.channel_id,
            kind = %event.kind,
            user_id = %event.user_id,
            "Event queued"
        );
        let queue = self.queues.queue(&event.channel_id);
        queue.enqueue(Arc::clone(self).execute(binding, event));
        Dispatch::Queued
    }

    /// Queue an externally sourced event (scheduled trigger, cross-process
    /// signal). Returns `false` when the conversation's bounded queue is full.
    pub fn submit_external(self: &Arc<Self>, binding: Arc<dyn Binding>, event: CanonicalEvent) -> bool {
        let channel_id = event.channel_id.clone();
        let queue = self.queues.queue(&channel_id);
        let accepted = queue.try_enqueue_external(Arc::clone(self).execute(binding, event));
        if !accepted {
            warn!(channel_id = %channel_id, "External event dropped");
        }
        accepted
    }

    /// Stop the conversation's active run, if any.
    pub async fn stop(&self, channel_id: &str) -> StopOutcome {
        self.coordinator.request_stop(channel_id).await
    }

    async fn execute(self: Arc<Self>, binding: Arc<dyn Binding>, event: CanonicalEvent) -> anyhow::Result<()> {
        let channel_id = event.channel_id.clone();
        let abort = self.coordinator.begin_run(&channel_id)?;

        let renderer = Renderer::spawn(Arc::clone(&binding), &channel_id, self.policy.clone());
        if let Err(e) = self.coordinator.attach_renderer(&channel_id, renderer.clone()) {
            warn!(channel_id = %channel_id, error = %e, "Could not attach renderer");
        }

        info!(
            channel_id = %channel_id,
            binding = binding.name(),
            kind = %event.kind,
            "Run dispatched to engine"
        );
        let result = AssertUnwindSafe(self.engine.run(
            &event,
            binding.formatting_instructions(),
            renderer.sink(),
            abort.clone(),
        ))
        .catch_unwind()
        .await;

        renderer.finalize().await;

        let completion = match result {
            Ok(Ok(RunOutcome::Completed)) if !abort.is_aborted() => RunCompletion::Completed,
            Ok(Ok(_)) => RunCompletion::AbortedByStop,
            Ok(Err(e)) => {
                error!(channel_id = %channel_id, error = %e, "Agent engine failed");
                stopped_or(&abort, RunCompletion::Failed)
            }
            Err(_) => {
                error!(channel_id = %channel_id, "Agent engine panicked");
                stopped_or(&abort, RunCompletion::Failed)
            }
        };

        self.coordinator.complete_run(&channel_id, completion).await?;
        Ok(())
    }
}

fn stopped_or(abort: &AbortSignal, otherwise: RunCompletion) -> RunCompletion {
    if abort.is_aborted() {
        RunCompletion::AbortedByStop
    } else {
        otherwise
    }
}

/// Gateway route feeding one binding's webhook into the hub.
pub struct WebhookRoute<B> {
    binding: Arc<B>,
    hub: Arc<ChannelHub>,
}

impl<B> WebhookRoute<B>
where
    B: Binding + Inbound + 'static,
{
    pub fn new(binding: Arc<B>, hub: Arc<ChannelHub>) -> Self {
        Self { binding, hub }
    }
}

#[async_trait]
impl<B> RouteHandler for WebhookRoute<B>
where
    B: Binding + Inbound + 'static,
{
    async fn handle(&self, request: InboundRequest) -> Result<Response, GatewayError> {
        let Some(event) = self.binding.normalize(&request.headers, &request.body)? else {
            return Ok(Json(serde_json::json!({ "ok": true })).into_response());
        };

        let binding: Arc<dyn Binding> = self.binding.clone();
        let dispatch = self.hub.dispatch(binding, event).await;
        Ok(Json(serde_json::json!({ "ok": true, "dispatch": dispatch })).into_response())
    }
}
