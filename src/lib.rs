//! Channel Relay: routes chat-platform events into per-conversation runs and
//! renders agent output back as throttled platform messages.

pub mod channels;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod hub;
pub mod queue;
pub mod render;
pub mod router;
pub mod scheduler;
