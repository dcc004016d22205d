//! Adapter rendering: turns an ordered stream of render instructions into
//! throttled, ordered platform message operations.

pub mod machine;
pub mod pipeline;
pub mod status;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use machine::{Phase, RenderState};
pub use pipeline::{RenderSink, Renderer};
pub use status::StatusBoard;

/// One UI effect requested by the agent engine, in production order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum RenderInstruction {
    /// Transient progress label ("searching", "reading file").
    StatusUpdate(String),
    /// Interim text, buffered until proven interim or final.
    ContentAppend(String),
    /// The definitive answer.
    Replace(String),
    /// Verbose detail for a secondary surface.
    ThreadDetail(String),
    /// Typing indicator on/off.
    Typing(bool),
    /// Upload a local file.
    Upload { path: PathBuf, title: String },
    /// Remove everything this run has posted.
    Delete,
}

impl RenderInstruction {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StatusUpdate(_) => "status_update",
            Self::ContentAppend(_) => "content_append",
            Self::Replace(_) => "replace",
            Self::ThreadDetail(_) => "thread_detail",
            Self::Typing(_) => "typing",
            Self::Upload { .. } => "upload",
            Self::Delete => "delete",
        }
    }
}
