//! Platform bindings and the canonical event model.

pub mod binding;
pub mod event;
pub mod local;
pub mod memory;
pub mod telegram;

use axum::http::HeaderMap;

pub use binding::{Binding, MessageHandle, split_message};
pub use event::{Attachment, CanonicalEvent, EventKind};
pub use local::{LOCAL_PREFIX, LocalBinding};
pub use memory::{MemoryBinding, Operation};
pub use telegram::TelegramBinding;

use crate::error::ChannelError;

/// Inbound half of a binding: verifies and normalizes a raw webhook request.
///
/// `Ok(None)` means the request was valid but carries nothing to act on.
/// Errors are protocol errors and are answered with a 4xx status.
pub trait Inbound: Send + Sync {
    fn normalize(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<Option<CanonicalEvent>, ChannelError>;
}
