//! Cross-channel router: resolves an arbitrary conversation id to the
//! binding that owns it, for outbound sends.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use regex::Regex;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::channels::telegram::TELEGRAM_PREFIX;
use crate::channels::{Binding, LOCAL_PREFIX, MessageHandle, split_message};
use crate::error::{ConfigError, GatewayError};
use crate::gateway::{InboundRequest, RouteHandler, require_secret};

/// Header carrying the shared secret for `POST /send`.
pub const SEND_SECRET_HEADER: &str = "x-relay-send-token";

/// How a rule recognizes conversation ids.
#[derive(Debug, Clone)]
pub enum ChannelPattern {
    /// Only ASCII digits, optionally with a leading `-`.
    Numeric,
    /// Starts with one of the given characters.
    LeadingChar(Vec<char>),
    /// Starts with a textual prefix, which is stripped to give the native id.
    Prefix(String),
    /// Matches a regular expression.
    Regex(Regex),
}

impl ChannelPattern {
    pub fn regex(pattern: &str) -> Result<Self, ConfigError> {
        Regex::new(pattern)
            .map(Self::Regex)
            .map_err(|e| ConfigError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            })
    }

    /// The platform-native id if `channel_id` matches.
    fn matches<'a>(&self, channel_id: &'a str) -> Option<&'a str> {
        match self {
            Self::Numeric => {
                let digits = channel_id.strip_prefix('-').unwrap_or(channel_id);
                (!digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
                    .then_some(channel_id)
            }
            Self::LeadingChar(chars) => channel_id
                .chars()
                .next()
                .filter(|c| chars.contains(c))
                .map(|_| channel_id),
            Self::Prefix(prefix) => channel_id
                .strip_prefix(prefix.as_str())
                .filter(|rest| !rest.is_empty()),
            Self::Regex(re) => re.is_match(channel_id).then_some(channel_id),
        }
    }
}

struct RouteRule {
    pattern: ChannelPattern,
    binding: Arc<dyn Binding>,
}

/// A resolved destination.
#[derive(Clone)]
pub struct Resolved {
    pub binding: Arc<dyn Binding>,
    pub native_id: String,
}

/// Outbound message to an arbitrary conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRequest {
    pub channel_id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<PathBuf>,
}

/// Structured result of an outbound send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SendOutcome {
    Sent {
        destination: String,
        binding: String,
        handle: MessageHandle,
    },
    Failed {
        channel_id: String,
        error: String,
    },
}

impl SendOutcome {
    fn failed(channel_id: &str, error: impl Into<String>) -> Self {
        Self::Failed {
            channel_id: channel_id.to_string(),
            error: error.into(),
        }
    }

    pub fn is_sent(&self) -> bool {
        matches!(self, Self::Sent { .. })
    }

    /// One-line rendering for tool results and logs.
    pub fn to_text(&self) -> String {
        match self {
            Self::Sent {
                destination,
                binding,
                handle,
            } => format!("Sent to {destination} via {binding} (message {handle})"),
            Self::Failed { channel_id, error } => {
                format!("Failed to send to {channel_id}: {error}")
            }
        }
    }
}

/// Ordered rule list; the first matching rule wins.
#[derive(Default)]
pub struct CrossChannelRouter {
    rules: Vec<RouteRule>,
}

impl CrossChannelRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rule(mut self, pattern: ChannelPattern, binding: Arc<dyn Binding>) -> Self {
        self.add_rule(pattern, binding);
        self
    }

    pub fn add_rule(&mut self, pattern: ChannelPattern, binding: Arc<dyn Binding>) {
        self.rules.push(RouteRule { pattern, binding });
    }

    /// The relay's rule set: Telegram owns `tg:` and numeric ids, the local
    /// binding owns `local:` ids. Anything else does not resolve.
    pub fn standard(telegram: Option<Arc<dyn Binding>>, local: Arc<dyn Binding>) -> Self {
        let mut router = Self::new();
        if let Some(telegram) = telegram {
            router.add_rule(ChannelPattern::Prefix(TELEGRAM_PREFIX.to_string()), Arc::clone(&telegram));
            router.add_rule(ChannelPattern::Numeric, telegram);
        }
        router.add_rule(ChannelPattern::Prefix(LOCAL_PREFIX.to_string()), local);
        router
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn resolve(&self, channel_id: &str) -> Option<Resolved> {
        self.rules.iter().find_map(|rule| {
            rule.pattern.matches(channel_id).map(|native| Resolved {
                binding: Arc::clone(&rule.binding),
                native_id: native.to_string(),
            })
        })
    }

    /// Send text and attachments. Failures come back as
    /// [`SendOutcome::Failed`], never as an error.
    pub async fn send(&self, request: &SendRequest) -> SendOutcome {
        let channel_id = request.channel_id.as_str();
        let Some(Resolved { binding, native_id }) = self.resolve(channel_id) else {
            warn!(channel_id = %channel_id, "No binding matches conversation id");
            return SendOutcome::failed(channel_id, "no binding matches this conversation id");
        };

        if request.text.trim().is_empty() && request.attachments.is_empty() {
            return SendOutcome::failed(channel_id, "nothing to send");
        }

        let mut last = None;
        if !request.text.trim().is_empty() {
            for chunk in split_message(&request.text, binding.max_message_len()) {
                match binding.post(&native_id, &chunk).await {
                    Ok(handle) => last = Some(handle),
                    Err(e) => {
                        warn!(channel_id = %channel_id, error = %e, "Outbound send failed");
                        return SendOutcome::failed(channel_id, e.to_string());
                    }
                }
            }
        }

        for path in &request.attachments {
            let title = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            match binding.upload(&native_id, path, &title).await {
                Ok(handle) => last = Some(handle),
                Err(e) => {
                    warn!(channel_id = %channel_id, path = %path.display(), error = %e, "Outbound upload failed");
                    return SendOutcome::failed(channel_id, e.to_string());
                }
            }
        }

        match last {
            Some(handle) => {
                info!(
                    channel_id = %channel_id,
                    binding = binding.name(),
                    handle = %handle,
                    "Outbound message sent"
                );
                SendOutcome::Sent {
                    destination: channel_id.to_string(),
                    binding: binding.name().to_string(),
                    handle,
                }
            }
            None => SendOutcome::failed(channel_id, "nothing to send"),
        }
    }
}

/// Gateway route exposing [`CrossChannelRouter::send`] as `POST` JSON.
pub struct SendRoute {
    router: Arc<CrossChannelRouter>,
    secret: Option<SecretString>,
}

impl SendRoute {
    pub fn new(router: Arc<CrossChannelRouter>) -> Self {
        Self {
            router,
            secret: None,
        }
    }

    /// Require [`SEND_SECRET_HEADER`] to carry this secret.
    pub fn with_secret(mut self, secret: SecretString) -> Self {
        self.secret = Some(secret);
        self
    }
}

#[async_trait]
impl RouteHandler for SendRoute {
    async fn handle(&self, request: InboundRequest) -> Result<Response, GatewayError> {
        if let Some(secret) = &self.secret {
            require_secret(&request.headers, SEND_SECRET_HEADER, secret)?;
        }
        let send: SendRequest =
            serde_json::from_slice(&request.body).map_err(|e| GatewayError::Rejected {
                status: StatusCode::BAD_REQUEST,
                reason: format!("invalid send request: {e}"),
            })?;
        let outcome = self.router.send(&send).await;
        Ok(Json(outcome).into_response())
    }
}
