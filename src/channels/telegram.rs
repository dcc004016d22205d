//! Telegram binding: Bot API message primitives and webhook normalization.
//!
//! Conversation ids are `tg:<chat_id>`; the bare numeric chat id is accepted
//! too so routed sends can pass the platform-native form.

use std::path::Path;
use std::sync::OnceLock;

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use reqwest::multipart::{Form, Part};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;

use crate::channels::binding::{Binding, MessageHandle, split_message};
use crate::channels::event::{Attachment, CanonicalEvent, EventKind};
use crate::channels::Inbound;
use crate::error::ChannelError;
use crate::gateway::constant_time_eq;

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

/// Header Telegram echoes back on every webhook call.
const SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

/// Prefix of Telegram conversation ids.
pub const TELEGRAM_PREFIX: &str = "tg:";

/// Telegram binding that talks to the Bot API over HTTPS.
pub struct TelegramBinding {
    bot_token: SecretString,
    webhook_secret: Option<SecretString>,
    allowed_users: Vec<String>,
    api_base: String,
    bot_username: OnceLock<String>,
    client: reqwest::Client,
}

/// A failed Bot API call.
struct ApiFailure {
    status: u16,
    description: String,
}

impl TelegramBinding {
    pub fn new(bot_token: SecretString, allowed_users: Vec<String>) -> Self {
        Self {
            bot_token,
            webhook_secret: None,
            allowed_users,
            api_base: "https://api.telegram.org".to_string(),
            bot_username: OnceLock::new(),
            client: reqwest::Client::new(),
        }
    }

    /// Require webhook calls to carry this secret token.
    pub fn with_webhook_secret(mut self, secret: SecretString) -> Self {
        self.webhook_secret = Some(secret);
        self
    }

    /// Point the binding at a different Bot API host.
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into().trim_end_matches('/').to_string();
        self
    }

    /// Set the bot's username up front instead of discovering it in `connect`.
    pub fn with_bot_username(self, username: impl Into<String>) -> Self {
        let _ = self.bot_username.set(username.into());
        self
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.api_base,
            self.bot_token.expose_secret()
        )
    }

    /// Check if a username is in the allowed list.
    pub fn is_user_allowed(&self, username: &str) -> bool {
        self.allowed_users.iter().any(|u| u == "*" || u == username)
    }

    /// Check if any of the provided identities is allowed.
    pub fn is_any_user_allowed<'a, I>(&self, identities: I) -> bool
    where
        I: IntoIterator<Item = &'a str>,
    {
        identities.into_iter().any(|id| self.is_user_allowed(id))
    }

    /// Verify the bot token with `getMe` and remember the bot's username.
    ///
    /// The gateway route for this binding should only be marked ready after
    /// this succeeds.
    pub async fn connect(&self) -> Result<(), ChannelError> {
        let me = self
            .call("getMe", &serde_json::json!({}))
            .await
            .map_err(|f| ChannelError::StartupFailed {
                name: "telegram".into(),
                reason: format!("getMe returned {}: {}", f.status, f.description),
            })?;

        if let Some(username) = me.get("username").and_then(Value::as_str) {
            let _ = self.bot_username.set(username.to_string());
        }
        tracing::info!(
            bot = self.bot_username.get().map(String::as_str).unwrap_or("unknown"),
            "Telegram binding connected"
        );
        Ok(())
    }

    /// Call a Bot API method and return its `result` field.
    async fn call(&self, method: &str, body: &Value) -> Result<Value, ApiFailure> {
        let resp = self
            .client
            .post(self.api_url(method))
            .json(body)
            .send()
            .await
            .map_err(|e| ApiFailure {
                status: 0,
                description: e.to_string(),
            })?;
        Self::parse_response(resp).await
    }

    async fn parse_response(resp: reqwest::Response) -> Result<Value, ApiFailure> {
        let status = resp.status().as_u16();
        let data: Value = resp.json().await.map_err(|e| ApiFailure {
            status,
            description: format!("unreadable response: {e}"),
        })?;

        if data.get("ok").and_then(Value::as_bool) == Some(true) {
            Ok(data.get("result").cloned().unwrap_or(Value::Null))
        } else {
            Err(ApiFailure {
                status,
                description: data
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            })
        }
    }

    /// Send a single chunk, Markdown first with plain-text fallback.
    async fn send_chunk(
        &self,
        chat_id: &str,
        text: &str,
        reply_to: Option<&MessageHandle>,
    ) -> Result<MessageHandle, ChannelError> {
        let mut body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "Markdown",
        });
        if let Some(parent) = reply_to {
            body["reply_to_message_id"] = Value::String(parent.to_string());
        }

        let result = match self.call("sendMessage", &body).await {
            Ok(result) => result,
            Err(markdown) if markdown.status == 429 => {
                return Err(ChannelError::RateLimited {
                    name: "telegram".into(),
                });
            }
            Err(markdown) => {
                tracing::warn!(
                    status = markdown.status,
                    "Telegram sendMessage with Markdown failed; retrying without parse_mode"
                );
                if let Some(obj) = body.as_object_mut() {
                    obj.remove("parse_mode");
                }
                self.call("sendMessage", &body)
                    .await
                    .map_err(|plain| ChannelError::SendFailed {
                        name: "telegram".into(),
                        reason: format!(
                            "sendMessage failed (markdown: {}, plain: {})",
                            markdown.description, plain.description
                        ),
                    })?
            }
        };

        message_handle(&result).ok_or_else(|| ChannelError::SendFailed {
            name: "telegram".into(),
            reason: "sendMessage returned no message_id".into(),
        })
    }

    /// Turn a webhook update into a canonical event.
    ///
    /// Returns `Ok(None)` for updates the relay does not act on: non-message
    /// updates, unauthorized users, group chatter not addressed to the bot.
    pub fn normalize_update(&self, update: &Value) -> Result<Option<CanonicalEvent>, ChannelError> {
        let Some(message) = update.get("message") else {
            return Ok(None);
        };

        let text = message
            .get("text")
            .or_else(|| message.get("caption"))
            .and_then(Value::as_str)
            .unwrap_or_default();

        let chat = message
            .get("chat")
            .ok_or_else(|| ChannelError::InvalidMessage("message without chat".into()))?;
        let chat_id = chat
            .get("id")
            .and_then(Value::as_i64)
            .ok_or_else(|| ChannelError::InvalidMessage("chat without numeric id".into()))?;

        let from = message.get("from");
        let username = from
            .and_then(|f| f.get("username"))
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        let user_id = from
            .and_then(|f| f.get("id"))
            .and_then(Value::as_i64)
            .map(|id| id.to_string());

        let is_allowed = {
            let mut identities = vec![username];
            if let Some(ref id) = user_id {
                identities.push(id.as_str());
            }
            self.is_any_user_allowed(identities)
        };
        if !is_allowed {
            tracing::warn!(
                username,
                user_id = user_id.as_deref().unwrap_or("unknown"),
                "Telegram: ignoring message from unauthorized user"
            );
            return Ok(None);
        }

        let attachments = collect_attachments(message);
        if text.is_empty() && attachments.is_empty() {
            return Ok(None);
        }

        let kind = if chat.get("type").and_then(Value::as_str) == Some("private") {
            EventKind::DirectMessage
        } else if self.addresses_bot(message, text) {
            EventKind::Mention
        } else {
            return Ok(None);
        };

        let timestamp = message
            .get("date")
            .and_then(Value::as_i64)
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
            .unwrap_or_else(Utc::now);

        let mut event = CanonicalEvent::new(
            kind,
            format!("{TELEGRAM_PREFIX}{chat_id}"),
            user_id.as_deref().unwrap_or(username),
            self.strip_mention(text),
        )
        .with_timestamp(timestamp);
        for attachment in attachments {
            event = event.with_attachment(attachment);
        }
        Ok(Some(event))
    }

    fn addresses_bot(&self, message: &Value, text: &str) -> bool {
        let replied_to_bot = message
            .get("reply_to_message")
            .and_then(|r| r.get("from"))
            .and_then(|f| f.get("is_bot"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let mentioned = self
            .bot_username
            .get()
            .is_some_and(|name| text.contains(&format!("@{name}")));
        replied_to_bot || mentioned
    }

    fn strip_mention(&self, text: &str) -> String {
        match self.bot_username.get() {
            Some(name) => text.replace(&format!("@{name}"), "").trim().to_string(),
            None => text.trim().to_string(),
        }
    }

    fn verify_secret(&self, headers: &HeaderMap) -> Result<(), ChannelError> {
        let Some(expected) = &self.webhook_secret else {
            return Ok(());
        };
        let provided = headers
            .get(SECRET_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if constant_time_eq(provided.as_bytes(), expected.expose_secret().as_bytes()) {
            Ok(())
        } else {
            Err(ChannelError::AuthFailed {
                name: "telegram".into(),
                reason: "webhook secret token mismatch".into(),
            })
        }
    }
}

// ── Binding implementation ──────────────────────────────────────────

#[async_trait]
impl Binding for TelegramBinding {
    fn name(&self) -> &str {
        "telegram"
    }

    fn max_message_len(&self) -> usize {
        TELEGRAM_MAX_MESSAGE_LENGTH
    }

    fn formatting_instructions(&self) -> &str {
        "Format replies with Telegram Markdown: *bold*, _italic_, `code`. \
         No tables or headings."
    }

    async fn post(&self, channel_id: &str, text: &str) -> Result<MessageHandle, ChannelError> {
        let chars = text.chars().count();
        if chars > TELEGRAM_MAX_MESSAGE_LENGTH {
            return Err(ChannelError::SendFailed {
                name: "telegram".into(),
                reason: format!("message is {chars} characters, limit is {TELEGRAM_MAX_MESSAGE_LENGTH}"),
            });
        }
        self.send_chunk(chat_id(channel_id), text, None).await
    }

    async fn edit(
        &self,
        channel_id: &str,
        handle: &MessageHandle,
        text: &str,
    ) -> Result<(), ChannelError> {
        let chars = text.chars().count();
        if chars > TELEGRAM_MAX_MESSAGE_LENGTH {
            return Err(ChannelError::EditFailed {
                name: "telegram".into(),
                handle: handle.to_string(),
                reason: format!("text is {chars} characters, limit is {TELEGRAM_MAX_MESSAGE_LENGTH}"),
            });
        }

        let body = serde_json::json!({
            "chat_id": chat_id(channel_id),
            "message_id": handle.as_str(),
            "text": text,
        });

        match self.call("editMessageText", &body).await {
            Ok(_) => Ok(()),
            // Editing to identical text is a no-op, not a failure.
            Err(f) if f.description.contains("message is not modified") => Ok(()),
            Err(f) if f.status == 429 => Err(ChannelError::RateLimited {
                name: "telegram".into(),
            }),
            Err(f) if f.description.contains("message to edit not found") => {
                Err(ChannelError::MessageNotFound {
                    name: "telegram".into(),
                    handle: handle.to_string(),
                })
            }
            Err(f) => Err(ChannelError::EditFailed {
                name: "telegram".into(),
                handle: handle.to_string(),
                reason: f.description,
            }),
        }
    }

    async fn delete(&self, channel_id: &str, handle: &MessageHandle) -> Result<(), ChannelError> {
        let body = serde_json::json!({
            "chat_id": chat_id(channel_id),
            "message_id": handle.as_str(),
        });

        match self.call("deleteMessage", &body).await {
            Ok(_) => Ok(()),
            Err(f) if f.description.contains("not found") => Err(ChannelError::MessageNotFound {
                name: "telegram".into(),
                handle: handle.to_string(),
            }),
            Err(f) => Err(ChannelError::SendFailed {
                name: "telegram".into(),
                reason: format!("deleteMessage failed: {}", f.description),
            }),
        }
    }

    async fn upload(
        &self,
        channel_id: &str,
        path: &Path,
        title: &str,
    ) -> Result<MessageHandle, ChannelError> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();

        let file_bytes = tokio::fs::read(path).await?;
        let part = Part::bytes(file_bytes).file_name(file_name.clone());

        let mut form = Form::new()
            .text("chat_id", chat_id(channel_id).to_string())
            .part("document", part);
        if !title.is_empty() {
            form = form.text("caption", title.to_string());
        }

        let resp = self
            .client
            .post(self.api_url("sendDocument"))
            .multipart(form)
            .send()
            .await
            .map_err(|e| ChannelError::UploadFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })?;

        let result = Self::parse_response(resp)
            .await
            .map_err(|f| ChannelError::UploadFailed {
                name: "telegram".into(),
                reason: f.description,
            })?;

        tracing::info!(channel_id, file = %file_name, "Telegram document sent");
        message_handle(&result).ok_or_else(|| ChannelError::UploadFailed {
            name: "telegram".into(),
            reason: "sendDocument returned no message_id".into(),
        })
    }

    async fn typing(&self, channel_id: &str) -> Result<(), ChannelError> {
        let body = serde_json::json!({
            "chat_id": chat_id(channel_id),
            "action": "typing",
        });
        self.call("sendChatAction", &body)
            .await
            .map(|_| ())
            .map_err(|f| ChannelError::SendFailed {
                name: "telegram".into(),
                reason: format!("sendChatAction failed: {}", f.description),
            })
    }

    async fn detail(
        &self,
        channel_id: &str,
        parent: Option<&MessageHandle>,
        text: &str,
    ) -> Result<(), ChannelError> {
        // Telegram has no collapsible blocks: detail goes out as replies.
        for chunk in split_message(text, TELEGRAM_MAX_MESSAGE_LENGTH) {
            self.send_chunk(chat_id(channel_id), &chunk, parent).await?;
        }
        Ok(())
    }
}

impl Inbound for TelegramBinding {
    fn normalize(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<Option<CanonicalEvent>, ChannelError> {
        self.verify_secret(headers)?;
        let update: Value = serde_json::from_slice(body)
            .map_err(|e| ChannelError::InvalidMessage(format!("invalid update JSON: {e}")))?;
        self.normalize_update(&update)
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Bot API chat id for a conversation id.
fn chat_id(channel_id: &str) -> &str {
    channel_id.strip_prefix(TELEGRAM_PREFIX).unwrap_or(channel_id)
}

fn message_handle(result: &Value) -> Option<MessageHandle> {
    result
        .get("message_id")
        .and_then(Value::as_i64)
        .map(|id| MessageHandle::new(id.to_string()))
}

fn collect_attachments(message: &Value) -> Vec<Attachment> {
    let mut attachments = Vec::new();
    if let Some(doc) = message.get("document") {
        attachments.push(Attachment {
            name: doc
                .get("file_name")
                .and_then(Value::as_str)
                .unwrap_or("document")
                .to_string(),
            url: doc
                .get("file_id")
                .and_then(Value::as_str)
                .map(|id| format!("telegram-file:{id}")),
            mime_type: doc
                .get("mime_type")
                .and_then(Value::as_str)
                .map(String::from),
        });
    }
    if let Some(largest) = message
        .get("photo")
        .and_then(Value::as_array)
        .and_then(|sizes| sizes.last())
    {
        attachments.push(Attachment {
            name: "photo.jpg".to_string(),
            url: largest
                .get("file_id")
                .and_then(Value::as_str)
                .map(|id| format!("telegram-file:{id}")),
            mime_type: Some("image/jpeg".to_string()),
        });
    }
    attachments
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn binding(allowed: &[&str]) -> TelegramBinding {
        TelegramBinding::new(
            SecretString::from("123:ABC"),
            allowed.iter().map(|s| s.to_string()).collect(),
        )
        .with_bot_username("relay_bot")
    }

    fn private_update(text: &str) -> Value {
        serde_json::json!({
            "update_id": 1,
            "message": {
                "message_id": 10,
                "date": 1_700_000_000,
                "chat": {"id": 4242, "type": "private"},
                "from": {"id": 77, "username": "alice", "is_bot": false},
                "text": text,
            }
        })
    }

    #[test]
    fn telegram_binding_name() {
        assert_eq!(binding(&["*"]).name(), "telegram");
    }

    #[test]
    fn telegram_api_url() {
        assert_eq!(
            binding(&[]).api_url("getMe"),
            "https://api.telegram.org/bot123:ABC/getMe"
        );
    }

    #[test]
    fn telegram_api_base_override() {
        let b = binding(&[]).with_api_base("http://127.0.0.1:9/");
        assert_eq!(b.api_url("getMe"), "http://127.0.0.1:9/bot123:ABC/getMe");
    }

    // ── User allowlist tests ────────────────────────────────────────

    #[test]
    fn telegram_user_allowed_wildcard() {
        assert!(binding(&["*"]).is_user_allowed("anyone"));
    }

    #[test]
    fn telegram_user_allowed_specific() {
        let b = binding(&["alice", "bob"]);
        assert!(b.is_user_allowed("alice"));
        assert!(!b.is_user_allowed("eve"));
    }

    #[test]
    fn telegram_user_exact_match_not_substring() {
        let b = binding(&["alice"]);
        assert!(!b.is_user_allowed("alice_bot"));
        assert!(!b.is_user_allowed("malice"));
    }

    #[test]
    fn telegram_user_allowed_by_numeric_id_identity() {
        assert!(binding(&["123456789"]).is_any_user_allowed(["unknown", "123456789"]));
    }

    // ── Normalization tests ─────────────────────────────────────────

    #[test]
    fn private_message_is_direct_message() {
        let event = binding(&["*"])
            .normalize_update(&private_update("hello"))
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, EventKind::DirectMessage);
        assert_eq!(event.channel_id, "tg:4242");
        assert_eq!(event.user_id, "77");
        assert_eq!(event.text, "hello");
        assert_eq!(event.timestamp.timestamp(), 1_700_000_000);
    }

    #[test]
    fn group_mention_is_stripped() {
        let update = serde_json::json!({
            "message": {
                "chat": {"id": -100, "type": "supergroup"},
                "from": {"id": 77, "username": "alice"},
                "text": "@relay_bot what's up",
            }
        });
        let event = binding(&["*"]).normalize_update(&update).unwrap().unwrap();
        assert_eq!(event.kind, EventKind::Mention);
        assert_eq!(event.channel_id, "tg:-100");
        assert_eq!(event.text, "what's up");
    }

    #[test]
    fn unaddressed_group_chatter_is_ignored() {
        let update = serde_json::json!({
            "message": {
                "chat": {"id": -100, "type": "group"},
                "from": {"id": 77, "username": "alice"},
                "text": "just talking",
            }
        });
        assert!(binding(&["*"]).normalize_update(&update).unwrap().is_none());
    }

    #[test]
    fn unauthorized_user_is_ignored() {
        let b = binding(&["bob"]);
        assert!(b.normalize_update(&private_update("hi")).unwrap().is_none());
    }

    #[test]
    fn non_message_update_is_ignored() {
        let update = serde_json::json!({"update_id": 5, "edited_message": {}});
        assert!(binding(&["*"]).normalize_update(&update).unwrap().is_none());
    }

    #[test]
    fn document_becomes_attachment() {
        let update = serde_json::json!({
            "message": {
                "chat": {"id": 1, "type": "private"},
                "from": {"id": 77},
                "caption": "see file",
                "document": {"file_id": "F1", "file_name": "report.pdf", "mime_type": "application/pdf"},
            }
        });
        let event = binding(&["*"]).normalize_update(&update).unwrap().unwrap();
        assert_eq!(event.text, "see file");
        assert_eq!(event.attachments.len(), 1);
        assert_eq!(event.attachments[0].name, "report.pdf");
    }

    #[test]
    fn secret_mismatch_is_auth_failure() {
        let b = binding(&["*"]).with_webhook_secret(SecretString::from("s3cret"));
        let body = serde_json::to_vec(&private_update("hi")).unwrap();

        let err = b.normalize(&HeaderMap::new(), &body).unwrap_err();
        assert!(matches!(err, ChannelError::AuthFailed { .. }));

        let mut headers = HeaderMap::new();
        headers.insert(SECRET_HEADER, HeaderValue::from_static("s3cret"));
        assert!(b.normalize(&headers, &body).unwrap().is_some());
    }

    #[test]
    fn malformed_body_is_invalid_message() {
        let err = binding(&["*"])
            .normalize(&HeaderMap::new(), b"{not json")
            .unwrap_err();
        assert!(matches!(err, ChannelError::InvalidMessage(_)));
    }

    #[test]
    fn chat_id_strips_prefix() {
        assert_eq!(chat_id("tg:-1001"), "-1001");
        assert_eq!(chat_id("4242"), "4242");
    }

    // ── Network error tests (expected to fail with no server) ───────

    #[tokio::test]
    async fn post_without_server_is_send_failure() {
        let b = binding(&["*"]).with_api_base("http://127.0.0.1:9");
        let err = b.post("tg:1", "hello").await.unwrap_err();
        assert!(matches!(err, ChannelError::SendFailed { .. }));
    }

    #[tokio::test]
    async fn upload_nonexistent_file_is_io_error() {
        let b = binding(&["*"]);
        let err = b
            .upload("tg:1", Path::new("/nonexistent/path/file.txt"), "t")
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Io(_)));
    }

    // ── Size limit tests ────────────────────────────────────────────

    #[tokio::test]
    async fn oversized_post_is_rejected_before_any_call() {
        // Unroutable base: a request would fail differently.
        let b = binding(&["*"]).with_api_base("http://127.0.0.1:9");
        let err = b.post("tg:1", &"x".repeat(4097)).await.unwrap_err();
        assert!(
            matches!(&err, ChannelError::SendFailed { reason, .. } if reason.contains("limit is 4096")),
            "got {err:?}"
        );
    }

    #[tokio::test]
    async fn oversized_edit_is_an_error_not_a_truncation() {
        let b = binding(&["*"]).with_api_base("http://127.0.0.1:9");
        let err = b
            .edit("tg:1", &MessageHandle::new("5"), &"y".repeat(6000))
            .await
            .unwrap_err();
        assert!(
            matches!(&err, ChannelError::EditFailed { reason, .. } if reason.contains("6000 characters")),
            "got {err:?}"
        );
    }
}
