//! Configuration types.

use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default capacity of a conversation's externally-sourced queue.
pub const DEFAULT_EXTERNAL_QUEUE_CAPACITY: usize = 5;

/// How the status message keeps its list of recent entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusWindow {
    /// Keep only the last `n` entries.
    Rolling(usize),
    /// Keep every entry, dropping the oldest once the rendered list would
    /// exceed `max_chars`.
    Trimmed { max_chars: usize },
}

impl StatusWindow {
    /// Parse `rolling:N` or `trimmed:N`.
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        let invalid = |message: &str| ConfigError::InvalidValue {
            key: "RELAY_STATUS_WINDOW".to_string(),
            message: format!("{message}: {value}"),
        };

        let (kind, n) = value
            .split_once(':')
            .ok_or_else(|| invalid("expected rolling:N or trimmed:N"))?;
        let n: usize = n.trim().parse().map_err(|_| invalid("not a number"))?;
        if n == 0 {
            return Err(invalid("must be greater than zero"));
        }

        match kind.trim() {
            "rolling" => Ok(Self::Rolling(n)),
            "trimmed" => Ok(Self::Trimmed { max_chars: n }),
            _ => Err(invalid("unknown window kind")),
        }
    }
}

impl Default for StatusWindow {
    fn default() -> Self {
        Self::Rolling(5)
    }
}

/// Throttling and layout policy for the adapter rendering state machine.
#[derive(Debug, Clone)]
pub struct RenderPolicy {
    /// Minimum interval between two edits of the status message.
    pub min_edit_interval: Duration,
    /// Cadence of live-message edits while streaming.
    pub stream_edit_interval: Duration,
    /// Buffered text length at which streaming starts.
    pub stream_min_chars: usize,
    /// Whether streaming of interim content is enabled at all.
    pub streaming: bool,
    /// First line of the status message.
    pub status_header: String,
    /// Which recent entries the status message shows.
    pub status_window: StatusWindow,
    /// Text of the transient stop indicator.
    pub stopping_text: String,
    /// Text the stop indicator is edited to once the run has ended.
    pub stopped_text: String,
}

impl Default for RenderPolicy {
    fn default() -> Self {
        Self {
            min_edit_interval: Duration::from_millis(300),
            stream_edit_interval: Duration::from_millis(800),
            stream_min_chars: 40,
            streaming: true,
            status_header: "Working…".to_string(),
            status_window: StatusWindow::default(),
            stopping_text: "⏹ Stopping…".to_string(),
            stopped_text: "⏹ Stopped".to_string(),
        }
    }
}

impl RenderPolicy {
    /// Build a policy from `RELAY_*` environment variables, falling back to
    /// defaults for anything unset or unparseable.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let min_edit_interval = env_u64("RELAY_MIN_EDIT_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.min_edit_interval);
        let stream_edit_interval = env_u64("RELAY_STREAM_EDIT_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.stream_edit_interval);
        let stream_min_chars = env_u64("RELAY_STREAM_MIN_CHARS")
            .map(|n| n as usize)
            .unwrap_or(defaults.stream_min_chars);
        let streaming = std::env::var("RELAY_STREAMING")
            .map(|v| !matches!(v.trim(), "0" | "false" | "off"))
            .unwrap_or(defaults.streaming);
        let status_window = match std::env::var("RELAY_STATUS_WINDOW") {
            Ok(v) => StatusWindow::parse(&v)?,
            Err(_) => defaults.status_window,
        };

        Ok(Self {
            min_edit_interval,
            stream_edit_interval,
            stream_min_chars,
            streaming,
            status_window,
            ..defaults
        })
    }
}

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Port of the shared gateway listener.
    pub port: u16,
    /// Maximum accepted request body size in bytes.
    pub max_body_bytes: usize,
    /// Capacity of each conversation's externally-sourced queue.
    pub external_queue_capacity: usize,
    /// Interval at which scheduled triggers are checked.
    pub schedule_tick: Duration,
    /// Rendering policy handed to every run.
    pub render: RenderPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            max_body_bytes: 1024 * 1024,
            external_queue_capacity: DEFAULT_EXTERNAL_QUEUE_CAPACITY,
            schedule_tick: Duration::from_secs(30),
            render: RenderPolicy::default(),
        }
    }
}

impl RelayConfig {
    /// Build a config from `RELAY_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let port = match std::env::var("RELAY_PORT") {
            Ok(v) => v.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: "RELAY_PORT".to_string(),
                message: format!("not a port number: {v}"),
            })?,
            Err(_) => defaults.port,
        };

        let external_queue_capacity = env_u64("RELAY_QUEUE_CAPACITY")
            .map(|n| n as usize)
            .filter(|n| *n > 0)
            .unwrap_or(defaults.external_queue_capacity);

        let schedule_tick = positive_secs(env_u64("RELAY_SCHEDULE_TICK_SECS"))
            .unwrap_or(defaults.schedule_tick);

        Ok(Self {
            port,
            external_queue_capacity,
            schedule_tick,
            render: RenderPolicy::from_env()?,
            ..defaults
        })
    }
}

/// Telegram binding configuration. Present only when a bot token is set.
#[derive(Debug)]
pub struct TelegramConfig {
    pub bot_token: SecretString,
    pub webhook_secret: Option<SecretString>,
    /// Usernames or numeric ids; `*` allows everyone.
    pub allowed_users: Vec<String>,
    pub webhook_path: String,
}

impl TelegramConfig {
    pub fn from_env() -> Option<Self> {
        let bot_token = std::env::var("TELEGRAM_BOT_TOKEN")
            .ok()
            .filter(|t| !t.trim().is_empty())?;

        let allowed_users = parse_list(
            &std::env::var("TELEGRAM_ALLOWED_USERS").unwrap_or_else(|_| "*".to_string()),
        );
        let webhook_secret = std::env::var("TELEGRAM_WEBHOOK_SECRET")
            .ok()
            .filter(|s| !s.is_empty())
            .map(SecretString::from);
        let webhook_path = std::env::var("TELEGRAM_WEBHOOK_PATH")
            .unwrap_or_else(|_| "/hooks/telegram".to_string());

        Some(Self {
            bot_token: SecretString::from(bot_token),
            webhook_secret,
            allowed_users,
            webhook_path,
        })
    }

    pub fn allows_everyone(&self) -> bool {
        self.allowed_users.iter().any(|u| u == "*")
    }
}

/// Split a comma-separated list, dropping blanks.
pub fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Shared secret for `POST /send`. Without one the route is not exposed.
pub fn send_secret_from_env() -> Option<SecretString> {
    std::env::var("RELAY_SEND_SECRET")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .map(SecretString::from)
}

/// A zero period is not a period: timers reject it.
fn positive_secs(value: Option<u64>) -> Option<Duration> {
    value.filter(|n| *n > 0).map(Duration::from_secs)
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rolling_window() {
        assert_eq!(StatusWindow::parse("rolling:3").unwrap(), StatusWindow::Rolling(3));
    }

    #[test]
    fn parse_trimmed_window() {
        assert_eq!(
            StatusWindow::parse("trimmed:1200").unwrap(),
            StatusWindow::Trimmed { max_chars: 1200 }
        );
    }

    #[test]
    fn reject_bad_windows() {
        assert!(StatusWindow::parse("rolling").is_err());
        assert!(StatusWindow::parse("rolling:0").is_err());
        assert!(StatusWindow::parse("sliding:4").is_err());
        assert!(StatusWindow::parse("trimmed:x").is_err());
    }

    #[test]
    fn list_parsing_drops_blanks() {
        assert_eq!(parse_list(" alice, ,bob ,"), vec!["alice", "bob"]);
        assert!(parse_list("").is_empty());
    }

    #[test]
    fn defaults_match_platform_limits() {
        let policy = RenderPolicy::default();
        assert_eq!(policy.min_edit_interval, Duration::from_millis(300));
        assert_eq!(policy.stream_edit_interval, Duration::from_millis(800));

        let config = RelayConfig::default();
        assert_eq!(config.external_queue_capacity, 5);
    }

    #[test]
    fn zero_tick_falls_back_to_default() {
        assert_eq!(positive_secs(Some(0)), None);
        assert_eq!(positive_secs(Some(15)), Some(Duration::from_secs(15)));
        assert_eq!(positive_secs(None), None);
    }
}
