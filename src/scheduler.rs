//! Scheduled triggers: cron expressions that feed synthetic events into the
//! bounded external queue.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::channels::CanonicalEvent;
use crate::error::ConfigError;
use crate::hub::ChannelHub;
use crate::router::CrossChannelRouter;

/// Shortest period the ticker accepts.
const MIN_TICK: Duration = Duration::from_secs(1);

/// One configured schedule.
#[derive(Debug, Clone)]
pub struct ScheduledTrigger {
    pub name: String,
    pub channel_id: String,
    pub text: String,
    schedule: cron::Schedule,
    next_fire: Option<DateTime<Utc>>,
}

impl ScheduledTrigger {
    pub fn new(
        name: &str,
        channel_id: &str,
        expression: &str,
        text: &str,
    ) -> Result<Self, ConfigError> {
        let schedule =
            cron::Schedule::from_str(expression).map_err(|e| ConfigError::InvalidSchedule {
                name: name.to_string(),
                reason: format!("invalid cron '{expression}': {e}"),
            })?;
        Ok(Self {
            name: name.to_string(),
            channel_id: channel_id.to_string(),
            text: text.to_string(),
            schedule,
            next_fire: None,
        })
    }

    pub fn next_fire(&self) -> Option<DateTime<Utc>> {
        self.next_fire
    }

    /// Advance to `now`; returns whether the trigger is due.
    ///
    /// The first call only computes the next fire time.
    fn poll(&mut self, now: DateTime<Utc>) -> bool {
        let due = self.next_fire.is_some_and(|next| next <= now);
        if due || self.next_fire.is_none() {
            self.next_fire = self.schedule.after(&now).next();
        }
        due
    }
}

/// Parse `name|channel|cron|text` entries separated by `;`.
pub fn parse_schedules(raw: &str) -> Result<Vec<ScheduledTrigger>, ConfigError> {
    raw.split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let parts: Vec<&str> = entry.splitn(4, '|').map(str::trim).collect();
            match parts.as_slice() {
                [name, channel, expression, text]
                    if !name.is_empty() && !channel.is_empty() && !text.is_empty() =>
                {
                    ScheduledTrigger::new(name, channel, expression, text)
                }
                _ => Err(ConfigError::InvalidSchedule {
                    name: parts.first().copied().unwrap_or_default().to_string(),
                    reason: format!("expected name|channel|cron|text, got '{entry}'"),
                }),
            }
        })
        .collect()
}

/// Checks triggers and submits the due ones.
pub struct ScheduleTicker {
    triggers: Vec<ScheduledTrigger>,
    hub: Arc<ChannelHub>,
    router: Arc<CrossChannelRouter>,
}

impl ScheduleTicker {
    pub fn new(
        triggers: Vec<ScheduledTrigger>,
        hub: Arc<ChannelHub>,
        router: Arc<CrossChannelRouter>,
    ) -> Self {
        Self {
            triggers,
            hub,
            router,
        }
    }

    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }

    /// Submit every trigger due at `now`. Returns how many were accepted.
    pub fn check(&mut self, now: DateTime<Utc>) -> usize {
        let mut accepted = 0;
        for trigger in &mut self.triggers {
            if !trigger.poll(now) {
                continue;
            }

            let Some(resolved) = self.router.resolve(&trigger.channel_id) else {
                warn!(
                    schedule = %trigger.name,
                    channel_id = %trigger.channel_id,
                    "Scheduled trigger has no binding"
                );
                continue;
            };

            let event = CanonicalEvent::scheduled(&trigger.channel_id, &trigger.text).with_timestamp(now);
            if self.hub.submit_external(resolved.binding, event) {
                info!(schedule = %trigger.name, channel_id = %trigger.channel_id, "Scheduled trigger fired");
                accepted += 1;
            } else {
                warn!(schedule = %trigger.name, channel_id = %trigger.channel_id, "Scheduled trigger rejected");
            }
        }
        accepted
    }
}

/// Spawn the schedule ticker background task.
pub fn spawn_schedule_ticker(
    mut ticker: ScheduleTicker,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    let period = interval.max(MIN_TICK);
    tokio::spawn(async move {
        ticker.check(Utc::now());
        let mut interval = tokio::time::interval(period);
        // Skip immediate first tick
        interval.tick().await;

        loop {
            interval.tick().await;
            let fired = ticker.check(Utc::now());
            if fired > 0 {
                debug!(fired, "Scheduled triggers submitted");
            }
        }
    })
}
