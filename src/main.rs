use std::sync::Arc;

use channel_relay::channels::{Binding, LOCAL_PREFIX, LocalBinding, TelegramBinding};
use channel_relay::config::{self as relay_config, RelayConfig, TelegramConfig};
use channel_relay::engine::EchoEngine;
use channel_relay::gateway::Gateway;
use channel_relay::hub::{ChannelHub, WebhookRoute};
use channel_relay::router::{CrossChannelRouter, SEND_SECRET_HEADER, SendRoute};
use channel_relay::scheduler::{self, ScheduleTicker};

const LOCAL_WEBHOOK_PATH: &str = "/hooks/local";
const SEND_PATH: &str = "/send";

#[tokio::main]
async fn main() -> channel_relay::error::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = RelayConfig::from_env()?;

    eprintln!("📡 Channel Relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Gateway: http://0.0.0.0:{}", config.port);
    eprintln!(
        "   Rendering: edit every {}ms, stream every {}ms, streaming {}",
        config.render.min_edit_interval.as_millis(),
        config.render.stream_edit_interval.as_millis(),
        if config.render.streaming { "on" } else { "off" },
    );

    // ── Hub ─────────────────────────────────────────────────────────────
    let hub = ChannelHub::new(
        Arc::new(EchoEngine::new()),
        config.render.clone(),
        config.external_queue_capacity,
    );

    let mut gateway =
        Gateway::new("channel-relay", config.max_body_bytes).with_coordinator(Arc::clone(hub.coordinator()));
    let mut ready_paths = vec![LOCAL_WEBHOOK_PATH.to_string()];

    // ── Telegram ────────────────────────────────────────────────────────
    let mut telegram = None;
    if let Some(tg) = TelegramConfig::from_env() {
        eprintln!(
            "   Telegram: enabled at {} (allowed: {})",
            tg.webhook_path,
            if tg.allows_everyone() {
                "everyone".to_string()
            } else {
                tg.allowed_users.join(", ")
            }
        );

        let mut binding = TelegramBinding::new(tg.bot_token, tg.allowed_users);
        if let Some(secret) = tg.webhook_secret {
            binding = binding.with_webhook_secret(secret);
        }
        let binding = Arc::new(binding);

        gateway.register(
            &tg.webhook_path,
            Arc::new(WebhookRoute::new(Arc::clone(&binding), Arc::clone(&hub))),
        )?;
        telegram = Some((binding, tg.webhook_path));
    } else {
        eprintln!("   Telegram: disabled (TELEGRAM_BOT_TOKEN not set)");
    }

    // ── Local binding ───────────────────────────────────────────────────
    let local = Arc::new(LocalBinding::new());
    gateway.register(
        LOCAL_WEBHOOK_PATH,
        Arc::new(WebhookRoute::new(Arc::clone(&local), Arc::clone(&hub))),
    )?;
    eprintln!("   Local webhook: {LOCAL_WEBHOOK_PATH} (replies go to the log)");

    // ── Outbound sends ──────────────────────────────────────────────────
    let telegram_binding = telegram
        .as_ref()
        .map(|(binding, _)| Arc::clone(binding) as Arc<dyn Binding>);
    let router = Arc::new(CrossChannelRouter::standard(telegram_binding, local));
    match relay_config::send_secret_from_env() {
        Some(secret) => {
            gateway.register(
                SEND_PATH,
                Arc::new(SendRoute::new(Arc::clone(&router)).with_secret(secret)),
            )?;
            ready_paths.push(SEND_PATH.to_string());
            eprintln!("   Send route: {SEND_PATH} (requires {SEND_SECRET_HEADER}; {LOCAL_PREFIX}* ids go to the log)");
        }
        None => eprintln!("   Send route: disabled (RELAY_SEND_SECRET not set)"),
    }

    // ── Schedules ───────────────────────────────────────────────────────
    let schedules = std::env::var("RELAY_SCHEDULES").unwrap_or_default();
    let triggers = scheduler::parse_schedules(&schedules)?;
    if triggers.is_empty() {
        eprintln!("   Schedules: none");
    } else {
        eprintln!(
            "   Schedules: {} (checked every {}s)",
            triggers.len(),
            config.schedule_tick.as_secs()
        );
        let ticker = ScheduleTicker::new(triggers, Arc::clone(&hub), Arc::clone(&router));
        let _schedule_handle = scheduler::spawn_schedule_ticker(ticker, config.schedule_tick);
    }

    // ── Gateway ─────────────────────────────────────────────────────────
    // A bind failure is the only fatal startup error.
    let handle = gateway.start(config.port).await?;

    if let Some((binding, path)) = telegram {
        match binding.connect().await {
            Ok(()) => ready_paths.push(path),
            Err(e) => tracing::error!(error = %e, "Telegram connect failed; webhook stays unavailable"),
        }
    }
    for path in &ready_paths {
        gateway.mark_ready(path);
    }
    eprintln!("   Listening on {}\n", handle.local_addr());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Ctrl+C received, shutting down...");
        }
        _ = handle.wait() => {}
    }

    Ok(())
}
