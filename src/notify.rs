use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{NotifyConfig, TelegramConfig};
use crate::error::Result;
use crate::store::ResultStore;
use crate::types::NotificationEvent;

/// Outbound channel for operator notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, text: &str) -> anyhow::Result<()>;
}

/// Writes notifications to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, text: &str) -> anyhow::Result<()> {
        info!(target: "portwatch_rs::notify", "{text}");
        Ok(())
    }
}

const TELEGRAM_TIMEOUT: Duration = Duration::from_secs(10);

/// Posts notifications to a Telegram chat through the Bot API.
#[derive(Debug, Clone)]
pub struct TelegramNotifier {
    client: Client,
    url: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(cfg: &TelegramConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(TELEGRAM_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            url: format!(
                "{}/bot{}/sendMessage",
                cfg.api_base.trim_end_matches('/'),
                cfg.bot_token
            ),
            chat_id: cfg.chat_id.clone(),
        })
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, text: &str) -> anyhow::Result<()> {
        let resp = self
            .client
            .post(&self.url)
            .json(&json!({ "chat_id": self.chat_id, "text": text }))
            .send()
            .await
            // The request URL embeds the bot token.
            .map_err(|e| anyhow::anyhow!("telegram request failed: {}", e.without_url()))?;
        let status = resp.status();
        if !status.is_success() {
            bail!("telegram returned {status}");
        }
        Ok(())
    }
}

pub fn format_event(event: &NotificationEvent) -> String {
    match event.kind.as_str() {
        "new_port" => {
            let field = |k: &str| match event.payload.get(k) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => String::new(),
                Some(v) => v.to_string(),
            };
            let service = field("service");
            let service = if service.is_empty() { "unknown".to_string() } else { service };
            format!("New open port {}:{} ({service})", field("ip"), field("port"))
        }
        other => format!("event: {other}"),
    }
}

/// Polls the store's event log and forwards undelivered events.
pub struct DeliveryWorker {
    store: Arc<dyn ResultStore>,
    notifier: Arc<dyn Notifier>,
    interval: Duration,
    batch_size: u32,
}

impl DeliveryWorker {
    pub fn new(store: Arc<dyn ResultStore>, notifier: Arc<dyn Notifier>, cfg: &NotifyConfig) -> Self {
        Self {
            store,
            notifier,
            interval: Duration::from_secs(cfg.poll_interval_secs.max(1)),
            batch_size: cfg.batch_size.max(1),
        }
    }

    /// Poll until `cancel` fires. Returns at once if the backend keeps no log.
    pub async fn run(self, cancel: CancellationToken) {
        if self.store.notifications().is_none() {
            info!("storage backend has no event log; delivery worker not started");
            return;
        }
        info!(interval = ?self.interval, "delivery worker started");

        let mut ticker = time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.deliver_pending().await {
                        error!("delivery worker fetch failed: {e}");
                    }
                }
            }
        }
        info!("delivery worker stopped");
    }

    /// One polling round. Returns how many events were delivered.
    pub async fn deliver_pending(&self) -> Result<usize> {
        let Some(sink) = self.store.notifications() else {
            return Ok(0);
        };

        let mut delivered = 0;
        for event in sink.list_undelivered(self.batch_size).await? {
            let text = format_event(&event);
            if let Err(e) = self.notifier.send(&text).await {
                warn!(event_id = event.id, "notification send failed: {e}");
                continue;
            }
            match sink.mark_delivered(event.id).await {
                Ok(()) => delivered += 1,
                Err(e) => error!(event_id = event.id, "failed to mark event delivered: {e}"),
            }
        }
        Ok(delivered)
    }
}
