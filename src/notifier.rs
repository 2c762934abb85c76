//! Operator notifications.
//!
//! A [`Notifier`] forwards [`NotificationEvent`]s to a [`NotificationChannel`]
//! (a Discord webhook in production). Delivery failures are logged and
//! swallowed. Events that carry a screenshot are fingerprinted, and an
//! identical image already delivered within the dedup window is not sent
//! again.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::multipart::{Form, Part};
use serde::Serialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// How long an image fingerprint suppresses identical sends.
pub const DEDUP_WINDOW: Duration = Duration::from_secs(30);

const DEDUP_CAPACITY: usize = 64;
const SCREENSHOT_NAME: &str = "screenshot.png";
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Monotonic time source for the dedup window.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Bounded, time-windowed record of recently delivered image fingerprints.
#[derive(Debug)]
pub struct DedupWindow {
    window: Duration,
    capacity: usize,
    recent: VecDeque<(String, Instant)>,
}

impl DedupWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            capacity: DEDUP_CAPACITY,
            recent: VecDeque::new(),
        }
    }

    pub fn fingerprint(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    /// Whether `fingerprint` was recorded less than a window before `now`.
    pub fn is_duplicate(&mut self, fingerprint: &str, now: Instant) -> bool {
        self.evict(now);
        self.recent.iter().any(|(seen, _)| seen == fingerprint)
    }

    pub fn record(&mut self, fingerprint: String, now: Instant) {
        self.evict(now);
        if self.recent.len() == self.capacity {
            self.recent.pop_front();
        }
        self.recent.push_back((fingerprint, now));
    }

    pub fn len(&self) -> usize {
        self.recent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recent.is_empty()
    }

    fn evict(&mut self, now: Instant) {
        while let Some((_, at)) = self.recent.front() {
            if now.saturating_duration_since(*at) >= self.window {
                self.recent.pop_front();
            } else {
                break;
            }
        }
    }
}

impl Default for DedupWindow {
    fn default() -> Self {
        Self::new(DEDUP_WINDOW)
    }
}

/// What a notification is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Checkpoint,
    Challenge,
    ElementNotFound,
    Restricted,
    ForcedBypass,
    AmountAmbiguous,
    PaymentRefused,
    Failure,
    Summary,
}

impl NotificationKind {
    pub fn title(self) -> &'static str {
        match self {
            NotificationKind::Checkpoint => "Renewal: checkpoint",
            NotificationKind::Challenge => "Renewal: security challenge",
            NotificationKind::ElementNotFound => "Renewal: element not found",
            NotificationKind::Restricted => "Renewal restricted",
            NotificationKind::ForcedBypass => "Renewal restricted (forced bypass)",
            NotificationKind::AmountAmbiguous => "Renewal: invoice amount unknown",
            NotificationKind::PaymentRefused => "Renewal: payment not attempted",
            NotificationKind::Failure => "Renewal: failure",
            NotificationKind::Summary => "Renewal summary",
        }
    }

    fn color(self) -> u32 {
        match self {
            NotificationKind::Checkpoint | NotificationKind::Summary => 0x3498db,
            NotificationKind::ForcedBypass
            | NotificationKind::AmountAmbiguous
            | NotificationKind::PaymentRefused => 0xf1c40f,
            _ => 0xe74c3c,
        }
    }
}

/// Outbound alert with optional screenshot.
#[derive(Clone, PartialEq)]
pub struct NotificationEvent {
    pub kind: NotificationKind,
    pub message: String,
    pub fields: Vec<(String, String)>,
    pub image: Option<Vec<u8>>,
    pub timestamp: DateTime<Utc>,
}

impl NotificationEvent {
    pub fn new(kind: NotificationKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            fields: Vec::new(),
            image: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    pub fn with_image(mut self, png: Vec<u8>) -> Self {
        self.image = Some(png);
        self
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Discord embed for this event.
    pub fn embed(&self) -> Value {
        let fields: Vec<Value> = self
            .fields
            .iter()
            .map(|(name, value)| json!({ "name": name, "value": value }))
            .collect();
        let mut embed = json!({
            "title": self.kind.title(),
            "description": self.message,
            "color": self.kind.color(),
            "timestamp": self.timestamp.to_rfc3339(),
            "fields": fields,
        });
        if self.image.is_some() {
            embed["image"] = json!({ "url": format!("attachment://{SCREENSHOT_NAME}") });
        }
        embed
    }
}

impl fmt::Debug for NotificationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationEvent")
            .field("kind", &self.kind)
            .field("message", &self.message)
            .field("fields", &self.fields)
            .field("image_bytes", &self.image.as_ref().map(Vec::len))
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("webhook responded with {status}: {body}")]
    Status { status: u16, body: String },
    #[error("notification channel error: {0}")]
    Message(String),
}

/// Destination for notifications.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn deliver(&self, event: &NotificationEvent) -> Result<(), NotifyError>;
}

/// Discord (or Discord-compatible) incoming webhook.
#[derive(Debug, Clone)]
pub struct DiscordWebhook {
    client: reqwest::Client,
    url: String,
}

impl DiscordWebhook {
    pub fn new(url: impl Into<String>) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()?;
        Ok(Self::with_client(client, url))
    }

    pub fn with_client(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl NotificationChannel for DiscordWebhook {
    async fn deliver(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        let payload = json!({ "embeds": [event.embed()] });

        let request = match &event.image {
            Some(png) => {
                let form = Form::new().text("payload_json", payload.to_string()).part(
                    "files[0]",
                    Part::bytes(png.clone())
                        .file_name(SCREENSHOT_NAME)
                        .mime_str("image/png")?,
                );
                self.client.post(&self.url).multipart(form)
            }
            None => self.client.post(&self.url).json(&payload),
        };

        let response = request.send().await?;
        let status = response.status();
        if status.as_u16() >= 400 {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// What happened to one [`Notifier::notify`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Suppressed,
    Failed,
    NoChannel,
}

/// Deduplicating front for a notification channel.
pub struct Notifier {
    channel: Option<Arc<dyn NotificationChannel>>,
    clock: Arc<dyn Clock>,
    dedup: Mutex<DedupWindow>,
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier")
            .field("channel", &self.channel.is_some())
            .finish()
    }
}

impl Notifier {
    pub fn new(channel: Arc<dyn NotificationChannel>) -> Self {
        Self::with_clock(Some(channel), Arc::new(SystemClock))
    }

    /// Notifier that only logs; used when no webhook is configured.
    pub fn disabled() -> Self {
        Self::with_clock(None, Arc::new(SystemClock))
    }

    pub fn with_clock(channel: Option<Arc<dyn NotificationChannel>>, clock: Arc<dyn Clock>) -> Self {
        Self {
            channel,
            clock,
            dedup: Mutex::new(DedupWindow::default()),
        }
    }

    /// Build from an optional webhook URL.
    pub fn from_webhook(url: Option<&str>) -> Self {
        match url.map(str::trim).filter(|url| !url.is_empty()) {
            Some(url) => match DiscordWebhook::new(url) {
                Ok(webhook) => Self::new(Arc::new(webhook)),
                Err(err) => {
                    log::warn!("webhook client unavailable, notifications will only be logged: {err}");
                    Self::disabled()
                }
            },
            None => Self::disabled(),
        }
    }

    pub async fn notify(&self, event: NotificationEvent) -> Delivery {
        log::info!(target: "notify", "{}: {}", event.kind.title(), event.message);

        let Some(channel) = &self.channel else {
            return Delivery::NoChannel;
        };

        let fingerprint = event.image.as_deref().map(DedupWindow::fingerprint);
        if let Some(fingerprint) = &fingerprint {
            let now = self.clock.now();
            let duplicate = self
                .dedup
                .lock()
                .map(|mut dedup| dedup.is_duplicate(fingerprint, now))
                .unwrap_or(false);
            if duplicate {
                log::debug!(target: "notify", "suppressed duplicate screenshot {fingerprint}");
                return Delivery::Suppressed;
            }
        }

        match channel.deliver(&event).await {
            Ok(()) => {
                if let Some(fingerprint) = fingerprint {
                    let now = self.clock.now();
                    if let Ok(mut dedup) = self.dedup.lock() {
                        dedup.record(fingerprint, now);
                    }
                }
                Delivery::Sent
            }
            Err(err) => {
                log::warn!(target: "notify", "notification delivery failed: {err}");
                Delivery::Failed
            }
        }
    }
}
