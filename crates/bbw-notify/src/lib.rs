//! Change event transports and the fan-out router the reconciler talks to.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bbw_core::{ChangeEvent, Platform};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "bbw-notify";

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const SINK_TIMEOUT: Duration = Duration::from_secs(15);

/// Receives change events. Implementations report delivery errors; callers decide what they mean.
#[async_trait]
pub trait ChangeSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn notify(&self, event: &ChangeEvent) -> anyhow::Result<()>;

    /// Sent once when the watcher starts against an empty store.
    async fn announce_startup(&self, _platforms: &[Platform]) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Plain text of the first-run announcement.
pub fn startup_message(platforms: &[Platform]) -> String {
    let watched = platforms
        .iter()
        .map(Platform::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    if watched.is_empty() {
        return "bbw started: no platforms are monitored".to_string();
    }
    format!("bbw started: monitoring {watched}. New programs and scope changes will be reported here.")
}

/// Transport settings as they appear under `notify:` in the watcher config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default = "default_log")]
    pub log: bool,
    #[serde(default)]
    pub discord_webhook: Option<String>,
    #[serde(default)]
    pub telegram: Option<TelegramConfig>,
    #[serde(default)]
    pub webhooks: Vec<String>,
}

fn default_log() -> bool {
    true
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            log: true,
            discord_webhook: None,
            telegram: None,
            webhooks: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: String,
}

/// Writes every event as one structured log line.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait]
impl ChangeSink for LogSink {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn notify(&self, event: &ChangeEvent) -> anyhow::Result<()> {
        info!(
            platform = %event.program.platform,
            kind = ?event.kind,
            program = %event.program.name,
            key = %event.program.key,
            "{}",
            event.summary()
        );
        Ok(())
    }

    async fn announce_startup(&self, platforms: &[Platform]) -> anyhow::Result<()> {
        info!(platforms = platforms.len(), "{}", startup_message(platforms));
        Ok(())
    }
}

async fn post_json(http: &reqwest::Client, url: &str, payload: &serde_json::Value, transport: &str) -> anyhow::Result<()> {
    let resp = http.post(url).json(payload).send().await?;
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        warn!(status = %status, body = %body, transport, "sink returned non-success");
        anyhow::bail!("{transport} returned {status}");
    }
    Ok(())
}

/// Generic webhook: POSTs the serialized event as-is.
#[derive(Debug, Clone)]
pub struct WebhookSink {
    url: String,
    http: reqwest::Client,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>, http: reqwest::Client) -> Self {
        Self { url: url.into(), http }
    }
}

#[async_trait]
impl ChangeSink for WebhookSink {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn notify(&self, event: &ChangeEvent) -> anyhow::Result<()> {
        let payload = serde_json::to_value(event).context("serialize change event")?;
        post_json(&self.http, &self.url, &payload, self.name()).await
    }

    async fn announce_startup(&self, platforms: &[Platform]) -> anyhow::Result<()> {
        post_json(&self.http, &self.url, &WebhookSink::startup_payload(platforms), self.name()).await
    }
}

impl WebhookSink {
    pub fn startup_payload(platforms: &[Platform]) -> serde_json::Value {
        json!({ "kind": "startup", "platforms": platforms })
    }
}

#[derive(Debug, Clone)]
pub struct DiscordSink {
    webhook_url: String,
    http: reqwest::Client,
}

impl DiscordSink {
    pub fn new(webhook_url: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            webhook_url: webhook_url.into(),
            http,
        }
    }

    pub fn payload(event: &ChangeEvent) -> serde_json::Value {
        Self::text_payload(event.summary())
    }

    fn text_payload(content: String) -> serde_json::Value {
        json!({ "content": content })
    }
}

#[async_trait]
impl ChangeSink for DiscordSink {
    fn name(&self) -> &'static str {
        "discord"
    }

    async fn notify(&self, event: &ChangeEvent) -> anyhow::Result<()> {
        post_json(&self.http, &self.webhook_url, &Self::payload(event), self.name()).await
    }

    async fn announce_startup(&self, platforms: &[Platform]) -> anyhow::Result<()> {
        let payload = Self::text_payload(startup_message(platforms));
        post_json(&self.http, &self.webhook_url, &payload, self.name()).await
    }
}

#[derive(Debug, Clone)]
pub struct TelegramSink {
    config: TelegramConfig,
    http: reqwest::Client,
}

impl TelegramSink {
    pub fn new(config: TelegramConfig, http: reqwest::Client) -> Self {
        Self { config, http }
    }

    fn endpoint(&self) -> String {
        format!("{TELEGRAM_API_BASE}/bot{}/sendMessage", self.config.bot_token)
    }

    pub fn payload(chat_id: &str, event: &ChangeEvent) -> serde_json::Value {
        Self::text_payload(chat_id, event.summary())
    }

    fn text_payload(chat_id: &str, text: String) -> serde_json::Value {
        json!({
            "chat_id": chat_id,
            "text": text,
            "disable_web_page_preview": true,
        })
    }
}

#[async_trait]
impl ChangeSink for TelegramSink {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn notify(&self, event: &ChangeEvent) -> anyhow::Result<()> {
        let payload = Self::payload(&self.config.chat_id, event);
        post_json(&self.http, &self.endpoint(), &payload, self.name()).await
    }

    async fn announce_startup(&self, platforms: &[Platform]) -> anyhow::Result<()> {
        let payload = Self::text_payload(&self.config.chat_id, startup_message(platforms));
        post_json(&self.http, &self.endpoint(), &payload, self.name()).await
    }
}

/// Delivers each event to every transport in order. A failing transport is logged and skipped,
/// so `notify` on the router always succeeds.
#[derive(Default)]
pub struct SinkRouter {
    sinks: Vec<Box<dyn ChangeSink>>,
}

impl SinkRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: impl ChangeSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn push(&mut self, sink: Box<dyn ChangeSink>) {
        self.sinks.push(sink);
    }

    pub fn sink_names(&self) -> Vec<&'static str> {
        self.sinks.iter().map(|s| s.name()).collect()
    }
}

#[async_trait]
impl ChangeSink for SinkRouter {
    fn name(&self) -> &'static str {
        "router"
    }

    async fn notify(&self, event: &ChangeEvent) -> anyhow::Result<()> {
        for sink in &self.sinks {
            if let Err(err) = sink.notify(event).await {
                warn!(
                    sink = sink.name(),
                    program = %event.program.name,
                    key = %event.program.key,
                    error = %err,
                    "failed to deliver change notification"
                );
            }
        }
        Ok(())
    }

    async fn announce_startup(&self, platforms: &[Platform]) -> anyhow::Result<()> {
        for sink in &self.sinks {
            if let Err(err) = sink.announce_startup(platforms).await {
                warn!(sink = sink.name(), error = %err, "failed to deliver startup notification");
            }
        }
        Ok(())
    }
}

pub fn build_sink(config: &NotifyConfig) -> anyhow::Result<SinkRouter> {
    let http = reqwest::Client::builder()
        .timeout(SINK_TIMEOUT)
        .build()
        .context("build notification http client")?;

    let mut router = SinkRouter::new();
    if config.log {
        router.push(Box::new(LogSink));
    }
    if let Some(url) = config.discord_webhook.as_deref().filter(|u| !u.trim().is_empty()) {
        router.push(Box::new(DiscordSink::new(url, http.clone())));
    }
    if let Some(telegram) = &config.telegram {
        router.push(Box::new(TelegramSink::new(telegram.clone(), http.clone())));
    }
    for url in config.webhooks.iter().filter(|u| !u.trim().is_empty()) {
        router.push(Box::new(WebhookSink::new(url.clone(), http.clone())));
    }
    Ok(router)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bbw_core::{scope_from_descriptions, Platform, Program, ProgramType};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn event() -> ChangeEvent {
        let program = Program::new(
            Platform::Bugcrowd,
            "Hooli",
            "https://bugcrowd.com/hooli",
            ProgramType::Rdp,
            "",
            scope_from_descriptions(["hooli.com (website)".to_string()]),
            None,
        );
        ChangeEvent::added(program)
    }

    struct CountingSink(Arc<AtomicUsize>);

    #[async_trait]
    impl ChangeSink for CountingSink {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn notify(&self, _event: &ChangeEvent) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn announce_startup(&self, _platforms: &[Platform]) -> anyhow::Result<()> {
            self.0.fetch_add(100, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl ChangeSink for FailingSink {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn notify(&self, _event: &ChangeEvent) -> anyhow::Result<()> {
            anyhow::bail!("transport down")
        }

        async fn announce_startup(&self, _platforms: &[Platform]) -> anyhow::Result<()> {
            anyhow::bail!("transport down")
        }
    }

    #[tokio::test]
    async fn router_keeps_delivering_after_a_failure() {
        let delivered = Arc::new(AtomicUsize::new(0));
        let router = SinkRouter::new()
            .with_sink(FailingSink)
            .with_sink(CountingSink(delivered.clone()));

        router.notify(&event()).await.unwrap();
        router.notify(&event()).await.unwrap();

        assert_eq!(delivered.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn router_announces_startup_past_a_failure() {
        let delivered = Arc::new(AtomicUsize::new(0));
        let router = SinkRouter::new()
            .with_sink(FailingSink)
            .with_sink(CountingSink(delivered.clone()));

        router.announce_startup(&Platform::ALL).await.unwrap();

        assert_eq!(delivered.load(Ordering::SeqCst), 100);
    }

    #[tokio::test]
    async fn log_sink_accepts_events() {
        LogSink.notify(&event()).await.unwrap();
        LogSink.announce_startup(&[Platform::HackerOne]).await.unwrap();
    }

    #[test]
    fn startup_message_lists_watched_platforms() {
        assert_eq!(
            startup_message(&[Platform::HackerOne, Platform::Intigriti]),
            "bbw started: monitoring hackerone, intigriti. New programs and scope changes will be reported here."
        );
        assert!(startup_message(&[]).contains("no platforms"));

        let payload = WebhookSink::startup_payload(&[Platform::Bugcrowd]);
        assert_eq!(payload["kind"], "startup");
        assert_eq!(payload["platforms"][0], "bugcrowd");
    }

    #[test]
    fn discord_payload_of_a_huge_program_fits_the_message_limit() {
        let descriptions = (0..150).map(|i| format!("service-{i}.bigcorp.example (URL)"));
        let program = Program::new(
            Platform::HackerOne,
            "BigCorp",
            "https://hackerone.com/bigcorp",
            ProgramType::Rdp,
            "",
            scope_from_descriptions(descriptions),
            None,
        );
        let event = ChangeEvent::added(program);

        let content = DiscordSink::payload(&event)["content"].as_str().unwrap().to_string();
        assert!(content.chars().count() <= 2000);
        assert!(content.contains("and 145 more"));
        let text = TelegramSink::payload("42", &event)["text"].as_str().unwrap().to_string();
        assert!(text.chars().count() <= 4096);
    }

    #[test]
    fn build_sink_follows_config() {
        let router = build_sink(&NotifyConfig::default()).unwrap();
        assert_eq!(router.sink_names(), vec!["log"]);

        let config = NotifyConfig {
            log: false,
            discord_webhook: Some("https://discord.com/api/webhooks/1/abc".into()),
            telegram: Some(TelegramConfig {
                bot_token: "123:abc".into(),
                chat_id: "42".into(),
            }),
            webhooks: vec!["https://example.org/hook".into(), "  ".into()],
        };
        let router = build_sink(&config).unwrap();
        assert_eq!(router.sink_names(), vec!["discord", "telegram", "webhook"]);
    }

    #[test]
    fn empty_notify_section_keeps_log_sink() {
        let config: NotifyConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, NotifyConfig::default());
    }

    #[test]
    fn text_payloads_carry_the_summary() {
        let event = event();
        let discord = DiscordSink::payload(&event);
        assert_eq!(discord["content"], event.summary());

        let telegram = TelegramSink::payload("42", &event);
        assert_eq!(telegram["chat_id"], "42");
        assert!(telegram["text"].as_str().unwrap().contains("new program: Hooli"));
    }

    #[test]
    fn webhook_payload_is_the_serialized_event() {
        let payload = serde_json::to_value(event()).unwrap();
        assert_eq!(payload["kind"], "new");
        assert_eq!(payload["program"]["type"], "rdp");
        assert_eq!(payload["new_scope"][0], "hooli.com (website)");
        assert!(payload.get("removed_scope").is_none());
    }

    #[test]
    fn telegram_endpoint_embeds_token() {
        let sink = TelegramSink::new(
            TelegramConfig {
                bot_token: "123:abc".into(),
                chat_id: "42".into(),
            },
            reqwest::Client::new(),
        );
        assert_eq!(sink.endpoint(), "https://api.telegram.org/bot123:abc/sendMessage");
    }
}
