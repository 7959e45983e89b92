//! Watcher configuration, notification policy, per-platform reconciliation and run orchestration.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use bbw_adapters::{canonicalizer_for, decode_snapshot, Canonicalizer};
use bbw_core::{ChangeEvent, NotificationFlags, Platform, RunContext};
use bbw_notify::{build_sink, ChangeSink, NotifyConfig, SinkRouter};
use bbw_storage::{
    HttpClientConfig, HttpFetcher, MemoryProgramStore, ProgramStore, SnapshotArchive, SnapshotSource,
    SqliteProgramStore,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::fs;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "bbw-sync";

pub const DEFAULT_CONFIG_PATH: &str = "bbw.yaml";

/// What to do when a fetched snapshot yields no canonical programs at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptySnapshotPolicy {
    /// Trust it and remove every stored program of the platform.
    #[default]
    RemoveAll,
    /// Treat it as a suspect upstream response and keep the stored programs.
    Ignore,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub monitor: bool,
    #[serde(default)]
    pub empty_snapshot: EmptySnapshotPolicy,
    #[serde(default)]
    pub notifications: NotificationFlags,
}

impl PlatformConfig {
    /// The snapshot URL when this platform is both monitored and has somewhere to fetch from.
    pub fn active_url(&self) -> Option<&str> {
        if !self.monitor {
            return None;
        }
        self.url.as_deref().map(str::trim).filter(|u| !u.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("programs.db"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpSettings {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_user_agent() -> String {
    format!("bbw/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub archive_dir: Option<PathBuf>,
    #[serde(default)]
    pub http: HttpSettings,
    #[serde(default)]
    pub notify: NotifyConfig,
    /// Keyed by platform identifier. Kept as strings so unknown keys can be reported, not rejected.
    #[serde(default)]
    pub platforms: BTreeMap<String, PlatformConfig>,
}

impl WatchConfig {
    /// Read the YAML file at `path` and apply `BBW_*` environment overrides.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config {}", path.display()))?;
        let mut config = Self::from_yaml_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.apply_env_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(path) = lookup("BBW_DATABASE_PATH") {
            self.database.path = PathBuf::from(path);
        }
        if let Some(dir) = lookup("BBW_ARCHIVE_DIR") {
            self.archive_dir = Some(PathBuf::from(dir));
        }
        if let Some(user_agent) = lookup("BBW_USER_AGENT") {
            self.http.user_agent = user_agent;
        }
        if let Some(secs) = lookup("BBW_HTTP_TIMEOUT_SECS") {
            self.http.timeout_secs = secs
                .trim()
                .parse()
                .with_context(|| format!("BBW_HTTP_TIMEOUT_SECS is not a number: {secs:?}"))?;
        }
        Ok(())
    }

    pub fn platform(&self, platform: Platform) -> Option<&PlatformConfig> {
        self.platforms.get(platform.as_str())
    }

    pub fn unknown_platforms(&self) -> Vec<&str> {
        self.platforms
            .keys()
            .map(String::as_str)
            .filter(|key| key.parse::<Platform>().is_err())
            .collect()
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http.timeout_secs),
            user_agent: Some(self.http.user_agent.clone()),
            ..Default::default()
        }
    }
}

/// Decide whether a computed change event reaches the sinks.
///
/// During the initial population only brand-new programs can notify. Otherwise removals and
/// additions follow their own flag, and an update notifies when at least one change kind it
/// carries is subscribed to.
pub fn should_notify(
    is_new_record: bool,
    event: &ChangeEvent,
    flags: &NotificationFlags,
    first_run: bool,
) -> bool {
    if first_run {
        return is_new_record && flags.new_program;
    }
    if event.is_removed() {
        return flags.removed_program;
    }
    if is_new_record {
        return flags.new_program;
    }

    (flags.new_scope && !event.new_scope.is_empty())
        || (flags.removed_scope && !event.removed_scope.is_empty())
        || (flags.changed_scope && !event.changed_scope.is_empty())
        || (flags.new_type && event.new_type.is_some())
        || (flags.reward_change && event.reward.is_some())
}

/// Per-platform tallies for one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    /// Raw records seen in the snapshot.
    pub processed: usize,
    pub new: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub removed: usize,
    /// Malformed records.
    pub skipped: usize,
    /// Records whose store read or write failed.
    pub failed: usize,
    pub notified: usize,
}

/// Brings the store in line with one platform snapshot and emits the resulting change events.
pub struct Reconciler<'a> {
    store: &'a dyn ProgramStore,
    sink: &'a dyn ChangeSink,
    context: RunContext,
}

impl<'a> Reconciler<'a> {
    pub fn new(store: &'a dyn ProgramStore, sink: &'a dyn ChangeSink, context: RunContext) -> Self {
        Self { store, sink, context }
    }

    /// Errors only when the stored key set cannot be listed; nothing has been written then.
    pub async fn reconcile(
        &self,
        canonicalizer: &dyn Canonicalizer,
        snapshot: &JsonValue,
        settings: &PlatformConfig,
    ) -> Result<ReconcileStats> {
        let platform = canonicalizer.platform();
        let flags = &settings.notifications;
        let stored_keys: BTreeSet<String> = self
            .store
            .keys_for_platform(platform)
            .await
            .with_context(|| format!("listing stored {platform} programs"))?
            .into_iter()
            .collect();

        let mut stats = ReconcileStats::default();
        let mut current_keys = BTreeSet::new();

        for raw in canonicalizer.records(snapshot) {
            stats.processed += 1;
            let program = match canonicalizer.canonicalize(raw) {
                Ok(program) => program,
                Err(err) => {
                    debug!(%platform, error = %err, "skipping malformed record");
                    stats.skipped += 1;
                    continue;
                }
            };
            current_keys.insert(program.key.clone());

            let previous = match self.store.get(&program.key).await {
                Ok(previous) => previous,
                Err(err) => {
                    warn!(%platform, key = %program.key, program = %program.name, error = %err, "store lookup failed");
                    stats.failed += 1;
                    continue;
                }
            };

            let (is_new_record, event) = match previous {
                None => (true, ChangeEvent::added(program.clone())),
                Some(previous) => match ChangeEvent::between(&previous, &program) {
                    Some(event) => (false, event),
                    None => {
                        stats.unchanged += 1;
                        continue;
                    }
                },
            };

            if let Err(err) = self.store.upsert(&program).await {
                warn!(%platform, key = %program.key, program = %program.name, error = %err, "store write failed; change not announced");
                stats.failed += 1;
                continue;
            }
            if is_new_record {
                stats.new += 1;
            } else {
                stats.updated += 1;
            }
            self.dispatch(is_new_record, &event, flags, &mut stats).await;
        }

        if current_keys.is_empty()
            && !stored_keys.is_empty()
            && settings.empty_snapshot == EmptySnapshotPolicy::Ignore
        {
            warn!(
                %platform,
                stored = stored_keys.len(),
                "snapshot produced no programs; keeping stored programs"
            );
        } else {
            for key in stored_keys.difference(&current_keys) {
                self.remove(key, flags, &mut stats).await;
            }
        }

        info!(
            %platform,
            processed = stats.processed,
            new = stats.new,
            updated = stats.updated,
            unchanged = stats.unchanged,
            removed = stats.removed,
            skipped = stats.skipped,
            failed = stats.failed,
            notified = stats.notified,
            "platform reconciled"
        );
        Ok(stats)
    }

    async fn remove(&self, key: &str, flags: &NotificationFlags, stats: &mut ReconcileStats) {
        let stored = match self.store.get(key).await {
            Ok(Some(stored)) => stored,
            Ok(None) => return,
            Err(err) => {
                warn!(key, error = %err, "store lookup failed for removed program");
                stats.failed += 1;
                return;
            }
        };
        if let Err(err) = self.store.delete(key).await {
            warn!(key, program = %stored.name, error = %err, "store delete failed; removal not announced");
            stats.failed += 1;
            return;
        }
        stats.removed += 1;
        self.dispatch(false, &ChangeEvent::removed(stored), flags, stats).await;
    }

    async fn dispatch(
        &self,
        is_new_record: bool,
        event: &ChangeEvent,
        flags: &NotificationFlags,
        stats: &mut ReconcileStats,
    ) {
        if !should_notify(is_new_record, event, flags, self.context.first_run) {
            return;
        }
        if let Err(err) = self.sink.notify(event).await {
            warn!(key = %event.program.key, error = %err, "change notification failed");
        }
        stats.notified += 1;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub first_run: bool,
    pub platforms: Vec<(Platform, ReconcileStats)>,
    pub failed_platforms: Vec<Platform>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointReport {
    pub platform: Platform,
    pub url: String,
    pub bytes: Option<usize>,
    pub error: Option<String>,
}

impl EndpointReport {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

pub struct SyncPipeline {
    config: WatchConfig,
    store: Box<dyn ProgramStore>,
    source: Box<dyn SnapshotSource>,
    sink: Box<dyn ChangeSink>,
    archive: Option<SnapshotArchive>,
}

impl SyncPipeline {
    pub fn new(
        config: WatchConfig,
        store: Box<dyn ProgramStore>,
        source: Box<dyn SnapshotSource>,
        sink: Box<dyn ChangeSink>,
    ) -> Self {
        let archive = config.archive_dir.clone().map(SnapshotArchive::new);
        Self {
            config,
            store,
            source,
            sink,
            archive,
        }
    }

    /// Wire the SQLite store, HTTP fetcher and configured transports.
    pub async fn from_config(config: WatchConfig) -> Result<Self> {
        let store = SqliteProgramStore::open(&config.database.path)
            .await
            .with_context(|| format!("opening store {}", config.database.path.display()))?;
        let fetcher = HttpFetcher::new(config.http_client_config())?;
        let sink = build_sink(&config.notify)?;
        Ok(Self::new(config, Box::new(store), Box::new(fetcher), Box::new(sink)))
    }

    /// HTTP-only wiring for endpoint checks: an in-memory store and no transports.
    pub fn detached(config: WatchConfig) -> Result<Self> {
        let fetcher = HttpFetcher::new(config.http_client_config())?;
        Ok(Self::new(
            config,
            Box::new(MemoryProgramStore::new()),
            Box::new(fetcher),
            Box::new(SinkRouter::new()),
        ))
    }

    fn warn_unknown_platforms(&self) {
        for key in self.config.unknown_platforms() {
            warn!(platform = key, "ignoring unknown platform in config");
        }
    }

    /// Platforms to sync this run, in processing order.
    fn active_platforms(&self) -> Vec<(Platform, &PlatformConfig, &str)> {
        Platform::ALL
            .into_iter()
            .filter_map(|platform| {
                let Some(settings) = self.config.platform(platform) else {
                    info!(%platform, "platform not configured; skipping");
                    return None;
                };
                match settings.active_url() {
                    Some(url) => Some((platform, settings, url)),
                    None => {
                        info!(%platform, "platform not monitored or has no url; skipping");
                        None
                    }
                }
            })
            .collect()
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        self.run_inner(run_id)
            .instrument(info_span!("sync_run", %run_id))
            .await
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        self.warn_unknown_platforms();

        let first_run = self.store.count().await.context("counting stored programs")? == 0;
        if first_run {
            info!("store is empty; first run suppresses update and removal notifications");
        }
        let context = RunContext { first_run };
        let active = self.active_platforms();

        if first_run {
            let watched: Vec<Platform> = active.iter().map(|(platform, _, _)| *platform).collect();
            if let Err(err) = self.sink.announce_startup(&watched).await {
                warn!(error = %err, "startup notification failed");
            }
        }

        let mut platforms = Vec::new();
        let mut failed_platforms = Vec::new();
        for (platform, settings, url) in active {
            let outcome = self
                .sync_platform(platform, settings, url, context)
                .instrument(info_span!("platform_sync", %platform))
                .await;
            match outcome {
                Ok(stats) => platforms.push((platform, stats)),
                Err(err) => {
                    let error = format!("{err:#}");
                    warn!(%platform, %error, "platform sync aborted");
                    failed_platforms.push(platform);
                }
            }
        }

        let finished_at = Utc::now();
        info!(
            platforms = platforms.len(),
            failed = failed_platforms.len(),
            "sync run finished"
        );
        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at,
            first_run,
            platforms,
            failed_platforms,
        })
    }

    async fn sync_platform(
        &self,
        platform: Platform,
        settings: &PlatformConfig,
        url: &str,
        context: RunContext,
    ) -> Result<ReconcileStats> {
        let fetched_at = Utc::now();
        let bytes = self
            .source
            .fetch(url)
            .await
            .with_context(|| format!("fetching {platform} snapshot"))?;

        if let Some(archive) = &self.archive {
            match archive.store_snapshot(fetched_at, platform, &bytes).await {
                Ok(archived) => debug!(
                    path = %archived.relative_path.display(),
                    deduplicated = archived.deduplicated,
                    "snapshot archived"
                ),
                Err(err) => warn!(error = %err, "snapshot archive write failed"),
            }
        }

        let snapshot = decode_snapshot(&bytes)
            .with_context(|| format!("decoding {platform} snapshot ({} bytes)", bytes.len()))?;
        let canonicalizer = canonicalizer_for(platform);
        Reconciler::new(self.store.as_ref(), self.sink.as_ref(), context)
            .reconcile(canonicalizer.as_ref(), &snapshot, settings)
            .await
    }

    /// Fetch every active platform once without touching the store.
    pub async fn check_endpoints(&self) -> Vec<EndpointReport> {
        self.warn_unknown_platforms();
        let mut reports = Vec::new();
        for (platform, _, url) in self.active_platforms() {
            let report = match self.source.fetch(url).await {
                Ok(bytes) => EndpointReport {
                    platform,
                    url: url.to_string(),
                    bytes: Some(bytes.len()),
                    error: None,
                },
                Err(err) => EndpointReport {
                    platform,
                    url: url.to_string(),
                    bytes: None,
                    error: Some(err.to_string()),
                },
            };
            reports.push(report);
        }
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bbw_core::{scope_from_descriptions, Program, ProgramType, Reward};

    fn program(scope: &[&str]) -> Program {
        Program::new(
            Platform::HackerOne,
            "Acme",
            "https://hackerone.com/acme",
            ProgramType::Rdp,
            "",
            scope_from_descriptions(scope.iter().map(|s| s.to_string())),
            None,
        )
    }

    fn update(previous: &[&str], current: &[&str]) -> ChangeEvent {
        ChangeEvent::between(&program(previous), &program(current)).expect("delta")
    }

    #[test]
    fn first_run_only_announces_new_programs() {
        let flags = NotificationFlags::all();
        let added = ChangeEvent::added(program(&["a (URL)"]));
        let removed = ChangeEvent::removed(program(&["a (URL)"]));
        let updated = update(&["a (URL)"], &["b (URL)"]);

        assert!(should_notify(true, &added, &flags, true));
        assert!(!should_notify(false, &removed, &flags, true));
        assert!(!should_notify(false, &updated, &flags, true));

        let quiet = NotificationFlags {
            new_program: false,
            ..NotificationFlags::all()
        };
        assert!(!should_notify(true, &added, &quiet, true));
    }

    #[test]
    fn removal_and_addition_follow_their_flags() {
        let removed = ChangeEvent::removed(program(&[]));
        let added = ChangeEvent::added(program(&[]));
        let mut flags = NotificationFlags::default();
        assert!(!should_notify(false, &removed, &flags, false));
        assert!(!should_notify(true, &added, &flags, false));

        flags.removed_program = true;
        flags.new_program = true;
        assert!(should_notify(false, &removed, &flags, false));
        assert!(should_notify(true, &added, &flags, false));
    }

    #[test]
    fn updates_need_a_subscribed_change_kind() {
        let grew = update(&["a (URL)"], &["a (URL)", "b (URL)"]);
        let shrank = update(&["a (URL)", "b (URL)"], &["a (URL)"]);

        let only_new_scope = NotificationFlags {
            new_scope: true,
            reward_change: false,
            ..NotificationFlags::default()
        };
        assert!(should_notify(false, &grew, &only_new_scope, false));
        assert!(!should_notify(false, &shrank, &only_new_scope, false));

        let none = NotificationFlags {
            reward_change: false,
            ..NotificationFlags::default()
        };
        assert!(!should_notify(false, &grew, &none, false));
    }

    #[test]
    fn type_and_reward_changes_have_their_own_flags() {
        let previous = program(&["a (URL)"]);
        let mut current = previous.clone();
        current.program_type = ProgramType::Vdp;
        current.reward = Some(Reward {
            min: "$50".into(),
            max: "$500".into(),
        });
        let event = ChangeEvent::between(&previous, &current).expect("delta");

        let type_only = NotificationFlags {
            new_type: true,
            reward_change: false,
            ..NotificationFlags::default()
        };
        assert!(should_notify(false, &event, &type_only, false));
        assert!(should_notify(false, &event, &NotificationFlags::default(), false));
    }

    #[test]
    fn config_defaults_and_platform_lookup() {
        let config = WatchConfig::from_yaml_str(
            r#"
platforms:
  hackerone:
    url: https://example.org/h1.json
    monitor: true
    notifications:
      new_program: true
  bugcrowd:
    url: https://example.org/bc.json
  yeswehack:
    url: https://example.org/ywh.json
    monitor: true
"#,
        )
        .unwrap();

        assert_eq!(config.database.path, PathBuf::from("programs.db"));
        assert_eq!(config.http.timeout_secs, 30);
        assert!(config.notify.log);
        assert_eq!(config.archive_dir, None);

        let h1 = config.platform(Platform::HackerOne).unwrap();
        assert_eq!(h1.active_url(), Some("https://example.org/h1.json"));
        assert_eq!(h1.empty_snapshot, EmptySnapshotPolicy::RemoveAll);
        assert!(h1.notifications.new_program);
        assert!(!h1.notifications.removed_program);
        assert!(h1.notifications.reward_change);

        assert_eq!(config.platform(Platform::Bugcrowd).unwrap().active_url(), None);
        assert!(config.platform(Platform::Intigriti).is_none());
        assert_eq!(config.unknown_platforms(), vec!["yeswehack"]);
    }

    #[test]
    fn empty_snapshot_policy_parses_snake_case() {
        let config = WatchConfig::from_yaml_str(
            "platforms:\n  intigriti:\n    url: https://x\n    monitor: true\n    empty_snapshot: ignore\n",
        )
        .unwrap();
        assert_eq!(
            config.platform(Platform::Intigriti).unwrap().empty_snapshot,
            EmptySnapshotPolicy::Ignore
        );
    }

    #[test]
    fn env_overrides_apply_after_file() {
        let mut config = WatchConfig::default();
        let env: BTreeMap<&str, &str> = [
            ("BBW_DATABASE_PATH", "/tmp/bbw.db"),
            ("BBW_ARCHIVE_DIR", "/tmp/archive"),
            ("BBW_HTTP_TIMEOUT_SECS", "5"),
        ]
        .into_iter()
        .collect();
        config
            .apply_env_overrides(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.database.path, PathBuf::from("/tmp/bbw.db"));
        assert_eq!(config.archive_dir, Some(PathBuf::from("/tmp/archive")));
        assert_eq!(config.http_client_config().timeout, Duration::from_secs(5));

        let err = config
            .apply_env_overrides(|name| (name == "BBW_HTTP_TIMEOUT_SECS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("BBW_HTTP_TIMEOUT_SECS"));
    }

    #[tokio::test]
    async fn sample_config_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../bbw.yaml");
        let config = WatchConfig::load(path).await.unwrap();
        assert!(config.unknown_platforms().is_empty());
        for platform in Platform::ALL {
            assert!(config.platform(platform).and_then(PlatformConfig::active_url).is_some());
        }
    }

    #[test]
    fn malformed_yaml_is_an_error() {
        assert!(WatchConfig::from_yaml_str("platforms: [not, a, map]").is_err());
    }
}
