//! Program store, upstream snapshot fetching and raw snapshot archiving.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bbw_core::{Platform, Program, ProgramType, Reward, ScopeMap};
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "bbw-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt record {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Key-indexed persistence for the last known canonical snapshot of every program.
#[async_trait]
pub trait ProgramStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Program>, StoreError>;

    /// Insert or overwrite the record stored under `program.key`.
    async fn upsert(&self, program: &Program) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    async fn keys_for_platform(&self, platform: Platform) -> Result<Vec<String>, StoreError>;

    async fn count(&self) -> Result<u64, StoreError>;
}

#[derive(Debug, Clone)]
pub struct SqliteProgramStore {
    pool: SqlitePool,
}

impl SqliteProgramStore {
    /// Open (creating if missing) the database file and apply migrations.
    pub async fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating database directory {}", parent.display()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("opening program store {}", path.display()))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("running program store migrations")?;

        Ok(Self { pool })
    }

    fn decode(row: &SqliteRow) -> Result<Program, StoreError> {
        let key: String = row.try_get("key")?;
        let corrupt = |reason: String| StoreError::Corrupt {
            key: key.clone(),
            reason,
        };

        let program_type: ProgramType = row
            .try_get::<String, _>("program_type")?
            .parse()
            .map_err(|e| corrupt(format!("{e}")))?;
        let platform: Platform = row
            .try_get::<String, _>("platform")?
            .parse()
            .map_err(|e| corrupt(format!("{e}")))?;
        let scope: ScopeMap = serde_json::from_str(&row.try_get::<String, _>("scope")?)
            .map_err(|e| corrupt(format!("scope: {e}")))?;
        let reward: Option<Reward> = match row.try_get::<Option<String>, _>("reward")? {
            Some(text) => {
                Some(serde_json::from_str(&text).map_err(|e| corrupt(format!("reward: {e}")))?)
            }
            None => None,
        };

        Ok(Program {
            name: row.try_get("name")?,
            url: row.try_get("url")?,
            program_type,
            key,
            platform,
            logo: row.try_get("logo")?,
            scope,
            reward,
        })
    }
}

#[async_trait]
impl ProgramStore for SqliteProgramStore {
    async fn get(&self, key: &str) -> Result<Option<Program>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT key, name, url, program_type, platform, logo, scope, reward
            FROM programs WHERE key = ?
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::decode).transpose()
    }

    async fn upsert(&self, program: &Program) -> Result<(), StoreError> {
        let corrupt = |reason: String| StoreError::Corrupt {
            key: program.key.clone(),
            reason,
        };
        let scope = serde_json::to_string(&program.scope).map_err(|e| corrupt(format!("scope: {e}")))?;
        let reward = program
            .reward
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| corrupt(format!("reward: {e}")))?;
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO programs
                (key, name, url, program_type, platform, logo, scope, reward, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                name = excluded.name,
                url = excluded.url,
                program_type = excluded.program_type,
                platform = excluded.platform,
                logo = excluded.logo,
                scope = excluded.scope,
                reward = excluded.reward,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&program.key)
        .bind(&program.name)
        .bind(&program.url)
        .bind(program.program_type.as_str())
        .bind(program.platform.as_str())
        .bind(&program.logo)
        .bind(scope)
        .bind(reward)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM programs WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn keys_for_platform(&self, platform: Platform) -> Result<Vec<String>, StoreError> {
        let keys = sqlx::query_scalar::<_, String>(
            "SELECT key FROM programs WHERE platform = ? ORDER BY created_at, key",
        )
        .bind(platform.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(keys)
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM programs")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}

/// In-process store used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryProgramStore {
    programs: Mutex<BTreeMap<String, Program>>,
}

impl MemoryProgramStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_programs(programs: impl IntoIterator<Item = Program>) -> Self {
        Self {
            programs: Mutex::new(programs.into_iter().map(|p| (p.key.clone(), p)).collect()),
        }
    }

    pub async fn programs(&self) -> Vec<Program> {
        self.programs.lock().await.values().cloned().collect()
    }
}

#[async_trait]
impl ProgramStore for MemoryProgramStore {
    async fn get(&self, key: &str) -> Result<Option<Program>, StoreError> {
        Ok(self.programs.lock().await.get(key).cloned())
    }

    async fn upsert(&self, program: &Program) -> Result<(), StoreError> {
        self.programs
            .lock()
            .await
            .insert(program.key.clone(), program.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.programs.lock().await.remove(key);
        Ok(())
    }

    async fn keys_for_platform(&self, platform: Platform) -> Result<Vec<String>, StoreError> {
        Ok(self
            .programs
            .lock()
            .await
            .values()
            .filter(|p| p.platform == platform)
            .map(|p| p.key.clone())
            .collect())
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.programs.lock().await.len() as u64)
    }
}

#[derive(Debug, Clone)]
pub struct ArchivedSnapshot {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Content-addressed archive of raw upstream snapshot bodies.
#[derive(Debug, Clone)]
pub struct SnapshotArchive {
    root: PathBuf,
}

impl SnapshotArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn snapshot_relative_path(
        fetched_at: DateTime<Utc>,
        platform: Platform,
        content_hash: &str,
    ) -> PathBuf {
        PathBuf::from(fetched_at.format("%Y%m%d_%H%M%S").to_string())
            .join(platform.as_str())
            .join(format!("{content_hash}.json"))
    }

    /// Write the body once under its hash; concurrent or repeated writes of the same body
    /// resolve to the existing file.
    pub async fn store_snapshot(
        &self,
        fetched_at: DateTime<Utc>,
        platform: Platform,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedSnapshot> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = Self::snapshot_relative_path(fetched_at, platform, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .with_context(|| format!("snapshot path {} has no parent", absolute_path.display()))?;

        let archived = |deduplicated: bool| ArchivedSnapshot {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating snapshot directory {}", parent.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking snapshot path {}", absolute_path.display()))?
        {
            return Ok(archived(true));
        }

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp snapshot file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp snapshot file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp snapshot file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(archived(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(archived(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming temp snapshot {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Where raw platform snapshots come from. Any error means the platform is unavailable
/// for this cycle.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let mut attempt = 0usize;
        loop {
            let retries_left = attempt < self.backoff.max_retries;
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        debug!(bytes = body.len(), attempt, "snapshot fetched");
                        return Ok(body);
                    }

                    if classify_status(status) == RetryDisposition::NonRetryable || !retries_left {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: resp.url().to_string(),
                        });
                    }
                    warn!(status = status.as_u16(), attempt, "retryable http status");
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable || !retries_left {
                        return Err(FetchError::Request(err));
                    }
                    warn!(error = %err, attempt, "retryable request error");
                }
            }

            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl SnapshotSource for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        self.fetch_bytes(url)
            .instrument(info_span!("http_fetch", url))
            .await
    }
}
