//! Indicator upsert storage + HTTP fetch utilities for xrate.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;
use xrate_core::IndicatorRecord;

pub const CRATE_NAME: &str = "xrate-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertAction {
    Inserted,
    Updated,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpsertFailure {
    pub item_id: i64,
    pub error: String,
}

/// Per-batch tally produced by [`IndicatorStore::apply`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyReport {
    pub inserted: usize,
    pub updated: usize,
    pub failures: Vec<UpsertFailure>,
}

impl ApplyReport {
    pub fn applied(&self) -> usize {
        self.inserted + self.updated
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Latest-value table keyed by `item_id`.
///
/// Implementations must make a single `upsert` atomic for its row; batches are never
/// wrapped in a transaction, so overlapping callers converge record by record.
#[async_trait]
pub trait IndicatorStore: Send + Sync {
    async fn upsert(&self, record: &IndicatorRecord) -> Result<UpsertAction, StoreError>;

    /// Full-table read ordered by `item_id`.
    async fn list_all(&self) -> Result<Vec<IndicatorRecord>, StoreError>;

    /// Sanitizes and upserts each record in order; a failed record is logged and tallied.
    async fn apply(&self, records: &[IndicatorRecord]) -> ApplyReport {
        let mut report = ApplyReport::default();
        for record in records {
            let record = record.clone().sanitized();
            match self.upsert(&record).await {
                Ok(UpsertAction::Inserted) => report.inserted += 1,
                Ok(UpsertAction::Updated) => report.updated += 1,
                Err(err) => {
                    warn!(item_id = record.item_id, error = %err, "indicator upsert failed");
                    report.failures.push(UpsertFailure {
                        item_id: record.item_id,
                        error: err.to_string(),
                    });
                }
            }
        }
        report
    }
}

const UPSERT_SQL: &str = r#"
    INSERT INTO api_data (
        item_id, name, title, price, high_price, low_price, open_price,
        change_value, change_percent, updated_at, dt, t, prices
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, CAST($9 AS NUMERIC(9, 2)), $10, $11, $12, $13)
    ON CONFLICT (item_id) DO UPDATE
       SET name = EXCLUDED.name,
           title = EXCLUDED.title,
           price = EXCLUDED.price,
           high_price = EXCLUDED.high_price,
           low_price = EXCLUDED.low_price,
           open_price = EXCLUDED.open_price,
           change_value = EXCLUDED.change_value,
           change_percent = EXCLUDED.change_percent,
           updated_at = EXCLUDED.updated_at,
           dt = EXCLUDED.dt,
           t = EXCLUDED.t,
           prices = EXCLUDED.prices
    RETURNING (xmax = 0) AS inserted
"#;

#[derive(Debug, Clone)]
pub struct PgIndicatorStore {
    pool: PgPool,
}

impl PgIndicatorStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl IndicatorStore for PgIndicatorStore {
    async fn upsert(&self, record: &IndicatorRecord) -> Result<UpsertAction, StoreError> {
        let row = sqlx::query(UPSERT_SQL)
            .bind(record.item_id)
            .bind(&record.name)
            .bind(&record.title)
            .bind(&record.price)
            .bind(&record.high_price)
            .bind(&record.low_price)
            .bind(&record.open_price)
            .bind(&record.change_value)
            .bind(record.change_percent)
            .bind(&record.updated_at)
            .bind(&record.dt)
            .bind(&record.t)
            .bind(&record.prices)
            .fetch_one(&self.pool)
            .await?;

        let inserted: bool = row.try_get("inserted")?;
        Ok(if inserted {
            UpsertAction::Inserted
        } else {
            UpsertAction::Updated
        })
    }

    async fn list_all(&self) -> Result<Vec<IndicatorRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT item_id, name, title, price, high_price, low_price, open_price,
                   change_value, change_percent::float8 AS change_percent,
                   updated_at, dt, t, prices
              FROM api_data
             ORDER BY item_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(IndicatorRecord {
                item_id: row.try_get("item_id")?,
                name: row.try_get("name")?,
                title: row.try_get("title")?,
                price: row.try_get("price")?,
                high_price: row.try_get("high_price")?,
                low_price: row.try_get("low_price")?,
                open_price: row.try_get("open_price")?,
                change_value: row.try_get("change_value")?,
                change_percent: row.try_get("change_percent")?,
                updated_at: row.try_get("updated_at")?,
                dt: row.try_get("dt")?,
                t: row.try_get("t")?,
                prices: row.try_get("prices")?,
            });
        }
        Ok(out)
    }
}

/// Process-local table; the lock is held only for a single record's read-modify-write.
#[derive(Debug, Default)]
pub struct MemoryIndicatorStore {
    rows: Mutex<BTreeMap<i64, IndicatorRecord>>,
}

impl MemoryIndicatorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.lock().await.is_empty()
    }
}

#[async_trait]
impl IndicatorStore for MemoryIndicatorStore {
    async fn upsert(&self, record: &IndicatorRecord) -> Result<UpsertAction, StoreError> {
        let mut rows = self.rows.lock().await;
        Ok(match rows.insert(record.item_id, record.clone()) {
            Some(_) => UpsertAction::Updated,
            None => UpsertAction::Inserted,
        })
    }

    async fn list_all(&self) -> Result<Vec<IndicatorRecord>, StoreError> {
        Ok(self.rows.lock().await.values().cloned().collect())
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
            max_retries: 0,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
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
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub fetched_at: DateTime<Utc>,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
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

    pub async fn fetch_bytes(
        &self,
        pass_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %pass_id, source_id, url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            fetched_at: Utc::now(),
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(%status, attempt, "retrying fetch after status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(error = %err, attempt, "retrying fetch after request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}
