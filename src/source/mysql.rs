//! MySQL-backed [`AccountSource`] using a shared sqlx connection pool.

use super::{Account, AccountSource};
use crate::processor::backoff::{retry_with_backoff, RetrySchedule};
use anyhow::{bail, Context, Result};
use futures::future::BoxFuture;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_MAX_CONNECTIONS: u32 = 50;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_CONNECT_ATTEMPTS: usize = 3;
const DEFAULT_CONNECT_BACKOFF_SECS: u64 = 5;

const COUNT_SQL: &str = "SELECT COUNT(*) FROM wallets";
const PAGE_SQL: &str =
    "SELECT address, privateKey, proof FROM wallets ORDER BY id LIMIT ? OFFSET ?";
const UPDATE_PROOF_SQL: &str = "UPDATE wallets SET proof = ? WHERE address = ?";
const HEALTH_PROBE_SQL: &str = "SELECT 1";

/// Invoked between failed connection attempts, e.g. to restart a local database service.
pub type RecoveryHook = Arc<dyn Fn(usize) -> BoxFuture<'static, ()> + Send + Sync>;

/// Connection pool settings for the account store.
#[derive(Clone)]
pub struct DatabaseConfig {
    url: String,
    max_connections: u32,
    connect_timeout: Duration,
    connect_attempts: usize,
    connect_backoff: Duration,
    recovery_hook: Option<RecoveryHook>,
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &redact_url(&self.url))
            .field("max_connections", &self.max_connections)
            .field("connect_timeout", &self.connect_timeout)
            .field("connect_attempts", &self.connect_attempts)
            .field("connect_backoff", &self.connect_backoff)
            .field("recovery_hook", &self.recovery_hook.is_some())
            .finish()
    }
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into().trim().to_owned(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            connect_backoff: Duration::from_secs(DEFAULT_CONNECT_BACKOFF_SECS),
            recovery_hook: None,
        }
    }

    pub fn max_connections(mut self, connections: u32) -> Self {
        self.max_connections = connections;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn connect_attempts(mut self, attempts: usize) -> Self {
        self.connect_attempts = attempts;
        self
    }

    pub fn connect_backoff(mut self, backoff: Duration) -> Self {
        self.connect_backoff = backoff;
        self
    }

    pub fn recovery_hook(mut self, hook: RecoveryHook) -> Self {
        self.recovery_hook = Some(hook);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn validate(&self) -> Result<()> {
        if !self.url.starts_with("mysql://") {
            bail!("database url must start with mysql://");
        }
        if self.max_connections == 0 {
            bail!("max_connections must be greater than 0");
        }
        if self.connect_timeout.is_zero() {
            bail!("connect_timeout must be greater than 0");
        }
        if self.connect_attempts == 0 {
            bail!("connect_attempts must be greater than 0");
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct MySqlAccountSource {
    pool: MySqlPool,
}

impl MySqlAccountSource {
    pub fn from_pool(pool: MySqlPool) -> Self {
        Self { pool }
    }

    /// Builds the pool and proves it is usable with a health probe. Retries with
    /// a fixed backoff and runs the recovery hook between attempts.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        config.validate()?;

        let pool = retry_with_backoff(
            RetrySchedule::fixed(config.connect_backoff, config.connect_attempts),
            |attempt| async move {
                if attempt > 1 {
                    if let Some(hook) = &config.recovery_hook {
                        hook(attempt - 1).await;
                    }
                }
                let pool = MySqlPoolOptions::new()
                    .max_connections(config.max_connections)
                    .acquire_timeout(config.connect_timeout)
                    .test_before_acquire(true)
                    .connect(&config.url)
                    .await
                    .with_context(|| format!("database connection attempt {attempt} failed"))?;
                sqlx::query(HEALTH_PROBE_SQL)
                    .execute(&pool)
                    .await
                    .context("database health probe failed")?;
                Ok(pool)
            },
            |failed| {
                tracing::error!(
                    attempt = failed.attempt,
                    backoff_ms = failed.retry_in.unwrap_or_default().as_millis() as u64,
                    will_retry = failed.retry_in.is_some(),
                    error = %failed.error,
                    "database connection attempt failed"
                );
            },
        )
        .await
        .with_context(|| {
            format!(
                "could not connect to {} after {} attempts; check that MySQL is running",
                redact_url(&config.url),
                config.connect_attempts
            )
        })?;

        tracing::info!(
            max_connections = config.max_connections,
            "database connected successfully"
        );
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }
}

impl AccountSource for MySqlAccountSource {
    fn count(&self) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move {
            let (count,): (i64,) = sqlx::query_as(COUNT_SQL)
                .fetch_one(&self.pool)
                .await
                .context("failed to count accounts")?;
            Ok(count.max(0) as u64)
        })
    }

    fn read_page(&self, offset: u64, limit: u64) -> BoxFuture<'_, Result<Vec<Account>>> {
        Box::pin(async move {
            let rows: Vec<(String, String, Option<String>)> = sqlx::query_as(PAGE_SQL)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await
                .with_context(|| format!("failed to read accounts at offset {offset}"))?;

            Ok(rows
                .into_iter()
                .map(|(address, credential, proof)| {
                    let account = Account::new(address, credential);
                    match proof {
                        Some(proof) => account.with_proof(proof),
                        None => account,
                    }
                })
                .collect())
        })
    }

    fn update_proof<'a>(
        &'a self,
        address: &'a str,
        proof: &'a str,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let result = sqlx::query(UPDATE_PROOF_SQL)
                .bind(proof)
                .bind(address)
                .execute(&self.pool)
                .await
                .with_context(|| format!("failed to update proof for {address}"))?;
            Ok(result.rows_affected() > 0)
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.pool.close().await;
            tracing::info!("database pool closed");
        })
    }
}

fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://<redacted>{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_owned(),
    }
}
