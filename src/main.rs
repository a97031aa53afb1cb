use anyhow::{Context, Result};
use nodesweep::source::mysql::DEFAULT_MAX_CONNECTIONS;
use nodesweep::{
    init_tracing, load_proxies, DatabaseConfig, EngineConfig, HttpAccountServiceFactory,
    MySqlAccountSource, ProxyRotator, RunExit, Runner,
};
use std::env;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_PROXY_FILE: &str = "proxy.txt";

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = dotenvy::dotenv() {
        if !err.not_found() {
            eprintln!("failed to load .env: {err}");
        }
    }
    init_tracing();

    match run().await {
        Ok(exit) => {
            tracing::info!(?exit, "nodesweep stopped");
            ExitCode::SUCCESS
        }
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "nodesweep stopped on a fatal error");
            ExitCode::from(1)
        }
    }
}

async fn run() -> Result<RunExit> {
    let engine = engine_config_from_env()?;
    let database = DatabaseConfig::new(required_env("NODESWEEP_DATABASE_URL")?)
        .max_connections(parse_env_with_default(
            "NODESWEEP_DB_MAX_CONNECTIONS",
            DEFAULT_MAX_CONNECTIONS,
        )?);
    let service_url = required_env("NODESWEEP_SERVICE_URL")?;
    let proxy_file = read_env_or_default("NODESWEEP_PROXY_FILE", DEFAULT_PROXY_FILE);

    let proxies = load_proxies(&proxy_file).await?;
    let factory = HttpAccountServiceFactory::new(service_url)?;
    let source = MySqlAccountSource::connect(&database).await?;

    let mut runner = Runner::new(
        engine,
        Arc::new(source),
        Arc::new(factory),
        ProxyRotator::new(proxies),
    );
    runner.run_until_signal().await
}

fn engine_config_from_env() -> Result<EngineConfig> {
    let workers = parse_env_with_default(
        "NODESWEEP_WORKERS",
        nodesweep::runtime::config::DEFAULT_WORKER_COUNT,
    )?;
    let mut builder = EngineConfig::builder()
        .worker_count(workers)
        .batch_size(parse_env_with_default("NODESWEEP_BATCH_SIZE", workers)?)
        .start_offset(parse_env_with_default("NODESWEEP_START_OFFSET", 0u64)?)
        .task_timeout(Duration::from_secs(parse_env_with_default(
            "NODESWEEP_TASK_TIMEOUT_SECS",
            nodesweep::runtime::config::DEFAULT_TASK_TIMEOUT.as_secs(),
        )?))
        .pass_cooldown(Duration::from_secs(parse_env_with_default(
            "NODESWEEP_PASS_COOLDOWN_SECS",
            nodesweep::runtime::config::DEFAULT_PASS_COOLDOWN.as_secs(),
        )?))
        .respawn_workers(parse_env_with_default("NODESWEEP_RESPAWN_WORKERS", false)?);

    if let Some(limit) = parse_env_optional::<u64>("NODESWEEP_MAX_ACCOUNTS")? {
        builder = builder.max_accounts(limit);
    }

    builder.build().context("invalid engine configuration")
}

fn required_env(key: &str) -> Result<String> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        Ok(_) => anyhow::bail!("{key} is set but empty"),
        Err(err) => Err(err).with_context(|| format!("{key} must be set")),
    }
}

fn read_env_or_default(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => value,
        _ => default.to_string(),
    }
}

fn parse_env_with_default<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    Ok(parse_env_optional(key)?.unwrap_or(default))
}

fn parse_env_optional<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("failed to parse {key}='{value}'")),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err).with_context(|| format!("failed to read {key}")),
    }
}
