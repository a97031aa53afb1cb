use crate::runtime::telemetry;
use anyhow::{bail, Result};
use std::time::Duration;

pub const DEFAULT_WORKER_COUNT: usize = 4;
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_STARTUP_DELAY: Duration = Duration::from_secs(3);
pub const DEFAULT_WORKER_SPAWN_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_WAVE_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_TASK_DELAY: Duration = Duration::from_secs(2);
pub const DEFAULT_STEP_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_PASS_COOLDOWN: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_PAGE_RETRY_ATTEMPTS: usize = 3;
pub const DEFAULT_PAGE_RETRY_DELAY: Duration = Duration::from_secs(2);
pub const DEFAULT_PROGRESS_LOG_INTERVAL: u64 = 100;

/// Runtime configuration for the sweep engine.
///
/// All instances must be constructed via [`EngineConfig::builder`] or [`EngineConfig::new`]
/// so invariants are validated before any consumer observes the values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    worker_count: usize,
    batch_size: usize,
    start_offset: u64,
    max_accounts: Option<u64>,
    task_timeout: Duration,
    startup_delay: Duration,
    worker_spawn_delay: Duration,
    wave_delay: Duration,
    task_delay: Duration,
    step_delay: Duration,
    pass_cooldown: Duration,
    page_retry_attempts: usize,
    page_retry_delay: Duration,
    metrics_interval: Duration,
    progress_log_interval: u64,
    respawn_workers: bool,
}

pub struct EngineConfigParams {
    pub worker_count: usize,
    pub batch_size: usize,
    pub start_offset: u64,
    pub max_accounts: Option<u64>,
    pub task_timeout: Duration,
    pub startup_delay: Duration,
    pub worker_spawn_delay: Duration,
    pub wave_delay: Duration,
    pub task_delay: Duration,
    pub step_delay: Duration,
    pub pass_cooldown: Duration,
    pub page_retry_attempts: usize,
    pub page_retry_delay: Duration,
    pub metrics_interval: Duration,
    pub progress_log_interval: u64,
    pub respawn_workers: bool,
}

impl EngineConfig {
    /// Returns a builder to incrementally construct and validate a configuration.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Constructs a configuration directly from the provided values.
    ///
    /// Prefer [`EngineConfig::builder`] when most values use defaults.
    pub fn new(params: EngineConfigParams) -> Result<Self> {
        let EngineConfigParams {
            worker_count,
            batch_size,
            start_offset,
            max_accounts,
            task_timeout,
            startup_delay,
            worker_spawn_delay,
            wave_delay,
            task_delay,
            step_delay,
            pass_cooldown,
            page_retry_attempts,
            page_retry_delay,
            metrics_interval,
            progress_log_interval,
            respawn_workers,
        } = params;

        let config = Self {
            worker_count,
            batch_size,
            start_offset,
            max_accounts,
            task_timeout,
            startup_delay,
            worker_spawn_delay,
            wave_delay,
            task_delay,
            step_delay,
            pass_cooldown,
            page_retry_attempts,
            page_retry_delay,
            metrics_interval,
            progress_log_interval,
            respawn_workers,
        };

        config.validate()?;
        Ok(config)
    }

    /// Number of long-lived workers owned by the pool.
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Accounts read per page; one page is dispatched as one wave.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Offset each pass starts paging from.
    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    /// Optional cap on the number of accounts a single pass visits.
    pub fn max_accounts(&self) -> Option<u64> {
        self.max_accounts
    }

    /// Time budget for one task, measured from dispatch to Outcome.
    pub fn task_timeout(&self) -> Duration {
        self.task_timeout
    }

    pub fn startup_delay(&self) -> Duration {
        self.startup_delay
    }

    /// Pause between consecutive worker spawns during pool initialization.
    pub fn worker_spawn_delay(&self) -> Duration {
        self.worker_spawn_delay
    }

    /// Pause after a wave settles, before the next page is read.
    pub fn wave_delay(&self) -> Duration {
        self.wave_delay
    }

    /// Pause after each task settles inside a wave.
    pub fn task_delay(&self) -> Duration {
        self.task_delay
    }

    /// Pause used by workers between remote steps.
    pub fn step_delay(&self) -> Duration {
        self.step_delay
    }

    /// Idle time between two passes.
    pub fn pass_cooldown(&self) -> Duration {
        self.pass_cooldown
    }

    pub fn page_retry_attempts(&self) -> usize {
        self.page_retry_attempts
    }

    pub fn page_retry_delay(&self) -> Duration {
        self.page_retry_delay
    }

    /// Interval used by the telemetry reporter.
    pub fn metrics_interval(&self) -> Duration {
        self.metrics_interval
    }

    /// Emit a progress line every time this many accounts have been processed.
    pub fn progress_log_interval(&self) -> u64 {
        self.progress_log_interval
    }

    /// Whether a worker that exits fatally is replaced on the same index.
    pub fn respawn_workers(&self) -> bool {
        self.respawn_workers
    }

    /// Performs validation on an existing configuration instance.
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            bail!("worker_count must be greater than 0");
        }

        if self.batch_size == 0 {
            bail!("batch_size must be greater than 0");
        }

        if self.batch_size > self.worker_count {
            bail!(
                "batch_size ({}) must not exceed worker_count ({}); a wave holds at most one task per worker",
                self.batch_size,
                self.worker_count,
            );
        }

        if self.task_timeout.is_zero() {
            bail!("task_timeout must be greater than 0");
        }

        if self.page_retry_attempts == 0 {
            bail!("page_retry_attempts must be greater than 0");
        }

        if self.metrics_interval.is_zero() {
            bail!("metrics_interval must be greater than 0");
        }

        if self.progress_log_interval == 0 {
            bail!("progress_log_interval must be greater than 0");
        }

        if self.max_accounts == Some(0) {
            bail!("max_accounts must be greater than 0 when set");
        }

        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct EngineConfigBuilder {
    worker_count: Option<usize>,
    batch_size: Option<usize>,
    start_offset: Option<u64>,
    max_accounts: Option<u64>,
    task_timeout: Option<Duration>,
    startup_delay: Option<Duration>,
    worker_spawn_delay: Option<Duration>,
    wave_delay: Option<Duration>,
    task_delay: Option<Duration>,
    step_delay: Option<Duration>,
    pass_cooldown: Option<Duration>,
    page_retry_attempts: Option<usize>,
    page_retry_delay: Option<Duration>,
    metrics_interval: Option<Duration>,
    progress_log_interval: Option<u64>,
    respawn_workers: Option<bool>,
}

impl EngineConfigBuilder {
    pub fn worker_count(mut self, count: usize) -> Self {
        self.worker_count = Some(count);
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    pub fn start_offset(mut self, offset: u64) -> Self {
        self.start_offset = Some(offset);
        self
    }

    pub fn max_accounts(mut self, limit: u64) -> Self {
        self.max_accounts = Some(limit);
        self
    }

    pub fn task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = Some(timeout);
        self
    }

    pub fn startup_delay(mut self, delay: Duration) -> Self {
        self.startup_delay = Some(delay);
        self
    }

    pub fn worker_spawn_delay(mut self, delay: Duration) -> Self {
        self.worker_spawn_delay = Some(delay);
        self
    }

    pub fn wave_delay(mut self, delay: Duration) -> Self {
        self.wave_delay = Some(delay);
        self
    }

    pub fn task_delay(mut self, delay: Duration) -> Self {
        self.task_delay = Some(delay);
        self
    }

    pub fn step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = Some(delay);
        self
    }

    pub fn pass_cooldown(mut self, cooldown: Duration) -> Self {
        self.pass_cooldown = Some(cooldown);
        self
    }

    pub fn page_retry_attempts(mut self, attempts: usize) -> Self {
        self.page_retry_attempts = Some(attempts);
        self
    }

    pub fn page_retry_delay(mut self, delay: Duration) -> Self {
        self.page_retry_delay = Some(delay);
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = Some(interval);
        self
    }

    pub fn progress_log_interval(mut self, accounts: u64) -> Self {
        self.progress_log_interval = Some(accounts);
        self
    }

    pub fn respawn_workers(mut self, respawn: bool) -> Self {
        self.respawn_workers = Some(respawn);
        self
    }

    /// Collapses every delay to zero so tests run at full speed. The task timeout
    /// is left untouched.
    pub fn without_delays(self) -> Self {
        self.startup_delay(Duration::ZERO)
            .worker_spawn_delay(Duration::ZERO)
            .wave_delay(Duration::ZERO)
            .task_delay(Duration::ZERO)
            .step_delay(Duration::ZERO)
            .page_retry_delay(Duration::ZERO)
            .pass_cooldown(Duration::ZERO)
    }

    pub fn build(self) -> Result<EngineConfig> {
        let worker_count = self.worker_count.unwrap_or(DEFAULT_WORKER_COUNT);
        let params = EngineConfigParams {
            worker_count,
            batch_size: self.batch_size.unwrap_or(worker_count),
            start_offset: self.start_offset.unwrap_or(0),
            max_accounts: self.max_accounts,
            task_timeout: self.task_timeout.unwrap_or(DEFAULT_TASK_TIMEOUT),
            startup_delay: self.startup_delay.unwrap_or(DEFAULT_STARTUP_DELAY),
            worker_spawn_delay: self
                .worker_spawn_delay
                .unwrap_or(DEFAULT_WORKER_SPAWN_DELAY),
            wave_delay: self.wave_delay.unwrap_or(DEFAULT_WAVE_DELAY),
            task_delay: self.task_delay.unwrap_or(DEFAULT_TASK_DELAY),
            step_delay: self.step_delay.unwrap_or(DEFAULT_STEP_DELAY),
            pass_cooldown: self.pass_cooldown.unwrap_or(DEFAULT_PASS_COOLDOWN),
            page_retry_attempts: self
                .page_retry_attempts
                .unwrap_or(DEFAULT_PAGE_RETRY_ATTEMPTS),
            page_retry_delay: self.page_retry_delay.unwrap_or(DEFAULT_PAGE_RETRY_DELAY),
            metrics_interval: self
                .metrics_interval
                .unwrap_or(telemetry::DEFAULT_METRICS_INTERVAL),
            progress_log_interval: self
                .progress_log_interval
                .unwrap_or(DEFAULT_PROGRESS_LOG_INTERVAL),
            respawn_workers: self.respawn_workers.unwrap_or(false),
        };

        EngineConfig::new(params)
    }
}
