use std::time::Duration;
use tokio::time::Instant;

/// How a pass left the paging loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassEnd {
    /// Every page up to the snapshot total was read, or the source ran dry.
    Drained,
    /// A page read exhausted its retries; the rest of the pass was skipped.
    Aborted,
    /// Shutdown was requested mid-pass.
    Cancelled,
}

/// Running counters for one pass. Created at `START`, discarded after the summary.
#[derive(Debug)]
pub struct PassStats {
    pass: u64,
    started: Instant,
    total: u64,
    processed: u64,
    errors: u64,
    waves: u64,
}

impl PassStats {
    pub fn new(pass: u64, total: u64) -> Self {
        Self {
            pass,
            started: Instant::now(),
            total,
            processed: 0,
            errors: 0,
            waves: 0,
        }
    }

    pub fn record_wave(&mut self, size: usize, errors: usize) {
        self.processed = self.processed.saturating_add(size as u64);
        self.errors = self.errors.saturating_add(errors as u64);
        self.waves = self.waves.saturating_add(1);
    }

    pub fn processed(&self) -> u64 {
        self.processed
    }

    pub fn errors(&self) -> u64 {
        self.errors
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn finish(self, end: PassEnd) -> PassSummary {
        PassSummary {
            pass: self.pass,
            total: self.total,
            processed: self.processed,
            errors: self.errors,
            waves: self.waves,
            elapsed: self.started.elapsed(),
            end,
        }
    }
}

/// Completion record for one pass.
#[derive(Debug, Clone, PartialEq)]
pub struct PassSummary {
    pub pass: u64,
    pub total: u64,
    pub processed: u64,
    pub errors: u64,
    pub waves: u64,
    pub elapsed: Duration,
    pub end: PassEnd,
}

impl PassSummary {
    pub fn total_time_minutes(&self) -> f64 {
        self.elapsed.as_secs_f64() / 60.0
    }

    /// Average minutes spent per processed account; zero when nothing was processed.
    pub fn avg_minutes_per_account(&self) -> f64 {
        if self.processed == 0 {
            return 0.0;
        }
        self.total_time_minutes() / self.processed as f64
    }

    pub fn log(&self) {
        tracing::info!(
            pass = self.pass,
            total_processed = self.processed,
            total_time_minutes = format!("{:.2}", self.total_time_minutes()),
            avg_time_per_account = format!("{:.2}", self.avg_minutes_per_account()),
            error_count = self.errors,
            waves = self.waves,
            end = ?self.end,
            "pass finished"
        );
    }
}
