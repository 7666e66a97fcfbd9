//! Scheduler state and configuration models.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// Number of recent sync durations kept for the rolling average.
pub const SYNC_DURATION_WINDOW: usize = 10;

/// Inclusive bounds for the recurring sync interval, in minutes.
pub const MIN_SYNC_INTERVAL_MINUTES: u32 = 1;
pub const MAX_SYNC_INTERVAL_MINUTES: u32 = 60;

/// Default page/batch size for imports.
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Default bound on the candidate set fetched per sync.
pub const DEFAULT_MAX_RESULTS: usize = 1000;

/// Outcome of the most recent sync attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    Success,
    Failure,
}

/// Persisted scheduler state. Survives process restarts through the
/// persistence collaborator; every field tolerates absence so a corrupt or
/// missing blob degrades to the zero-valued default instead of failing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncState {
    pub last_sync_time: Option<DateTime<Utc>>,
    pub last_sync_status: Option<SyncOutcome>,
    pub total_sync_count: u64,
    /// Consecutive failures; sole authority for backoff timing.
    pub failure_count: u32,
    pub successful_sync_count: u64,
    pub failed_sync_count: u64,
    /// Ring buffer of the most recent run durations, oldest dropped first.
    pub sync_durations_ms: VecDeque<u64>,
}

impl SyncState {
    pub fn record_success(&mut self, at: DateTime<Utc>, duration_ms: u64) {
        self.last_sync_time = Some(at);
        self.last_sync_status = Some(SyncOutcome::Success);
        self.total_sync_count += 1;
        self.successful_sync_count += 1;
        self.failure_count = 0;
        self.push_duration(duration_ms);
    }

    pub fn record_failure(&mut self, at: DateTime<Utc>, duration_ms: u64) {
        self.last_sync_time = Some(at);
        self.last_sync_status = Some(SyncOutcome::Failure);
        self.total_sync_count += 1;
        self.failed_sync_count += 1;
        self.failure_count += 1;
        self.push_duration(duration_ms);
    }

    fn push_duration(&mut self, duration_ms: u64) {
        if self.sync_durations_ms.len() >= SYNC_DURATION_WINDOW {
            self.sync_durations_ms.pop_front();
        }
        self.sync_durations_ms.push_back(duration_ms);
    }

    /// Mean of the recorded durations; 0 when none were recorded yet.
    pub fn average_duration_ms(&self) -> f64 {
        if self.sync_durations_ms.is_empty() {
            return 0.0;
        }
        let sum: u64 = self.sync_durations_ms.iter().sum();
        sum as f64 / self.sync_durations_ms.len() as f64
    }
}

/// Scheduler status as reported in [`SyncStatistics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerStatus {
    #[default]
    Idle,
    Syncing,
    Error,
}

/// Derived statistics view over [`SyncState`]; never persisted separately.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatistics {
    pub total_syncs: u64,
    pub successful_syncs: u64,
    pub failed_syncs: u64,
    pub average_sync_duration_ms: f64,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub current_status: SchedulerStatus,
}

impl SyncStatistics {
    pub fn from_state(state: &SyncState, current_status: SchedulerStatus) -> Self {
        Self {
            total_syncs: state.total_sync_count,
            successful_syncs: state.successful_sync_count,
            failed_syncs: state.failed_sync_count,
            average_sync_duration_ms: state.average_duration_ms(),
            last_sync_time: state.last_sync_time,
            current_status,
        }
    }
}

/// Configuration for the recurring sync scheduler. Owned by the caller and
/// replaced wholesale on update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoSyncConfig {
    pub enabled: bool,
    /// Query descriptor handed to the ticket source on each run.
    pub query: String,
    /// Recurring interval in minutes; valid range 1..=60.
    pub sync_interval: u32,
    pub max_results: usize,
    pub batch_size: usize,
}

impl Default for AutoSyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            query: String::new(),
            sync_interval: 30,
            max_results: DEFAULT_MAX_RESULTS,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl AutoSyncConfig {
    pub fn validate_interval(minutes: u32) -> Result<()> {
        if !(MIN_SYNC_INTERVAL_MINUTES..=MAX_SYNC_INTERVAL_MINUTES).contains(&minutes) {
            return Err(Error::validation(format!(
                "sync interval must be between {} and {} minutes, got {}",
                MIN_SYNC_INTERVAL_MINUTES, MAX_SYNC_INTERVAL_MINUTES, minutes
            )));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        Self::validate_interval(self.sync_interval)?;
        if self.batch_size == 0 {
            return Err(Error::validation("batch size must be greater than zero"));
        }
        Ok(())
    }
}
