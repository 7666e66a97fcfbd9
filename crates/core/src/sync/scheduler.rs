//! Recurring sync scheduler with exponential retry backoff.
//!
//! The scheduler owns a background loop that runs the configured [`SyncJob`]
//! at a fixed interval while the last run succeeded, and on an exponential
//! backoff schedule while runs keep failing. Manual triggers share a
//! single-flight guard with the scheduled path so at most one sync executes
//! at any time.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use log::{debug, info, warn};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::errors::{Error, Result};
use crate::sync::{
    AutoSyncConfig, Notifier, SchedulerStatus, StateStore, SyncState, SyncStatistics,
};

/// First retry delay after a failed run, in milliseconds (one minute).
pub const RETRY_BASE_DELAY_MS: u64 = 60_000;

/// Ceiling for the retry delay, in milliseconds (thirty minutes).
pub const RETRY_MAX_DELAY_MS: u64 = 1_800_000;

/// Top-level key the scheduler state lives under in the persisted blob.
const SCHEDULER_STATE_KEY: &str = "schedulerState";

/// Retry delay for the given consecutive-failure count:
/// `min(base * 2^(n-1), cap)`. A count of zero means no failures, which gets
/// the base delay.
pub fn retry_backoff_ms(consecutive_failures: u32) -> u64 {
    if consecutive_failures == 0 {
        return RETRY_BASE_DELAY_MS;
    }
    // 2^10 minutes already exceeds the cap, so clamp the exponent before
    // shifting to avoid overflow on large failure counts.
    let exponent = (consecutive_failures - 1).min(10);
    RETRY_BASE_DELAY_MS
        .saturating_mul(1 << exponent)
        .min(RETRY_MAX_DELAY_MS)
}

/// Context passed to each job invocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncJobContext {
    /// True for the run fired immediately when the scheduler starts.
    pub is_initial: bool,
    /// True when the run was requested by the caller instead of the timer.
    pub is_manual: bool,
}

/// The work the scheduler runs on each tick.
#[async_trait]
pub trait SyncJob: Send + Sync {
    async fn run(&self, ctx: SyncJobContext) -> Result<()>;
}

struct SchedulerInner {
    job: Arc<dyn SyncJob>,
    store: Arc<dyn StateStore>,
    notifier: Arc<dyn Notifier>,
    config: StdMutex<AutoSyncConfig>,
    state: StdMutex<SyncState>,
    status: StdMutex<SchedulerStatus>,
    running: AtomicBool,
    /// Single-flight guard shared by scheduled and manual runs.
    run_guard: Mutex<()>,
    loop_task: Mutex<Option<JoinHandle<()>>>,
    /// Poked when the interval changes so the sleeping loop re-arms.
    reschedule: Notify,
}

/// Cheaply cloneable handle to the scheduler; all clones share state.
#[derive(Clone)]
pub struct SyncScheduler {
    inner: Arc<SchedulerInner>,
}

impl SyncScheduler {
    pub fn new(
        job: Arc<dyn SyncJob>,
        store: Arc<dyn StateStore>,
        notifier: Arc<dyn Notifier>,
        config: AutoSyncConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                job,
                store,
                notifier,
                config: StdMutex::new(config),
                state: StdMutex::new(SyncState::default()),
                status: StdMutex::new(SchedulerStatus::Idle),
                running: AtomicBool::new(false),
                run_guard: Mutex::new(()),
                loop_task: Mutex::new(None),
                reschedule: Notify::new(),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Start the background loop. Idempotent; a second call while running is
    /// a no-op. The first run fires immediately.
    pub async fn start(&self) {
        if self
            .inner
            .running
            .swap(true, Ordering::SeqCst)
        {
            debug!("[Scheduler] Start requested but loop is already running");
            return;
        }
        self.load_state().await;
        info!("[Scheduler] Starting background sync loop");
        let scheduler = self.clone();
        let handle = tokio::spawn(scheduler.run_loop());
        *self.inner.loop_task.lock().await = Some(handle);
    }

    /// Stop the background loop. Idempotent. A sync already in flight is
    /// aborted with the loop.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("[Scheduler] Stopping background sync loop");
        self.inner.reschedule.notify_waiters();
        if let Some(handle) = self.inner.loop_task.lock().await.take() {
            handle.abort();
        }
        *self.status_mut() = SchedulerStatus::Idle;
    }

    /// Run one sync now, outside the timer schedule. Returns false when a
    /// sync is already in flight. Manual failures count toward statistics but
    /// never re-arm the retry timer.
    pub async fn trigger_manual_sync(&self) -> bool {
        let ctx = SyncJobContext {
            is_initial: false,
            is_manual: true,
        };
        self.execute(ctx).await.is_some()
    }

    /// Change the recurring interval. Takes effect on the next re-arm, which
    /// this forces immediately when the loop is running.
    pub fn update_interval(&self, minutes: u32) -> Result<()> {
        AutoSyncConfig::validate_interval(minutes)?;
        self.config_mut().sync_interval = minutes;
        info!("[Scheduler] Sync interval updated to {} minutes", minutes);
        if self.is_running() {
            self.inner.reschedule.notify_waiters();
        }
        Ok(())
    }

    /// Replace the whole configuration. Starts or stops the loop when the
    /// enabled flag flips, and re-arms the timer when the interval changed.
    pub async fn update_config(&self, config: AutoSyncConfig) -> Result<()> {
        config.validate()?;
        let previous_interval = {
            let mut current = self.config_mut();
            let previous = current.sync_interval;
            *current = config.clone();
            previous
        };
        let running = self.is_running();
        if config.enabled && !running {
            self.start().await;
        } else if !config.enabled && running {
            self.stop().await;
        } else if running && config.sync_interval != previous_interval {
            self.inner.reschedule.notify_waiters();
        }
        Ok(())
    }

    pub fn config(&self) -> AutoSyncConfig {
        self.config_mut().clone()
    }

    pub fn state(&self) -> SyncState {
        self.state_mut().clone()
    }

    pub fn statistics(&self) -> SyncStatistics {
        let status = *self.status_mut();
        SyncStatistics::from_state(&self.state_mut(), status)
    }

    /// Load persisted state. Tolerant: a missing or corrupt blob degrades to
    /// the default state with a warning, never an error.
    async fn load_state(&self) {
        let blob = match self.inner.store.load_state().await {
            Ok(blob) => blob,
            Err(e) => {
                warn!("[Scheduler] Failed to load persisted state: {}", e);
                None
            }
        };
        let state = blob
            .and_then(|blob| blob.get(SCHEDULER_STATE_KEY).cloned())
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or_default();
        *self.state_mut() = state;
    }

    async fn save_state(&self) {
        let value = match serde_json::to_value(self.state()) {
            Ok(value) => value,
            Err(e) => {
                warn!("[Scheduler] Failed to serialize state: {}", e);
                return;
            }
        };
        let patch = serde_json::json!({ SCHEDULER_STATE_KEY: value });
        if let Err(e) = self.inner.store.save_state(patch).await {
            warn!("[Scheduler] Failed to persist state: {}", e);
        }
    }

    async fn run_loop(self) {
        let mut is_initial = true;
        loop {
            if !self.is_running() {
                return;
            }
            let ctx = SyncJobContext {
                is_initial,
                is_manual: false,
            };
            is_initial = false;
            self.execute(ctx).await;

            // Sleep until the next tick, re-arming whenever the interval
            // changes underneath us.
            loop {
                let delay = Duration::from_millis(self.next_delay_ms());
                tokio::select! {
                    _ = tokio::time::sleep(delay) => break,
                    _ = self.inner.reschedule.notified() => {
                        if !self.is_running() {
                            return;
                        }
                    }
                }
            }
        }
    }

    fn next_delay_ms(&self) -> u64 {
        let failure_count = self.state_mut().failure_count;
        if failure_count > 0 {
            let delay = retry_backoff_ms(failure_count);
            debug!(
                "[Scheduler] {} consecutive failure(s), retrying in {} ms",
                failure_count, delay
            );
            delay
        } else {
            u64::from(self.config_mut().sync_interval) * 60_000
        }
    }

    /// Run the job once under the single-flight guard. Returns `None` when a
    /// sync is already in flight, otherwise `Some(success)`.
    async fn execute(&self, ctx: SyncJobContext) -> Option<bool> {
        let Ok(_guard) = self.inner.run_guard.try_lock() else {
            debug!("[Scheduler] Sync already in flight, skipping");
            return None;
        };
        *self.status_mut() = SchedulerStatus::Syncing;
        let started = Instant::now();

        let outcome = AssertUnwindSafe(self.inner.job.run(ctx))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(Error::job(panic_message(panic))));

        let duration_ms = started.elapsed().as_millis() as u64;
        let now = Utc::now();
        let success = match outcome {
            Ok(()) => {
                self.state_mut().record_success(now, duration_ms);
                *self.status_mut() = SchedulerStatus::Idle;
                debug!("[Scheduler] Sync finished in {} ms", duration_ms);
                true
            }
            Err(e) => {
                self.state_mut().record_failure(now, duration_ms);
                *self.status_mut() = SchedulerStatus::Error;
                warn!("[Scheduler] Sync failed after {} ms: {}", duration_ms, e);
                self.inner.notifier.notify(&format!("Sync failed: {}", e));
                false
            }
        };
        self.save_state().await;
        Some(success)
    }

    // A poisoned lock only means a callback panicked mid-update; recover the
    // guard and keep the loop alive.
    fn config_mut(&self) -> MutexGuard<'_, AutoSyncConfig> {
        self.inner
            .config
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn state_mut(&self) -> MutexGuard<'_, SyncState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn status_mut(&self) -> MutexGuard<'_, SchedulerStatus> {
        self.inner
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "job panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_one_minute() {
        assert_eq!(retry_backoff_ms(1), 60_000);
        assert_eq!(retry_backoff_ms(2), 120_000);
        assert_eq!(retry_backoff_ms(3), 240_000);
        assert_eq!(retry_backoff_ms(4), 480_000);
        assert_eq!(retry_backoff_ms(5), 960_000);
    }

    #[test]
    fn backoff_caps_at_thirty_minutes() {
        assert_eq!(retry_backoff_ms(6), RETRY_MAX_DELAY_MS);
        assert_eq!(retry_backoff_ms(10), RETRY_MAX_DELAY_MS);
        assert_eq!(retry_backoff_ms(u32::MAX), RETRY_MAX_DELAY_MS);
    }

    #[test]
    fn backoff_formula_matches_min_expression() {
        for n in 1..=12u32 {
            let expected =
                (RETRY_BASE_DELAY_MS as u128 * 2u128.pow(n - 1)).min(RETRY_MAX_DELAY_MS as u128);
            assert_eq!(retry_backoff_ms(n) as u128, expected);
        }
    }
}
