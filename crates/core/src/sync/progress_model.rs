//! Shared progress/state model: sync phases, bounded error log, time
//! estimation, and cancellation bookkeeping used by the scheduler and the
//! bulk import engine.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sync::MaterializeOutcome;

/// Maximum number of error entries retained per run; oldest are dropped.
pub const MAX_ERROR_LOG: usize = 100;

/// Lifecycle phase of a sync run.
///
/// Runs move forward along `Initializing → Searching → Downloading →
/// Processing → Finalizing → Complete` without skipping; `Error` and
/// `Cancelled` are fault/abort edges reachable from any non-terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    #[default]
    Initializing,
    Searching,
    Downloading,
    Processing,
    Finalizing,
    Complete,
    Cancelled,
    Error,
}

impl SyncPhase {
    /// Terminal phases admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Cancelled | Self::Error)
    }

    /// Position along the forward chain; `None` for abort phases.
    fn forward_rank(self) -> Option<u8> {
        match self {
            Self::Initializing => Some(0),
            Self::Searching => Some(1),
            Self::Downloading => Some(2),
            Self::Processing => Some(3),
            Self::Finalizing => Some(4),
            Self::Complete => Some(5),
            Self::Cancelled | Self::Error => None,
        }
    }

    /// The next phase along the forward chain, if any.
    pub fn next_forward(self) -> Option<Self> {
        match self {
            Self::Initializing => Some(Self::Searching),
            Self::Searching => Some(Self::Downloading),
            Self::Downloading => Some(Self::Processing),
            Self::Processing => Some(Self::Finalizing),
            Self::Finalizing => Some(Self::Complete),
            Self::Complete | Self::Cancelled | Self::Error => None,
        }
    }

    /// Whether a user may request cancellation while in this phase.
    pub fn allows_cancel(self) -> bool {
        !matches!(self, Self::Finalizing | Self::Complete | Self::Cancelled)
    }

    /// Whether a user may request a pause while in this phase.
    pub fn allows_pause(self) -> bool {
        matches!(self, Self::Downloading | Self::Processing)
    }
}

/// Validates a phase transition: forward-only, adjacent steps, fault edges
/// from non-terminal phases, nothing out of a terminal phase.
pub fn is_valid_phase_transition(from: SyncPhase, to: SyncPhase) -> bool {
    if from.is_terminal() {
        return false;
    }
    match to {
        SyncPhase::Error | SyncPhase::Cancelled => true,
        _ => match (from.forward_rank(), to.forward_rank()) {
            (Some(from_rank), Some(to_rank)) => to_rank == from_rank + 1,
            _ => false,
        },
    }
}

/// Category tag attached to recorded errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncErrorCode {
    Network,
    Validation,
    Conflict,
    Processing,
    Persistence,
    NotFound,
    #[default]
    Unknown,
}

/// One immutable entry in a run's bounded error log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncErrorEntry {
    pub code: SyncErrorCode,
    pub message: String,
    pub phase: SyncPhase,
    pub timestamp: DateTime<Utc>,
    pub retry_attempt: u32,
    pub max_retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub technical_detail: Option<String>,
}

impl Default for SyncErrorEntry {
    fn default() -> Self {
        Self {
            code: SyncErrorCode::Unknown,
            message: String::new(),
            phase: SyncPhase::Initializing,
            timestamp: Utc::now(),
            retry_attempt: 0,
            max_retries: 0,
            next_retry_at: None,
            record_id: None,
            user_action: None,
            technical_detail: None,
        }
    }
}

impl SyncErrorEntry {
    /// Create an entry with defaults for every optional field.
    pub fn new(code: SyncErrorCode, message: impl Into<String>, phase: SyncPhase) -> Self {
        Self {
            code,
            message: message.into(),
            phase,
            ..Self::default()
        }
    }

    pub fn with_record_id(mut self, record_id: impl Into<String>) -> Self {
        self.record_id = Some(record_id.into());
        self
    }

    pub fn with_user_action(mut self, user_action: impl Into<String>) -> Self {
        self.user_action = Some(user_action.into());
        self
    }

    pub fn with_technical_detail(mut self, detail: impl Into<String>) -> Self {
        self.technical_detail = Some(detail.into());
        self
    }

    pub fn with_retry(
        mut self,
        retry_attempt: u32,
        max_retries: u32,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Self {
        self.retry_attempt = retry_attempt;
        self.max_retries = max_retries;
        self.next_retry_at = next_retry_at;
        self
    }
}

/// Progress of a single sync run.
///
/// Counters hold `current <= total` and `processed + failed <= current`.
/// Instances are created fresh per run; snapshots handed to callbacks are
/// plain `Clone` copies and never alias engine-internal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub current: usize,
    pub total: usize,
    pub processed: usize,
    pub failed: usize,
    pub phase: SyncPhase,
    pub phase_start_time: DateTime<Utc>,
    pub start_time: DateTime<Utc>,
    pub estimated_time_remaining_ms: Option<i64>,
    pub errors: VecDeque<SyncErrorEntry>,
    pub warnings: Vec<String>,
    pub cancellation_requested: bool,
    pub cancellation_token: Option<String>,
}

impl SyncProgress {
    pub fn new(total: usize) -> Self {
        let now = Utc::now();
        Self {
            current: 0,
            total,
            processed: 0,
            failed: 0,
            phase: SyncPhase::Initializing,
            phase_start_time: now,
            start_time: now,
            estimated_time_remaining_ms: None,
            errors: VecDeque::new(),
            warnings: Vec::new(),
            cancellation_requested: false,
            cancellation_token: None,
        }
    }

    /// Move to `to` if the transition is valid; returns whether it happened.
    pub fn transition_to(&mut self, to: SyncPhase) -> bool {
        if !is_valid_phase_transition(self.phase, to) {
            return false;
        }
        self.phase = to;
        self.phase_start_time = Utc::now();
        true
    }

    /// Walk forward to `target`, passing through intermediate phases so a
    /// short-circuited run (e.g. empty result set) still honors adjacency.
    pub fn advance_to(&mut self, target: SyncPhase) -> bool {
        if self.phase == target {
            return true;
        }
        if matches!(target, SyncPhase::Error | SyncPhase::Cancelled) {
            return self.transition_to(target);
        }
        while self.phase != target {
            let Some(next) = self.phase.next_forward() else {
                return false;
            };
            if !self.transition_to(next) {
                return false;
            }
        }
        true
    }

    /// Append an error, dropping the oldest entry beyond [`MAX_ERROR_LOG`].
    pub fn record_error(&mut self, entry: SyncErrorEntry) {
        if self.errors.len() >= MAX_ERROR_LOG {
            self.errors.pop_front();
        }
        self.errors.push_back(entry);
    }

    pub fn push_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    /// Request cooperative cancellation. The first caller's token wins;
    /// later calls are no-ops and never overwrite the stored token.
    pub fn request_cancellation(&mut self, token: impl Into<String>) {
        if self.cancellation_requested {
            return;
        }
        self.cancellation_requested = true;
        self.cancellation_token = Some(token.into());
    }

    /// Estimated remaining time as `(elapsed / processed) * (total - processed)`.
    ///
    /// `None` when nothing was processed yet or the recorded timestamps are
    /// inconsistent (start time in the future); `Some(0)` once done. Never
    /// NaN or negative; saturates instead of overflowing.
    pub fn estimate_remaining_ms(&self, now: DateTime<Utc>) -> Option<i64> {
        if self.total > 0 && self.processed >= self.total {
            return Some(0);
        }
        if self.processed == 0 {
            return None;
        }
        let elapsed_ms = now.signed_duration_since(self.start_time).num_milliseconds();
        if elapsed_ms < 0 {
            return None;
        }
        let per_item = elapsed_ms as f64 / self.processed as f64;
        let remaining = per_item * self.total.saturating_sub(self.processed) as f64;
        if !remaining.is_finite() {
            return Some(i64::MAX);
        }
        Some(remaining.clamp(0.0, i64::MAX as f64) as i64)
    }

    /// Recompute and store the remaining-time estimate.
    pub fn update_estimate(&mut self, now: DateTime<Utc>) -> Option<i64> {
        self.estimated_time_remaining_ms = self.estimate_remaining_ms(now);
        self.estimated_time_remaining_ms
    }

    /// Full reset: zero counters, phase, errors, warnings, and cancellation
    /// state, optionally adopting a new total.
    pub fn reset(&mut self, total: Option<usize>) {
        *self = Self::new(total.unwrap_or(self.total));
    }

    /// Partial reset for retries: like [`reset`](Self::reset) but able to keep
    /// the error log and/or the original start time for diagnostic continuity.
    pub fn reset_partial(&mut self, total: Option<usize>, retain: ResetRetain) {
        let errors = std::mem::take(&mut self.errors);
        let start_time = self.start_time;
        self.reset(total);
        if retain.errors {
            self.errors = errors;
        }
        if retain.start_time {
            self.start_time = start_time;
        }
    }
}

/// What a partial reset preserves.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResetRetain {
    pub errors: bool,
    pub start_time: bool,
}

/// Progress of a bulk import run: the shared [`SyncProgress`] plus batch
/// bookkeeping and per-outcome counters.
///
/// Invariant at every observable point:
/// `duplicates_found + new_tickets_created + tickets_updated == processed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkImportProgress {
    #[serde(flatten)]
    pub sync: SyncProgress,
    /// 1-based index of the batch in flight; 0 before processing starts.
    pub current_batch: usize,
    pub total_batches: usize,
    pub batch_size: usize,
    pub resume_token: Option<String>,
    pub processed_ticket_keys: Vec<String>,
    pub duplicates_found: usize,
    pub new_tickets_created: usize,
    pub tickets_updated: usize,
    pub allow_cancel: bool,
    pub allow_pause: bool,
    pub is_paused: bool,
}

impl BulkImportProgress {
    pub fn new(total: usize, batch_size: usize) -> Self {
        let sync = SyncProgress::new(total);
        Self {
            allow_cancel: sync.phase.allows_cancel(),
            allow_pause: sync.phase.allows_pause(),
            sync,
            current_batch: 0,
            total_batches: 0,
            batch_size,
            resume_token: None,
            processed_ticket_keys: Vec::new(),
            duplicates_found: 0,
            new_tickets_created: 0,
            tickets_updated: 0,
            is_paused: false,
        }
    }

    pub fn transition_to(&mut self, to: SyncPhase) -> bool {
        let moved = self.sync.transition_to(to);
        if moved {
            self.refresh_capabilities();
        }
        moved
    }

    pub fn advance_to(&mut self, target: SyncPhase) -> bool {
        let moved = self.sync.advance_to(target);
        if moved {
            self.refresh_capabilities();
        }
        moved
    }

    fn refresh_capabilities(&mut self) {
        self.allow_cancel = self.sync.phase.allows_cancel();
        self.allow_pause = self.sync.phase.allows_pause();
    }

    /// Record a successful per-item outcome, keeping the outcome counters and
    /// the processed counter in lockstep.
    pub fn record_outcome(&mut self, outcome: MaterializeOutcome, key: &str) {
        self.sync.processed += 1;
        match outcome {
            MaterializeOutcome::Created => self.new_tickets_created += 1,
            MaterializeOutcome::Updated => self.tickets_updated += 1,
            MaterializeOutcome::Skipped => self.duplicates_found += 1,
        }
        self.processed_ticket_keys.push(key.to_string());
    }

    /// Record a per-item failure along with its bounded error log entry.
    pub fn record_failure(&mut self, entry: SyncErrorEntry) {
        self.sync.failed += 1;
        self.sync.record_error(entry);
    }

    /// Outcome counters always sum to the processed counter.
    pub fn counters_consistent(&self) -> bool {
        self.duplicates_found + self.new_tickets_created + self.tickets_updated
            == self.sync.processed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn forward_transitions_are_adjacent_only() {
        assert!(!is_valid_phase_transition(
            SyncPhase::Initializing,
            SyncPhase::Downloading
        ));
        assert!(is_valid_phase_transition(
            SyncPhase::Initializing,
            SyncPhase::Searching
        ));
        assert!(is_valid_phase_transition(
            SyncPhase::Downloading,
            SyncPhase::Error
        ));
        assert!(!is_valid_phase_transition(
            SyncPhase::Processing,
            SyncPhase::Searching
        ));
    }

    #[test]
    fn terminal_phases_admit_no_transitions() {
        for to in [
            SyncPhase::Initializing,
            SyncPhase::Searching,
            SyncPhase::Downloading,
            SyncPhase::Processing,
            SyncPhase::Finalizing,
            SyncPhase::Complete,
            SyncPhase::Cancelled,
            SyncPhase::Error,
        ] {
            assert!(!is_valid_phase_transition(SyncPhase::Complete, to));
            assert!(!is_valid_phase_transition(SyncPhase::Cancelled, to));
            assert!(!is_valid_phase_transition(SyncPhase::Error, to));
        }
    }

    #[test]
    fn self_transition_is_invalid() {
        assert!(!is_valid_phase_transition(
            SyncPhase::Processing,
            SyncPhase::Processing
        ));
    }

    #[test]
    fn pause_cancel_capability_table() {
        assert!(SyncPhase::Initializing.allows_cancel());
        assert!(!SyncPhase::Initializing.allows_pause());
        assert!(SyncPhase::Searching.allows_cancel());
        assert!(!SyncPhase::Searching.allows_pause());
        assert!(SyncPhase::Downloading.allows_cancel());
        assert!(SyncPhase::Downloading.allows_pause());
        assert!(SyncPhase::Processing.allows_cancel());
        assert!(SyncPhase::Processing.allows_pause());
        assert!(!SyncPhase::Finalizing.allows_cancel());
        assert!(!SyncPhase::Finalizing.allows_pause());
        assert!(!SyncPhase::Complete.allows_cancel());
        assert!(!SyncPhase::Cancelled.allows_cancel());
        assert!(SyncPhase::Error.allows_cancel());
        assert!(!SyncPhase::Error.allows_pause());
    }

    #[test]
    fn advance_walks_intermediate_phases() {
        let mut progress = SyncProgress::new(0);
        assert!(progress.advance_to(SyncPhase::Complete));
        assert_eq!(progress.phase, SyncPhase::Complete);

        let mut progress = SyncProgress::new(10);
        assert!(progress.advance_to(SyncPhase::Processing));
        assert_eq!(progress.phase, SyncPhase::Processing);
        // Backwards is refused.
        assert!(!progress.advance_to(SyncPhase::Searching));
    }

    #[test]
    fn error_log_keeps_most_recent_hundred_in_order() {
        let mut progress = SyncProgress::new(0);
        for i in 0..150 {
            progress.record_error(SyncErrorEntry::new(
                SyncErrorCode::Processing,
                format!("error {}", i),
                SyncPhase::Processing,
            ));
        }
        assert_eq!(progress.errors.len(), MAX_ERROR_LOG);
        assert_eq!(
            progress.errors.front().map(|e| e.message.as_str()),
            Some("error 50")
        );
        assert_eq!(
            progress.errors.back().map(|e| e.message.as_str()),
            Some("error 149")
        );
    }

    #[test]
    fn cancellation_token_is_first_writer_wins() {
        let mut progress = SyncProgress::new(5);
        progress.request_cancellation("first");
        progress.request_cancellation("second");
        assert!(progress.cancellation_requested);
        assert_eq!(progress.cancellation_token.as_deref(), Some("first"));
    }

    #[test]
    fn estimate_is_none_before_progress_and_zero_when_done() {
        let mut progress = SyncProgress::new(10);
        let now = progress.start_time + Duration::seconds(5);
        assert_eq!(progress.estimate_remaining_ms(now), None);

        progress.processed = 5;
        // 5s for 5 items leaves 5s for the remaining 5.
        assert_eq!(progress.estimate_remaining_ms(now), Some(5_000));

        progress.processed = 10;
        assert_eq!(progress.estimate_remaining_ms(now), Some(0));
    }

    #[test]
    fn estimate_rejects_inconsistent_timestamps() {
        let mut progress = SyncProgress::new(10);
        progress.processed = 3;
        let before_start = progress.start_time - Duration::seconds(30);
        assert_eq!(progress.estimate_remaining_ms(before_start), None);
    }

    #[test]
    fn estimate_saturates_for_huge_counters() {
        let mut progress = SyncProgress::new(usize::MAX);
        progress.processed = 1;
        let now = progress.start_time + Duration::days(365);
        let estimate = progress.estimate_remaining_ms(now);
        assert!(estimate.is_some());
        assert!(estimate.unwrap() >= 0);
    }

    #[test]
    fn reset_clears_everything() {
        let mut progress = SyncProgress::new(10);
        progress.advance_to(SyncPhase::Processing);
        progress.current = 4;
        progress.processed = 3;
        progress.failed = 1;
        progress.push_warning("w");
        progress.record_error(SyncErrorEntry::default());
        progress.request_cancellation("tok");

        progress.reset(Some(20));
        assert_eq!(progress.total, 20);
        assert_eq!(progress.current, 0);
        assert_eq!(progress.processed, 0);
        assert_eq!(progress.failed, 0);
        assert_eq!(progress.phase, SyncPhase::Initializing);
        assert!(progress.errors.is_empty());
        assert!(progress.warnings.is_empty());
        assert!(!progress.cancellation_requested);
        assert!(progress.cancellation_token.is_none());
    }

    #[test]
    fn partial_reset_can_preserve_errors_and_start_time() {
        let mut progress = SyncProgress::new(10);
        let original_start = progress.start_time;
        progress.record_error(SyncErrorEntry::new(
            SyncErrorCode::Network,
            "timeout",
            SyncPhase::Searching,
        ));
        progress.processed = 5;

        progress.reset_partial(
            None,
            ResetRetain {
                errors: true,
                start_time: true,
            },
        );
        assert_eq!(progress.processed, 0);
        assert_eq!(progress.errors.len(), 1);
        assert_eq!(progress.start_time, original_start);
    }

    #[test]
    fn malformed_error_entry_deserializes_with_defaults() {
        let entry: SyncErrorEntry =
            serde_json::from_value(serde_json::json!({ "message": "boom" }))
                .expect("tolerant deserialize");
        assert_eq!(entry.code, SyncErrorCode::Unknown);
        assert_eq!(entry.message, "boom");
        assert_eq!(entry.retry_attempt, 0);
        assert!(entry.record_id.is_none());
    }

    #[test]
    fn bulk_progress_outcome_counters_stay_in_lockstep() {
        let mut progress = BulkImportProgress::new(3, 50);
        progress.record_outcome(MaterializeOutcome::Created, "TICK-1");
        progress.record_outcome(MaterializeOutcome::Updated, "TICK-2");
        progress.record_outcome(MaterializeOutcome::Skipped, "TICK-3");
        assert!(progress.counters_consistent());
        assert_eq!(progress.sync.processed, 3);
        assert_eq!(progress.new_tickets_created, 1);
        assert_eq!(progress.tickets_updated, 1);
        assert_eq!(progress.duplicates_found, 1);
        assert_eq!(
            progress.processed_ticket_keys,
            vec!["TICK-1", "TICK-2", "TICK-3"]
        );
    }

    #[test]
    fn bulk_progress_capabilities_follow_phase() {
        let mut progress = BulkImportProgress::new(10, 50);
        assert!(progress.allow_cancel);
        assert!(!progress.allow_pause);
        progress.advance_to(SyncPhase::Processing);
        assert!(progress.allow_cancel);
        assert!(progress.allow_pause);
        progress.advance_to(SyncPhase::Complete);
        assert!(!progress.allow_cancel);
        assert!(!progress.allow_pause);
    }
}
