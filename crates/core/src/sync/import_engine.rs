//! Resumable bulk import engine.
//!
//! One engine instance runs at most one import at a time. A run walks the
//! phase chain of the progress model, yields to the executor at bounded
//! intervals so progress callbacks stay responsive, checkpoints resume state
//! every few batches, and honors cooperative pause/cancel requests between
//! items.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{Error, Result};
use crate::sync::{
    BulkImportProgress, ImportListener, MaterializeOptions, NoOpImportListener, NoOpNotifier,
    NoteMaterializer, Notifier, PageRequest, StateStore, SyncErrorEntry, SyncPhase, TicketRecord,
    TicketSource, DEFAULT_BATCH_SIZE, DEFAULT_MAX_RESULTS,
};

/// Yield to the executor and emit a progress snapshot every this many items.
const YIELD_EVERY_ITEMS: usize = 5;

/// Persist a resume checkpoint every this many completed batches.
const CHECKPOINT_EVERY_BATCHES: usize = 5;

/// Top-level key the resume state lives under in the persisted blob.
const IMPORT_RESUME_KEY: &str = "bulkImportResume";

/// Options for one bulk import run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BulkImportOptions {
    /// Query descriptor handed to the ticket source.
    pub query: String,
    pub batch_size: usize,
    /// Upper bound on the candidate set; fetching stops at this many records.
    pub max_results: usize,
    pub skip_existing: bool,
    pub organize_by_group: bool,
    /// When false, no checkpoints are written and pause leaves nothing to
    /// resume from.
    pub enable_resume: bool,
}

impl Default for BulkImportOptions {
    fn default() -> Self {
        Self {
            query: String::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            max_results: DEFAULT_MAX_RESULTS,
            skip_existing: true,
            organize_by_group: false,
            enable_resume: true,
        }
    }
}

impl BulkImportOptions {
    fn materialize_options(&self) -> MaterializeOptions {
        MaterializeOptions {
            skip_existing: self.skip_existing,
            organize_by_group: self.organize_by_group,
        }
    }
}

/// Checkpoint persisted between batches so an interrupted run can continue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportResumeState {
    pub resume_token: String,
    pub query: String,
    pub batch_size: usize,
    pub processed_ticket_keys: Vec<String>,
    pub saved_at: DateTime<Utc>,
}

/// Summary returned when a run finishes, pauses, cancels, or fails.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkImportResult {
    pub total_imported: usize,
    pub failed: usize,
    pub duplicates_found: usize,
    pub new_tickets_created: usize,
    pub tickets_updated: usize,
    pub duration_ms: u64,
    pub mean_item_ms: f64,
    pub items_per_second: f64,
    pub cancelled: bool,
    pub paused: bool,
    pub resume_token: Option<String>,
    pub phase: SyncPhase,
}

/// Narrow the original query so already-imported records are not re-fetched.
fn derive_resume_query(query: &str, processed_keys: &[String]) -> String {
    if processed_keys.is_empty() {
        return query.to_string();
    }
    format!("{} AND key NOT IN ({})", query, processed_keys.join(", "))
}

fn resume_token(batch: usize, offset: usize) -> String {
    format!("resume_batch_{}_offset_{}", batch, offset)
}

/// Drives one import at a time against the source/materializer/store
/// collaborators. Cheap to share behind an `Arc`; every method takes `&self`.
pub struct BulkImportEngine {
    source: Arc<dyn TicketSource>,
    materializer: Arc<dyn NoteMaterializer>,
    store: Arc<dyn StateStore>,
    notifier: Arc<dyn Notifier>,
    listener: Arc<dyn ImportListener>,
    progress: StdMutex<BulkImportProgress>,
    active: AtomicBool,
    pause_requested: AtomicBool,
}

/// Clears the active and pause flags when a run exits by any path,
/// early returns included.
struct ActiveGuard<'a> {
    engine: &'a BulkImportEngine,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.engine.active.store(false, Ordering::SeqCst);
        self.engine.pause_requested.store(false, Ordering::SeqCst);
    }
}

impl BulkImportEngine {
    pub fn new(
        source: Arc<dyn TicketSource>,
        materializer: Arc<dyn NoteMaterializer>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            source,
            materializer,
            store,
            notifier: Arc::new(NoOpNotifier),
            listener: Arc::new(NoOpImportListener),
            progress: StdMutex::new(BulkImportProgress::new(0, DEFAULT_BATCH_SIZE)),
            active: AtomicBool::new(false),
            pause_requested: AtomicBool::new(false),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn ImportListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Snapshot of the current progress; a deep copy safe to hold across
    /// awaits.
    pub fn progress(&self) -> BulkImportProgress {
        self.with_progress(|p| p.clone())
    }

    /// Request cooperative cancellation. Refused (returns false) in phases
    /// that no longer admit it. The first accepted token wins.
    pub fn request_cancellation(&self, token: impl Into<String>) -> bool {
        self.with_progress(|p| {
            if !p.allow_cancel {
                return false;
            }
            p.sync.request_cancellation(token);
            true
        })
    }

    /// Request a pause at the next item boundary. Refused outside the
    /// pausable phases.
    pub fn request_pause(&self) -> bool {
        if !self.with_progress(|p| p.allow_pause) {
            return false;
        }
        self.pause_requested.store(true, Ordering::SeqCst);
        true
    }

    /// Run one import to completion, pause, cancellation, or failure.
    ///
    /// Only invalid options and a concurrently active run are reported as
    /// `Err`; runtime failures end the run in the `Error` phase and are
    /// described by the returned result and error log.
    pub async fn start(&self, options: BulkImportOptions) -> Result<BulkImportResult> {
        if options.batch_size == 0 {
            return Err(Error::validation("batch size must be greater than zero"));
        }
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::conflict("a bulk import is already running"));
        }
        let _guard = ActiveGuard { engine: self };

        let run_id = Uuid::new_v4();
        info!(
            "[BulkImport] Starting run {} for query '{}'",
            run_id, options.query
        );
        let started = Instant::now();
        self.with_progress(|p| *p = BulkImportProgress::new(0, options.batch_size));
        self.emit_progress();

        let materialize = options.materialize_options();
        if let Err(e) = self.materializer.ensure_container(&materialize).await {
            return self.fail_run(started, e).await;
        }

        self.with_progress(|p| {
            p.advance_to(SyncPhase::Searching);
        });
        self.emit_progress();

        let records = match self.fetch_candidates(&options).await {
            Ok(records) => records,
            Err(e) => return self.fail_run(started, e).await,
        };

        if records.is_empty() {
            self.with_progress(|p| {
                p.advance_to(SyncPhase::Complete);
                p.sync.estimated_time_remaining_ms = Some(0);
            });
            self.emit_progress();
            info!("[BulkImport] Run {} found nothing to import", run_id);
            return Ok(self.build_result(started, false, false));
        }

        let total = records.len();
        let total_batches = total.div_ceil(options.batch_size);
        self.with_progress(|p| {
            p.sync.total = total;
            p.total_batches = total_batches;
            p.advance_to(SyncPhase::Processing);
        });
        self.emit_progress();

        let mut items_since_yield = 0usize;
        for (batch_index, batch) in records.chunks(options.batch_size).enumerate() {
            let batch_number = batch_index + 1;
            if self.cancel_requested() {
                return self.cancel_run(started).await;
            }
            if self.take_pause_request() {
                return self.pause_run(started, &options).await;
            }
            self.with_progress(|p| p.current_batch = batch_number);

            for record in batch {
                if self.cancel_requested() {
                    return self.cancel_run(started).await;
                }
                if self.take_pause_request() {
                    return self.pause_run(started, &options).await;
                }
                self.with_progress(|p| p.sync.current += 1);

                match self.materializer.process_ticket(record, &materialize).await {
                    Ok(outcome) => {
                        self.with_progress(|p| p.record_outcome(outcome, &record.key));
                    }
                    Err(e) => {
                        let code = e.category();
                        let message = e.to_string();
                        self.with_progress(|p| {
                            let entry = SyncErrorEntry::new(code, message.clone(), p.sync.phase)
                                .with_record_id(&record.key);
                            p.record_failure(entry);
                        });
                        self.listener.on_error(&record.key, &message, code);
                    }
                }

                items_since_yield += 1;
                if items_since_yield % YIELD_EVERY_ITEMS == 0 {
                    let now = Utc::now();
                    self.with_progress(|p| {
                        p.sync.update_estimate(now);
                    });
                    self.emit_progress();
                    tokio::task::yield_now().await;
                }
            }

            let now = Utc::now();
            let processed = self.with_progress(|p| {
                p.sync.update_estimate(now);
                p.sync.processed
            });
            self.listener
                .on_batch_complete(batch_number, total_batches, processed);
            self.emit_progress();

            if options.enable_resume
                && batch_number % CHECKPOINT_EVERY_BATCHES == 0
                && batch_number < total_batches
            {
                let offset = self.with_progress(|p| p.sync.current);
                self.persist_resume_state(&options, resume_token(batch_number + 1, offset))
                    .await;
            }
        }

        self.with_progress(|p| {
            p.advance_to(SyncPhase::Finalizing);
        });
        self.emit_progress();
        if options.enable_resume {
            self.clear_resume_state().await;
        }
        self.with_progress(|p| {
            p.advance_to(SyncPhase::Complete);
            p.sync.estimated_time_remaining_ms = Some(0);
        });
        self.emit_progress();

        let result = self.build_result(started, false, false);
        info!(
            "[BulkImport] Run {} complete: {} imported, {} failed in {} ms",
            run_id, result.total_imported, result.failed, result.duration_ms
        );
        self.notifier.notify(&format!(
            "Import complete: {} created, {} updated, {} skipped",
            result.new_tickets_created, result.tickets_updated, result.duplicates_found
        ));
        Ok(result)
    }

    /// Continue a paused or checkpointed import from its persisted state.
    /// The resumed run excludes already-processed keys from the query.
    pub async fn resume(&self) -> Result<BulkImportResult> {
        let saved = self.load_resume_state().await?;
        info!(
            "[BulkImport] Resuming from {} with {} processed key(s)",
            saved.resume_token,
            saved.processed_ticket_keys.len()
        );
        let options = BulkImportOptions {
            query: derive_resume_query(&saved.query, &saved.processed_ticket_keys),
            batch_size: saved.batch_size.max(1),
            ..BulkImportOptions::default()
        };
        self.start(options).await
    }

    /// Page through the source until the candidate set is complete or the
    /// `max_results` bound is hit. Enters the `Downloading` phase once a
    /// second page is needed.
    async fn fetch_candidates(&self, options: &BulkImportOptions) -> Result<Vec<TicketRecord>> {
        let mut records: Vec<TicketRecord> = Vec::new();
        let mut page_token: Option<String> = None;
        let mut entered_download = false;
        loop {
            let page_size = options.batch_size.min(options.max_results - records.len());
            let request = PageRequest {
                max_results: options.max_results,
                page_size,
                page_token: page_token.clone(),
            };
            let page = self.source.execute_query(&options.query, &request).await?;
            debug!(
                "[BulkImport] Fetched page of {} record(s), source reports {} total",
                page.records.len(),
                page.total
            );
            for record in page.records {
                if records.len() >= options.max_results {
                    break;
                }
                records.push(record);
            }
            match page.next_page_token {
                Some(token) if records.len() < options.max_results => {
                    page_token = Some(token);
                    if !entered_download {
                        entered_download = true;
                        self.with_progress(|p| {
                            p.advance_to(SyncPhase::Downloading);
                        });
                        self.emit_progress();
                    }
                }
                _ => break,
            }
        }
        Ok(records)
    }

    async fn pause_run(
        &self,
        started: Instant,
        options: &BulkImportOptions,
    ) -> Result<BulkImportResult> {
        let token = self.with_progress(|p| {
            let token = resume_token(p.current_batch.max(1), p.sync.current);
            p.resume_token = Some(token.clone());
            p.is_paused = true;
            token
        });
        if options.enable_resume {
            self.persist_resume_state(options, token.clone()).await;
        }
        info!("[BulkImport] Paused at {}", token);
        self.emit_progress();
        Ok(self.build_result(started, false, true))
    }

    async fn cancel_run(&self, started: Instant) -> Result<BulkImportResult> {
        self.with_progress(|p| {
            p.advance_to(SyncPhase::Cancelled);
        });
        self.emit_progress();
        info!("[BulkImport] Run cancelled");
        self.notifier.notify("Import cancelled");
        Ok(self.build_result(started, true, false))
    }

    async fn fail_run(&self, started: Instant, error: Error) -> Result<BulkImportResult> {
        warn!("[BulkImport] Run failed: {}", error);
        let code = error.category();
        let message = error.to_string();
        self.with_progress(|p| {
            p.record_failure(SyncErrorEntry::new(code, message.clone(), p.sync.phase));
            p.advance_to(SyncPhase::Error);
        });
        self.emit_progress();
        self.notifier.notify(&format!("Import failed: {}", message));
        Ok(self.build_result(started, false, false))
    }

    fn build_result(&self, started: Instant, cancelled: bool, paused: bool) -> BulkImportResult {
        let duration_ms = started.elapsed().as_millis() as u64;
        self.with_progress(|p| {
            let attempted = p.sync.processed + p.sync.failed;
            let mean_item_ms = if attempted > 0 {
                duration_ms as f64 / attempted as f64
            } else {
                0.0
            };
            let items_per_second = if duration_ms > 0 {
                attempted as f64 * 1000.0 / duration_ms as f64
            } else {
                0.0
            };
            BulkImportResult {
                total_imported: p.sync.processed,
                failed: p.sync.failed,
                duplicates_found: p.duplicates_found,
                new_tickets_created: p.new_tickets_created,
                tickets_updated: p.tickets_updated,
                duration_ms,
                mean_item_ms,
                items_per_second,
                cancelled,
                paused,
                resume_token: p.resume_token.clone(),
                phase: p.sync.phase,
            }
        })
    }

    /// Write a checkpoint. Persistence failures are logged and tolerated;
    /// losing a checkpoint never aborts the run.
    async fn persist_resume_state(&self, options: &BulkImportOptions, token: String) {
        let keys = self.with_progress(|p| {
            p.resume_token = Some(token.clone());
            p.processed_ticket_keys.clone()
        });
        let state = ImportResumeState {
            resume_token: token,
            query: options.query.clone(),
            batch_size: options.batch_size,
            processed_ticket_keys: keys,
            saved_at: Utc::now(),
        };
        let value = match serde_json::to_value(&state) {
            Ok(value) => value,
            Err(e) => {
                warn!("[BulkImport] Failed to serialize resume state: {}", e);
                return;
            }
        };
        let patch = serde_json::json!({ IMPORT_RESUME_KEY: value });
        if let Err(e) = self.store.save_state(patch).await {
            warn!("[BulkImport] Failed to persist resume state: {}", e);
        }
    }

    async fn clear_resume_state(&self) {
        let patch = serde_json::json!({ IMPORT_RESUME_KEY: null });
        if let Err(e) = self.store.save_state(patch).await {
            warn!("[BulkImport] Failed to clear resume state: {}", e);
        }
    }

    async fn load_resume_state(&self) -> Result<ImportResumeState> {
        let blob = match self.store.load_state().await {
            Ok(blob) => blob,
            Err(e) => {
                warn!("[BulkImport] Failed to load persisted state: {}", e);
                None
            }
        };
        blob.and_then(|blob| blob.get(IMPORT_RESUME_KEY).cloned())
            .filter(|value| !value.is_null())
            .and_then(|value| serde_json::from_value(value).ok())
            .ok_or_else(|| Error::not_found("no saved import state to resume"))
    }

    fn cancel_requested(&self) -> bool {
        self.with_progress(|p| p.sync.cancellation_requested)
    }

    fn take_pause_request(&self) -> bool {
        self.pause_requested.swap(false, Ordering::SeqCst)
    }

    fn emit_progress(&self) {
        let snapshot = self.progress();
        self.listener.on_progress(&snapshot);
    }

    // A poisoned lock only means a listener panicked while we held the guard;
    // recover it and keep serving snapshots.
    fn with_progress<R>(&self, f: impl FnOnce(&mut BulkImportProgress) -> R) -> R {
        let mut guard = self
            .progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}
