use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{Instrument, error, info, instrument, warn};
use uuid::Uuid;

use crate::batch::limits::{MemoryProbe, ProcessMemory, check_memory};
use crate::batch::model::{
    BATCH_FILE, Batch, BatchExec, BatchExecRow, BatchRow, BatchStatus, result_file,
};
use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::logger::{annotate_client, batch_span};
use crate::metrics::counters::Counters;
use crate::notify::{BatchEvent, Notifier};
use crate::spark::types::{ExecuteRequest, ExecutedRecord};
use crate::spark::{SliceObserver, Spark};
use crate::store::RecordStore;
use crate::wasm::WasmRepo;

/// Turns record lists into tracked, persisted asynchronous batches.
///
/// Admission control (memory, per-module concurrency) runs under a submission
/// lock, and `submit` keeps it through the `processing` transition. The
/// concurrency limit is checked again, atomically with that transition, for
/// batches started through `run_async`/`run`.
pub struct BatchRepo {
    wasm: Arc<WasmRepo>,
    store: Arc<RecordStore>,
    notifier: Arc<dyn Notifier>,
    probe: Arc<dyn MemoryProbe>,
    counters: Counters,

    memory_threshold_mb: u64,
    batch_limit: usize,

    submission: tokio::sync::Mutex<()>,
}

impl BatchRepo {
    pub fn new(
        wasm: Arc<WasmRepo>,
        store: Arc<RecordStore>,
        notifier: Arc<dyn Notifier>,
        config: &AppConfig,
        counters: Counters,
    ) -> Self {
        Self {
            wasm,
            store,
            notifier,
            probe: Arc::new(ProcessMemory::new()),
            counters,
            memory_threshold_mb: config.memory_threshold_mb,
            batch_limit: config.batch_limit.max(1),
            submission: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Admits and records a new batch in `created` state.
    #[instrument(skip(self), target = "batch")]
    pub async fn create(
        &self,
        service_id: &str,
        client_id: Option<&str>,
        buffer_size: usize,
        total_inputs: usize,
    ) -> AppResult<Batch> {
        let _submission = self.submission.lock().await;
        self.admit(service_id, client_id, buffer_size, total_inputs).await
    }

    /// Expands columnar input, creates the batch and starts it in the background.
    ///
    /// Admission and the `processing` transition happen under one submission
    /// lock, so concurrent submits never overshoot the batch limit.
    pub async fn submit(
        self: &Arc<Self>,
        service_id: &str,
        client_id: Option<&str>,
        request: ExecuteRequest,
    ) -> AppResult<Batch> {
        let (_, inputs, shared) = Spark::infer_format(request.inputs, request.shared);
        let records = match inputs {
            Value::Array(items) => items,
            single => vec![single],
        };
        if records.is_empty() {
            return Err(AppError::ValidationFailed("inputs must not be empty".into()));
        }

        let buffer_size = serde_json::to_vec(&records).map(|b| b.len()).unwrap_or(0);
        let processing = {
            let _submission = self.submission.lock().await;
            let batch = self
                .admit(service_id, client_id, buffer_size, records.len())
                .await?;
            self.begin(batch, records.len()).await?
        };

        self.spawn_drive(processing.clone(), records, shared, request.metadata);
        Ok(processing)
    }

    /// Marks the batch `processing` and spawns its execution.
    ///
    /// Returns the processing snapshot; completion is observable through
    /// `find_one` and notifications.
    pub async fn run_async(
        self: &Arc<Self>,
        batch: Batch,
        records: Vec<Value>,
        shared: Option<Value>,
        metadata: Map<String, Value>,
    ) -> AppResult<Batch> {
        let processing = self.begin(batch, records.len()).await?;
        self.spawn_drive(processing.clone(), records, shared, metadata);
        Ok(processing)
    }

    /// Same as [`run_async`](Self::run_async) but awaits the final snapshot.
    pub async fn run(
        &self,
        batch: Batch,
        records: Vec<Value>,
        shared: Option<Value>,
        metadata: Map<String, Value>,
    ) -> AppResult<Batch> {
        let processing = self.begin(batch, records.len()).await?;
        let span = batch_span(&processing.id, &processing.service_id);
        Ok(self
            .drive(processing, records, shared, metadata)
            .instrument(span)
            .await)
    }

    /// Linear scan of the batch file.
    pub async fn find_one(&self, batch_id: Uuid) -> AppResult<Batch> {
        let rows: Vec<BatchRow> = self.store.read_all(BATCH_FILE).await;
        rows.into_iter()
            .find(|r| r.id == batch_id)
            .map(Batch::from)
            .ok_or_else(|| AppError::not_found(format!("records not found for batch <{batch_id}>")))
    }

    pub async fn get_result(&self, batch_id: Uuid) -> AppResult<Vec<BatchExec>> {
        let file = result_file(&batch_id);
        if !self.store.exists(&file).await {
            return Err(results_not_found(batch_id));
        }

        let rows: Vec<BatchExecRow> = self.store.read_all(&file).await;
        Ok(rows.into_iter().map(BatchExec::from).collect())
    }

    pub async fn download_result(&self, batch_id: Uuid) -> AppResult<Vec<u8>> {
        self.store
            .read_bytes(&result_file(&batch_id))
            .await?
            .ok_or_else(|| results_not_found(batch_id))
    }

    /// Deletes the rows and result files of finished batches.
    ///
    /// Refuses (and deletes nothing) if any requested batch is still
    /// `created` or `processing`. Unknown ids are ignored. Returns how many
    /// ids had a row or a result file removed.
    #[instrument(skip(self, batch_ids), target = "batch", fields(count = batch_ids.len()))]
    pub async fn delete_results(&self, batch_ids: &[Uuid]) -> AppResult<usize> {
        let wanted: HashSet<Uuid> = batch_ids.iter().copied().collect();

        let filter = wanted.clone();
        let outcome = self
            .store
            .update(BATCH_FILE, move |rows: Vec<BatchRow>| {
                if let Some(busy) = rows
                    .iter()
                    .find(|r| filter.contains(&r.id) && !r.status.is_terminal())
                {
                    let id = busy.id;
                    return (rows, Err(id));
                }

                let (gone, kept): (Vec<BatchRow>, Vec<BatchRow>) =
                    rows.into_iter().partition(|r| filter.contains(&r.id));
                let gone: HashSet<Uuid> = gone.into_iter().map(|r| r.id).collect();
                (kept, Ok(gone))
            })
            .await?;

        let rows_removed = match outcome {
            Ok(gone) => gone,
            Err(busy) => {
                warn!(batch_id = %busy, "delete refused: batch still processing");
                return Err(AppError::RateLimitExceeded(format!(
                    "batch <{busy}> is still processing"
                )));
            }
        };

        let mut deleted = 0;
        for id in &wanted {
            let file_removed = match self.store.remove_file(&result_file(id)).await {
                Ok(removed) => removed,
                Err(e) => {
                    warn!(batch_id = %id, error = %e, "result file not deleted");
                    false
                }
            };
            if file_removed || rows_removed.contains(id) {
                deleted += 1;
            }
        }

        info!(deleted, "batch results deleted");
        Ok(deleted)
    }

    /// Admission checks and the `created` row. Caller holds the submission lock.
    async fn admit(
        &self,
        service_id: &str,
        client_id: Option<&str>,
        buffer_size: usize,
        total_inputs: usize,
    ) -> AppResult<Batch> {
        if !check_memory(self.probe.clone(), self.memory_threshold_mb).await {
            warn!(threshold_mb = self.memory_threshold_mb, "batch refused: memory");
            return Err(AppError::RateLimitExceeded("rss/heap memory limit exceeded".into()));
        }

        let rows: Vec<BatchRow> = self.store.read_all(BATCH_FILE).await;
        let processing = count_processing(&rows, service_id, None);
        if processing >= self.batch_limit {
            warn!(processing, limit = self.batch_limit, "batch refused: concurrency");
            return Err(batch_limit_exceeded());
        }

        self.wasm.find_wasm(service_id).await?;

        let batch = Batch::created(service_id, client_id.map(str::to_string), buffer_size, total_inputs);
        self.store.append(BATCH_FILE, vec![BatchRow::from(&batch)]).await?;

        Counters::incr(&self.counters.batches_created);
        info!(batch_id = %batch.id, total_inputs, "batch created");
        Ok(batch)
    }

    fn spawn_drive(
        self: &Arc<Self>,
        processing: Batch,
        records: Vec<Value>,
        shared: Option<Value>,
        metadata: Map<String, Value>,
    ) {
        let this = Arc::clone(self);
        let span = batch_span(&processing.id, &processing.service_id);
        tokio::spawn(
            async move {
                this.drive(processing, records, shared, metadata).await;
            }
            .instrument(span),
        );
    }

    /// Persists and announces the `processing` transition.
    ///
    /// The concurrency limit is re-checked in the same file update, so two
    /// batches created back to back cannot both start past the limit.
    async fn begin(&self, batch: Batch, total: usize) -> AppResult<Batch> {
        if batch.total_inputs != total {
            warn!(
                batch_id = %batch.id,
                declared = batch.total_inputs,
                actual = total,
                "declared input count differs from records; using records"
            );
        }

        let processing = batch.with_total_inputs(total).processing();
        let row = BatchRow::from(&processing);
        let limit = self.batch_limit;
        let outcome = self
            .store
            .update(BATCH_FILE, move |mut rows: Vec<BatchRow>| {
                let busy = count_processing(&rows, &row.service_id, Some(row.id));
                if busy >= limit {
                    return (rows, Err(busy));
                }
                let found = match rows.iter_mut().find(|r| r.id == row.id) {
                    Some(slot) => {
                        *slot = row;
                        true
                    }
                    None => false,
                };
                (rows, Ok(found))
            })
            .await?;

        match outcome {
            Ok(true) => {}
            Ok(false) => warn!(batch_id = %processing.id, "batch row missing; snapshot not persisted"),
            Err(busy) => {
                warn!(batch_id = %processing.id, processing = busy, limit, "batch not started: concurrency");
                return Err(batch_limit_exceeded());
            }
        }

        self.publish(BatchEvent::Processing, &processing, None);
        Ok(processing)
    }

    /// Executes the batch to a terminal state. Never returns an error: any
    /// failure marks the batch `failed`.
    async fn drive(
        &self,
        batch: Batch,
        records: Vec<Value>,
        shared: Option<Value>,
        metadata: Map<String, Value>,
    ) -> Batch {
        annotate_client(batch.client_id.as_deref());
        let progress = BatchProgress::new(self, batch);

        match self.execute(&progress, records, shared, metadata).await {
            Ok(completed) => completed,
            Err(e) => {
                let failed = progress.snapshot().failed(progress.elapsed_ms());
                error!(batch_id = %failed.id, error = %e, code = e.code(), "batch failed");

                if let Err(save_err) = self.save(&failed).await {
                    error!(batch_id = %failed.id, error = %save_err, "failed state not persisted");
                }
                Counters::incr(&self.counters.batches_failed);
                self.publish(BatchEvent::Failed, &failed, Some(&e.to_string()));
                failed
            }
        }
    }

    async fn execute(
        &self,
        progress: &BatchProgress<'_>,
        records: Vec<Value>,
        shared: Option<Value>,
        metadata: Map<String, Value>,
    ) -> AppResult<Batch> {
        let batch = progress.snapshot();
        let lease = self.wasm.lease_wasm(&batch.service_id).await?;

        let requests = records
            .iter()
            .map(|r| Spark::build_request(r, &batch.service_id, shared.as_ref(), &metadata))
            .collect();

        let executed = lease.execute_all(requests, Some(progress)).await;
        drop(lease);
        Counters::add(&self.counters.records_executed, executed.len() as u64);

        if let Some(e) = progress.take_error() {
            return Err(e);
        }

        let completed = progress
            .snapshot()
            .completed(executed.len(), executed.len(), progress.elapsed_ms());
        self.save(&completed).await?;

        Counters::incr(&self.counters.batches_completed);
        self.publish(BatchEvent::Completed, &completed, None);
        info!("{completed}");
        Ok(completed)
    }

    /// Replaces the batch row with `batch`.
    async fn save(&self, batch: &Batch) -> AppResult<()> {
        let row = BatchRow::from(batch);
        let found = self
            .store
            .update(BATCH_FILE, move |mut rows: Vec<BatchRow>| {
                let found = match rows.iter_mut().find(|r| r.id == row.id) {
                    Some(slot) => {
                        *slot = row;
                        true
                    }
                    None => false,
                };
                (rows, found)
            })
            .await?;

        if !found {
            warn!(batch_id = %batch.id, "batch row missing; snapshot not persisted");
        }
        Ok(())
    }

    fn publish(&self, event: BatchEvent, batch: &Batch, error: Option<&str>) {
        let mut payload = serde_json::to_value(batch).unwrap_or_default();
        if let (Some(msg), Value::Object(map)) = (error, &mut payload) {
            map.insert("error".into(), Value::String(msg.to_string()));
        }
        self.notifier.publish(event, batch.client_id.as_deref(), payload);
    }
}

/// Batches of `service_id` in `processing`, ignoring `except`.
fn count_processing(rows: &[BatchRow], service_id: &str, except: Option<Uuid>) -> usize {
    rows.iter()
        .filter(|r| r.service_id == service_id && r.status == BatchStatus::Processing)
        .filter(|r| Some(r.id) != except)
        .count()
}

fn batch_limit_exceeded() -> AppError {
    AppError::RateLimitExceeded("batch limit exceeded".into())
}

fn results_not_found(batch_id: Uuid) -> AppError {
    AppError::not_found(format!("batch results not found for <{batch_id}>"))
}

/// Per-slice bookkeeping of one running batch.
struct BatchProgress<'a> {
    repo: &'a BatchRepo,
    state: parking_lot::Mutex<Batch>,
    started: Instant,
    /// First persistence failure; turns the batch `failed` once slices drain.
    error: parking_lot::Mutex<Option<AppError>>,
}

impl<'a> BatchProgress<'a> {
    fn new(repo: &'a BatchRepo, batch: Batch) -> Self {
        Self {
            repo,
            state: parking_lot::Mutex::new(batch),
            started: Instant::now(),
            error: parking_lot::Mutex::new(None),
        }
    }

    fn snapshot(&self) -> Batch {
        self.state.lock().clone()
    }

    fn elapsed_ms(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1000.0
    }

    fn take_error(&self) -> Option<AppError> {
        self.error.lock().take()
    }

    fn keep_first(&self, e: AppError) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(e);
        }
    }
}

#[async_trait]
impl<'a> SliceObserver for BatchProgress<'a> {
    async fn on_slice(&self, records: &[ExecutedRecord]) {
        let snapshot = {
            let mut state = self.state.lock();
            *state = state.progressed(records.len(), self.elapsed_ms());
            state.clone()
        };

        if let Err(e) = self.repo.save(&snapshot).await {
            self.keep_first(e);
        }

        let rows: Vec<BatchExecRow> = records.iter().map(BatchExecRow::from).collect();
        if let Err(e) = self.repo.store.append(&result_file(&snapshot.id), rows).await {
            self.keep_first(e);
        }

        info!("{snapshot}");
        self.repo.publish(BatchEvent::Processing, &snapshot, None);
    }
}
