use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use crate::batch::model::BatchData;
use crate::cache::ModelCache;
use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::logger::warn_if_slow;
use crate::metrics::counters::Counters;
use crate::batch::limits::{StorageHealth, check_storage};
use crate::spark::{Lease, Spark};
use crate::spark::types::{ExecuteRequest, ExecutedRecord, ExecutionResult, ModuleHandle};
use crate::store::RecordStore;
use crate::store::pagination::{PageParams, Paginated};
use crate::wasm::model::{
    ExecHistory, HistoryRow, WASM_DATA_FILE, WasmData, history_file, is_valid_file_path,
    is_valid_version_id,
};

/// Pools disposed between lookup and lease are reloaded this many times.
const LEASE_ATTEMPTS: usize = 3;

/// Resolves modules through the cache and runs records against them one at
/// a time. Owns the module registry and the per-module execution history.
pub struct WasmRepo {
    cache: Arc<ModelCache>,
    store: Arc<RecordStore>,
    counters: Counters,
    threads: usize,
    replicas: usize,
    storage_threshold_mb: u64,
}

impl WasmRepo {
    pub fn new(
        cache: Arc<ModelCache>,
        store: Arc<RecordStore>,
        config: &AppConfig,
        counters: Counters,
    ) -> Self {
        Self {
            cache,
            store,
            counters,
            threads: config.threads,
            replicas: config.replicas,
            storage_threshold_mb: config.wasm_data_threshold_mb,
        }
    }

    /// Cached pool for `version_id`, loading it from the registry on a miss.
    ///
    /// An unregistered module never touches the cache.
    #[instrument(skip(self), target = "wasm")]
    pub async fn find_wasm(&self, version_id: &str) -> AppResult<Arc<Spark>> {
        if let Some(spark) = self.cache.get(version_id) {
            return Ok(spark);
        }

        let row = self
            .registry_row(version_id)
            .await
            .ok_or_else(|| AppError::not_found(format!("wasm file <{version_id}>")))?;

        let handle = ModuleHandle::new(version_id, self.module_location(&row.file_path))
            .with_topology(self.threads, self.replicas);

        debug!(url = %handle.url, "loading module into cache");
        self.cache.put(handle).await
    }

    /// Resolves `version_id` and pins its pool for the life of the lease.
    ///
    /// A pool evicted between lookup and lease is resolved again.
    pub async fn lease_wasm(&self, version_id: &str) -> AppResult<Lease> {
        for attempt in 1..=LEASE_ATTEMPTS {
            let spark = self.find_wasm(version_id).await?;
            if let Some(lease) = spark.lease().await {
                return Ok(lease);
            }
            debug!(attempt, "pool disposed before lease; resolving again");
        }

        Err(AppError::ExecutionUnitNotCreated {
            version_id: version_id.to_string(),
            source: anyhow::anyhow!("replica pool kept being evicted before use"),
        })
    }

    /// Runs one request and appends it to the module history.
    #[instrument(skip(self, request), target = "wasm")]
    pub async fn execute(&self, version_id: &str, request: ExecuteRequest) -> AppResult<ExecutionResult> {
        let lease = self.lease_wasm(version_id).await?;

        let (format, inputs, shared) = Spark::infer_format(request.inputs, request.shared);
        let req = Spark::build_request(&inputs, version_id, shared.as_ref(), &request.metadata);
        debug!(format = ?format, "request built");

        let start = Instant::now();
        let mut result = warn_if_slow("wasm_execute", Duration::from_secs(1), lease.execute(req.clone())).await;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        drop(lease);

        if result.response_meta.process_time.is_none() {
            result.response_meta.process_time = Some(elapsed_ms);
        }
        Counters::incr(&self.counters.records_executed);

        let record = ExecutedRecord {
            request: req,
            result,
            elapsed_ms,
        };
        self.save_history(version_id, std::slice::from_ref(&record)).await;

        Ok(record.result)
    }

    /// Runs every record sequentially on the caller's task and rolls the
    /// results up. A non-array `inputs` is a single record.
    ///
    /// The pool stays leased for the whole loop, so an eviction in between
    /// records waits for it to finish.
    #[instrument(skip(self, request), target = "wasm")]
    pub async fn execute_many(&self, version_id: &str, request: ExecuteRequest) -> AppResult<BatchData> {
        let lease = self.lease_wasm(version_id).await?;

        let (_, inputs, shared) = Spark::infer_format(request.inputs, request.shared);
        let records = match inputs {
            serde_json::Value::Array(items) => items,
            single => vec![single],
        };

        let mut executed = Vec::with_capacity(records.len());
        for record in &records {
            let req = Spark::build_request(record, version_id, shared.as_ref(), &request.metadata);
            let start = Instant::now();
            let result = lease.execute(req.clone()).await;
            executed.push(ExecutedRecord {
                request: req,
                result,
                elapsed_ms: start.elapsed().as_secs_f64() * 1000.0,
            });
        }
        drop(lease);

        Counters::add(&self.counters.records_executed, executed.len() as u64);
        self.save_history(version_id, &executed).await;

        let mut data = BatchData::from_records(&executed);
        if data.version_id.is_empty() {
            data.version_id = version_id.to_string();
        }
        Ok(data)
    }

    /// One page of execution history; empty when none is recorded.
    pub async fn get_history(&self, version_id: &str, params: PageParams) -> Paginated<ExecHistory> {
        if !is_valid_version_id(version_id) {
            return Paginated::empty(params);
        }
        let rows: Vec<HistoryRow> = self.store.read_all(&history_file(version_id)).await;
        Paginated::paginate(rows, params).map(ExecHistory::from)
    }

    pub async fn download_history(&self, version_id: &str) -> AppResult<Vec<u8>> {
        if !is_valid_version_id(version_id) {
            return Err(AppError::not_found(format!("execution history <{version_id}>")));
        }
        self.store
            .read_bytes(&history_file(version_id))
            .await?
            .ok_or_else(|| AppError::not_found(format!("execution history <{version_id}>")))
    }

    /// Appends history rows. A write failure is logged; the execution itself
    /// already succeeded.
    pub async fn save_history(&self, version_id: &str, records: &[ExecutedRecord]) {
        let rows: Vec<HistoryRow> = records
            .iter()
            .map(|r| HistoryRow::from_record(version_id, r))
            .collect();

        if let Err(e) = self.store.append(&history_file(version_id), rows).await {
            warn!(version_id, error = %e, code = e.code(), "execution history not saved");
        }
    }

    /// Registers a module. Version ids are unique plain file stems.
    #[instrument(skip(self, data), target = "wasm", fields(version_id = %data.version_id))]
    pub async fn save_wasm(&self, data: WasmData) -> AppResult<WasmData> {
        if !is_valid_version_id(&data.version_id) {
            return Err(AppError::ValidationFailed(format!(
                "invalid version_id <{}>: use letters, digits, '-', '_' or '.', not a reserved file name",
                data.version_id
            )));
        }
        if !is_valid_file_path(&data.file_path) {
            return Err(AppError::ValidationFailed(format!(
                "invalid file_path <{}>",
                data.file_path
            )));
        }

        let row = data.clone();
        let inserted = self
            .store
            .update(WASM_DATA_FILE, move |mut rows: Vec<WasmData>| {
                if rows.iter().any(|r| r.version_id == row.version_id) {
                    return (rows, false);
                }
                rows.push(row);
                (rows, true)
            })
            .await?;

        if !inserted {
            return Err(AppError::ValidationFailed(format!(
                "wasm <{}> is already registered",
                data.version_id
            )));
        }

        info!(file_path = %data.file_path, size = data.size, "module registered");
        Ok(data)
    }

    pub async fn get_wasm_data(&self, params: PageParams) -> Paginated<WasmData> {
        let rows: Vec<WasmData> = self.store.read_all(WASM_DATA_FILE).await;
        Paginated::paginate(rows, params)
    }

    /// Raw bytecode of a registered module.
    pub async fn download_wasm(&self, version_id: &str) -> AppResult<Vec<u8>> {
        let row = self
            .registry_row(version_id)
            .await
            .ok_or_else(|| AppError::not_found(format!("wasm file <{version_id}>")))?;

        self.store
            .read_bytes(&row.file_path)
            .await?
            .ok_or_else(|| AppError::not_found(format!("wasm file <{version_id}>")))
    }

    /// Unregisters a module: evicts it, deletes its files, drops its row.
    #[instrument(skip(self), target = "wasm")]
    pub async fn delete_wasm(&self, version_id: &str) -> AppResult<()> {
        let row = self
            .registry_row(version_id)
            .await
            .ok_or_else(|| AppError::not_found(format!("wasm file <{version_id}>")))?;

        self.cache.remove(version_id).await;

        if !is_remote(&row.file_path) {
            if let Err(e) = self.store.remove_file(&row.file_path).await {
                warn!(error = %e, "module file not deleted");
            }
        }
        if let Err(e) = self.store.remove_file(&history_file(version_id)).await {
            warn!(error = %e, "history file not deleted");
        }

        let id = version_id.to_string();
        self.store
            .update(WASM_DATA_FILE, move |rows: Vec<WasmData>| {
                let kept = rows.into_iter().filter(|r| r.version_id != id).collect();
                (kept, ())
            })
            .await?;

        info!("module deleted");
        Ok(())
    }

    /// Size of the upload dir against the configured threshold.
    pub async fn storage_health(&self) -> StorageHealth {
        let root = self.store.root().to_path_buf();
        let threshold_mb = self.storage_threshold_mb;
        match tokio::task::spawn_blocking(move || check_storage(&root, threshold_mb)).await {
            Ok(health) => health,
            Err(e) => {
                warn!(error = %e, "storage check task failed");
                StorageHealth::unknown(threshold_mb)
            }
        }
    }

    async fn registry_row(&self, version_id: &str) -> Option<WasmData> {
        let rows: Vec<WasmData> = self.store.read_all(WASM_DATA_FILE).await;
        rows.into_iter().find(|r| r.version_id == version_id)
    }

    fn module_location(&self, file_path: &str) -> String {
        if is_remote(file_path) {
            file_path.to_string()
        } else {
            self.store.path(file_path).to_string_lossy().into_owned()
        }
    }
}

fn is_remote(path: &str) -> bool {
    path.starts_with("http://") || path.starts_with("https://")
}
