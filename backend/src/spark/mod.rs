//! Replica pool for one module version.
//!
//! Suppose 100 records are submitted to a pool with 4 threads. They are split
//! into 4 contiguous slices of 25, each handed to its own worker task. Every
//! worker owns `replicas` execution units and runs its slice in rounds of that
//! many records at once.
//!
//! Design principles:
//! - **No record drops a batch**: unit errors become failed results in place.
//! - **Submission order out**: results are reassembled by slice offset.
//! - **Progress per slice**: an optional observer sees each slice as it lands,
//!   in completion order.
//! - **Dispose waits**: disposal blocks until in-flight executions finish, so no
//!   unit is removed under a running call.
//! - **Leases pin a pool**: a [`Lease`] holds the gate across many calls, so a
//!   pool evicted mid-loop stays usable until the holder lets go.

pub mod columnar;
pub mod types;
pub(crate) mod worker;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde_json::{Map, Value};
use tokio::sync::{OwnedRwLockReadGuard, RwLock, mpsc, oneshot};
use tracing::{debug, error, info, instrument, warn};

use crate::error::{AppError, AppResult};
use crate::runner::{ExecutionUnit, UnitFactory};
use columnar::Format;
use types::{ExecutedRecord, ExecutionRequest, ExecutionResult, ModuleHandle, RequestData, RequestMeta};
use worker::{SliceJob, Worker, run_one, unreachable_record};

const DISPOSED: &str = "replica pool disposed";

/// Receives the results of each completed slice of an `execute_all` call.
#[async_trait]
pub trait SliceObserver: Send + Sync {
    async fn on_slice(&self, records: &[ExecutedRecord]);
}

pub struct Spark {
    handle: ModuleHandle,
    /// Worker inboxes; cleared on dispose, which stops the workers.
    workers: parking_lot::Mutex<Vec<mpsc::Sender<SliceJob>>>,
    /// Every initialized unit, across all workers.
    units: parking_lot::Mutex<Vec<Arc<dyn ExecutionUnit>>>,
    cursor: AtomicUsize,
    /// Executions and leases hold it shared; dispose takes it exclusively.
    gate: Arc<RwLock<()>>,
    disposed: AtomicBool,
}

impl Spark {
    /// Spins up `threads` workers of `replicas` initialized units each.
    ///
    /// Partial initialization failure is tolerated with a warning; the pool
    /// fails only if no unit at all could be initialized.
    #[instrument(
        skip(handle, factory),
        target = "spark",
        fields(version_id = %handle.version_id, threads = handle.threads, replicas = handle.replicas)
    )]
    pub async fn create(
        handle: ModuleHandle,
        factory: &dyn UnitFactory,
        queue_capacity: usize,
    ) -> AppResult<Self> {
        let threads = handle.threads.max(1);
        let replicas = handle.replicas.max(1);
        let wanted = threads * replicas;

        let mut groups: Vec<Vec<Arc<dyn ExecutionUnit>>> = Vec::with_capacity(threads);
        let mut last_err: Option<anyhow::Error> = None;

        for _ in 0..threads {
            let mut units = Vec::with_capacity(replicas);
            for _ in 0..replicas {
                let unit = factory.create(&handle);
                match unit.initialize().await {
                    Ok(()) => units.push(unit),
                    Err(e) => {
                        warn!(error = %format!("{e:#}"), "execution unit failed to initialize");
                        last_err = Some(e);
                    }
                }
            }
            if !units.is_empty() {
                groups.push(units);
            }
        }

        let created: usize = groups.iter().map(Vec::len).sum();
        if created == 0 {
            return Err(AppError::ExecutionUnitNotCreated {
                version_id: handle.version_id.clone(),
                source: last_err.unwrap_or_else(|| anyhow::anyhow!("no execution unit requested")),
            });
        }
        if created < wanted {
            warn!(created, wanted, "could only create part of the requested execution units");
        }

        let mut senders = Vec::with_capacity(groups.len());
        let mut all_units = Vec::with_capacity(created);
        for (id, units) in groups.into_iter().enumerate() {
            all_units.extend(units.iter().cloned());

            let (tx, rx) = mpsc::channel(queue_capacity.max(1));
            let worker = Worker::new(id, handle.version_id.clone(), units);
            tokio::spawn(async move {
                worker.run(rx).await;
            });
            senders.push(tx);
        }

        info!(workers = senders.len(), units = created, "replica pool ready");

        Ok(Self {
            handle,
            workers: parking_lot::Mutex::new(senders),
            units: parking_lot::Mutex::new(all_units),
            cursor: AtomicUsize::new(0),
            gate: Arc::new(RwLock::new(())),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn version_id(&self) -> &str {
        &self.handle.version_id
    }

    pub fn handle(&self) -> &ModuleHandle {
        &self.handle
    }

    /// Live worker count.
    pub fn threads(&self) -> usize {
        self.workers.lock().len()
    }

    /// Live execution unit count.
    pub fn replicas(&self) -> usize {
        self.units.lock().len()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// See [`columnar::infer_format`].
    pub fn infer_format(inputs: Value, shared: Option<Value>) -> (Format, Value, Option<Value>) {
        columnar::infer_format(inputs, shared)
    }

    /// Builds the unit request for one record.
    ///
    /// `shared` fields are merged into an object record; the record's own value
    /// wins on key collision. Non-object records pass through unchanged.
    pub fn build_request(
        record: &Value,
        version_id: &str,
        shared: Option<&Value>,
        metadata: &Map<String, Value>,
    ) -> ExecutionRequest {
        let inputs = match (record, shared) {
            (Value::Object(own), Some(Value::Object(common))) => {
                let mut merged = common.clone();
                for (k, v) in own {
                    merged.insert(k.clone(), v.clone());
                }
                Value::Object(merged)
            }
            _ => record.clone(),
        };

        let text = |key: &str| {
            metadata
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
        };

        ExecutionRequest {
            request_data: RequestData { inputs },
            request_meta: RequestMeta {
                version_id: version_id.to_string(),
                call_purpose: text("call_purpose").unwrap_or_else(|| "spark-engine".into()),
                source_system: text("source_system").unwrap_or_else(|| "spark-engine".into()),
                correlation_id: text("correlation_id").unwrap_or_default(),
                requested_output: text("requested_output"),
                service_category: text("service_category").unwrap_or_default(),
                compiler_type: text("compiler_type"),
            },
        }
    }

    /// Pins the pool until the returned lease is dropped.
    ///
    /// `None` once disposal has begun; the caller should resolve the module
    /// again.
    pub async fn lease(self: &Arc<Self>) -> Option<Lease> {
        if self.is_disposed() {
            return None;
        }
        let guard = self.gate.clone().read_owned().await;
        if self.units.lock().is_empty() {
            return None;
        }
        Some(Lease {
            spark: self.clone(),
            _guard: guard,
        })
    }

    /// Executes one record on the next unit in round-robin order.
    pub async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        let _shared = self.gate.read().await;
        if self.is_disposed() {
            return ExecutionResult::failed(self.version_id(), DISPOSED);
        }
        self.run_single(request).await
    }

    /// Fans `requests` out across workers in contiguous slices and returns all
    /// results in submission order.
    pub async fn execute_all(
        &self,
        requests: Vec<ExecutionRequest>,
        observer: Option<&dyn SliceObserver>,
    ) -> Vec<ExecutedRecord> {
        let _shared = self.gate.read().await;
        if self.is_disposed() {
            return self.reject_all(requests, observer).await;
        }
        self.fan_out(requests, observer).await
    }

    /// Caller holds the gate.
    async fn run_single(&self, request: ExecutionRequest) -> ExecutionResult {
        let unit = {
            let units = self.units.lock();
            if units.is_empty() {
                None
            } else {
                let i = self.cursor.fetch_add(1, Ordering::Relaxed) % units.len();
                Some(units[i].clone())
            }
        };

        match unit {
            Some(unit) => run_one(unit.as_ref(), self.version_id(), request).await.result,
            None => ExecutionResult::failed(self.version_id(), DISPOSED),
        }
    }

    async fn reject_all(
        &self,
        requests: Vec<ExecutionRequest>,
        observer: Option<&dyn SliceObserver>,
    ) -> Vec<ExecutedRecord> {
        let records: Vec<_> = requests
            .into_iter()
            .map(|r| unreachable_record(self.version_id(), r, DISPOSED))
            .collect();
        if let Some(obs) = observer {
            if !records.is_empty() {
                obs.on_slice(&records).await;
            }
        }
        records
    }

    /// Caller holds the gate.
    #[instrument(skip(self, requests, observer), target = "spark", fields(version_id = %self.handle.version_id, total = requests.len()))]
    async fn fan_out(
        &self,
        requests: Vec<ExecutionRequest>,
        observer: Option<&dyn SliceObserver>,
    ) -> Vec<ExecutedRecord> {
        let total = requests.len();
        if total == 0 {
            return Vec::new();
        }

        let senders = self.workers.lock().clone();
        if senders.is_empty() {
            return self.reject_all(requests, observer).await;
        }

        let slice_size = total.div_ceil(senders.len());
        let mut pending = FuturesUnordered::new();
        let mut remaining = requests.into_iter();
        let mut offset = 0;

        for sender in senders {
            let slice: Vec<ExecutionRequest> = remaining.by_ref().take(slice_size).collect();
            if slice.is_empty() {
                break;
            }
            let len = slice.len();
            let fallback = slice.clone();
            let (reply, rx) = oneshot::channel();
            let job = SliceJob {
                offset,
                requests: slice,
                reply,
            };

            pending.push(async move {
                let records = match sender.send(job).await {
                    Ok(()) => rx.await.ok(),
                    Err(_) => None,
                };
                (offset, fallback, records)
            });
            offset += len;
        }

        debug!(slices = pending.len(), slice_size, "slices dispatched");

        let mut slots: Vec<Option<ExecutedRecord>> = (0..total).map(|_| None).collect();

        while let Some((offset, fallback, records)) = pending.next().await {
            let records = match records {
                Some(records) if records.len() == fallback.len() => records,
                _ => {
                    error!(offset, size = fallback.len(), "worker unavailable; slice marked failed");
                    fallback
                        .into_iter()
                        .map(|r| unreachable_record(self.version_id(), r, "worker unavailable"))
                        .collect()
                }
            };

            if let Some(obs) = observer {
                obs.on_slice(&records).await;
            }

            for (i, record) in records.into_iter().enumerate() {
                slots[offset + i] = Some(record);
            }
        }

        slots.into_iter().flatten().collect()
    }

    /// Releases every execution unit. Idempotent.
    ///
    /// Waits for in-flight executions, then stops the workers and calls
    /// `remove()` on each unit. Every unit is attempted even if some fail.
    #[instrument(skip(self), target = "spark", fields(version_id = %self.handle.version_id))]
    pub async fn dispose(&self) -> anyhow::Result<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let _exclusive = self.gate.write().await;

        self.workers.lock().clear();
        let units = std::mem::take(&mut *self.units.lock());

        let total = units.len();
        let mut failures = 0usize;
        let mut first: Option<anyhow::Error> = None;

        for unit in units {
            if let Err(e) = unit.remove().await {
                failures += 1;
                warn!(error = %format!("{e:#}"), "execution unit failed to release");
                first.get_or_insert(e);
            }
        }

        info!(units = total, failures, "replica pool disposed");

        match first {
            Some(e) => Err(e.context(format!("{failures} of {total} execution units failed to release"))),
            None => Ok(()),
        }
    }
}

/// Shared hold on a pool. Disposal waits until every lease is dropped, and
/// calls made through a lease never see a half-disposed pool.
pub struct Lease {
    spark: Arc<Spark>,
    _guard: OwnedRwLockReadGuard<()>,
}

impl Lease {
    pub fn spark(&self) -> &Arc<Spark> {
        &self.spark
    }

    pub async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        self.spark.run_single(request).await
    }

    pub async fn execute_all(
        &self,
        requests: Vec<ExecutionRequest>,
        observer: Option<&dyn SliceObserver>,
    ) -> Vec<ExecutedRecord> {
        self.spark.fan_out(requests, observer).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    use crate::spark::types::{ResponseData, ResponseMeta};

    /// Unit that doubles `inputs.n`; fails on `{"fail": true}`.
    pub(crate) struct MockUnit {
        pub initialized: AtomicBool,
        pub removed: Arc<AtomicUsize>,
        pub fail_init: bool,
    }

    #[async_trait]
    impl ExecutionUnit for MockUnit {
        async fn initialize(&self) -> anyhow::Result<()> {
            if self.fail_init {
                anyhow::bail!("init refused");
            }
            self.initialized.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn execute(&self, request: &ExecutionRequest) -> anyhow::Result<ExecutionResult> {
            let inputs = request.inputs();
            if inputs.get("fail").and_then(Value::as_bool) == Some(true) {
                anyhow::bail!("bad record");
            }
            tokio::task::yield_now().await;
            let n = inputs.get("n").and_then(Value::as_i64).unwrap_or(0);
            Ok(ExecutionResult {
                response_data: ResponseData {
                    outputs: json!({ "doubled": n * 2 }),
                    ..Default::default()
                },
                response_meta: ResponseMeta {
                    version_id: request.request_meta.version_id.clone(),
                    ..Default::default()
                },
            })
        }

        async fn remove(&self) -> anyhow::Result<()> {
            self.removed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    pub(crate) fn mock_factory(removed: Arc<AtomicUsize>) -> impl UnitFactory {
        move |_: &ModuleHandle| {
            Arc::new(MockUnit {
                initialized: AtomicBool::new(false),
                removed: removed.clone(),
                fail_init: false,
            }) as Arc<dyn ExecutionUnit>
        }
    }

    fn requests(inputs: Vec<Value>) -> Vec<ExecutionRequest> {
        inputs
            .iter()
            .map(|r| Spark::build_request(r, "v1", None, &Map::new()))
            .collect()
    }

    struct Recorder(Mutex<Vec<usize>>);

    #[async_trait]
    impl SliceObserver for Recorder {
        async fn on_slice(&self, records: &[ExecutedRecord]) {
            self.0.lock().push(records.len());
        }
    }

    #[tokio::test]
    async fn execute_all_preserves_order_across_slices() {
        let removed = Arc::new(AtomicUsize::new(0));
        let handle = ModuleHandle::new("v1", "/m.wasm").with_topology(4, 1);
        let spark = Spark::create(handle, &mock_factory(removed), 8).await.unwrap();
        assert_eq!(spark.threads(), 4);

        let inputs: Vec<Value> = (0..10).map(|n| json!({ "n": n })).collect();
        let recorder = Recorder(Mutex::new(vec![]));

        let out = spark.execute_all(requests(inputs), Some(&recorder)).await;

        assert_eq!(out.len(), 10);
        for (n, rec) in out.iter().enumerate() {
            assert_eq!(rec.request.inputs(), &json!({ "n": n }));
            assert_eq!(rec.result.outputs(), &json!({ "doubled": n * 2 }));
        }

        // ceil(10 / 4) = 3 -> slices of 3, 3, 3, 1
        let mut sizes = recorder.0.lock().clone();
        sizes.sort();
        assert_eq!(sizes, vec![1, 3, 3, 3]);
    }

    #[tokio::test]
    async fn failing_record_is_isolated() {
        let removed = Arc::new(AtomicUsize::new(0));
        let handle = ModuleHandle::new("v1", "/m.wasm").with_topology(4, 2);
        let spark = Spark::create(handle, &mock_factory(removed), 8).await.unwrap();

        let mut inputs: Vec<Value> = (0..10).map(|n| json!({ "n": n })).collect();
        inputs[5] = json!({ "fail": true });

        let out = spark.execute_all(requests(inputs), None).await;

        assert_eq!(out.len(), 10);
        for (i, rec) in out.iter().enumerate() {
            if i == 5 {
                assert!(rec.result.is_failure());
                let msg = rec.result.response_data.errors[0]["message"].as_str().unwrap();
                assert!(msg.contains("bad record"));
            } else {
                assert!(!rec.result.is_failure(), "record {i} must succeed");
            }
        }
    }

    #[tokio::test]
    async fn fewer_records_than_threads() {
        let removed = Arc::new(AtomicUsize::new(0));
        let handle = ModuleHandle::new("v1", "/m.wasm").with_topology(4, 1);
        let spark = Spark::create(handle, &mock_factory(removed), 8).await.unwrap();

        let out = spark
            .execute_all(requests(vec![json!({"n": 1}), json!({"n": 2})]), None)
            .await;
        assert_eq!(out.len(), 2);
        assert!(spark.execute_all(vec![], None).await.is_empty());
    }

    #[tokio::test]
    async fn partial_initialization_is_tolerated() {
        let removed = Arc::new(AtomicUsize::new(0));
        let calls = Arc::new(AtomicUsize::new(0));
        let r = removed.clone();
        let factory = move |_: &ModuleHandle| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            Arc::new(MockUnit {
                initialized: AtomicBool::new(false),
                removed: r.clone(),
                fail_init: n % 2 == 1,
            }) as Arc<dyn ExecutionUnit>
        };

        let handle = ModuleHandle::new("v1", "/m.wasm").with_topology(2, 2);
        let spark = Spark::create(handle, &factory, 8).await.unwrap();
        assert_eq!(spark.replicas(), 2);
        assert_eq!(spark.threads(), 2);
    }

    #[tokio::test]
    async fn no_unit_initialized_fails_construction() {
        let factory = |_: &ModuleHandle| {
            Arc::new(MockUnit {
                initialized: AtomicBool::new(false),
                removed: Arc::new(AtomicUsize::new(0)),
                fail_init: true,
            }) as Arc<dyn ExecutionUnit>
        };

        let handle = ModuleHandle::new("v1", "/m.wasm").with_topology(2, 1);
        let err = Spark::create(handle, &factory, 8).await.err().unwrap();
        assert!(matches!(err, AppError::ExecutionUnitNotCreated { .. }));
    }

    #[tokio::test]
    async fn dispose_is_idempotent_and_releases_every_unit() {
        let removed = Arc::new(AtomicUsize::new(0));
        let handle = ModuleHandle::new("v1", "/m.wasm").with_topology(2, 3);
        let spark = Spark::create(handle, &mock_factory(removed.clone()), 8)
            .await
            .unwrap();

        spark.dispose().await.unwrap();
        spark.dispose().await.unwrap();

        assert_eq!(removed.load(Ordering::SeqCst), 6);
        assert_eq!(spark.replicas(), 0);

        let res = spark
            .execute(Spark::build_request(&json!({"n": 1}), "v1", None, &Map::new()))
            .await;
        assert!(res.is_failure());
    }

    #[tokio::test]
    async fn lease_holds_off_dispose_until_dropped() {
        let removed = Arc::new(AtomicUsize::new(0));
        let handle = ModuleHandle::new("v1", "/m.wasm").with_topology(2, 1);
        let spark = Arc::new(
            Spark::create(handle, &mock_factory(removed.clone()), 8)
                .await
                .unwrap(),
        );
        let lease = spark.lease().await.unwrap();

        let disposer = {
            let spark = spark.clone();
            tokio::spawn(async move { spark.dispose().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        // Marked for disposal: no new leases, but the held one still works.
        assert!(spark.is_disposed());
        assert!(spark.lease().await.is_none());

        let one = lease
            .execute(Spark::build_request(&json!({"n": 3}), "v1", None, &Map::new()))
            .await;
        assert_eq!(one.outputs(), &json!({ "doubled": 6 }));

        let inputs: Vec<Value> = (0..5).map(|n| json!({ "n": n })).collect();
        let out = lease.execute_all(requests(inputs), None).await;
        assert!(out.iter().all(|r| !r.result.is_failure()));
        assert_eq!(removed.load(Ordering::SeqCst), 0);

        drop(lease);
        disposer.await.unwrap().unwrap();
        assert_eq!(removed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn record_fields_win_over_shared() {
        let req = Spark::build_request(
            &json!({"a": 1, "b": 2}),
            "v1",
            Some(&json!({"b": 20, "c": 30})),
            &Map::new(),
        );
        assert_eq!(req.inputs(), &json!({"b": 2, "c": 30, "a": 1}));
        assert_eq!(req.request_meta.version_id, "v1");
    }

    #[test]
    fn non_object_record_ignores_shared() {
        let req = Spark::build_request(&json!(5), "v1", Some(&json!({"c": 30})), &Map::new());
        assert_eq!(req.inputs(), &json!(5));
    }
}
