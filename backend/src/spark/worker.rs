use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use tokio::sync::mpsc::Receiver;
use tokio::sync::oneshot;
use tracing::{Instrument, debug, info_span, warn};

use crate::runner::ExecutionUnit;
use crate::spark::types::{ExecutedRecord, ExecutionRequest, ExecutionResult};

/// A contiguous slice of one `execute_all` submission.
pub(crate) struct SliceJob {
    /// Position of the slice's first request in the submission.
    pub offset: usize,
    pub requests: Vec<ExecutionRequest>,
    /// One reply channel per in-flight slice.
    pub reply: oneshot::Sender<Vec<ExecutedRecord>>,
}

/// Executes slices for one replica pool worker.
///
/// A worker owns `replicas` units; a slice is run in rounds of that many
/// records, each record of a round on a distinct unit.
pub(crate) struct Worker {
    id: usize,
    version_id: String,
    units: Vec<Arc<dyn ExecutionUnit>>,
}

impl Worker {
    pub fn new(id: usize, version_id: String, units: Vec<Arc<dyn ExecutionUnit>>) -> Self {
        Self {
            id,
            version_id,
            units,
        }
    }

    /// Worker loop. Exits when every sender of the inbox is dropped.
    pub async fn run(self, mut rx: Receiver<SliceJob>) {
        debug!(
            component = "worker",
            worker = self.id,
            version_id = %self.version_id,
            units = self.units.len(),
            event = "startup"
        );

        while let Some(job) = rx.recv().await {
            let span = info_span!(
                "slice_execution",
                worker = self.id,
                version_id = %self.version_id,
                offset = job.offset,
                size = job.requests.len()
            );

            let records = self.execute_slice(job.requests).instrument(span).await;

            if job.reply.send(records).is_err() {
                warn!(
                    component = "worker",
                    worker = self.id,
                    offset = job.offset,
                    "slice receiver dropped before results were delivered"
                );
            }
        }

        debug!(component = "worker", worker = self.id, "worker exiting");
    }

    async fn execute_slice(&self, requests: Vec<ExecutionRequest>) -> Vec<ExecutedRecord> {
        let mut out = Vec::with_capacity(requests.len());
        let mut pending = requests.into_iter();

        loop {
            let round: Vec<ExecutionRequest> = pending.by_ref().take(self.units.len()).collect();
            if round.is_empty() {
                break;
            }

            let handles = round
                .into_iter()
                .zip(self.units.iter())
                .map(|(request, unit)| run_one(unit.as_ref(), &self.version_id, request));

            out.extend(join_all(handles).await);
        }

        out
    }
}

/// Runs one record; a unit error becomes a failed result for that record only.
pub(crate) async fn run_one(
    unit: &dyn ExecutionUnit,
    version_id: &str,
    request: ExecutionRequest,
) -> ExecutedRecord {
    let start = Instant::now();

    let result = match unit.execute(&request).await {
        Ok(result) => result,
        Err(e) => {
            warn!(version_id = %version_id, error = %format!("{e:#}"), "record execution failed");
            ExecutionResult::failed(version_id, format!("{e:#}"))
        }
    };

    ExecutedRecord {
        request,
        result,
        elapsed_ms: start.elapsed().as_secs_f64() * 1000.0,
    }
}

/// Failed record for a request that never reached a unit.
pub(crate) fn unreachable_record(
    version_id: &str,
    request: ExecutionRequest,
    reason: &str,
) -> ExecutedRecord {
    ExecutedRecord {
        request,
        result: ExecutionResult::failed(version_id, reason),
        elapsed_ms: 0.0,
    }
}
