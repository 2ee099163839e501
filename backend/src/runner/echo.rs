use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use async_trait::async_trait;

use crate::runner::ExecutionUnit;
use crate::spark::types::{ExecutionRequest, ExecutionResult, ResponseData, ResponseMeta};

/// Dry-run unit: outputs mirror the request inputs.
pub struct EchoRunner {
    version_id: String,
    ready: AtomicBool,
}

impl EchoRunner {
    pub fn new(version_id: &str) -> Self {
        Self {
            version_id: version_id.to_string(),
            ready: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ExecutionUnit for EchoRunner {
    async fn initialize(&self) -> anyhow::Result<()> {
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn execute(&self, request: &ExecutionRequest) -> anyhow::Result<ExecutionResult> {
        if !self.ready.load(Ordering::SeqCst) {
            anyhow::bail!("echo runner <{}> is not initialized", self.version_id);
        }

        let start = Instant::now();
        let outputs = request.inputs().clone();

        Ok(ExecutionResult {
            response_data: ResponseData {
                outputs,
                ..Default::default()
            },
            response_meta: ResponseMeta {
                version_id: self.version_id.clone(),
                correlation_id: Some(request.request_meta.correlation_id.clone())
                    .filter(|c| !c.is_empty()),
                compiler_version: Some("echo".into()),
                process_time: Some(start.elapsed().as_secs_f64() * 1000.0),
                ..Default::default()
            },
        })
    }

    async fn remove(&self) -> anyhow::Result<()> {
        self.ready.store(false, Ordering::SeqCst);
        Ok(())
    }
}
