use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::spark::types::ExecutedRecord;
use crate::store::Record;
use crate::time::{humanize_ms, now_ms};

pub const BATCH_FILE: &str = "batch-data.csv";

/// Result file of one batch.
pub fn result_file(batch_id: &Uuid) -> String {
    format!("b_{batch_id}.csv")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Created,
    Processing,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Tracked asynchronous execution of many records against one module.
///
/// Transitions return a new snapshot. Once `completed` or `failed`, every
/// transition returns the batch unchanged.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: Uuid,
    pub status: BatchStatus,
    pub service_id: String,
    /// Notification target; never persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub executed_at: DateTime<Utc>,
    pub buffer_size: usize,
    pub total_inputs: usize,
    pub total_processed: usize,
    pub total_outputs: usize,
    /// Milliseconds since the batch started processing.
    pub duration: f64,
}

impl Batch {
    pub fn created(
        service_id: impl Into<String>,
        client_id: Option<String>,
        buffer_size: usize,
        total_inputs: usize,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: BatchStatus::Created,
            service_id: service_id.into(),
            client_id,
            executed_at: Utc::now(),
            buffer_size,
            total_inputs,
            total_processed: 0,
            total_outputs: 0,
            duration: 0.0,
        }
    }

    pub fn processing(&self) -> Self {
        self.transition(|b| b.status = BatchStatus::Processing)
    }

    /// Adds `processed` records to the running total, capped at `total_inputs`.
    pub fn progressed(&self, processed: usize, duration_ms: f64) -> Self {
        self.transition(|b| {
            b.status = BatchStatus::Processing;
            b.total_processed = (b.total_processed + processed).min(b.total_inputs);
            b.duration = round2(duration_ms);
        })
    }

    pub fn completed(&self, processed: usize, outputs: usize, duration_ms: f64) -> Self {
        self.transition(|b| {
            b.status = BatchStatus::Completed;
            b.total_inputs = b.total_inputs.max(processed);
            b.total_processed = processed;
            b.total_outputs = outputs;
            b.duration = round2(duration_ms);
        })
    }

    pub fn failed(&self, duration_ms: f64) -> Self {
        self.transition(|b| {
            b.status = BatchStatus::Failed;
            b.duration = round2(duration_ms);
        })
    }

    pub(crate) fn with_total_inputs(mut self, total_inputs: usize) -> Self {
        self.total_inputs = total_inputs;
        self
    }

    fn transition(&self, f: impl FnOnce(&mut Self)) -> Self {
        let mut next = self.clone();
        if !self.status.is_terminal() {
            f(&mut next);
        }
        next
    }
}

impl fmt::Display for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "batch <{}> updated: {} of {} about {}",
            self.id,
            self.total_processed,
            self.total_inputs,
            humanize_ms(self.duration)
        )
    }
}

/// Persisted form of [`Batch`], one line of `batch-data.csv`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchRow {
    pub id: Uuid,
    pub status: BatchStatus,
    pub service_id: String,
    pub executed_at: DateTime<Utc>,
    pub buffer_size: usize,
    pub total_inputs: usize,
    pub total_processed: usize,
    pub total_outputs: usize,
    pub duration: Option<f64>,
}

impl Record for BatchRow {
    const HEADERS: &'static [&'static str] = &[
        "id",
        "status",
        "service_id",
        "executed_at",
        "buffer_size",
        "total_inputs",
        "total_processed",
        "total_outputs",
        "duration",
    ];
}

impl From<&Batch> for BatchRow {
    fn from(b: &Batch) -> Self {
        Self {
            id: b.id,
            status: b.status,
            service_id: b.service_id.clone(),
            executed_at: b.executed_at,
            buffer_size: b.buffer_size,
            total_inputs: b.total_inputs,
            total_processed: b.total_processed,
            total_outputs: b.total_outputs,
            duration: Some(b.duration),
        }
    }
}

impl From<BatchRow> for Batch {
    fn from(r: BatchRow) -> Self {
        Self {
            id: r.id,
            status: r.status,
            service_id: r.service_id,
            client_id: None,
            executed_at: r.executed_at,
            buffer_size: r.buffer_size,
            total_inputs: r.total_inputs,
            total_processed: r.total_processed,
            total_outputs: r.total_outputs,
            duration: r.duration.unwrap_or(0.0),
        }
    }
}

/// One executed record of a batch, as returned to callers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchExec {
    pub inputs: Value,
    pub outputs: Value,
    /// Epoch milliseconds.
    pub executed_at: u64,
    pub duration: f64,
}

/// Persisted form of [`BatchExec`]; JSON columns are stored as text.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchExecRow {
    pub inputs: String,
    pub outputs: String,
    pub executed_at: u64,
    pub duration: f64,
}

impl Record for BatchExecRow {
    const HEADERS: &'static [&'static str] = &["inputs", "outputs", "executed_at", "duration"];
    const DELIMITER: u8 = b'|';
}

impl From<&ExecutedRecord> for BatchExecRow {
    fn from(r: &ExecutedRecord) -> Self {
        Self {
            inputs: r.request.inputs().to_string(),
            outputs: outputs_column(r),
            executed_at: now_ms(),
            duration: round2(r.elapsed_ms),
        }
    }
}

impl From<BatchExecRow> for BatchExec {
    fn from(r: BatchExecRow) -> Self {
        Self {
            inputs: parse_json_column(r.inputs),
            outputs: parse_json_column(r.outputs),
            executed_at: r.executed_at,
            duration: r.duration,
        }
    }
}

/// Outputs of a record, or `{"errors": [...]}` when it failed.
pub(crate) fn outputs_column(r: &ExecutedRecord) -> String {
    if r.result.is_failure() {
        serde_json::json!({ "errors": r.result.response_data.errors }).to_string()
    } else {
        r.result.outputs().to_string()
    }
}

/// Text that is not valid JSON is kept as a JSON string.
pub(crate) fn parse_json_column(text: String) -> Value {
    serde_json::from_str(&text).unwrap_or(Value::String(text))
}

/// Rollup of a synchronous multi-record execution.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchData {
    pub version_id: String,
    pub executed_at: Option<DateTime<Utc>>,
    pub duration_in_ms: f64,
    pub outputs: Vec<Value>,
    pub execution_times: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compiler_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// Per-record error lists, aligned with `outputs`.
    pub errors: Vec<Value>,
    pub warnings: Vec<Value>,
}

impl BatchData {
    pub fn empty(version_id: impl Into<String>) -> Self {
        Self {
            version_id: version_id.into(),
            ..Default::default()
        }
    }

    /// Metadata fields are taken from the last record.
    pub fn from_records(records: &[ExecutedRecord]) -> Self {
        let Some(last) = records.last() else {
            return Self::default();
        };

        let mut data = Self {
            executed_at: Some(Utc::now()),
            ..Default::default()
        };

        for r in records {
            let response = &r.result.response_data;
            data.execution_times.push(round3(r.elapsed_ms));
            data.outputs.push(response.outputs.clone());
            data.errors.push(Value::Array(response.errors.clone()));
            data.warnings.push(Value::Array(response.warnings.clone()));
            data.duration_in_ms += r.elapsed_ms;
        }
        data.duration_in_ms = round3(data.duration_in_ms);

        let meta = &last.result.response_meta;
        data.version_id = meta.version_id.clone();
        data.compiler_version = meta.compiler_version.clone();
        data.service_category = meta.service_category.clone();
        data.correlation_id = meta.correlation_id.clone();
        data.system = meta.system.clone();
        data
    }
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

fn round3(x: f64) -> f64 {
    (x * 1000.0).round() / 1000.0
}
