use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::batch::model::parse_json_column;
use crate::spark::types::ExecutedRecord;
use crate::store::Record;
use crate::time::now_ms;

pub const WASM_DATA_FILE: &str = "wasm-data.csv";

/// Execution history file of one module.
pub fn history_file(version_id: &str) -> String {
    format!("{version_id}.csv")
}

/// A version id doubles as a file stem, so it must be a plain name that
/// cannot collide with the store's own files.
pub fn is_valid_version_id(version_id: &str) -> bool {
    !version_id.is_empty()
        && version_id.len() <= 128
        && !version_id.starts_with('.')
        && version_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !is_reserved_stem(version_id)
}

/// Registry, batch state and batch result files share the upload dir.
fn is_reserved_stem(stem: &str) -> bool {
    let stem = stem.to_ascii_lowercase();
    let stem = stem.strip_suffix(".csv").unwrap_or(&stem);
    stem == "wasm-data" || stem == "batch-data" || stem.starts_with("b_")
}

/// Module file locations stay inside the upload dir unless they are URLs or
/// absolute paths, and never point at a store file.
pub fn is_valid_file_path(file_path: &str) -> bool {
    let path = std::path::Path::new(file_path);
    let escapes = path
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir));
    let reserved = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.to_ascii_lowercase().ends_with(".csv") && is_reserved_stem(n));

    !file_path.trim().is_empty() && !escapes && !reserved
}

/// Registry row of an uploaded module.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WasmData {
    pub version_id: String,
    pub file_name: String,
    /// Module bytecode location; relative paths resolve against the upload dir.
    pub file_path: String,
    pub original_name: String,
    pub size: u64,
    /// Epoch milliseconds.
    pub uploaded_at: u64,
    pub service_name: Option<String>,
    pub revision: Option<String>,
    pub username: Option<String>,
}

impl WasmData {
    pub fn new(version_id: impl Into<String>, file_path: impl Into<String>, size: u64) -> Self {
        let version_id = version_id.into();
        let file_path = file_path.into();
        let file_name = std::path::Path::new(&file_path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| file_path.clone());

        Self {
            original_name: file_name.clone(),
            version_id,
            file_name,
            file_path,
            size,
            uploaded_at: now_ms(),
            service_name: None,
            revision: None,
            username: None,
        }
    }
}

impl Record for WasmData {
    const HEADERS: &'static [&'static str] = &[
        "version_id",
        "file_name",
        "file_path",
        "original_name",
        "size",
        "uploaded_at",
        "service_name",
        "revision",
        "username",
    ];
}

/// Persisted single-execution history line.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryRow {
    pub version_id: String,
    pub inputs: String,
    pub outputs: String,
    pub executed_at: u64,
    /// Milliseconds.
    pub execution_time: f64,
}

impl Record for HistoryRow {
    const HEADERS: &'static [&'static str] =
        &["version_id", "inputs", "outputs", "executed_at", "execution_time"];
    const DELIMITER: u8 = b'|';
}

impl HistoryRow {
    pub fn from_record(version_id: &str, r: &ExecutedRecord) -> Self {
        Self {
            version_id: version_id.to_string(),
            inputs: r.request.inputs().to_string(),
            outputs: crate::batch::model::outputs_column(r),
            executed_at: now_ms(),
            execution_time: (r.elapsed_ms * 100.0).round() / 100.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecHistory {
    pub version_id: String,
    pub inputs: Value,
    pub outputs: Value,
    pub executed_at: u64,
    pub execution_time: f64,
}

impl From<HistoryRow> for ExecHistory {
    fn from(r: HistoryRow) -> Self {
        Self {
            version_id: r.version_id,
            inputs: parse_json_column(r.inputs),
            outputs: parse_json_column(r.outputs),
            executed_at: r.executed_at,
            execution_time: r.execution_time,
        }
    }
}
