//! Module registry and synchronous execution.

pub mod model;
mod repository;

pub use model::{ExecHistory, HistoryRow, WasmData};
pub use repository::WasmRepo;
