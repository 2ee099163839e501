//! Asynchronous batch execution: admission, progress tracking, results.

pub mod limits;
pub mod model;
mod repository;

pub use model::{Batch, BatchData, BatchExec, BatchStatus};
pub use repository::BatchRepo;
