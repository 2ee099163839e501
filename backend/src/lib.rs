pub mod batch;
pub mod cache;
pub mod config;
pub mod context;
pub mod metrics;
pub mod notify;
pub mod runner;
pub mod spark;
pub mod store;
pub mod wasm;

pub mod error;
pub mod logger;
pub mod time;
