//! Execution unit contract and its adapters.
//!
//! The interpreter that actually runs module bytecode lives outside this crate.
//! Everything above this module only sees `ExecutionUnit`; which adapter backs
//! it is decided once, from `AppConfig::runner`.

pub mod command;
pub mod echo;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::RunnerKind;
use crate::spark::types::{ExecutionRequest, ExecutionResult, ModuleHandle};

pub use command::CommandRunner;
pub use echo::EchoRunner;

/// One loaded, independently executable instance of a module.
///
/// Implementations must tolerate concurrent `execute` calls; the pool never
/// assumes a unit is idle.
#[async_trait]
pub trait ExecutionUnit: Send + Sync + 'static {
    async fn initialize(&self) -> anyhow::Result<()>;

    async fn execute(&self, request: &ExecutionRequest) -> anyhow::Result<ExecutionResult>;

    /// Releases native resources. Called exactly once per unit by the pool.
    async fn remove(&self) -> anyhow::Result<()>;
}

/// Creates uninitialized units for a module.
pub trait UnitFactory: Send + Sync + 'static {
    fn create(&self, module: &ModuleHandle) -> Arc<dyn ExecutionUnit>;
}

impl<F> UnitFactory for F
where
    F: Fn(&ModuleHandle) -> Arc<dyn ExecutionUnit> + Send + Sync + 'static,
{
    fn create(&self, module: &ModuleHandle) -> Arc<dyn ExecutionUnit> {
        self(module)
    }
}

/// Factory for the adapter selected in configuration.
pub fn factory_for(kind: &RunnerKind) -> Arc<dyn UnitFactory> {
    match kind.clone() {
        RunnerKind::Echo => {
            Arc::new(|m: &ModuleHandle| Arc::new(EchoRunner::new(&m.version_id)) as Arc<dyn ExecutionUnit>)
        }
        RunnerKind::Command { program } => Arc::new(move |m: &ModuleHandle| {
            Arc::new(CommandRunner::new(program.clone(), m)) as Arc<dyn ExecutionUnit>
        }),
    }
}
