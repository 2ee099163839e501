use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, bail};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::runner::ExecutionUnit;
use crate::spark::types::{ExecutionRequest, ExecutionResult, ModuleHandle};

/// Adapter over an external runner program.
///
/// Each execution spawns `<program> <module url>`, writes the request JSON to
/// stdin and parses the response JSON from stdout. A non-zero exit status is an
/// error carrying stderr.
pub struct CommandRunner {
    program: String,
    version_id: String,
    module_url: String,
}

impl CommandRunner {
    pub fn new(program: String, module: &ModuleHandle) -> Self {
        Self {
            program,
            version_id: module.version_id.clone(),
            module_url: module.url.clone(),
        }
    }

    fn is_remote(&self) -> bool {
        self.module_url.starts_with("http://") || self.module_url.starts_with("https://")
    }
}

#[async_trait]
impl ExecutionUnit for CommandRunner {
    async fn initialize(&self) -> anyhow::Result<()> {
        if !self.is_remote() && !Path::new(&self.module_url).exists() {
            bail!(
                "module file for <{}> not found at {}",
                self.version_id,
                self.module_url
            );
        }
        Ok(())
    }

    async fn execute(&self, request: &ExecutionRequest) -> anyhow::Result<ExecutionResult> {
        let payload = serde_json::to_vec(request).context("failed to encode request")?;

        let mut child = Command::new(&self.program)
            .arg(&self.module_url)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn runner `{}`", self.program))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&payload)
                .await
                .context("failed to write request to runner stdin")?;
            // Dropping stdin signals EOF to the runner.
        }

        let output = child
            .wait_with_output()
            .await
            .context("runner process did not complete")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "runner exited with {}: {}",
                output.status,
                stderr.trim()
            );
        }

        debug!(
            version_id = %self.version_id,
            bytes = output.stdout.len(),
            "runner response received"
        );

        serde_json::from_slice(&output.stdout).context("runner returned malformed response")
    }

    async fn remove(&self) -> anyhow::Result<()> {
        // Nothing is held between executions.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn initialize_fails_for_missing_module_file() {
        let handle = ModuleHandle::new("v1", "/definitely/not/here.wasm");
        let unit = CommandRunner::new("cat".into(), &handle);

        let err = unit.initialize().await.unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn remote_modules_skip_the_file_check() {
        let handle = ModuleHandle::new("v1", "https://example.invalid/m.wasm");
        let unit = CommandRunner::new("cat".into(), &handle);

        assert!(unit.initialize().await.is_ok());
    }
}
