use std::path::{Path, PathBuf};

/// Which `ExecutionUnit` adapter backs every replica.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunnerKind {
    /// Dry-run adapter: outputs mirror inputs. Useful for smoke tests.
    Echo,
    /// External runner program, invoked as `<program> <module path>` with the
    /// request JSON on stdin.
    Command { program: String },
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Root directory of every CSV file and uploaded module.
    pub upload_path: PathBuf,

    // =========================
    // Cache configuration
    // =========================
    /// Maximum number of replica pools resident at once.
    ///
    /// Each resident pool keeps `threads * replicas` execution units alive,
    /// so this is also the bound on loaded native resources.
    pub cache_size: usize,

    // =========================
    // Rate limiting
    // =========================
    /// Batch submissions are refused while process RSS is above this value (MB).
    pub memory_threshold_mb: u64,

    /// Maximum number of batches of one module in `processing` at once.
    pub batch_limit: usize,

    // =========================
    // Health
    // =========================
    /// The upload dir is reported unhealthy once its files reach this size (MB).
    pub wasm_data_threshold_mb: u64,

    // =========================
    // Replica pool topology
    // =========================
    /// Worker tasks per pool. `execute_all` splits input into this many slices.
    pub threads: usize,

    /// Execution units owned by each worker.
    pub replicas: usize,

    /// Capacity of each worker's slice queue.
    ///
    /// Acts as backpressure between concurrent `execute_all` calls on one pool.
    pub worker_queue_capacity: usize,

    pub runner: RunnerKind,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let upload_path = std::env::var("SPARK_UPLOAD_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./uploads"));

        let runner = match std::env::var("SPARK_RUNNER").ok().as_deref() {
            Some("command") => match std::env::var("SPARK_RUNNER_CMD") {
                Ok(program) if !program.trim().is_empty() => RunnerKind::Command { program },
                _ => {
                    tracing::warn!("SPARK_RUNNER=command without SPARK_RUNNER_CMD; using echo");
                    RunnerKind::Echo
                }
            },
            _ => RunnerKind::Echo,
        };

        Self {
            upload_path,
            cache_size: env_or("SPARK_CACHE_SIZE", 10),
            memory_threshold_mb: env_or("SPARK_MEMORY_THRESHOLD_MB", 256),
            batch_limit: env_or("SPARK_BATCH_LIMIT", 1),
            wasm_data_threshold_mb: env_or("SPARK_WASM_DATA_THRESHOLD_MB", 150),
            threads: env_or("SPARK_THREADS", 1),
            replicas: env_or("SPARK_REPLICAS", 1),
            worker_queue_capacity: 64,
            runner,
        }
        .normalized()
    }

    /// Defaults rooted at `dir`, with the echo runner.
    pub fn for_dir(dir: impl AsRef<Path>) -> Self {
        Self {
            upload_path: dir.as_ref().to_path_buf(),
            cache_size: 10,
            memory_threshold_mb: 256,
            batch_limit: 1,
            wasm_data_threshold_mb: 150,
            threads: 1,
            replicas: 1,
            worker_queue_capacity: 64,
            runner: RunnerKind::Echo,
        }
    }

    /// Clamps counts that must never be zero.
    pub fn normalized(mut self) -> Self {
        self.cache_size = self.cache_size.max(1);
        self.batch_limit = self.batch_limit.max(1);
        self.threads = self.threads.max(1);
        self.replicas = self.replicas.max(1);
        self.worker_queue_capacity = self.worker_queue_capacity.max(1);
        self
    }

    pub fn print_usage(&self) {
        tracing::info!(
            upload_path = %self.upload_path.display(),
            cache_size = self.cache_size,
            memory_threshold_mb = self.memory_threshold_mb,
            batch_limit = self.batch_limit,
            wasm_data_threshold_mb = self.wasm_data_threshold_mb,
            threads = self.threads,
            replicas = self.replicas,
            runner = ?self.runner,
            "configuration loaded"
        );
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_clamps_zero_counts() {
        let mut cfg = AppConfig::for_dir("/tmp/x");
        cfg.cache_size = 0;
        cfg.threads = 0;
        cfg.replicas = 0;
        cfg.batch_limit = 0;

        let cfg = cfg.normalized();
        assert_eq!(cfg.cache_size, 1);
        assert_eq!(cfg.threads, 1);
        assert_eq!(cfg.replicas, 1);
        assert_eq!(cfg.batch_limit, 1);
    }
}
