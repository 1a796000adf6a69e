//! Backend and process configuration.

use crate::error::{BackendError, BackendResult};
use crate::failure::FailurePolicy;
use parallel_common::codec::json;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Configuration shared by root and workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Application name, used in log output
    pub app_name: String,
    /// Milliseconds root waits for a rank during a collective
    pub collective_timeout_ms: u64,
    /// Milliseconds root waits for task reports; `None` waits indefinitely
    pub task_timeout_ms: Option<u64>,
    /// Milliseconds a worker keeps trying to reach root, and root waits for workers
    pub connect_timeout_ms: u64,
    /// Pause between connection attempts
    pub connect_retry_interval_ms: u64,
    /// Largest single frame accepted by the TCP transport
    pub max_payload_bytes: usize,
    /// Policy used by `map` unless the call names one
    pub failure_policy: FailurePolicy,
    /// Executor configuration
    pub executor: ExecutorConfig,
}

/// How a rank runs the records of its shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Threads used for one shard: 1 runs records sequentially, 0 uses one
    /// thread per CPU core.
    pub record_threads: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            app_name: "parallel-app".to_string(),
            collective_timeout_ms: 30_000,
            task_timeout_ms: None,
            connect_timeout_ms: 10_000,
            connect_retry_interval_ms: 200,
            max_payload_bytes: 1024 * 1024 * 128, // 128MB
            failure_policy: FailurePolicy::Abort,
            executor: ExecutorConfig::default(),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self { record_threads: 1 }
    }
}

impl ExecutorConfig {
    /// Effective thread count for a shard.
    pub fn threads(&self) -> usize {
        match self.record_threads {
            0 => num_cpus::get(),
            n => n,
        }
    }
}

impl BackendConfig {
    pub fn from_json_str(text: &str) -> BackendResult<Self> {
        let config: Self = json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> BackendResult<Self> {
        let config: Self = json::from_file(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> BackendResult<()> {
        if self.collective_timeout_ms == 0 {
            return Err(BackendError::Configuration(
                "collective_timeout_ms must be positive".to_string(),
            ));
        }
        if self.max_payload_bytes == 0 {
            return Err(BackendError::Configuration(
                "max_payload_bytes must be positive".to_string(),
            ));
        }
        self.failure_policy.validate()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn connect_retry_interval(&self) -> Duration {
        Duration::from_millis(self.connect_retry_interval_ms)
    }
}

/// Where this process sits in the process group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessConfig {
    pub rank: usize,
    pub world_size: usize,
    pub root_addr: SocketAddr,
}

impl ProcessConfig {
    pub const RANK_VAR: &'static str = "PARALLEL_RANK";
    pub const WORLD_SIZE_VAR: &'static str = "PARALLEL_WORLD_SIZE";
    pub const ROOT_ADDR_VAR: &'static str = "PARALLEL_ROOT_ADDR";
    const MPI_RANK_VAR: &'static str = "OMPI_COMM_WORLD_RANK";
    const MPI_WORLD_SIZE_VAR: &'static str = "OMPI_COMM_WORLD_SIZE";
    const DEFAULT_ROOT_ADDR: &'static str = "127.0.0.1:47000";

    pub fn new(rank: usize, world_size: usize, root_addr: SocketAddr) -> BackendResult<Self> {
        if world_size == 0 {
            return Err(BackendError::Configuration(
                "world size must be at least 1".to_string(),
            ));
        }
        if rank >= world_size {
            return Err(BackendError::Configuration(format!(
                "rank {} is outside a group of {}",
                rank, world_size
            )));
        }
        Ok(Self {
            rank,
            world_size,
            root_addr,
        })
    }

    /// Read the process placement from the environment.
    ///
    /// `PARALLEL_*` variables win; Open MPI's variables are accepted so a
    /// group can be started with `mpirun -np W`.
    pub fn from_env() -> BackendResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> BackendResult<Self> {
        let read = |primary: &str, fallback: &str| -> BackendResult<usize> {
            let (key, raw) = match lookup(primary) {
                Some(raw) => (primary.to_string(), raw),
                None => match lookup(fallback) {
                    Some(raw) => (fallback.to_string(), raw),
                    None => {
                        return Err(BackendError::Configuration(format!(
                            "neither {} nor {} is set",
                            primary, fallback
                        )));
                    }
                },
            };
            raw.trim().parse().map_err(|e| {
                BackendError::Configuration(format!("{}='{}' is not a number: {}", key, raw, e))
            })
        };

        let rank = read(Self::RANK_VAR, Self::MPI_RANK_VAR)?;
        let world_size = read(Self::WORLD_SIZE_VAR, Self::MPI_WORLD_SIZE_VAR)?;
        let addr = lookup(Self::ROOT_ADDR_VAR).unwrap_or_else(|| Self::DEFAULT_ROOT_ADDR.into());
        let root_addr = addr.parse().map_err(|e| {
            BackendError::Configuration(format!("{}='{}': {}", Self::ROOT_ADDR_VAR, addr, e))
        })?;
        Self::new(rank, world_size, root_addr)
    }
}
