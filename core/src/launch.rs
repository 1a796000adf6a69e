//! Starting a process group.
//!
//! A group is `W` ranks started together: rank 0 runs the driver on a
//! [`Backend`], ranks `1..W` run the [`Worker`] loop and never see driver
//! code. [`local_group`] runs every rank inside the current process;
//! [`run_process`] runs one rank of a group spread over processes.

use crate::backend::Backend;
use crate::config::{BackendConfig, ProcessConfig};
use crate::error::{BackendError, BackendResult};
use crate::task::FunctionRegistry;
use crate::transport::{self, TransportSpec};
use crate::types::{ROOT, Rank};
use crate::worker::Worker;
use std::process::ExitCode;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Install the fmt subscriber. Does nothing if one is already installed.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_target(false).try_init();
}

/// The worker ranks of a group started by [`local_group`].
#[derive(Debug)]
pub struct WorkerGroup {
    workers: Vec<(Rank, JoinHandle<BackendResult<()>>)>,
}

impl WorkerGroup {
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Wait for every worker to leave its loop. Returns the first error a
    /// worker ended with.
    pub async fn join(self) -> BackendResult<()> {
        let mut first_error = None;
        for (rank, handle) in self.workers {
            let outcome = handle.await.unwrap_or_else(|e| {
                Err(BackendError::Internal(format!(
                    "worker {} did not finish: {}",
                    rank, e
                )))
            });
            if let Err(e) = outcome {
                error!("Worker {} ended with an error: {}", rank, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Start a group of `world_size` ranks inside this process, connected by
/// the in-memory transport. Workers run as tokio tasks.
pub async fn local_group(
    config: BackendConfig,
    world_size: usize,
    registry: FunctionRegistry,
) -> BackendResult<(Backend, WorkerGroup)> {
    config.validate()?;
    let mut endpoints = transport::build(TransportSpec::Local { world_size })
        .await?
        .into_iter();
    let root = endpoints
        .next()
        .ok_or_else(|| BackendError::Internal("local group has no root endpoint".to_string()))?;

    let mut workers = Vec::with_capacity(world_size.saturating_sub(1));
    for endpoint in endpoints {
        let rank = endpoint.rank();
        let worker = Worker::new(endpoint, registry.clone(), &config)?;
        workers.push((rank, tokio::spawn(worker.run())));
    }

    let backend = Backend::start(root, registry, config).await?;
    Ok((backend, WorkerGroup { workers }))
}

/// Run one rank of a multi-process group and return its exit code: success
/// on a clean shutdown, failure on any unrecovered error.
///
/// Root binds `process.root_addr`, waits for every worker, runs `driver` and
/// shuts the group down; the driver's error, if any, is logged and turns
/// into a failing exit code. Every other rank connects to root and serves
/// it until shutdown.
pub async fn run_process<D>(
    config: BackendConfig,
    process: ProcessConfig,
    registry: FunctionRegistry,
    driver: D,
) -> ExitCode
where
    D: AsyncFnOnce(&mut Backend) -> anyhow::Result<()>,
{
    let rank = process.rank;
    let result = if rank == ROOT {
        run_root(config, process, registry, driver).await
    } else {
        run_worker(config, process, registry).await
    };

    match result {
        Ok(()) => {
            info!("Rank {} exiting cleanly", rank);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Rank {} failed: {:#}", rank, e);
            ExitCode::FAILURE
        }
    }
}

async fn run_root<D>(
    config: BackendConfig,
    process: ProcessConfig,
    registry: FunctionRegistry,
    driver: D,
) -> anyhow::Result<()>
where
    D: AsyncFnOnce(&mut Backend) -> anyhow::Result<()>,
{
    let transport = single_endpoint(process, &config).await?;
    let mut backend = Backend::start(transport, registry, config).await?;
    let driven = driver(&mut backend).await;
    let shutdown = backend.shutdown().await;
    driven?;
    shutdown?;
    Ok(())
}

async fn run_worker(
    config: BackendConfig,
    process: ProcessConfig,
    registry: FunctionRegistry,
) -> anyhow::Result<()> {
    let transport = single_endpoint(process, &config).await?;
    Worker::new(transport, registry, &config)?.run().await?;
    Ok(())
}

async fn single_endpoint(
    process: ProcessConfig,
    config: &BackendConfig,
) -> BackendResult<Box<dyn transport::Transport>> {
    info!(
        "Rank {} of {} joining group at {}",
        process.rank, process.world_size, process.root_addr
    );
    transport::build(TransportSpec::Tcp {
        process,
        config: config.clone(),
    })
    .await?
    .pop()
    .ok_or_else(|| BackendError::Internal("TCP transport built no endpoint".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_group_of_one() {
        let (backend, workers) = local_group(BackendConfig::default(), 1, FunctionRegistry::new())
            .await
            .unwrap();
        assert!(workers.is_empty());
        assert_eq!(backend.world_size(), 1);
        backend.shutdown().await.unwrap();
        workers.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_local_group_rejects_empty_group() {
        let err = local_group(BackendConfig::default(), 0, FunctionRegistry::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Configuration(_)));
    }
}
