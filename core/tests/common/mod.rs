//! Common test utilities and helpers for integration tests

#![allow(dead_code)] // Each test binary uses a different subset

use parallel_core::{
    Backend, BackendConfig, BroadcastHandle, FunctionRegistry, TaskContext, TaskFunction,
    WorkerGroup, local_group,
};
use serde::{Deserialize, Serialize};

/// Multiply every record by two.
#[derive(Debug, Serialize, Deserialize)]
pub struct Double;

impl TaskFunction for Double {
    const NAME: &'static str = "double";
    type Input = i64;
    type Output = i64;

    fn call(&self, _index: usize, input: i64, _ctx: &TaskContext) -> anyhow::Result<i64> {
        Ok(input * 2)
    }
}

/// Add the record's global index to it, tagged with the rank that ran it.
#[derive(Debug, Serialize, Deserialize)]
pub struct IndexedSum;

impl TaskFunction for IndexedSum {
    const NAME: &'static str = "indexed_sum";
    type Input = i64;
    type Output = (usize, i64);

    fn call(&self, index: usize, input: i64, ctx: &TaskContext) -> anyhow::Result<(usize, i64)> {
        Ok((ctx.rank(), index as i64 + input))
    }
}

/// Shift each record by the mean of a broadcast sample.
#[derive(Debug, Serialize, Deserialize)]
pub struct ShiftByMean {
    pub sample: BroadcastHandle<Vec<f64>>,
}

impl TaskFunction for ShiftByMean {
    const NAME: &'static str = "shift_by_mean";
    type Input = f64;
    type Output = f64;

    fn call(&self, _index: usize, input: f64, ctx: &TaskContext) -> anyhow::Result<f64> {
        let sample = ctx.value(&self.sample)?;
        if sample.is_empty() {
            anyhow::bail!("empty sample");
        }
        let mean = sample.iter().sum::<f64>() / sample.len() as f64;
        Ok(input + mean)
    }
}

/// Fail on one global index, pass everything else through.
#[derive(Debug, Serialize, Deserialize)]
pub struct FailOn {
    pub index: usize,
}

impl TaskFunction for FailOn {
    const NAME: &'static str = "fail_on";
    type Input = i64;
    type Output = i64;

    fn call(&self, index: usize, input: i64, _ctx: &TaskContext) -> anyhow::Result<i64> {
        if index == self.index {
            anyhow::bail!("refusing record {}", index);
        }
        Ok(input)
    }
}

/// Fail the first `failures` attempts of every record.
#[derive(Debug, Serialize, Deserialize)]
pub struct Flaky {
    pub failures: u32,
}

impl TaskFunction for Flaky {
    const NAME: &'static str = "flaky";
    type Input = i64;
    type Output = u32;

    fn call(&self, _index: usize, _input: i64, ctx: &TaskContext) -> anyhow::Result<u32> {
        if ctx.attempt() <= self.failures {
            anyhow::bail!("attempt {} failed", ctx.attempt());
        }
        Ok(ctx.attempt())
    }
}

/// Stall every record on one rank, pass everything through.
#[derive(Debug, Serialize, Deserialize)]
pub struct SleepOn {
    pub rank: usize,
    pub millis: u64,
}

impl TaskFunction for SleepOn {
    const NAME: &'static str = "sleep_on";
    type Input = i64;
    type Output = i64;

    fn call(&self, _index: usize, input: i64, ctx: &TaskContext) -> anyhow::Result<i64> {
        if ctx.rank() == self.rank {
            std::thread::sleep(std::time::Duration::from_millis(self.millis));
        }
        Ok(input)
    }
}

/// Registry every rank of a test group builds.
pub fn registry() -> FunctionRegistry {
    FunctionRegistry::new()
        .register::<Double>()
        .register::<IndexedSum>()
        .register::<ShiftByMean>()
        .register::<FailOn>()
        .register::<Flaky>()
        .register::<SleepOn>()
}

/// Config with short deadlines so broken groups fail fast.
pub fn test_config() -> BackendConfig {
    BackendConfig {
        app_name: "parallel-tests".to_string(),
        collective_timeout_ms: 5_000,
        ..BackendConfig::default()
    }
}

/// Start an in-process group of `world_size` ranks.
pub async fn start_group(world_size: usize) -> (Backend, WorkerGroup) {
    start_group_with(test_config(), world_size).await
}

pub async fn start_group_with(config: BackendConfig, world_size: usize) -> (Backend, WorkerGroup) {
    let _ = tracing_subscriber::fmt::try_init();
    local_group(config, world_size, registry())
        .await
        .expect("failed to start local group")
}

/// Shut the group down and check every rank left cleanly.
pub async fn stop_group(backend: Backend, workers: WorkerGroup) {
    backend.shutdown().await.expect("shutdown failed");
    workers.join().await.expect("a worker failed");
}
