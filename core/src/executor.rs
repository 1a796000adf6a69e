//! Per-rank execution state.
//!
//! Root and every worker own one [`RankExecutor`]: the shards of each live
//! dataset placed on the rank, the broadcast cache and the function registry.
//! Root drives its executor directly, workers drive theirs from the control
//! loop.

use crate::broadcast::BroadcastCache;
use crate::config::ExecutorConfig;
use crate::error::{BackendError, BackendResult};
use crate::failure::{FailurePolicy, RecordFailure};
use crate::partition::ShardLayout;
use crate::protocol::{HandshakeAck, ReleaseSet, ShardPayload, TaskMetrics, TaskReport};
use crate::task::{BoundFunction, FunctionRegistry, RecordOutcome, TaskContext, TaskDescriptor};
use crate::types::{DatasetId, Rank, SessionId};
use parallel_common::codec;
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// One rank's shard of a dataset. A `None` slot is a record that failed in
/// an earlier `map` and was skipped.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct StoredShard {
    pub offset: usize,
    pub slots: Vec<Option<Vec<u8>>>,
}

/// Output of running a task over one shard.
#[derive(Debug)]
struct ShardRun {
    shard: StoredShard,
    failures: Vec<RecordFailure>,
}

#[derive(Debug)]
pub struct RankExecutor {
    rank: Rank,
    world_size: usize,
    session: SessionId,
    registry: FunctionRegistry,
    broadcasts: Arc<BroadcastCache>,
    shards: HashMap<DatasetId, Arc<StoredShard>>,
    pool: Option<Arc<rayon::ThreadPool>>,
}

impl RankExecutor {
    pub fn new(
        rank: Rank,
        world_size: usize,
        session: SessionId,
        registry: FunctionRegistry,
        config: &ExecutorConfig,
    ) -> BackendResult<Self> {
        let threads = config.threads();
        let pool = if threads > 1 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .thread_name(move |i| format!("rank-{}-record-{}", rank, i))
                .build()
                .map_err(|e| {
                    BackendError::Configuration(format!("failed to build record pool: {}", e))
                })?;
            Some(Arc::new(pool))
        } else {
            None
        };

        Ok(Self {
            rank,
            world_size,
            session,
            registry,
            broadcasts: Arc::new(BroadcastCache::new()),
            shards: HashMap::new(),
            pool,
        })
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn registry(&self) -> &FunctionRegistry {
        &self.registry
    }

    pub fn broadcasts(&self) -> &Arc<BroadcastCache> {
        &self.broadcasts
    }

    /// Number of dataset shards held by this rank.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn holds(&self, dataset: DatasetId) -> bool {
        self.shards.contains_key(&dataset)
    }

    /// Commands of another session mean root and this rank are out of step.
    pub fn check_session(&self, session: SessionId) -> BackendResult<()> {
        if session != self.session {
            return Err(BackendError::protocol_mismatch(
                self.rank,
                format!("a command of session {}", self.session),
                format!("a command of session {}", session),
            ));
        }
        Ok(())
    }

    /// The local registry as seen by root during the session handshake.
    pub fn handshake(&self) -> HandshakeAck {
        HandshakeAck {
            rank: self.rank,
            functions: self.registry.names(),
        }
    }

    /// Drop every shard and broadcast and adopt `session`.
    pub fn reset(&mut self, session: SessionId) -> BackendResult<()> {
        info!(
            "Rank {} moving from session {} to {}, dropping {} shard(s)",
            self.rank,
            self.session,
            session,
            self.shards.len()
        );
        self.shards.clear();
        self.broadcasts.clear()?;
        self.session = session;
        Ok(())
    }

    pub fn release(&mut self, releases: &ReleaseSet) -> BackendResult<()> {
        for dataset in &releases.datasets {
            if self.shards.remove(dataset).is_some() {
                debug!("Rank {} released {}", self.rank, dataset);
            }
        }
        for id in &releases.broadcasts {
            if self.broadcasts.remove(*id)? {
                debug!("Rank {} released {}", self.rank, id);
            }
        }
        Ok(())
    }

    /// Store this rank's part of a parallelized sequence, as scattered by
    /// root: an encoded list of encoded records.
    pub fn store_part(
        &mut self,
        dataset: DatasetId,
        layout: &ShardLayout,
        part: &[u8],
    ) -> BackendResult<()> {
        let records: Vec<Vec<u8>> = codec::decode(part)?;
        self.store_records(dataset, layout, records)
    }

    pub fn store_records(
        &mut self,
        dataset: DatasetId,
        layout: &ShardLayout,
        records: Vec<Vec<u8>>,
    ) -> BackendResult<()> {
        if layout.num_shards() != self.world_size {
            return Err(BackendError::size_mismatch(
                format!("layout of {}", dataset),
                self.world_size,
                layout.num_shards(),
            ));
        }
        let expected = layout.len(self.rank);
        if records.len() != expected {
            return Err(BackendError::size_mismatch(
                format!("shard {} of {}", self.rank, dataset),
                expected,
                records.len(),
            ));
        }

        debug!(
            "Rank {} stored {} record(s) of {}",
            self.rank,
            records.len(),
            dataset
        );
        self.shards.insert(
            dataset,
            Arc::new(StoredShard {
                offset: layout.offset(self.rank),
                slots: records.into_iter().map(Some).collect(),
            }),
        );
        Ok(())
    }

    /// Run a task over the local shard of its input and store the output
    /// shard. Never fails: anything that goes wrong ends up in the report.
    pub async fn run_task(&mut self, task: &TaskDescriptor) -> TaskReport {
        match self.execute(task).await {
            Ok(report) => report,
            Err(e) => {
                warn!("Rank {} could not run {}: {}", self.rank, task.task_id, e);
                TaskReport::failed(self.rank, e)
            }
        }
    }

    async fn execute(&mut self, task: &TaskDescriptor) -> BackendResult<TaskReport> {
        let started = Instant::now();
        let input = self.shard(task.input)?;
        let expected = task.layout.len(self.rank);
        if input.slots.len() != expected {
            return Err(BackendError::size_mismatch(
                format!("input shard {} of {}", self.rank, task.input),
                expected,
                input.slots.len(),
            ));
        }
        let bound = self.registry.bind(&task.function, &task.args)?;
        let mut metrics = TaskMetrics {
            deserialize_time_ms: started.elapsed().as_millis() as u64,
            ..TaskMetrics::default()
        };

        debug!(
            "Rank {} running '{}' over {} record(s) of {}",
            self.rank,
            task.function,
            input.slots.len(),
            task.input
        );
        let run_started = Instant::now();
        let ctx = TaskContext::new(
            self.rank,
            self.world_size,
            self.session,
            self.broadcasts.clone(),
        );
        let rank = self.rank;
        let policy = task.policy;
        let pool = self.pool.clone();
        let run = tokio::task::spawn_blocking(move || {
            run_shard(rank, bound.as_ref(), &input, &ctx, policy, pool.as_deref())
        })
        .await
        .map_err(|e| BackendError::Internal(format!("task thread failed: {}", e)))??;
        metrics.run_time_ms = run_started.elapsed().as_millis() as u64;
        metrics.result_size_bytes = run
            .shard
            .slots
            .iter()
            .flatten()
            .map(|record| record.len() as u64)
            .sum();

        let records = run.shard.slots.len();
        self.shards.insert(task.output, Arc::new(run.shard));
        Ok(TaskReport {
            rank: self.rank,
            records,
            failures: run.failures,
            error: None,
            metrics,
        })
    }

    /// This rank's shard of `dataset`, ready to be gathered on root.
    pub fn shard_payload(&self, dataset: DatasetId) -> ShardPayload {
        match self.shard(dataset) {
            Ok(shard) => ShardPayload {
                rank: self.rank,
                offset: shard.offset,
                records: shard.slots.clone(),
                error: None,
            },
            Err(e) => ShardPayload {
                rank: self.rank,
                offset: 0,
                records: Vec::new(),
                error: Some(e),
            },
        }
    }

    fn shard(&self, dataset: DatasetId) -> BackendResult<Arc<StoredShard>> {
        self.shards.get(&dataset).cloned().ok_or_else(|| {
            BackendError::StaleHandle(format!(
                "{} is not stored on rank {} in session {}",
                dataset, self.rank, self.session
            ))
        })
    }
}

/// Apply a bound function to every record of a shard, in shard order.
///
/// Records that failed upstream stay empty without counting as new failures.
/// With a pool the records run in parallel, but the outcome is folded in
/// order, so a stopping policy reports the same first failure either way.
fn run_shard(
    rank: Rank,
    bound: &dyn BoundFunction,
    input: &StoredShard,
    ctx: &TaskContext,
    policy: FailurePolicy,
    pool: Option<&rayon::ThreadPool>,
) -> BackendResult<ShardRun> {
    let apply = |position: usize| -> BackendResult<Option<RecordOutcome>> {
        match &input.slots[position] {
            Some(record) => bound
                .apply(input.offset + position, record, ctx, policy)
                .map(Some),
            None => Ok(None),
        }
    };

    let mut run = ShardRun {
        shard: StoredShard {
            offset: input.offset,
            slots: Vec::with_capacity(input.slots.len()),
        },
        failures: Vec::new(),
    };
    // Returns true when the shard must stop.
    let mut fold = |position: usize, outcome: Option<RecordOutcome>| -> bool {
        match outcome {
            None => run.shard.slots.push(None),
            Some(Ok(output)) => run.shard.slots.push(Some(output)),
            Some(Err((attempts, message))) => {
                run.shard.slots.push(None);
                run.failures.push(RecordFailure {
                    index: input.offset + position,
                    rank,
                    attempts,
                    message,
                });
                return policy.stops_on_failure();
            }
        }
        false
    };

    match pool {
        Some(pool) => {
            let outcomes: Vec<_> =
                pool.install(|| (0..input.slots.len()).into_par_iter().map(apply).collect());
            for (position, outcome) in outcomes.into_iter().enumerate() {
                if fold(position, outcome?) {
                    break;
                }
            }
        }
        None => {
            for position in 0..input.slots.len() {
                if fold(position, apply(position)?) {
                    break;
                }
            }
        }
    }
    Ok(run)
}
