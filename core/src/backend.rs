//! The root-side entry point: `parallelize`, `broadcast`, `map` and
//! `collect`.
//!
//! Every call follows the same shape. Root broadcasts a [`ControlMessage`]
//! naming the command, then every rank joins the collective that belongs to
//! it. Root owns shard 0 and does its share of the work in between, like any
//! other rank.

use crate::broadcast::BroadcastHandle;
use crate::config::BackendConfig;
use crate::error::{BackendError, BackendResult};
use crate::executor::RankExecutor;
use crate::failure::{
    AggregateFailure, FailureMonitor, FailurePolicy, FailureStats, MapOutcome, RecordFailure,
};
use crate::partition::ShardLayout;
use crate::pds::{PartitionedDataset, Provenance, ReleaseQueue};
use crate::protocol::{
    Command, ControlMessage, HandshakeAck, ShardPayload, StoreAck, TaskReport,
};
use crate::task::{FunctionRegistry, TaskDescriptor};
use crate::traits::{Data, TaskFunction};
use crate::transport::{Communicator, Transport};
use crate::types::{BroadcastId, DatasetId, ROOT, Rank, SessionCell, SessionId};
use parallel_common::codec;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Root's view of a dataset that is still alive on the group.
#[derive(Debug, Clone)]
struct DatasetEntry {
    layout: ShardLayout,
    provenance: Provenance,
}

/// A backend session, held by root.
///
/// Only root can hold a `Backend`; every other rank runs a
/// [`Worker`](crate::worker::Worker). Once a call fails with a fatal error
/// (transport failure, timeout, protocol mismatch) the session is poisoned
/// and every further call fails with [`BackendError::SessionAborted`].
#[derive(Debug)]
pub struct Backend {
    comm: Communicator,
    executor: RankExecutor,
    monitor: FailureMonitor,
    config: BackendConfig,
    session: SessionId,
    /// Read by broadcast handles held outside the backend
    current: SessionCell,
    datasets: HashMap<DatasetId, DatasetEntry>,
    releases: ReleaseQueue,
    next_dataset: u64,
    /// Shared by all sessions so generations never repeat
    broadcast_generation: u64,
    poisoned: Option<String>,
}

impl Backend {
    /// Start a session on root and check that every worker registered the
    /// same functions.
    pub async fn start(
        transport: Box<dyn Transport>,
        registry: FunctionRegistry,
        config: BackendConfig,
    ) -> BackendResult<Self> {
        config.validate()?;
        if transport.rank() != ROOT {
            return Err(BackendError::InvalidRole(format!(
                "rank {} is a worker; only rank {} can start a backend session",
                transport.rank(),
                ROOT
            )));
        }

        let world_size = transport.world_size();
        let session = SessionId::new();
        let executor = RankExecutor::new(
            ROOT,
            world_size,
            session,
            registry,
            &config.executor,
        )?;
        let mut backend = Self {
            comm: Communicator::new(transport),
            executor,
            monitor: FailureMonitor::new(&config, world_size),
            config,
            session,
            current: SessionCell::new(session),
            datasets: HashMap::new(),
            releases: ReleaseQueue::default(),
            next_dataset: 0,
            broadcast_generation: 0,
            poisoned: None,
        };

        let handshake = backend.handshake().await;
        backend.guard(handshake)?;
        info!(
            "Backend session {} of '{}' started with {} rank(s)",
            backend.session, backend.config.app_name, world_size
        );
        Ok(backend)
    }

    pub fn rank(&self) -> Rank {
        ROOT
    }

    pub fn world_size(&self) -> usize {
        self.comm.world_size()
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn failure_stats(&self) -> &FailureStats {
        self.monitor.stats()
    }

    /// Whether a fatal error ended the session.
    pub fn is_aborted(&self) -> bool {
        self.poisoned.is_some()
    }

    /// Split `data` into one contiguous shard per rank and place shard `i`
    /// on rank `i`. Empty input is allowed and yields empty shards.
    pub async fn parallelize<T: Data>(
        &mut self,
        data: Vec<T>,
    ) -> BackendResult<PartitionedDataset<T>> {
        let result = self.parallelize_inner(data).await;
        self.guard(result)
    }

    /// Replicate `value` to every rank once.
    pub async fn broadcast<V: Data>(&mut self, value: V) -> BackendResult<BroadcastHandle<V>> {
        let result = self.broadcast_inner(value).await;
        self.guard(result)
    }

    /// Apply `function` to every record of `pds` under the configured
    /// failure policy.
    pub async fn map<F: TaskFunction>(
        &mut self,
        function: &F,
        pds: &PartitionedDataset<F::Input>,
    ) -> BackendResult<PartitionedDataset<F::Output>> {
        let policy = self.monitor.policy_for(None);
        self.map_with_policy(function, pds, policy).await
    }

    /// Apply `function` to every record of `pds`.
    ///
    /// Every rank maps its own shard, in shard order, and the result has the
    /// same layout as `pds`. Record failures are handled according to
    /// `policy`; with [`FailurePolicy::SkipAndContinue`] the call succeeds
    /// and the returned dataset is tainted.
    pub async fn map_with_policy<F: TaskFunction>(
        &mut self,
        function: &F,
        pds: &PartitionedDataset<F::Input>,
        policy: FailurePolicy,
    ) -> BackendResult<PartitionedDataset<F::Output>> {
        let result = self.map_inner(function, pds, policy).await;
        self.guard(result)
    }

    /// Gather every shard on root, in rank order.
    ///
    /// Fails with the aggregate error if any record of `pds` failed, instead
    /// of returning fewer records.
    pub async fn collect<T: Data>(&mut self, pds: &PartitionedDataset<T>) -> BackendResult<Vec<T>> {
        self.ensure_live()?;
        self.check_dataset(pds)?;
        if let Some(failures) = pds.failures() {
            return Err(BackendError::WorkerExecution(failures.clone()));
        }

        let result = self.gather_records(pds).await;
        let records = self.guard(result)?;
        records
            .into_iter()
            .map(|(index, slot)| -> BackendResult<T> {
                match slot {
                    Some(bytes) => Ok(codec::decode(&bytes)?),
                    None => Err(BackendError::Internal(format!(
                        "record {} of {} is missing",
                        index,
                        pds.id()
                    ))),
                }
            })
            .collect()
    }

    /// Gather every shard on root, in rank order, with the failure in place
    /// of each record that failed.
    pub async fn collect_partial<T: Data>(
        &mut self,
        pds: &PartitionedDataset<T>,
    ) -> BackendResult<Vec<Result<T, RecordFailure>>> {
        self.ensure_live()?;
        self.check_dataset(pds)?;

        let result = self.gather_records(pds).await;
        let records = self.guard(result)?;
        records
            .into_iter()
            .map(|(index, slot)| -> BackendResult<Result<T, RecordFailure>> {
                match slot {
                    Some(bytes) => Ok(Ok(codec::decode(&bytes)?)),
                    None => Ok(Err(missing_record(pds, index))),
                }
            })
            .collect()
    }

    /// Number of records in `pds`, known on root without communication.
    pub fn count<T>(&self, pds: &PartitionedDataset<T>) -> BackendResult<usize> {
        self.check_dataset(pds)?;
        Ok(pds.len())
    }

    /// The chain of datasets `pds` was derived from, starting with `pds`
    /// itself. Stops at the first ancestor that was already released.
    pub fn lineage<T>(
        &self,
        pds: &PartitionedDataset<T>,
    ) -> BackendResult<Vec<(DatasetId, Provenance)>> {
        self.check_dataset(pds)?;
        let mut chain = vec![(pds.id(), pds.provenance().clone())];
        let mut next = pds.provenance().clone();
        while let Provenance::Mapped { parent, .. } = next {
            match self.datasets.get(&parent) {
                Some(entry) => {
                    chain.push((parent, entry.provenance.clone()));
                    next = entry.provenance.clone();
                }
                None => break,
            }
        }
        Ok(chain)
    }

    /// Root's copy of a broadcast value.
    pub fn value<V: Data>(&self, handle: &BroadcastHandle<V>) -> BackendResult<Arc<V>> {
        if handle.session() != self.session {
            return Err(stale_session(handle.id(), handle.session(), self.session));
        }
        self.executor
            .broadcasts()
            .get(handle.id(), handle.generation())
    }

    /// Drop a broadcast value on every rank. Workers free their copy with
    /// the next command.
    pub fn release_broadcast<V: Data>(&mut self, handle: BroadcastHandle<V>) -> BackendResult<()> {
        if handle.session() != self.session {
            return Err(stale_session(handle.id(), handle.session(), self.session));
        }
        self.executor.broadcasts().remove(handle.id())?;
        self.releases.push_broadcast(handle.id());
        debug!("Queued release of {}", handle.id());
        Ok(())
    }

    /// Wait until every rank has reached this point.
    pub async fn barrier(&mut self) -> BackendResult<()> {
        let result = self.barrier_inner().await;
        self.guard(result)
    }

    /// Start a new session on every rank. All datasets and broadcast values
    /// are dropped, and handles created before the reset are rejected with
    /// [`BackendError::StaleHandle`].
    pub async fn reset(&mut self) -> BackendResult<()> {
        let result = self.reset_inner().await;
        self.guard(result)
    }

    /// Send the shutdown sentinel and close the transport.
    ///
    /// On an aborted session the sentinel is still attempted so that workers
    /// still in step can leave cleanly; the abort is then reported.
    pub async fn shutdown(mut self) -> BackendResult<()> {
        let poisoned = self.poisoned.take();
        info!("Shutting down backend session {}", self.session);
        let sent = self.issue(Command::Shutdown).await;
        let closed = self.comm.close().await;
        if let Some(reason) = poisoned {
            return Err(BackendError::SessionAborted(reason));
        }
        sent?;
        closed
    }

    async fn handshake(&mut self) -> BackendResult<()> {
        let functions = self.executor.registry().names();
        self.issue(Command::Handshake {
            session: self.session,
            functions: functions.clone(),
        })
        .await?;

        let local = codec::encode(&self.executor.handshake())?;
        let acks: Vec<HandshakeAck> = self.gather(local, self.collective_deadline()).await?;
        for (rank, ack) in acks.into_iter().enumerate() {
            if ack.rank != rank {
                return Err(BackendError::protocol_mismatch(
                    rank,
                    format!("handshake from rank {}", rank),
                    format!("handshake from rank {}", ack.rank),
                ));
            }
            if ack.functions != functions {
                return Err(BackendError::protocol_mismatch(
                    rank,
                    format!("functions [{}]", functions.join(", ")),
                    format!("functions [{}]", ack.functions.join(", ")),
                ));
            }
        }
        Ok(())
    }

    async fn parallelize_inner<T: Data>(
        &mut self,
        data: Vec<T>,
    ) -> BackendResult<PartitionedDataset<T>> {
        self.ensure_live()?;
        let records = data
            .iter()
            .map(codec::encode)
            .collect::<Result<Vec<_>, _>>()?;
        let layout = ShardLayout::even(records.len(), self.world_size());
        let dataset = self.next_dataset_id();

        debug!(
            "Parallelizing {} record(s) into {} as {:?}",
            records.len(),
            dataset,
            layout.sizes()
        );
        self.issue(Command::Parallelize {
            session: self.session,
            dataset,
            layout: layout.clone(),
        })
        .await?;

        let mut parts = layout.split(records).into_iter();
        let own = parts.next().unwrap_or_default();
        let encoded = parts
            .map(|part| codec::encode(&part))
            .collect::<Result<Vec<_>, _>>()?;
        // Root keeps its part decoded; the scatter carries an empty slot for it.
        let mut scattered = Vec::with_capacity(self.world_size());
        scattered.push(Vec::new());
        scattered.extend(encoded);
        self.comm
            .scatter(Some(scattered), self.collective_deadline())
            .await?;

        let stored = self.executor.store_records(dataset, &layout, own);
        let local = codec::encode(&StoreAck {
            rank: ROOT,
            error: stored.err(),
        })?;
        let acks: Vec<StoreAck> = self.gather(local, self.collective_deadline()).await?;
        if let Some(error) = acks.into_iter().find_map(|ack| ack.error) {
            self.releases.push_dataset(dataset);
            return Err(error);
        }

        let provenance = Provenance::Parallelized {
            records: layout.total(),
        };
        self.datasets.insert(
            dataset,
            DatasetEntry {
                layout: layout.clone(),
                provenance: provenance.clone(),
            },
        );
        Ok(PartitionedDataset::new(
            dataset,
            self.session,
            layout,
            provenance,
            None,
            self.releases.clone(),
        ))
    }

    async fn broadcast_inner<V: Data>(&mut self, value: V) -> BackendResult<BroadcastHandle<V>> {
        self.ensure_live()?;
        let payload = codec::encode(&value)?;
        self.broadcast_generation += 1;
        let generation = self.broadcast_generation;
        let id = BroadcastId(generation);

        debug!("Broadcasting {} ({} bytes)", id, payload.len());
        self.issue(Command::Broadcast {
            session: self.session,
            id,
            generation,
            payload: payload.clone(),
        })
        .await?;

        let cache = self.executor.broadcasts().clone();
        cache.insert_decoded(id, generation, payload, Arc::new(value))?;
        Ok(BroadcastHandle::new(id, generation, self.session).held_by(cache, self.current.clone()))
    }

    async fn map_inner<F: TaskFunction>(
        &mut self,
        function: &F,
        pds: &PartitionedDataset<F::Input>,
        policy: FailurePolicy,
    ) -> BackendResult<PartitionedDataset<F::Output>> {
        self.ensure_live()?;
        self.check_dataset(pds)?;
        policy.validate()?;

        let output = self.next_dataset_id();
        let layout = pds.layout().clone();
        let task = TaskDescriptor::new(function, pds.id(), output, layout.clone(), policy)?;
        info!(
            "Mapping '{}' over {} into {} ({:?})",
            F::NAME,
            pds.id(),
            output,
            policy
        );
        self.issue(Command::Map {
            session: self.session,
            task: task.clone(),
        })
        .await?;

        let own = self.executor.run_task(&task).await;
        let reports: Vec<TaskReport> = self
            .gather(codec::encode(&own)?, self.monitor.task_deadline())
            .await?;
        let outcome = match self.monitor.evaluate(F::NAME, policy, &layout, reports) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.releases.push_dataset(output);
                return Err(e);
            }
        };

        let failures = match (pds.failures(), outcome) {
            (None, MapOutcome::Complete) => None,
            (Some(upstream), MapOutcome::Complete) => Some(upstream.clone()),
            (None, MapOutcome::Tainted(new)) => Some(new),
            (Some(upstream), MapOutcome::Tainted(new)) => {
                let mut merged = upstream.failures.clone();
                merged.extend(new.failures);
                Some(AggregateFailure::new(F::NAME, merged))
            }
        };
        let provenance = Provenance::Mapped {
            parent: pds.id(),
            function: F::NAME.to_string(),
            policy,
        };
        self.datasets.insert(
            output,
            DatasetEntry {
                layout: layout.clone(),
                provenance: provenance.clone(),
            },
        );
        Ok(PartitionedDataset::new(
            output,
            self.session,
            layout,
            provenance,
            failures,
            self.releases.clone(),
        ))
    }

    /// Gather the shards of `pds` and flatten them into `(index, slot)`
    /// pairs in global order.
    async fn gather_records<T>(
        &mut self,
        pds: &PartitionedDataset<T>,
    ) -> BackendResult<Vec<(usize, Option<Vec<u8>>)>> {
        self.issue(Command::Collect {
            session: self.session,
            dataset: pds.id(),
        })
        .await?;

        let local = codec::encode(&self.executor.shard_payload(pds.id()))?;
        let payloads: Vec<ShardPayload> = self.gather(local, self.collective_deadline()).await?;

        let layout = pds.layout();
        let mut records = Vec::with_capacity(layout.total());
        for (rank, payload) in payloads.into_iter().enumerate() {
            if payload.rank != rank {
                return Err(BackendError::protocol_mismatch(
                    rank,
                    format!("shard from rank {}", rank),
                    format!("shard from rank {}", payload.rank),
                ));
            }
            if let Some(error) = payload.error {
                return Err(error);
            }
            if payload.records.len() != layout.len(rank) {
                return Err(BackendError::size_mismatch(
                    format!("shard {} of {}", rank, pds.id()),
                    layout.len(rank),
                    payload.records.len(),
                ));
            }
            if payload.offset != layout.offset(rank) {
                return Err(BackendError::size_mismatch(
                    format!("offset of shard {} of {}", rank, pds.id()),
                    layout.offset(rank),
                    payload.offset,
                ));
            }
            records.extend(
                payload
                    .records
                    .into_iter()
                    .enumerate()
                    .map(|(position, slot)| (payload.offset + position, slot)),
            );
        }
        debug!("Collected {} record(s) of {}", records.len(), pds.id());
        Ok(records)
    }

    async fn barrier_inner(&mut self) -> BackendResult<()> {
        self.ensure_live()?;
        self.issue(Command::Barrier).await?;
        self.comm.barrier(self.collective_deadline()).await
    }

    async fn reset_inner(&mut self) -> BackendResult<()> {
        self.ensure_live()?;
        let session = SessionId::new();
        self.issue(Command::Reset { session }).await?;
        self.executor.reset(session)?;
        self.datasets.clear();
        info!("Backend session {} replaced by {}", self.session, session);
        self.session = session;
        self.current.set(session);
        Ok(())
    }

    /// Broadcast a command to every rank, together with the releases
    /// that piled up since the last one.
    async fn issue(&mut self, command: Command) -> BackendResult<()> {
        let releases = self.releases.take();
        if !releases.is_empty() {
            debug!(
                "Releasing {} dataset(s) and {} broadcast(s)",
                releases.datasets.len(),
                releases.broadcasts.len()
            );
        }
        for dataset in &releases.datasets {
            self.datasets.remove(dataset);
        }
        self.executor.release(&releases)?;

        debug!("Issuing {} (collective #{})", command, self.comm.sequence() + 1);
        let message = codec::encode(&ControlMessage { releases, command })?;
        self.comm.broadcast_all(Some(message), None).await?;
        Ok(())
    }

    async fn gather<R: DeserializeOwned>(
        &mut self,
        local: Vec<u8>,
        deadline: Option<Duration>,
    ) -> BackendResult<Vec<R>> {
        let parts = self.comm.gather(local, deadline).await?.ok_or_else(|| {
            BackendError::Internal("gather on root returned no contributions".to_string())
        })?;
        parts
            .iter()
            .map(|part| codec::decode(part).map_err(BackendError::from))
            .collect()
    }

    fn collective_deadline(&self) -> Option<Duration> {
        self.monitor.collective_deadline()
    }

    fn next_dataset_id(&mut self) -> DatasetId {
        self.next_dataset += 1;
        DatasetId(self.next_dataset)
    }

    fn ensure_live(&self) -> BackendResult<()> {
        match &self.poisoned {
            Some(reason) => Err(BackendError::SessionAborted(reason.clone())),
            None => Ok(()),
        }
    }

    fn check_dataset<T>(&self, pds: &PartitionedDataset<T>) -> BackendResult<()> {
        if pds.session() != self.session {
            return Err(BackendError::StaleHandle(format!(
                "{} belongs to session {}, current session is {}",
                pds.id(),
                pds.session(),
                self.session
            )));
        }
        let entry = self
            .datasets
            .get(&pds.id())
            .ok_or_else(|| BackendError::StaleHandle(format!("{} was released", pds.id())))?;
        if entry.layout != *pds.layout() {
            return Err(BackendError::size_mismatch(
                format!("layout of {}", pds.id()),
                entry.layout.total(),
                pds.len(),
            ));
        }
        Ok(())
    }

    /// Poison the session on fatal errors.
    fn guard<T>(&mut self, result: BackendResult<T>) -> BackendResult<T> {
        if let Err(e) = &result {
            if e.is_fatal() && self.poisoned.is_none() {
                error!("Backend session {} aborted: {}", self.session, e);
                self.poisoned = Some(e.to_string());
            } else if !e.is_fatal() {
                warn!("Backend call failed: {}", e);
            }
        }
        result
    }
}

fn stale_session(id: BroadcastId, handle: SessionId, current: SessionId) -> BackendError {
    BackendError::StaleHandle(format!(
        "{} belongs to session {}, current session is {}",
        id, handle, current
    ))
}

fn missing_record<T>(pds: &PartitionedDataset<T>, index: usize) -> RecordFailure {
    pds.failures()
        .and_then(|failures| failures.get(index))
        .cloned()
        .unwrap_or_else(|| RecordFailure {
            index,
            rank: pds.layout().shard_of(index).unwrap_or(ROOT),
            attempts: 0,
            message: "record is missing from its shard".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launch::local_group;

    async fn group() -> (Backend, crate::launch::WorkerGroup) {
        local_group(BackendConfig::default(), 2, FunctionRegistry::new())
            .await
            .unwrap()
    }

    fn forged(backend: &Backend, id: DatasetId, layout: ShardLayout) -> PartitionedDataset<i64> {
        PartitionedDataset::new(
            id,
            backend.session(),
            layout,
            Provenance::Parallelized { records: 0 },
            None,
            ReleaseQueue::default(),
        )
    }

    #[tokio::test]
    async fn test_layout_disagreement_is_a_size_mismatch() {
        let (mut backend, workers) = group().await;
        let pds = backend.parallelize(vec![1i64, 2, 3, 4]).await.unwrap();
        let other = forged(&backend, pds.id(), ShardLayout::even(6, 2));

        let err = backend.count(&other).unwrap_err();
        assert!(matches!(
            err,
            BackendError::SizeMismatch { expected: 4, found: 6, .. }
        ));
        assert_eq!(backend.count(&pds).unwrap(), 4);

        backend.shutdown().await.unwrap();
        workers.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_dataset_is_stale() {
        let (mut backend, workers) = group().await;
        let other = forged(&backend, DatasetId(99), ShardLayout::even(2, 2));

        assert!(matches!(
            backend.collect(&other).await,
            Err(BackendError::StaleHandle(_))
        ));
        assert!(!backend.is_aborted());

        backend.shutdown().await.unwrap();
        workers.join().await.unwrap();
    }
}
