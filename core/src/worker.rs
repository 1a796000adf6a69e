//! The control loop of a non-root rank.

use crate::config::BackendConfig;
use crate::error::{BackendError, BackendResult};
use crate::executor::RankExecutor;
use crate::protocol::{Command, ControlMessage, ShardPayload, StoreAck, TaskReport};
use crate::task::FunctionRegistry;
use crate::transport::{Communicator, Transport};
use crate::types::{ROOT, Rank, SessionId};
use parallel_common::codec;
use std::fmt;
use std::time::Duration;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Waiting for the next command from root
    Idle,
    /// Handling a command, including the collectives that follow it
    Executing,
    /// Left the loop after the shutdown sentinel
    Terminated,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Executing => write!(f, "EXECUTING"),
            Self::Terminated => write!(f, "TERMINATED"),
        }
    }
}

/// A worker rank. It never runs driver code and never talks first: it only
/// answers root's commands and joins the collectives they announce.
#[derive(Debug)]
pub struct Worker {
    comm: Communicator,
    executor: RankExecutor,
    deadline: Option<Duration>,
    state: WorkerState,
}

impl Worker {
    pub fn new(
        transport: Box<dyn Transport>,
        registry: FunctionRegistry,
        config: &BackendConfig,
    ) -> BackendResult<Self> {
        config.validate()?;
        let rank = transport.rank();
        if rank == ROOT {
            return Err(BackendError::InvalidRole(
                "rank 0 is root and cannot run the worker loop".to_string(),
            ));
        }
        let world_size = transport.world_size();
        // The real session arrives with root's handshake.
        let executor =
            RankExecutor::new(rank, world_size, SessionId::new(), registry, &config.executor)?;
        Ok(Self {
            comm: Communicator::new(transport),
            executor,
            deadline: Some(Duration::from_millis(config.collective_timeout_ms)),
            state: WorkerState::Idle,
        })
    }

    pub fn rank(&self) -> Rank {
        self.comm.rank()
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Serve root until it sends the shutdown sentinel.
    ///
    /// Returns an error if the group falls apart: root vanished, a collective
    /// timed out, or root and this rank disagree on the protocol.
    pub async fn run(mut self) -> BackendResult<()> {
        info!(
            "Worker {} of {} entering {} state",
            self.rank(),
            self.comm.world_size(),
            self.state
        );
        let result = self.serve().await;
        if let Err(e) = &result {
            error!("Worker {} leaving after fatal error: {}", self.rank(), e);
        }
        self.comm.close().await?;
        result
    }

    async fn serve(&mut self) -> BackendResult<()> {
        loop {
            // Idle: no deadline, root may take as long as it likes.
            let bytes = self.comm.broadcast_all(None, None).await?;
            let message: ControlMessage = codec::decode(&bytes)?;
            self.executor.release(&message.releases)?;

            if message.command == Command::Shutdown {
                self.transition(WorkerState::Terminated);
                return Ok(());
            }

            self.transition(WorkerState::Executing);
            self.handle(message.command).await?;
            self.transition(WorkerState::Idle);
        }
    }

    async fn handle(&mut self, command: Command) -> BackendResult<()> {
        debug!("Worker {} handling {}", self.rank(), command);
        match command {
            Command::Handshake { session, .. } => {
                self.executor.reset(session)?;
                let ack = codec::encode(&self.executor.handshake())?;
                self.comm.gather(ack, self.deadline).await?;
            }
            Command::Parallelize {
                session,
                dataset,
                layout,
            } => {
                let part = self.comm.scatter(None, self.deadline).await?;
                let stored = self
                    .executor
                    .check_session(session)
                    .and_then(|_| self.executor.store_part(dataset, &layout, &part));
                let ack = StoreAck {
                    rank: self.rank(),
                    error: stored.err(),
                };
                self.comm.gather(codec::encode(&ack)?, self.deadline).await?;
            }
            Command::Broadcast {
                session,
                id,
                generation,
                payload,
            } => {
                // No reply follows a broadcast, so a failure here ends the
                // loop and root loses this rank at its next collective.
                self.executor.check_session(session)?;
                let cache = self.executor.broadcasts();
                cache.insert(id, generation, payload)?;
                let stats = cache.stats();
                debug!(
                    "Worker {} cached {}; {} value(s), {} bytes held",
                    self.rank(),
                    id,
                    stats.cached_broadcasts,
                    stats.total_size_bytes
                );
            }
            Command::Map { session, task } => {
                let report = match self.executor.check_session(session) {
                    Ok(()) => self.executor.run_task(&task).await,
                    Err(e) => TaskReport::failed(self.rank(), e),
                };
                self.comm.gather(codec::encode(&report)?, None).await?;
            }
            Command::Collect { session, dataset } => {
                let payload = match self.executor.check_session(session) {
                    Ok(()) => self.executor.shard_payload(dataset),
                    Err(e) => ShardPayload {
                        rank: self.rank(),
                        offset: 0,
                        records: Vec::new(),
                        error: Some(e),
                    },
                };
                self.comm.gather(codec::encode(&payload)?, self.deadline).await?;
            }
            Command::Barrier => self.comm.barrier(self.deadline).await?,
            Command::Reset { session } => {
                let old = self.executor.session();
                self.executor.reset(session)?;
                info!("Worker {} replaced session {} by {}", self.rank(), old, session);
            }
            Command::Shutdown => {}
        }
        Ok(())
    }

    fn transition(&mut self, next: WorkerState) {
        debug!("Worker {}: {} -> {}", self.rank(), self.state, next);
        if next == WorkerState::Terminated {
            info!("Worker {} received shutdown", self.rank());
        }
        self.state = next;
    }
}
