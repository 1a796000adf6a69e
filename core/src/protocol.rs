//! Control messages exchanged between root and workers.
//!
//! Every backend call starts with root broadcasting a [`ControlMessage`]; the
//! command inside it tells each worker which collective comes next.

use crate::error::BackendError;
use crate::failure::RecordFailure;
use crate::partition::ShardLayout;
use crate::task::TaskDescriptor;
use crate::types::{BroadcastId, DatasetId, Rank, SessionId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Handles whose last reference on root is gone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseSet {
    pub datasets: Vec<DatasetId>,
    pub broadcasts: Vec<BroadcastId>,
}

impl ReleaseSet {
    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty() && self.broadcasts.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// Check that every rank registered the same functions. Followed by a
    /// gather of [`HandshakeAck`].
    Handshake {
        session: SessionId,
        functions: Vec<String>,
    },
    /// Followed by a scatter of each rank's encoded records, then a gather
    /// of [`StoreAck`].
    Parallelize {
        session: SessionId,
        dataset: DatasetId,
        layout: ShardLayout,
    },
    /// The value travels inside the command.
    Broadcast {
        session: SessionId,
        id: BroadcastId,
        generation: u64,
        payload: Vec<u8>,
    },
    /// Followed by a gather of [`TaskReport`].
    Map {
        session: SessionId,
        task: TaskDescriptor,
    },
    /// Followed by a gather of [`ShardPayload`].
    Collect {
        session: SessionId,
        dataset: DatasetId,
    },
    /// Followed by a barrier.
    Barrier,
    /// Drop all state and adopt a new session.
    Reset { session: SessionId },
    /// Leave the worker loop.
    Shutdown,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Handshake { .. } => "handshake",
            Self::Parallelize { .. } => "parallelize",
            Self::Broadcast { .. } => "broadcast",
            Self::Map { .. } => "map",
            Self::Collect { .. } => "collect",
            Self::Barrier => "barrier",
            Self::Reset { .. } => "reset",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A command plus the releases that accumulated since the previous one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub releases: ReleaseSet,
    pub command: Command,
}

/// A worker's answer to [`Command::Handshake`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeAck {
    pub rank: Rank,
    pub functions: Vec<String>,
}

/// A rank's answer to [`Command::Parallelize`] once its shard is stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreAck {
    pub rank: Rank,
    pub error: Option<BackendError>,
}

/// Task execution metrics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMetrics {
    /// Time spent resolving the function and decoding its arguments
    pub deserialize_time_ms: u64,
    pub run_time_ms: u64,
    pub result_size_bytes: u64,
}

/// A rank's answer to [`Command::Map`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    pub rank: Rank,
    /// Number of records in the rank's result shard
    pub records: usize,
    pub failures: Vec<RecordFailure>,
    /// Set when the rank could not run the task at all
    pub error: Option<BackendError>,
    pub metrics: TaskMetrics,
}

impl TaskReport {
    pub fn failed(rank: Rank, error: BackendError) -> Self {
        Self {
            rank,
            records: 0,
            failures: Vec::new(),
            error: Some(error),
            metrics: TaskMetrics::default(),
        }
    }
}

/// A rank's answer to [`Command::Collect`]: its shard, one encoded record per
/// slot, `None` where the record failed upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardPayload {
    pub rank: Rank,
    pub offset: usize,
    pub records: Vec<Option<Vec<u8>>>,
    pub error: Option<BackendError>,
}
