//! Identifiers shared by every rank.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// Rank of a process in the group; rank 0 is root.
pub type Rank = usize;

/// Rank of the process that runs the driver code.
pub const ROOT: Rank = 0;

/// Identity of a backend session. A reset starts a new session, which
/// invalidates every handle created before it.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The live session of a rank, shared with the handles it hands out so they
/// notice a reset.
#[derive(Debug, Clone)]
pub(crate) struct SessionCell(Arc<RwLock<SessionId>>);

impl SessionCell {
    pub fn new(session: SessionId) -> Self {
        Self(Arc::new(RwLock::new(session)))
    }

    pub fn get(&self) -> SessionId {
        *self.0.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set(&self, session: SessionId) {
        *self.0.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = session;
    }
}

/// Identifier of a partitioned dataset, unique within a session.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DatasetId(pub u64);

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pds-{}", self.0)
    }
}

/// Identifier of a broadcast value, unique within a session.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BroadcastId(pub u64);

impl fmt::Display for BroadcastId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "broadcast-{}", self.0)
    }
}

/// Identifier of one `map` call.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}
