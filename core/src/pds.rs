//! Partitioned datasets.
//!
//! A [`PartitionedDataset`] is root's typed handle to a collection whose
//! shards live on the ranks of the group. The handle is cheap to clone; when
//! the last clone is dropped the dataset is queued for release and every rank
//! frees its shard with the next command root issues.

use crate::failure::{AggregateFailure, FailurePolicy};
use crate::partition::ShardLayout;
use crate::protocol::ReleaseSet;
use crate::types::{BroadcastId, DatasetId, SessionId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::sync::{Arc, Mutex};

/// How a dataset came to be.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Provenance {
    /// Split from a sequence held by root.
    Parallelized { records: usize },
    /// Produced by mapping a registered function over `parent`.
    Mapped {
        parent: DatasetId,
        function: String,
        policy: FailurePolicy,
    },
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parallelized { records } => write!(f, "parallelize({} records)", records),
            Self::Mapped {
                parent, function, ..
            } => write!(f, "map('{}', {})", function, parent),
        }
    }
}

/// Releases waiting for the next control message.
#[derive(Debug, Clone, Default)]
pub(crate) struct ReleaseQueue {
    pending: Arc<Mutex<ReleaseSet>>,
}

impl ReleaseQueue {
    pub fn push_dataset(&self, id: DatasetId) {
        self.lock().datasets.push(id);
    }

    pub fn push_broadcast(&self, id: BroadcastId) {
        self.lock().broadcasts.push(id);
    }

    pub fn take(&self) -> ReleaseSet {
        mem::take(&mut *self.lock())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ReleaseSet> {
        // A panic while holding the lock cannot leave a half-written id list.
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug)]
struct DatasetInner {
    id: DatasetId,
    session: SessionId,
    layout: ShardLayout,
    provenance: Provenance,
    failures: Option<AggregateFailure>,
    releases: ReleaseQueue,
}

impl Drop for DatasetInner {
    fn drop(&mut self) {
        self.releases.push_dataset(self.id);
    }
}

/// Handle to an immutable dataset of `T` records spread over the group.
pub struct PartitionedDataset<T> {
    inner: Arc<DatasetInner>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> PartitionedDataset<T> {
    pub(crate) fn new(
        id: DatasetId,
        session: SessionId,
        layout: ShardLayout,
        provenance: Provenance,
        failures: Option<AggregateFailure>,
        releases: ReleaseQueue,
    ) -> Self {
        Self {
            inner: Arc::new(DatasetInner {
                id,
                session,
                layout,
                provenance,
                failures,
                releases,
            }),
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> DatasetId {
        self.inner.id
    }

    pub fn session(&self) -> SessionId {
        self.inner.session
    }

    pub fn layout(&self) -> &ShardLayout {
        &self.inner.layout
    }

    pub fn provenance(&self) -> &Provenance {
        &self.inner.provenance
    }

    /// Total number of records, failed ones included.
    pub fn len(&self) -> usize {
        self.inner.layout.total()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.layout.is_empty()
    }

    /// Records whose function call failed under
    /// [`FailurePolicy::SkipAndContinue`], in this dataset or upstream.
    pub fn failures(&self) -> Option<&AggregateFailure> {
        self.inner.failures.as_ref()
    }

    pub fn is_tainted(&self) -> bool {
        self.inner.failures.is_some()
    }
}

impl<T> Clone for PartitionedDataset<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for PartitionedDataset<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionedDataset")
            .field("id", &self.inner.id)
            .field("session", &self.inner.session)
            .field("shard_sizes", &self.inner.layout.sizes())
            .field("provenance", &self.inner.provenance)
            .field("tainted", &self.is_tainted())
            .finish()
    }
}
