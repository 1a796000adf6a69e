//! Task descriptors and the function registry.
//!
//! A `map` call travels as a [`TaskDescriptor`]: the registered name of the
//! function, its serialized arguments and the datasets it reads and writes.
//! Each rank resolves the name in its own [`FunctionRegistry`], so no code is
//! ever shipped between processes.

use crate::broadcast::{BroadcastCache, BroadcastHandle};
use crate::error::{BackendError, BackendResult};
use crate::failure::{FailurePolicy, attempt_record};
use crate::partition::ShardLayout;
use crate::traits::{Data, TaskFunction};
use crate::types::{DatasetId, Rank, SessionId, TaskId};
use parallel_common::codec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::warn;

/// Everything a rank needs to run one `map` call on its shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub task_id: TaskId,
    /// Registered name of the function
    pub function: String,
    /// The serialized function struct
    pub args: Vec<u8>,
    pub input: DatasetId,
    pub output: DatasetId,
    /// Layout of the input dataset, which the output shares
    pub layout: ShardLayout,
    pub policy: FailurePolicy,
}

impl TaskDescriptor {
    pub fn new<F: TaskFunction>(
        function: &F,
        input: DatasetId,
        output: DatasetId,
        layout: ShardLayout,
        policy: FailurePolicy,
    ) -> BackendResult<Self> {
        Ok(Self {
            task_id: TaskId::new(),
            function: F::NAME.to_string(),
            args: codec::encode(function)?,
            input,
            output,
            layout,
            policy,
        })
    }
}

/// What a function sees of the rank it runs on.
#[derive(Debug, Clone)]
pub struct TaskContext {
    rank: Rank,
    world_size: usize,
    session: SessionId,
    attempt: u32,
    broadcasts: Arc<BroadcastCache>,
}

impl TaskContext {
    pub(crate) fn new(
        rank: Rank,
        world_size: usize,
        session: SessionId,
        broadcasts: Arc<BroadcastCache>,
    ) -> Self {
        Self {
            rank,
            world_size,
            session,
            attempt: 1,
            broadcasts,
        }
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// 1-based attempt number of the current record.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// This rank's copy of a broadcast value.
    pub fn value<V: Data>(&self, handle: &BroadcastHandle<V>) -> BackendResult<Arc<V>> {
        if handle.session() != self.session {
            return Err(BackendError::StaleHandle(format!(
                "{} belongs to session {}, current session is {}",
                handle.id(),
                handle.session(),
                self.session
            )));
        }
        self.broadcasts.get(handle.id(), handle.generation())
    }

    fn for_attempt(&self, attempt: u32) -> Self {
        Self {
            attempt,
            ..self.clone()
        }
    }
}

/// Result of one record: the encoded output, or the attempts made and the
/// last error message.
pub(crate) type RecordOutcome = Result<Vec<u8>, (u32, String)>;

/// A registered function with its arguments decoded, ready to run records.
pub(crate) trait BoundFunction: Send + Sync {
    /// Run one encoded record. `Err` is fatal to the whole call: the record
    /// or the output could not be (de)serialized.
    fn apply(
        &self,
        index: usize,
        record: &[u8],
        ctx: &TaskContext,
        policy: FailurePolicy,
    ) -> BackendResult<RecordOutcome>;
}

trait ErasedFunction: Send + Sync {
    fn bind(&self, args: &[u8]) -> BackendResult<Arc<dyn BoundFunction>>;
}

struct Registered<F>(PhantomData<fn() -> F>);

impl<F: TaskFunction> ErasedFunction for Registered<F> {
    fn bind(&self, args: &[u8]) -> BackendResult<Arc<dyn BoundFunction>> {
        let function: F = codec::decode(args)?;
        Ok(Arc::new(Bound(function)))
    }
}

struct Bound<F>(F);

impl<F: TaskFunction> BoundFunction for Bound<F> {
    fn apply(
        &self,
        index: usize,
        record: &[u8],
        ctx: &TaskContext,
        policy: FailurePolicy,
    ) -> BackendResult<RecordOutcome> {
        let input: F::Input = codec::decode(record)?;
        let outcome = attempt_record(policy, |attempt| {
            self.0.call(index, input.clone(), &ctx.for_attempt(attempt))
        });
        match outcome {
            Ok(output) => Ok(Ok(codec::encode(&output)?)),
            Err(failure) => Ok(Err(failure)),
        }
    }
}

/// Functions that can be named in a task. Every process must build the same
/// registry; root verifies this when the session starts.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: BTreeMap<&'static str, Arc<dyn ErasedFunction>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `F` under its name.
    pub fn register<F: TaskFunction>(mut self) -> Self {
        self.insert::<F>();
        self
    }

    /// Register `F`; returns false if a function with the same name was
    /// replaced.
    pub fn insert<F: TaskFunction>(&mut self) -> bool {
        let replaced = self
            .functions
            .insert(F::NAME, Arc::new(Registered::<F>(PhantomData)))
            .is_some();
        if replaced {
            warn!("Function '{}' registered twice; keeping the last one", F::NAME);
        }
        !replaced
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.functions.keys().map(|name| name.to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub(crate) fn bind(&self, name: &str, args: &[u8]) -> BackendResult<Arc<dyn BoundFunction>> {
        self.functions
            .get(name)
            .ok_or_else(|| BackendError::UnknownFunction(name.to_string()))?
            .bind(args)
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.names())
            .finish()
    }
}
