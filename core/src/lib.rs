//! Parallel Core - a root/worker execution backend
//!
//! A fixed group of ranks cooperates on partitioned datasets: root splits a
//! sequence across the group (`parallelize`), replicates shared values
//! (`broadcast`), has every rank apply a registered function to its shard
//! (`map`) and gathers the results back in order (`collect`).

pub mod backend;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod executor;
pub mod failure;
pub mod launch;
pub mod partition;
pub mod pds;
pub mod protocol;
pub mod task;
pub mod traits;
pub mod transport;
pub mod types;
pub mod worker;

pub use backend::Backend;
pub use broadcast::{BroadcastCache, BroadcastHandle};
pub use config::{BackendConfig, ExecutorConfig, ProcessConfig};
pub use error::{BackendError, BackendResult};
pub use failure::{AggregateFailure, FailurePolicy, FailureStats, RecordFailure};
pub use launch::{WorkerGroup, init_tracing, local_group, run_process};
pub use partition::ShardLayout;
pub use pds::{PartitionedDataset, Provenance};
pub use task::{FunctionRegistry, TaskContext};
pub use traits::{Data, TaskFunction};
pub use transport::{LocalTransport, TcpRootListener, TcpTransport, Transport, TransportSpec};
pub use types::{BroadcastId, DatasetId, ROOT, Rank, SessionId};
pub use worker::{Worker, WorkerState};
