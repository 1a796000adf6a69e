//! Message passing between the ranks of a process group.
//!
//! A [`Transport`] only moves opaque byte payloads between two ranks. The
//! collectives the backend relies on are built on top of it by
//! [`Communicator`].

pub mod collective;
pub mod local;
pub mod tcp;

pub use collective::{CollectiveOp, Communicator};
pub use local::LocalTransport;
pub use tcp::{TcpRootListener, TcpTransport};

use crate::config::{BackendConfig, ProcessConfig};
use crate::error::BackendResult;
use crate::types::{ROOT, Rank};
use async_trait::async_trait;
use std::fmt::Debug;

/// Point-to-point message exchange within a fixed process group.
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Rank of this endpoint
    fn rank(&self) -> Rank;

    /// Number of ranks in the group, root included
    fn world_size(&self) -> usize;

    /// Send a payload to `dst`. Messages between two ranks arrive in order.
    async fn send(&self, dst: Rank, payload: Vec<u8>) -> BackendResult<()>;

    /// Receive the next payload sent by `src`.
    async fn recv(&self, src: Rank) -> BackendResult<Vec<u8>>;

    /// Release the endpoint's connections.
    async fn close(&self) -> BackendResult<()> {
        Ok(())
    }
}

/// Which transport to build.
#[derive(Debug, Clone)]
pub enum TransportSpec {
    /// Every rank in this process, connected by channels.
    Local { world_size: usize },
    /// This process's endpoint of a TCP group.
    Tcp {
        process: ProcessConfig,
        config: BackendConfig,
    },
}

/// Build transport endpoints.
///
/// `Local` yields one endpoint per rank, in rank order. `Tcp` yields the
/// single endpoint of this process; on root this waits until every worker
/// has connected.
pub async fn build(spec: TransportSpec) -> BackendResult<Vec<Box<dyn Transport>>> {
    match spec {
        TransportSpec::Local { world_size } => Ok(LocalTransport::group(world_size)?
            .into_iter()
            .map(|t| Box::new(t) as Box<dyn Transport>)
            .collect()),
        TransportSpec::Tcp { process, config } => {
            let transport = if process.rank == ROOT {
                TcpRootListener::bind(process.root_addr, process.world_size, config)
                    .await?
                    .accept()
                    .await?
            } else {
                TcpTransport::connect(process.root_addr, process.rank, process.world_size, &config)
                    .await?
            };
            Ok(vec![Box::new(transport) as Box<dyn Transport>])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_build_local_group() {
        let endpoints = build(TransportSpec::Local { world_size: 3 }).await.unwrap();
        assert_eq!(endpoints.len(), 3);
        for (rank, endpoint) in endpoints.iter().enumerate() {
            assert_eq!(endpoint.rank(), rank);
            assert_eq!(endpoint.world_size(), 3);
        }

        endpoints[2].send(0, vec![9]).await.unwrap();
        assert_eq!(endpoints[0].recv(2).await.unwrap(), vec![9]);
    }
}
