//! In-process transport: every rank is a task in the same process.

use super::Transport;
use crate::error::{BackendError, BackendResult};
use crate::types::Rank;
use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};

type Outbox = mpsc::UnboundedSender<Vec<u8>>;
type Inbox = Mutex<mpsc::UnboundedReceiver<Vec<u8>>>;

/// One endpoint of an in-process group, connected to every other endpoint by
/// a dedicated channel per direction.
///
/// Dropping an endpoint closes its channels, so peers waiting on it fail
/// instead of hanging.
#[derive(Debug)]
pub struct LocalTransport {
    rank: Rank,
    world_size: usize,
    /// Indexed by destination rank
    outboxes: Vec<Option<Outbox>>,
    /// Indexed by source rank
    inboxes: Vec<Option<Inbox>>,
}

impl LocalTransport {
    /// Create the endpoints of a group of `world_size` ranks, in rank order.
    pub fn group(world_size: usize) -> BackendResult<Vec<LocalTransport>> {
        if world_size == 0 {
            return Err(BackendError::Configuration(
                "a process group needs at least one rank".to_string(),
            ));
        }

        let mut outboxes: Vec<Vec<Option<Outbox>>> = (0..world_size)
            .map(|_| (0..world_size).map(|_| None).collect())
            .collect();
        let mut inboxes: Vec<Vec<Option<Inbox>>> = (0..world_size)
            .map(|_| (0..world_size).map(|_| None).collect())
            .collect();

        for src in 0..world_size {
            for dst in 0..world_size {
                if src == dst {
                    continue;
                }
                let (tx, rx) = mpsc::unbounded_channel();
                outboxes[src][dst] = Some(tx);
                inboxes[dst][src] = Some(Mutex::new(rx));
            }
        }

        Ok(outboxes
            .into_iter()
            .zip(inboxes)
            .enumerate()
            .map(|(rank, (outboxes, inboxes))| LocalTransport {
                rank,
                world_size,
                outboxes,
                inboxes,
            })
            .collect())
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    async fn send(&self, dst: Rank, payload: Vec<u8>) -> BackendResult<()> {
        let outbox = self
            .outboxes
            .get(dst)
            .and_then(Option::as_ref)
            .ok_or_else(|| {
                BackendError::Transport(format!("rank {} has no link to rank {}", self.rank, dst))
            })?;
        outbox
            .send(payload)
            .map_err(|_| BackendError::Transport(format!("rank {} has left the group", dst)))
    }

    async fn recv(&self, src: Rank) -> BackendResult<Vec<u8>> {
        let inbox = self
            .inboxes
            .get(src)
            .and_then(Option::as_ref)
            .ok_or_else(|| {
                BackendError::Transport(format!("rank {} has no link to rank {}", self.rank, src))
            })?;
        inbox
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| BackendError::Transport(format!("rank {} has left the group", src)))
    }
}
