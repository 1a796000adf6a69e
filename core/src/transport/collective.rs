//! Collective operations over a [`Transport`].
//!
//! All collectives are root-centred. Each rank counts the collectives it has
//! entered, and every message carries the operation and that count; a rank
//! that receives anything else has fallen out of lock-step with root, which
//! is reported as a fatal protocol mismatch.

use super::Transport;
use crate::error::{BackendError, BackendResult};
use crate::types::{ROOT, Rank};
use parallel_common::codec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollectiveOp {
    Broadcast,
    Scatter,
    Gather,
    BarrierEnter,
    BarrierLeave,
}

impl fmt::Display for CollectiveOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Broadcast => "broadcast",
            Self::Scatter => "scatter",
            Self::Gather => "gather",
            Self::BarrierEnter => "barrier-enter",
            Self::BarrierLeave => "barrier-leave",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    op: CollectiveOp,
    seq: u64,
    payload: Vec<u8>,
}

/// Collective communication for one rank of a group.
#[derive(Debug)]
pub struct Communicator {
    transport: Box<dyn Transport>,
    seq: u64,
}

impl Communicator {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self { transport, seq: 0 }
    }

    pub fn rank(&self) -> Rank {
        self.transport.rank()
    }

    pub fn world_size(&self) -> usize {
        self.transport.world_size()
    }

    pub fn is_root(&self) -> bool {
        self.rank() == ROOT
    }

    /// Number of collectives this rank has entered.
    pub fn sequence(&self) -> u64 {
        self.seq
    }

    pub async fn close(&self) -> BackendResult<()> {
        self.transport.close().await
    }

    /// Root sends `payload` to every rank; every rank returns it. Workers
    /// pass `None`.
    pub async fn broadcast_all(
        &mut self,
        payload: Option<Vec<u8>>,
        deadline: Option<Duration>,
    ) -> BackendResult<Vec<u8>> {
        let seq = self.next_seq();
        if self.is_root() {
            let payload = payload.ok_or_else(|| {
                BackendError::Internal("root must supply the broadcast payload".to_string())
            })?;
            for dst in 1..self.world_size() {
                self.send_envelope(dst, CollectiveOp::Broadcast, seq, payload.clone())
                    .await?;
            }
            Ok(payload)
        } else {
            self.recv_envelope(ROOT, CollectiveOp::Broadcast, seq, deadline)
                .await
        }
    }

    /// Root hands part `i` to rank `i`; every rank returns its own part.
    /// Workers pass `None`.
    pub async fn scatter(
        &mut self,
        parts: Option<Vec<Vec<u8>>>,
        deadline: Option<Duration>,
    ) -> BackendResult<Vec<u8>> {
        let seq = self.next_seq();
        if self.is_root() {
            let parts = parts.ok_or_else(|| {
                BackendError::Internal("root must supply the scatter parts".to_string())
            })?;
            if parts.len() != self.world_size() {
                return Err(BackendError::size_mismatch(
                    "scatter parts",
                    self.world_size(),
                    parts.len(),
                ));
            }
            let mut parts = parts.into_iter();
            let own = parts.next().unwrap_or_default();
            for (dst, part) in parts.enumerate() {
                self.send_envelope(dst + 1, CollectiveOp::Scatter, seq, part)
                    .await?;
            }
            Ok(own)
        } else {
            self.recv_envelope(ROOT, CollectiveOp::Scatter, seq, deadline)
                .await
        }
    }

    /// Every rank contributes `local`; root returns all contributions in rank
    /// order, workers return `None`.
    pub async fn gather(
        &mut self,
        local: Vec<u8>,
        deadline: Option<Duration>,
    ) -> BackendResult<Option<Vec<Vec<u8>>>> {
        let seq = self.next_seq();
        if self.is_root() {
            let mut parts = Vec::with_capacity(self.world_size());
            parts.push(local);
            for src in 1..self.world_size() {
                parts.push(
                    self.recv_envelope(src, CollectiveOp::Gather, seq, deadline)
                        .await?,
                );
            }
            Ok(Some(parts))
        } else {
            self.send_envelope(ROOT, CollectiveOp::Gather, seq, local)
                .await?;
            Ok(None)
        }
    }

    /// No rank leaves before every rank has entered.
    pub async fn barrier(&mut self, deadline: Option<Duration>) -> BackendResult<()> {
        let seq = self.next_seq();
        if self.is_root() {
            for src in 1..self.world_size() {
                self.recv_envelope(src, CollectiveOp::BarrierEnter, seq, deadline)
                    .await?;
            }
            for dst in 1..self.world_size() {
                self.send_envelope(dst, CollectiveOp::BarrierLeave, seq, Vec::new())
                    .await?;
            }
        } else {
            self.send_envelope(ROOT, CollectiveOp::BarrierEnter, seq, Vec::new())
                .await?;
            self.recv_envelope(ROOT, CollectiveOp::BarrierLeave, seq, deadline)
                .await?;
        }
        Ok(())
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    async fn send_envelope(
        &self,
        dst: Rank,
        op: CollectiveOp,
        seq: u64,
        payload: Vec<u8>,
    ) -> BackendResult<()> {
        trace!("Rank {} -> {}: {}#{}", self.rank(), dst, op, seq);
        let bytes = codec::encode(&Envelope { op, seq, payload })?;
        self.transport.send(dst, bytes).await
    }

    async fn recv_envelope(
        &self,
        src: Rank,
        op: CollectiveOp,
        seq: u64,
        deadline: Option<Duration>,
    ) -> BackendResult<Vec<u8>> {
        let bytes = match deadline {
            Some(limit) => tokio::time::timeout(limit, self.transport.recv(src))
                .await
                .map_err(|_| BackendError::Timeout {
                    rank: src,
                    operation: op.to_string(),
                    timeout_ms: limit.as_millis() as u64,
                })??,
            None => self.transport.recv(src).await?,
        };

        let envelope: Envelope = codec::decode(&bytes).map_err(|e| {
            BackendError::protocol_mismatch(
                self.rank(),
                format!("{}#{} from rank {}", op, seq, src),
                format!("an undecodable frame ({})", e.message()),
            )
        })?;
        if envelope.op != op || envelope.seq != seq {
            return Err(BackendError::protocol_mismatch(
                self.rank(),
                format!("{}#{} from rank {}", op, seq, src),
                format!("{}#{}", envelope.op, envelope.seq),
            ));
        }
        trace!("Rank {} <- {}: {}#{}", self.rank(), src, op, seq);
        Ok(envelope.payload)
    }
}
