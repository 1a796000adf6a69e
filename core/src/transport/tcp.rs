//! TCP transport for groups that span processes or machines.
//!
//! The group is a star: every worker holds one connection to root and no
//! connection to other workers, which is all the root-centred collectives
//! need. Frames are length-delimited.

use super::Transport;
use crate::config::BackendConfig;
use crate::error::{BackendError, BackendResult};
use crate::types::{ROOT, Rank};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parallel_common::codec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep, timeout, timeout_at};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};

type FramedStream = Framed<TcpStream, LengthDelimitedCodec>;

/// Connection setup messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Handshake {
    Hello { rank: Rank, world_size: usize },
    Welcome,
}

struct Link {
    sink: Mutex<SplitSink<FramedStream, Bytes>>,
    stream: Mutex<SplitStream<FramedStream>>,
}

impl Link {
    fn new(framed: FramedStream) -> Self {
        let (sink, stream) = framed.split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
        }
    }
}

fn frame_stream(stream: TcpStream, max_payload_bytes: usize) -> FramedStream {
    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(max_payload_bytes)
        .new_codec();
    Framed::new(stream, codec)
}

async fn write_frame(framed: &mut FramedStream, message: &Handshake) -> BackendResult<()> {
    framed
        .send(Bytes::from(codec::encode(message)?))
        .await
        .map_err(|e| BackendError::Transport(format!("handshake send failed: {}", e)))
}

async fn read_frame(framed: &mut FramedStream) -> BackendResult<Handshake> {
    match framed.next().await {
        Some(Ok(frame)) => Ok(codec::decode(&frame)?),
        Some(Err(e)) => Err(BackendError::Transport(format!(
            "handshake receive failed: {}",
            e
        ))),
        None => Err(BackendError::Transport(
            "connection closed during handshake".to_string(),
        )),
    }
}

/// Root side of a TCP group, before the workers have connected.
pub struct TcpRootListener {
    listener: TcpListener,
    world_size: usize,
    config: BackendConfig,
}

impl TcpRootListener {
    pub async fn bind(
        addr: SocketAddr,
        world_size: usize,
        config: BackendConfig,
    ) -> BackendResult<Self> {
        if world_size == 0 {
            return Err(BackendError::Configuration(
                "a process group needs at least one rank".to_string(),
            ));
        }
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| BackendError::Transport(format!("cannot bind {}: {}", addr, e)))?;
        info!("Root listening on {} for {} worker(s)", addr, world_size - 1);
        Ok(Self {
            listener,
            world_size,
            config,
        })
    }

    /// Address workers should connect to; useful after binding port 0.
    pub fn local_addr(&self) -> BackendResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Wait for every worker to connect and introduce itself, then welcome
    /// them all.
    pub async fn accept(self) -> BackendResult<TcpTransport> {
        let timeout_ms = self.config.connect_timeout_ms;
        let deadline = Instant::now() + self.config.connect_timeout();
        let mut links: Vec<Option<FramedStream>> = (0..self.world_size).map(|_| None).collect();
        let mut connected = 0;

        while connected < self.world_size - 1 {
            let missing = links
                .iter()
                .enumerate()
                .skip(1)
                .find(|(_, link)| link.is_none())
                .map(|(rank, _)| rank)
                .unwrap_or(1);
            let timed_out = || BackendError::Timeout {
                rank: missing,
                operation: "accept".to_string(),
                timeout_ms,
            };

            let (stream, peer) = timeout_at(deadline, self.listener.accept())
                .await
                .map_err(|_| timed_out())??;
            let mut framed = frame_stream(stream, self.config.max_payload_bytes);
            let hello = timeout_at(deadline, read_frame(&mut framed))
                .await
                .map_err(|_| timed_out())??;

            let rank = match hello {
                Handshake::Hello { rank, world_size } if world_size != self.world_size => {
                    return Err(BackendError::protocol_mismatch(
                        rank,
                        format!("world size {}", self.world_size),
                        format!("world size {}", world_size),
                    ));
                }
                Handshake::Hello { rank, .. } if rank == ROOT || rank >= self.world_size => {
                    return Err(BackendError::protocol_mismatch(
                        ROOT,
                        format!("a worker rank in 1..{}", self.world_size),
                        format!("rank {}", rank),
                    ));
                }
                Handshake::Hello { rank, .. } if links[rank].is_some() => {
                    return Err(BackendError::protocol_mismatch(
                        ROOT,
                        format!("one connection for rank {}", rank),
                        "a duplicate connection",
                    ));
                }
                Handshake::Hello { rank, .. } => rank,
                Handshake::Welcome => {
                    return Err(BackendError::protocol_mismatch(ROOT, "hello", "welcome"));
                }
            };

            debug!("Rank {} connected from {}", rank, peer);
            links[rank] = Some(framed);
            connected += 1;
        }

        for framed in links.iter_mut().flatten() {
            write_frame(framed, &Handshake::Welcome).await?;
        }
        info!("All {} worker(s) connected", self.world_size - 1);

        Ok(TcpTransport {
            rank: ROOT,
            world_size: self.world_size,
            links: links.into_iter().map(|l| l.map(Link::new)).collect(),
        })
    }
}

/// One endpoint of a TCP group.
pub struct TcpTransport {
    rank: Rank,
    world_size: usize,
    /// Indexed by peer rank
    links: Vec<Option<Link>>,
}

impl TcpTransport {
    /// Connect a worker to root, retrying until root accepts or the connect
    /// timeout expires.
    pub async fn connect(
        root_addr: SocketAddr,
        rank: Rank,
        world_size: usize,
        config: &BackendConfig,
    ) -> BackendResult<Self> {
        if rank == ROOT || rank >= world_size {
            return Err(BackendError::InvalidRole(format!(
                "rank {} cannot join a group of {} as a worker",
                rank, world_size
            )));
        }

        let deadline = Instant::now() + config.connect_timeout();
        let mut attempt = 0u32;
        let stream = loop {
            attempt += 1;
            match TcpStream::connect(root_addr).await {
                Ok(stream) => break stream,
                Err(e) if Instant::now() + config.connect_retry_interval() < deadline => {
                    debug!(
                        "Rank {} connection attempt {} to {} failed: {}",
                        rank, attempt, root_addr, e
                    );
                    sleep(config.connect_retry_interval()).await;
                }
                Err(e) => {
                    return Err(BackendError::Transport(format!(
                        "rank {} could not reach root at {} after {} attempt(s): {}",
                        rank, root_addr, attempt, e
                    )));
                }
            }
        };

        let mut framed = frame_stream(stream, config.max_payload_bytes);
        write_frame(&mut framed, &Handshake::Hello { rank, world_size }).await?;
        let welcome = timeout(config.connect_timeout(), read_frame(&mut framed))
            .await
            .map_err(|_| BackendError::Timeout {
                rank: ROOT,
                operation: "welcome".to_string(),
                timeout_ms: config.connect_timeout_ms,
            })??;
        if welcome != Handshake::Welcome {
            return Err(BackendError::protocol_mismatch(rank, "welcome", "hello"));
        }
        info!("Rank {} joined group of {} at {}", rank, world_size, root_addr);

        let mut links: Vec<Option<Link>> = (0..world_size).map(|_| None).collect();
        links[ROOT] = Some(Link::new(framed));
        Ok(Self {
            rank,
            world_size,
            links,
        })
    }

    fn link(&self, peer: Rank) -> BackendResult<&Link> {
        self.links
            .get(peer)
            .and_then(Option::as_ref)
            .ok_or_else(|| {
                BackendError::Transport(format!("rank {} has no link to rank {}", self.rank, peer))
            })
    }
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let peers: Vec<Rank> = self
            .links
            .iter()
            .enumerate()
            .filter(|(_, link)| link.is_some())
            .map(|(rank, _)| rank)
            .collect();
        f.debug_struct("TcpTransport")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .field("peers", &peers)
            .finish()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    async fn send(&self, dst: Rank, payload: Vec<u8>) -> BackendResult<()> {
        self.link(dst)?
            .sink
            .lock()
            .await
            .send(Bytes::from(payload))
            .await
            .map_err(|e| BackendError::Transport(format!("send to rank {} failed: {}", dst, e)))
    }

    async fn recv(&self, src: Rank) -> BackendResult<Vec<u8>> {
        match self.link(src)?.stream.lock().await.next().await {
            Some(Ok(frame)) => Ok(frame.to_vec()),
            Some(Err(e)) => Err(BackendError::Transport(format!(
                "receive from rank {} failed: {}",
                src, e
            ))),
            None => Err(BackendError::Transport(format!(
                "rank {} closed the connection",
                src
            ))),
        }
    }

    async fn close(&self) -> BackendResult<()> {
        for (peer, link) in self.links.iter().enumerate() {
            if let Some(link) = link {
                if let Err(e) = link.sink.lock().await.close().await {
                    debug!("Closing link to rank {} failed: {}", peer, e);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_config() -> BackendConfig {
        BackendConfig {
            connect_timeout_ms: 300,
            connect_retry_interval_ms: 20,
            ..BackendConfig::default()
        }
    }

    #[tokio::test]
    async fn test_star_group_exchanges_frames() {
        let listener = TcpRootListener::bind("127.0.0.1:0".parse().unwrap(), 3, BackendConfig::default())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let workers: Vec<_> = (1..3)
            .map(|rank| {
                tokio::spawn(async move {
                    let transport = TcpTransport::connect(addr, rank, 3, &BackendConfig::default())
                        .await
                        .unwrap();
                    let msg = transport.recv(ROOT).await.unwrap();
                    transport.send(ROOT, [msg, vec![rank as u8]].concat()).await.unwrap();
                    transport
                })
            })
            .collect();

        let root = listener.accept().await.unwrap();
        for rank in 1..3 {
            root.send(rank, vec![42]).await.unwrap();
        }
        for rank in 1..3 {
            assert_eq!(root.recv(rank).await.unwrap(), vec![42, rank as u8]);
        }
        for worker in workers {
            let transport = worker.await.unwrap();
            let other = if transport.rank() == 1 { 2 } else { 1 };
            assert!(transport.send(other, vec![]).await.is_err());
        }
    }

    #[tokio::test]
    async fn test_root_times_out_waiting_for_workers() {
        let listener = TcpRootListener::bind("127.0.0.1:0".parse().unwrap(), 2, quick_config())
            .await
            .unwrap();
        let err = listener.accept().await.unwrap_err();
        assert!(matches!(err, BackendError::Timeout { rank: 1, .. }));
    }

    #[tokio::test]
    async fn test_worker_gives_up_without_root() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = TcpTransport::connect(addr, 1, 2, &quick_config())
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Transport(_)));
    }

    #[tokio::test]
    async fn test_world_size_disagreement_rejected() {
        let listener = TcpRootListener::bind("127.0.0.1:0".parse().unwrap(), 2, quick_config())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let worker = tokio::spawn(async move { TcpTransport::connect(addr, 1, 3, &quick_config()).await });

        let err = listener.accept().await.unwrap_err();
        assert!(matches!(err, BackendError::ProtocolMismatch { .. }));
        assert!(worker.await.unwrap().is_err());
    }

    #[test]
    fn test_worker_rank_validation() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let addr = "127.0.0.1:1".parse().unwrap();
        let err = rt
            .block_on(TcpTransport::connect(addr, 0, 2, &quick_config()))
            .unwrap_err();
        assert!(matches!(err, BackendError::InvalidRole(_)));
    }
}
