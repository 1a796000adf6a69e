//! Broadcast values.
//!
//! A broadcast value is pushed from root to every rank once and then read
//! locally as often as needed. Each rank keeps the bytes it received and
//! decodes them at most once; readers share the decoded `Arc`, so no rank can
//! mutate what another rank sees.

use crate::error::{BackendError, BackendResult};
use crate::traits::Data;
use crate::types::{BroadcastId, SessionCell, SessionId};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock, RwLock};

/// Handle to a broadcast value.
///
/// The handle is serializable so it can be part of a task's arguments; the
/// value itself never travels with it. On root, [`BroadcastHandle::value`]
/// reads root's copy. Inside a task, resolve the handle with
/// [`TaskContext::value`](crate::task::TaskContext::value).
#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
pub struct BroadcastHandle<V> {
    id: BroadcastId,
    generation: u64,
    session: SessionId,
    #[serde(skip)]
    root: Option<RootCopy>,
    #[serde(skip)]
    _marker: PhantomData<fn() -> V>,
}

/// Where the handle that root created finds root's copy.
#[derive(Debug, Clone)]
struct RootCopy {
    cache: Arc<BroadcastCache>,
    current: SessionCell,
}

impl<V: Data> BroadcastHandle<V> {
    pub(crate) fn new(id: BroadcastId, generation: u64, session: SessionId) -> Self {
        Self {
            id,
            generation,
            session,
            root: None,
            _marker: PhantomData,
        }
    }

    /// Attach root's cache, so the handle can be read without a backend.
    pub(crate) fn held_by(mut self, cache: Arc<BroadcastCache>, current: SessionCell) -> Self {
        self.root = Some(RootCopy { cache, current });
        self
    }

    pub fn id(&self) -> BroadcastId {
        self.id
    }

    /// Position of this broadcast in the monotonically increasing broadcast
    /// counter.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Root's copy of the value.
    ///
    /// Fails with [`BackendError::StaleHandle`] once the session was reset
    /// or the value released, and with [`BackendError::InvalidRole`] on a
    /// handle that was not created on this rank.
    pub fn value(&self) -> BackendResult<Arc<V>> {
        let root = self.root.as_ref().ok_or_else(|| {
            BackendError::InvalidRole(format!(
                "{} has no local copy here; read it with TaskContext::value",
                self.id
            ))
        })?;
        let current = root.current.get();
        if self.session != current {
            return Err(BackendError::StaleHandle(format!(
                "{} belongs to session {}, current session is {}",
                self.id, self.session, current
            )));
        }
        root.cache.get(self.id, self.generation)
    }
}

impl<V> Clone for BroadcastHandle<V> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            generation: self.generation,
            session: self.session,
            root: self.root.clone(),
            _marker: PhantomData,
        }
    }
}

impl<V> fmt::Debug for BroadcastHandle<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastHandle")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("session", &self.session)
            .field("local", &self.root.is_some())
            .finish()
    }
}

struct CachedBroadcast {
    generation: u64,
    data: Vec<u8>,
    decoded: OnceLock<Arc<dyn Any + Send + Sync>>,
}

impl fmt::Debug for CachedBroadcast {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedBroadcast")
            .field("generation", &self.generation)
            .field("bytes", &self.data.len())
            .field("decoded", &self.decoded.get().is_some())
            .finish()
    }
}

/// Per-rank cache of broadcast values
#[derive(Debug, Default)]
pub struct BroadcastCache {
    entries: RwLock<HashMap<BroadcastId, CachedBroadcast>>,
}

impl BroadcastCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache the bytes of a broadcast value received from root.
    pub fn insert(&self, id: BroadcastId, generation: u64, data: Vec<u8>) -> BackendResult<()> {
        self.write()?.insert(
            id,
            CachedBroadcast {
                generation,
                data,
                decoded: OnceLock::new(),
            },
        );
        Ok(())
    }

    /// Cache a value root already holds decoded.
    pub fn insert_decoded<V: Data>(
        &self,
        id: BroadcastId,
        generation: u64,
        data: Vec<u8>,
        value: Arc<V>,
    ) -> BackendResult<()> {
        let decoded = OnceLock::new();
        let _ = decoded.set(value as Arc<dyn Any + Send + Sync>);
        self.write()?.insert(
            id,
            CachedBroadcast {
                generation,
                data,
                decoded,
            },
        );
        Ok(())
    }

    /// Read a cached value, decoding it on first access.
    pub fn get<V: Data>(&self, id: BroadcastId, generation: u64) -> BackendResult<Arc<V>> {
        let entries = self.read()?;
        let entry = entries.get(&id).ok_or_else(|| {
            BackendError::StaleHandle(format!(
                "{} is not cached on this rank; it was released or belongs to an earlier session",
                id
            ))
        })?;
        if entry.generation != generation {
            return Err(BackendError::StaleHandle(format!(
                "{} has generation {}, handle expects {}",
                id, entry.generation, generation
            )));
        }

        let decoded = match entry.decoded.get() {
            Some(decoded) => decoded.clone(),
            None => {
                let value: V = parallel_common::codec::decode(&entry.data)?;
                let _ = entry.decoded.set(Arc::new(value));
                entry
                    .decoded
                    .get()
                    .cloned()
                    .ok_or_else(|| BackendError::Internal(format!("{} lost its value", id)))?
            }
        };
        decoded.downcast::<V>().map_err(|_| {
            BackendError::Serialization(format!(
                "{} does not hold a {}",
                id,
                std::any::type_name::<V>()
            ))
        })
    }

    pub fn remove(&self, id: BroadcastId) -> BackendResult<bool> {
        Ok(self.write()?.remove(&id).is_some())
    }

    pub fn clear(&self) -> BackendResult<()> {
        self.write()?.clear();
        Ok(())
    }

    pub fn stats(&self) -> BroadcastCacheStats {
        self.read()
            .map(|entries| BroadcastCacheStats {
                cached_broadcasts: entries.len(),
                total_size_bytes: entries.values().map(|b| b.data.len()).sum(),
            })
            .unwrap_or_default()
    }

    fn read(
        &self,
    ) -> BackendResult<std::sync::RwLockReadGuard<'_, HashMap<BroadcastId, CachedBroadcast>>> {
        self.entries
            .read()
            .map_err(|_| BackendError::Internal("broadcast cache lock poisoned".to_string()))
    }

    fn write(
        &self,
    ) -> BackendResult<std::sync::RwLockWriteGuard<'_, HashMap<BroadcastId, CachedBroadcast>>> {
        self.entries
            .write()
            .map_err(|_| BackendError::Internal("broadcast cache lock poisoned".to_string()))
    }
}

/// Statistics for broadcast cache
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastCacheStats {
    /// Number of cached broadcast variables
    pub cached_broadcasts: usize,
    /// Total size of cached data in bytes
    pub total_size_bytes: usize,
}
