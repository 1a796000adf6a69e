//! Contiguous partitioning of a sequence into one shard per rank.

use serde::{Deserialize, Serialize};

/// Sizes of the shards of a dataset; shard `i` lives on rank `i`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardLayout {
    sizes: Vec<usize>,
}

impl ShardLayout {
    /// Split `len` records into `shards` contiguous shards whose sizes differ
    /// by at most one. The first `len % shards` shards take the extra record.
    pub fn even(len: usize, shards: usize) -> Self {
        assert!(shards > 0, "Number of shards must be positive.");
        let base = len / shards;
        let extra = len % shards;
        Self {
            sizes: (0..shards)
                .map(|i| if i < extra { base + 1 } else { base })
                .collect(),
        }
    }

    pub fn num_shards(&self) -> usize {
        self.sizes.len()
    }

    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    /// Number of records in shard `shard`; zero for shards that do not exist.
    pub fn len(&self, shard: usize) -> usize {
        self.sizes.get(shard).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.sizes.iter().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Global index of the first record of `shard`.
    pub fn offset(&self, shard: usize) -> usize {
        self.sizes.iter().take(shard).sum()
    }

    /// Shard holding the record with global index `index`.
    pub fn shard_of(&self, index: usize) -> Option<usize> {
        let mut end = 0;
        for (shard, size) in self.sizes.iter().enumerate() {
            end += size;
            if index < end {
                return Some(shard);
            }
        }
        None
    }

    /// Split `data` along this layout, preserving order.
    pub fn split<T>(&self, data: Vec<T>) -> Vec<Vec<T>> {
        let mut iter = data.into_iter();
        self.sizes
            .iter()
            .map(|&size| iter.by_ref().take(size).collect())
            .collect()
    }
}
