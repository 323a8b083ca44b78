use std::collections::BTreeMap;

use crate::error::StoreError;
use crate::events::StoreName;

/// Per-store high-water mark of fully synchronised block height.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointTracker {
    genesis_height: u64,
    heights: BTreeMap<StoreName, u64>,
}

impl CheckpointTracker {
    pub fn new(genesis_height: u64) -> Self {
        Self {
            genesis_height,
            heights: BTreeMap::new(),
        }
    }

    pub fn genesis_height(&self) -> u64 {
        self.genesis_height
    }

    /// Checkpoint of `store`, defaulting to the genesis height.
    pub fn get(&self, store: StoreName) -> u64 {
        self.committed(store).unwrap_or(self.genesis_height)
    }

    /// Checkpoint of `store` if any commit ever advanced it.
    pub fn committed(&self, store: StoreName) -> Option<u64> {
        self.heights.get(&store).copied()
    }

    /// First height a sync pass still has to query.
    ///
    /// An empty store starts at the genesis height itself, so events in the
    /// genesis block are not skipped.
    pub fn next_height(&self, store: StoreName) -> u64 {
        match self.committed(store) {
            Some(height) => height.saturating_add(1),
            None => self.genesis_height,
        }
    }

    pub fn advance(&mut self, store: StoreName, height: u64) -> Result<(), StoreError> {
        let current = self.get(store);
        if height < current {
            return Err(StoreError::CheckpointRegression {
                store,
                current,
                requested: height,
            });
        }
        self.heights.insert(store, height);
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (StoreName, u64)> + '_ {
        self.heights.iter().map(|(store, height)| (*store, *height))
    }
}
