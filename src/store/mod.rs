//! Indexed local store: one event table per store, derived entities and the
//! checkpoint tracker, all mutated through [`WriteTxn`] only.

pub mod checkpoint;
pub mod derived;
pub mod table;
pub mod txn;


use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::events::{EventRecord, StoreName};
use crate::persistence::Journal;

pub use checkpoint::CheckpointTracker;
pub use derived::{
    AccountPersona, AuxData, DerivedTables, DerivedUpsert, ListingState, Persona, TokenOwner,
    TokenState,
};
pub use table::{Direction, EventTable, KeyRange};
pub use txn::{CommitSummary, WriteTxn};

/// One commit as written to the journal: inserts, entity writes and
/// checkpoint advances, applied in that order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub seq: u64,
    pub inserts: Vec<EventRecord>,
    pub derived: Vec<DerivedUpsert>,
    pub checkpoints: Vec<(StoreName, u64)>,
}

/// The single-writer database shared by sync sessions and readers.
pub type SharedDatabase = Arc<RwLock<Database>>;

#[derive(Debug)]
pub struct Database {
    tables: BTreeMap<StoreName, EventTable>,
    derived: DerivedTables,
    checkpoints: CheckpointTracker,
    journal: Option<Journal>,
    commit_seq: u64,
}

impl Database {
    /// A database without a journal. Nothing survives the process.
    pub fn in_memory(genesis_height: u64) -> Self {
        let tables = StoreName::ALL
            .into_iter()
            .map(|store| (store, EventTable::new(store)))
            .collect();

        Self {
            tables,
            derived: DerivedTables::default(),
            checkpoints: CheckpointTracker::new(genesis_height),
            journal: None,
            commit_seq: 0,
        }
    }

    /// Opens a journal-backed database, rebuilding every table and index by
    /// replaying the journal.
    pub fn open(path: impl AsRef<Path>, genesis_height: u64) -> Result<Self, StoreError> {
        let (journal, recovered) = Journal::open(path)?;

        let mut db = Self::in_memory(genesis_height);
        let count = recovered.changesets.len();
        for changeset in recovered.changesets {
            db.replay(changeset)?;
        }

        info!(
            "[STORE] Replayed {} commits from {} (seq={}, schema v{})",
            count,
            journal.path().display(),
            db.commit_seq,
            recovered.found_schema
        );
        db.journal = Some(journal);
        Ok(db)
    }

    pub fn into_shared(self) -> SharedDatabase {
        Arc::new(RwLock::new(self))
    }

    pub fn is_persistent(&self) -> bool {
        self.journal.is_some()
    }

    pub fn begin(&mut self) -> WriteTxn<'_> {
        WriteTxn::new(self)
    }

    pub fn table(&self, store: StoreName) -> &EventTable {
        // Every store gets a table in `in_memory`, and tables are never removed.
        &self.tables[&store]
    }

    pub fn derived(&self) -> &DerivedTables {
        &self.derived
    }

    pub fn checkpoints(&self) -> &CheckpointTracker {
        &self.checkpoints
    }

    /// Incremented by every commit. Readers use it to invalidate caches.
    pub fn commit_seq(&self) -> u64 {
        self.commit_seq
    }

    fn replay(&mut self, changeset: ChangeSet) -> Result<(), StoreError> {
        let checkpoints = self.check_changeset(&changeset).map_err(|e| match e {
            StoreError::DuplicateKey { .. }
            | StoreError::CheckpointRegression { .. }
            | StoreError::WrongStore { .. } => {
                warn!("[STORE] Journal replay violates an invariant: {}", e);
                StoreError::Corrupted(e.to_string())
            }
            other => other,
        })?;
        self.apply_checked(changeset, checkpoints);
        Ok(())
    }

    /// Validates, journals and applies one changeset.
    ///
    /// Every check runs before the journal append, so a changeset that
    /// reaches the journal always applies.
    pub(crate) fn commit_changeset(&mut self, changeset: ChangeSet) -> Result<(), StoreError> {
        let checkpoints = self.check_changeset(&changeset)?;
        if let Some(journal) = self.journal.as_mut() {
            journal.append(&changeset)?;
        }
        self.apply_checked(changeset, checkpoints);
        Ok(())
    }

    /// Returns the checkpoint tracker as it will be after `changeset`.
    fn check_changeset(&self, changeset: &ChangeSet) -> Result<CheckpointTracker, StoreError> {
        if changeset.seq <= self.commit_seq {
            return Err(StoreError::Corrupted(format!(
                "changeset #{} follows #{}",
                changeset.seq, self.commit_seq
            )));
        }

        let mut seen = BTreeSet::new();
        for record in &changeset.inserts {
            let store = record.store();
            self.tables
                .get(&store)
                .ok_or_else(|| StoreError::Corrupted(format!("no table for {store}")))?
                .check_insert(record)?;
            if !seen.insert((store, record.key)) {
                return Err(StoreError::DuplicateKey {
                    store,
                    key: record.key,
                });
            }
        }

        let mut checkpoints = self.checkpoints.clone();
        for (store, height) in &changeset.checkpoints {
            checkpoints.advance(*store, *height)?;
        }
        Ok(checkpoints)
    }

    fn apply_checked(&mut self, changeset: ChangeSet, checkpoints: CheckpointTracker) {
        let ChangeSet {
            seq,
            inserts,
            derived,
            ..
        } = changeset;

        for record in inserts {
            if let Some(table) = self.tables.get_mut(&record.store()) {
                table.push(record);
            }
        }
        for upsert in derived {
            self.derived.apply(upsert);
        }
        self.checkpoints = checkpoints;
        self.commit_seq = seq;
    }
}

/// Read access with poisoning mapped to a store error.
pub fn read(db: &SharedDatabase) -> Result<RwLockReadGuard<'_, Database>, StoreError> {
    db.read().map_err(|_| StoreError::Poisoned)
}

pub fn write(db: &SharedDatabase) -> Result<RwLockWriteGuard<'_, Database>, StoreError> {
    db.write().map_err(|_| StoreError::Poisoned)
}
