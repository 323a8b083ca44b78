use std::collections::{BTreeMap, BTreeSet};

use log::{debug, trace};

use super::derived::{
    self, AccountPersona, AuxData, DerivedTables, DerivedUpsert, DerivedView, ListingState,
    TokenOwner, TokenState,
};
use super::{ChangeSet, Database};
use crate::error::StoreError;
use crate::events::{Address, EventRecord, ListingId, PrimaryKey, StoreName, TokenId};

/// What a successful commit wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitSummary {
    pub seq: u64,
    pub inserted: usize,
    pub derived_mutations: usize,
    pub checkpoints: Vec<(StoreName, u64)>,
}

/// A single atomic write spanning event tables, derived entities and
/// checkpoints.
///
/// Nothing touches the database until [`WriteTxn::commit`]. Dropping the
/// transaction discards everything staged so far.
pub struct WriteTxn<'db> {
    db: &'db mut Database,
    inserts: Vec<EventRecord>,
    staged_keys: BTreeSet<(StoreName, PrimaryKey)>,
    overlay: DerivedTables,
    upserts: Vec<DerivedUpsert>,
    checkpoints: BTreeMap<StoreName, u64>,
}

impl<'db> WriteTxn<'db> {
    pub(super) fn new(db: &'db mut Database) -> Self {
        Self {
            db,
            inserts: Vec::new(),
            staged_keys: BTreeSet::new(),
            overlay: DerivedTables::default(),
            upserts: Vec::new(),
            checkpoints: BTreeMap::new(),
        }
    }

    /// Checkpoint of `store` including anything staged in this transaction.
    pub fn checkpoint(&self, store: StoreName) -> Option<u64> {
        self.checkpoints
            .get(&store)
            .copied()
            .or_else(|| self.db.checkpoints().committed(store))
    }

    /// Stages a record. Fails with `DuplicateKey` if it is already committed
    /// or staged earlier in this transaction.
    pub fn insert(&mut self, record: EventRecord) -> Result<(), StoreError> {
        let store = record.store();
        if self.db.table(store).contains(&record.key)
            || self.staged_keys.contains(&(store, record.key))
        {
            return Err(StoreError::DuplicateKey {
                store,
                key: record.key,
            });
        }

        trace!("[TXN] stage {} {}", store, record.key);
        self.staged_keys.insert((store, record.key));
        self.inserts.push(record);
        Ok(())
    }

    /// Folds a staged record into the derived entities. Returns the number of
    /// entity writes it caused.
    pub fn fold(&mut self, record: &EventRecord, aux: Option<&AuxData>) -> Result<usize, StoreError> {
        let view = OverlayView {
            base: self.db.derived(),
            overlay: &self.overlay,
        };
        let upserts = derived::fold(&view, record, aux)?;
        let count = upserts.len();

        for upsert in upserts {
            self.overlay.apply(upsert.clone());
            self.upserts.push(upsert);
        }
        Ok(count)
    }

    pub fn advance_checkpoint(&mut self, store: StoreName, height: u64) -> Result<(), StoreError> {
        let current = self
            .checkpoint(store)
            .unwrap_or_else(|| self.db.checkpoints().genesis_height());
        if height < current {
            return Err(StoreError::CheckpointRegression {
                store,
                current,
                requested: height,
            });
        }
        self.checkpoints.insert(store, height);
        Ok(())
    }

    /// Validates the changeset, writes it to the journal, then applies it in memory.
    pub fn commit(self) -> Result<CommitSummary, StoreError> {
        let WriteTxn {
            db,
            inserts,
            upserts,
            checkpoints,
            ..
        } = self;

        let changeset = ChangeSet {
            seq: db.commit_seq() + 1,
            inserts,
            derived: upserts,
            checkpoints: checkpoints.into_iter().collect(),
        };

        let summary = CommitSummary {
            seq: changeset.seq,
            inserted: changeset.inserts.len(),
            derived_mutations: changeset.derived.len(),
            checkpoints: changeset.checkpoints.clone(),
        };

        db.commit_changeset(changeset)?;

        debug!(
            "[TXN] commit #{} inserted={} derived={} checkpoints={:?}",
            summary.seq, summary.inserted, summary.derived_mutations, summary.checkpoints
        );
        Ok(summary)
    }
}

struct OverlayView<'a> {
    base: &'a DerivedTables,
    overlay: &'a DerivedTables,
}

impl DerivedView for OverlayView<'_> {
    fn owner(&self, contract: &Address, id: &TokenId) -> Option<TokenOwner> {
        self.overlay
            .owner(contract, id)
            .or_else(|| self.base.owner(contract, id))
            .cloned()
    }

    fn balance(&self, contract: &Address, id: &TokenId, holder: &Address) -> u128 {
        self.overlay
            .balance_entry(contract, id, holder)
            .unwrap_or_else(|| self.base.balance(contract, id, holder))
    }

    fn token(&self, id: &TokenId) -> Option<TokenState> {
        self.overlay.token(id).or_else(|| self.base.token(id)).cloned()
    }

    fn listing(&self, id: &ListingId) -> Option<ListingState> {
        self.overlay
            .listing(id)
            .or_else(|| self.base.listing(id))
            .cloned()
    }

    fn persona(&self, account: &Address) -> Option<AccountPersona> {
        self.overlay
            .persona(account)
            .or_else(|| self.base.persona(account))
            .cloned()
    }
}
