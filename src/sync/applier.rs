//! Transactional applier: the only writer of event tables, derived entities
//! and checkpoints.
//!
//! One call is one transaction. The checkpoint is re-read inside it, so a
//! batch that lost a race against another batch for the same store commits
//! nothing.

use log::{debug, info};

use crate::error::StoreError;
use crate::events::{EventRecord, StoreName};
use crate::store::{self, AuxData, SharedDatabase};

/// A mapped record with whatever its resolver attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEvent {
    pub record: EventRecord,
    pub aux: Option<AuxData>,
}

impl ResolvedEvent {
    pub fn new(record: EventRecord, aux: Option<AuxData>) -> Self {
        Self { record, aux }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplySummary {
    pub seq: u64,
    pub inserted: usize,
    pub duplicates: usize,
    pub derived_mutations: usize,
    pub checkpoint: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Committed(ApplySummary),
    /// The store was already at or past the target; nothing was written.
    Stale { checkpoint: u64 },
}

impl ApplyOutcome {
    /// Checkpoint of the store after this call.
    pub fn checkpoint(&self) -> u64 {
        match self {
            ApplyOutcome::Committed(summary) => summary.checkpoint,
            ApplyOutcome::Stale { checkpoint } => *checkpoint,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransactionalApplier {
    db: SharedDatabase,
}

impl TransactionalApplier {
    pub fn new(db: SharedDatabase) -> Self {
        Self { db }
    }

    /// Applies `events` for `store` and advances its checkpoint to `target`.
    ///
    /// The write lock is taken on the blocking pool, since a commit may fsync
    /// the journal.
    pub async fn apply(
        &self,
        store: StoreName,
        events: Vec<ResolvedEvent>,
        target: u64,
    ) -> Result<ApplyOutcome, StoreError> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || apply_blocking(&db, store, events, target))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

fn apply_blocking(
    db: &SharedDatabase,
    store: StoreName,
    events: Vec<ResolvedEvent>,
    target: u64,
) -> Result<ApplyOutcome, StoreError> {
    let mut guard = store::write(db)?;
    let mut txn = guard.begin();

    if let Some(checkpoint) = txn.checkpoint(store) {
        if checkpoint >= target {
            debug!(
                "[APPLIER] {} already at {} (target {}), skipping {} events",
                store,
                checkpoint,
                target,
                events.len()
            );
            return Ok(ApplyOutcome::Stale { checkpoint });
        }
    }

    let mut duplicates = 0;
    let mut derived_mutations = 0;

    for ResolvedEvent { record, aux } in events {
        if record.store() != store {
            return Err(StoreError::WrongStore {
                expected: store,
                found: record.store(),
            });
        }

        match txn.insert(record.clone()) {
            Ok(()) => {
                derived_mutations += txn.fold(&record, aux.as_ref())?;
            }
            Err(StoreError::DuplicateKey { store, key }) => {
                debug!("[APPLIER] {} {} already stored, skipping", store, key);
                duplicates += 1;
            }
            Err(e) => return Err(e),
        }
    }

    txn.advance_checkpoint(store, target)?;
    let summary = txn.commit()?;

    if summary.inserted > 0 {
        info!(
            "[APPLIER] {} -> {}: {} new, {} duplicate, {} entity writes",
            store, target, summary.inserted, duplicates, derived_mutations
        );
    }

    Ok(ApplyOutcome::Committed(ApplySummary {
        seq: summary.seq,
        inserted: summary.inserted,
        duplicates,
        derived_mutations,
        checkpoint: target,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Address, EventPayload, PrimaryKey, Transfer, Word};
    use crate::store::Database;

    fn mint(height: u64, id: u64, to: u8) -> ResolvedEvent {
        ResolvedEvent::new(
            EventRecord::new(
                PrimaryKey::new(height, 0, 0),
                Word::from_u64(height),
                EventPayload::Transfer(Transfer {
                    contract: Address::repeat_byte(1),
                    operator: Address::repeat_byte(to),
                    from: Address::ZERO,
                    to: Address::repeat_byte(to),
                    id: Word::from_u64(id),
                    value: 1,
                }),
            ),
            None,
        )
    }

    #[tokio::test]
    async fn commits_and_advances() {
        let db = Database::in_memory(0).into_shared();
        let applier = TransactionalApplier::new(db.clone());

        let outcome = applier
            .apply(StoreName::Transfer, vec![mint(3, 5, 0xaa)], 10)
            .await
            .unwrap();

        let ApplyOutcome::Committed(summary) = outcome else {
            panic!("expected a commit, got {outcome:?}");
        };
        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.duplicates, 0);
        assert!(summary.derived_mutations > 0);

        let guard = store::read(&db).unwrap();
        assert_eq!(guard.checkpoints().committed(StoreName::Transfer), Some(10));
        assert_eq!(guard.table(StoreName::Transfer).len(), 1);
    }

    #[tokio::test]
    async fn stale_target_is_a_no_op() {
        let db = Database::in_memory(0).into_shared();
        let applier = TransactionalApplier::new(db.clone());
        applier
            .apply(StoreName::Transfer, vec![], 20)
            .await
            .unwrap();

        let outcome = applier
            .apply(StoreName::Transfer, vec![mint(15, 5, 0xaa)], 20)
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Stale { checkpoint: 20 });
        assert!(store::read(&db).unwrap().table(StoreName::Transfer).is_empty());
    }

    #[tokio::test]
    async fn duplicates_are_skipped_without_entity_writes() {
        let db = Database::in_memory(0).into_shared();
        let applier = TransactionalApplier::new(db.clone());
        applier
            .apply(StoreName::Transfer, vec![mint(3, 5, 0xaa)], 5)
            .await
            .unwrap();

        let outcome = applier
            .apply(StoreName::Transfer, vec![mint(3, 5, 0xaa)], 6)
            .await
            .unwrap();
        let ApplyOutcome::Committed(summary) = outcome else {
            panic!("expected a commit, got {outcome:?}");
        };
        assert_eq!(summary.inserted, 0);
        assert_eq!(summary.duplicates, 1);
        assert_eq!(summary.derived_mutations, 0);
        assert_eq!(summary.checkpoint, 6);
    }

    #[tokio::test]
    async fn wrong_store_aborts_everything() {
        let db = Database::in_memory(0).into_shared();
        let applier = TransactionalApplier::new(db.clone());

        let err = applier
            .apply(StoreName::Claim, vec![mint(3, 5, 0xaa)], 5)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::WrongStore { .. }));

        let guard = store::read(&db).unwrap();
        assert_eq!(guard.checkpoints().committed(StoreName::Claim), None);
        assert_eq!(guard.commit_seq(), 0);
    }
}
