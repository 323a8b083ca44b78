use std::sync::Arc;
use std::time::Duration;

use crate::config::{ContractsConfig, RetryPolicy, SyncConfig};
use crate::error::{SourceError, SyncError};
use crate::events::{Address, PrimaryKey, StoreName, Word};
use crate::mapper::EventMapper;
use crate::persistence::open_database;
use crate::store::{self, Database, SharedDatabase};
use crate::sync::applier::{ApplyOutcome, ResolvedEvent, TransactionalApplier};
use crate::sync::context::SyncContext;
use crate::sync::resolver::{NoSideEffects, SideEffectResolver, TokenStateResolver};
use crate::sync::runtime::{SessionHandle, SyncManager, SyncSession, SyncStatus};
use crate::sync::source::{MockChainSource, RawLogEntry};
use crate::test_utils::*;

// =========================================================================
// Helpers
// =========================================================================

fn config(batch_size: u64) -> SyncConfig {
    SyncConfig {
        batch_size,
        retry: RetryPolicy {
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            max_attempts: Some(5),
        },
        ..SyncConfig::default()
    }
}

fn context(source: &MockChainSource, db: SharedDatabase, batch_size: u64) -> SyncContext<MockChainSource> {
    SyncContext::new(Arc::new(source.clone()), db, config(batch_size))
}

fn session_with<R: SideEffectResolver>(
    ctx: &SyncContext<MockChainSource>,
    store: StoreName,
    contract: Address,
    resolver: R,
) -> SyncSession<MockChainSource, R> {
    SyncSession::new(
        ctx.clone(),
        store,
        EventMapper::filter(store, contract, None),
        Arc::new(EventMapper::new()),
        Arc::new(resolver),
    )
}

fn transfer_session(ctx: &SyncContext<MockChainSource>) -> SyncSession<MockChainSource, NoSideEffects> {
    session_with(ctx, StoreName::Transfer, IPFT, NoSideEffects)
}

/// One mint of token `h` to 0x01 every ten blocks in `[from, to]`.
fn mints(from: u64, to: u64) -> Vec<RawLogEntry> {
    (from..=to)
        .step_by(10)
        .map(|h| transfer_single(h, 0, Address::ZERO, addr(1), h, 1))
        .collect()
}

fn transfer_count(db: &SharedDatabase) -> usize {
    store::read(db).unwrap().table(StoreName::Transfer).len()
}

fn checkpoint(db: &SharedDatabase, store_name: StoreName) -> Option<u64> {
    store::read(db).unwrap().checkpoints().committed(store_name)
}

async fn wait_live(handle: &SessionHandle, height: u64) {
    let status = tokio::time::timeout(
        Duration::from_secs(5),
        handle.wait_for(|s| s.is_live_at(height)),
    )
    .await
    .expect("session did not go live in time");
    assert!(status.is_live_at(height), "unexpected status {status:?}");
}

// =========================================================================
// Backfill
// =========================================================================

#[tokio::test]
async fn backfill_is_gap_free_and_batched() {
    let chain = MockChainSource::new();
    chain.push_logs(mints(0, 100));
    let db = Database::in_memory(0).into_shared();
    let ctx = context(&chain, db.clone(), 30);

    let session = transfer_session(&ctx);
    let status = session.subscribe_status();
    let report = session.run(Some(100)).await.unwrap();

    assert_eq!(chain.queries(), vec![(0, 29), (30, 59), (60, 89), (90, 100)]);
    assert_eq!(report.batches, 4);
    assert_eq!(report.inserted, 11);
    assert_eq!(transfer_count(&db), 11);
    assert_eq!(checkpoint(&db, StoreName::Transfer), Some(100));
    assert_eq!(*status.borrow(), SyncStatus::Closed);

    let guard = store::read(&db).unwrap();
    for h in (0..=100).step_by(10) {
        assert!(guard
            .table(StoreName::Transfer)
            .contains(&PrimaryKey::new(h, 0, 0)));
    }
}

#[tokio::test]
async fn ownership_follows_transfers() {
    let chain = MockChainSource::new();
    chain.push_logs(vec![
        transfer_single(100, 0, Address::ZERO, addr(0xa), 5, 1),
        transfer_single(105, 0, addr(0xa), addr(0xb), 5, 1),
    ]);
    let db = Database::in_memory(0).into_shared();
    let ctx = context(&chain, db.clone(), 50);

    transfer_session(&ctx).run(Some(110)).await.unwrap();

    let guard = store::read(&db).unwrap();
    let owner = guard.derived().owner(&IPFT, &Word::from_u64(5)).unwrap();
    assert_eq!(owner.owner, addr(0xb));
    assert_eq!(owner.minter, Some(addr(0xa)));

    let keys: Vec<PrimaryKey> = guard
        .table(StoreName::Transfer)
        .iter(Default::default())
        .map(|r| r.key)
        .collect();
    assert_eq!(keys, vec![PrimaryKey::new(100, 0, 0), PrimaryKey::new(105, 0, 0)]);
}

#[tokio::test]
async fn resume_after_crash_queries_only_the_rest() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("journal.dat");
    let chain = MockChainSource::new();
    chain.push_logs(mints(0, 100));

    {
        let db = open_database(&path, 0).unwrap();
        let ctx = context(&chain, db.clone(), 51);
        transfer_session(&ctx).run(Some(50)).await.unwrap();
        assert_eq!(checkpoint(&db, StoreName::Transfer), Some(50));
    }

    let db = open_database(&path, 0).unwrap();
    assert_eq!(checkpoint(&db, StoreName::Transfer), Some(50));
    let ctx = context(&chain, db.clone(), 51);
    let report = transfer_session(&ctx).run(Some(100)).await.unwrap();

    assert_eq!(chain.queries(), vec![(0, 50), (51, 100)]);
    assert_eq!(report.duplicates, 0);
    assert_eq!(report.inserted, 5);
    assert_eq!(transfer_count(&db), 11);
}

#[tokio::test]
async fn replaying_a_committed_range_changes_nothing() {
    let chain = MockChainSource::new();
    chain.push_logs(mints(0, 100));
    let db = Database::in_memory(0).into_shared();
    let ctx = context(&chain, db.clone(), 40);
    transfer_session(&ctx).run(Some(100)).await.unwrap();

    let (rows_before, entities_before, seq_before) = {
        let guard = store::read(&db).unwrap();
        let rows: Vec<_> = guard
            .table(StoreName::Transfer)
            .iter(Default::default())
            .cloned()
            .collect();
        (rows, guard.derived().clone(), guard.commit_seq())
    };

    let mapper = EventMapper::new();
    let events: Vec<ResolvedEvent> = mints(0, 100)
        .iter()
        .flat_map(|entry| mapper.map(entry).unwrap())
        .map(|record| ResolvedEvent::new(record, None))
        .collect();
    let outcome = TransactionalApplier::new(db.clone())
        .apply(StoreName::Transfer, events, 101)
        .await
        .unwrap();

    let ApplyOutcome::Committed(summary) = outcome else {
        panic!("expected a commit, got {outcome:?}");
    };
    assert_eq!(summary.inserted, 0);
    assert_eq!(summary.duplicates, 11);
    assert_eq!(summary.derived_mutations, 0);

    let guard = store::read(&db).unwrap();
    let rows: Vec<_> = guard
        .table(StoreName::Transfer)
        .iter(Default::default())
        .cloned()
        .collect();
    assert_eq!(rows, rows_before);
    assert_eq!(*guard.derived(), entities_before);
    assert_eq!(guard.commit_seq(), seq_before + 1);
}

#[tokio::test]
async fn full_replay_from_genesis_matches_single_pass() {
    let chain = MockChainSource::new();
    chain.push_logs(mints(0, 60));
    chain.push_logs(vec![transfer_single(61, 0, addr(1), addr(2), 30, 1)]);

    let once = Database::in_memory(0).into_shared();
    transfer_session(&context(&chain, once.clone(), 25))
        .run(Some(61))
        .await
        .unwrap();

    // Same range applied twice: the first pass through sessions, the second
    // as a single replayed batch.
    let twice = Database::in_memory(0).into_shared();
    transfer_session(&context(&chain, twice.clone(), 25))
        .run(Some(61))
        .await
        .unwrap();
    let mapper = EventMapper::new();
    let mut entries = mints(0, 60);
    entries.push(transfer_single(61, 0, addr(1), addr(2), 30, 1));
    let events = entries
        .iter()
        .flat_map(|entry| mapper.map(entry).unwrap())
        .map(|record| ResolvedEvent::new(record, None))
        .collect();
    TransactionalApplier::new(twice.clone())
        .apply(StoreName::Transfer, events, 62)
        .await
        .unwrap();

    let a = store::read(&once).unwrap();
    let b = store::read(&twice).unwrap();
    assert_eq!(a.derived(), b.derived());
    assert!(a
        .table(StoreName::Transfer)
        .iter(Default::default())
        .eq(b.table(StoreName::Transfer).iter(Default::default())));
}

#[tokio::test]
async fn transient_failures_retry_the_same_batch() {
    let chain = MockChainSource::new();
    chain.push_logs(mints(0, 20));
    chain.fail_next(2);
    let db = Database::in_memory(0).into_shared();
    let ctx = context(&chain, db.clone(), 10);

    let report = transfer_session(&ctx).run(Some(20)).await.unwrap();

    assert_eq!(
        chain.queries(),
        vec![(0, 9), (0, 9), (0, 9), (10, 19), (20, 20)]
    );
    assert_eq!(report.retries, 2);
    assert_eq!(report.inserted, 3);
    assert_eq!(checkpoint(&db, StoreName::Transfer), Some(20));
}

#[tokio::test]
async fn exhausted_retries_stall_without_partial_state() {
    let chain = MockChainSource::new();
    chain.push_logs(mints(0, 20));
    let db = Database::in_memory(0).into_shared();
    let ctx = context(&chain, db.clone(), 10);

    // The first batch commits; the second never gets through.
    let session = transfer_session(&ctx);
    let status = session.subscribe_status();
    transfer_session(&ctx).run(Some(9)).await.unwrap();
    chain.fail_next(100);

    let err = session.run(Some(20)).await.unwrap_err();
    assert!(matches!(err, SyncError::RetriesExhausted { attempts: 5, .. }));
    assert_eq!(checkpoint(&db, StoreName::Transfer), Some(9));
    assert_eq!(transfer_count(&db), 1);
    assert!(matches!(
        &*status.borrow(),
        SyncStatus::Stalled { height: 9, .. }
    ));
}

#[tokio::test]
async fn undecodable_response_stalls_without_retry() {
    let chain = MockChainSource::new();
    chain.push_logs(mints(0, 20));
    chain.fail_next_with(SourceError::Decode("log without block number".into()));
    let db = Database::in_memory(0).into_shared();
    let ctx = context(&chain, db.clone(), 10);

    let session = transfer_session(&ctx);
    let status = session.subscribe_status();
    let err = session.run(Some(20)).await.unwrap_err();

    assert!(matches!(err, SyncError::Source(SourceError::Decode(_))), "{err:?}");
    assert_eq!(chain.queries(), vec![(0, 9)]);
    assert_eq!(checkpoint(&db, StoreName::Transfer), None);
    match &*status.borrow() {
        SyncStatus::Stalled { height, reason } => {
            assert_eq!(*height, 0);
            assert!(reason.contains("block number"), "reason: {reason}");
        }
        other => panic!("expected a stall, got {other:?}"),
    };
}

#[tokio::test]
async fn bounded_target_stops_at_the_chain_head() {
    let chain = MockChainSource::new();
    chain.push_logs(mints(0, 50));
    let db = Database::in_memory(0).into_shared();
    let ctx = context(&chain, db.clone(), 100);

    transfer_session(&ctx).run(Some(100)).await.unwrap();
    assert_eq!(chain.queries(), vec![(0, 50)]);
    assert_eq!(checkpoint(&db, StoreName::Transfer), Some(50));

    // Block 70 is produced after the first run. Had the checkpoint jumped
    // to 100 it would never be queried.
    chain.push_logs(vec![transfer_single(70, 0, Address::ZERO, addr(1), 70, 1)]);
    transfer_session(&ctx).run(Some(120)).await.unwrap();

    assert_eq!(chain.queries().last(), Some(&(51, 70)));
    assert_eq!(checkpoint(&db, StoreName::Transfer), Some(70));
    assert!(store::read(&db)
        .unwrap()
        .table(StoreName::Transfer)
        .contains(&PrimaryKey::new(70, 0, 0)));
}

#[tokio::test]
async fn malformed_log_stalls_the_session() {
    let chain = MockChainSource::new();
    chain.push_logs(mints(0, 20));
    let mut bad = transfer_single(35, 0, Address::ZERO, addr(1), 35, 1);
    bad.data.truncate(40);
    chain.push_logs(vec![bad]);
    let db = Database::in_memory(0).into_shared();
    let ctx = context(&chain, db.clone(), 10);

    let session = transfer_session(&ctx);
    let status = session.subscribe_status();
    let err = session.run(Some(50)).await.unwrap_err();

    assert!(matches!(err, SyncError::Malformed(_)));
    assert_eq!(checkpoint(&db, StoreName::Transfer), Some(29));
    // Malformed input is not retried. The run stops at the head, block 35.
    assert_eq!(chain.queries().last(), Some(&(30, 35)));
    assert_eq!(chain.queries().len(), 4);
    match &*status.borrow() {
        SyncStatus::Stalled { height, reason } => {
            assert_eq!(*height, 29);
            assert!(reason.contains("35"), "reason: {reason}");
        }
        other => panic!("expected a stall, got {other:?}"),
    };
}

#[tokio::test]
async fn claim_side_effects_land_with_the_event() {
    let chain = MockChainSource::new();
    chain.push_logs(vec![claim(10, 0, addr(7), 5, 0x70)]);
    chain.set_token_state(IPFT, Word::from_u64(5), true, Some(1_700_000_000));
    let db = Database::in_memory(0).into_shared();
    let ctx = context(&chain, db.clone(), 100);

    let resolver = TokenStateResolver::new(ctx.source.clone());
    session_with(&ctx, StoreName::Claim, IPFT, resolver)
        .run(Some(20))
        .await
        .unwrap();

    let guard = store::read(&db).unwrap();
    let token = guard.derived().token(&Word::from_u64(5)).unwrap();
    assert_eq!(token.author, Some(addr(7)));
    assert_eq!(token.codec, Some(0x70));
    assert_eq!(token.finalized, Some(true));
    assert_eq!(token.expires_at, Some(1_700_000_000));
}

// =========================================================================
// Live tailing
// =========================================================================

#[tokio::test]
async fn live_blocks_apply_once_and_stale_ones_are_discarded() {
    let chain = MockChainSource::new();
    chain.push_logs(mints(0, 100));
    let db = Database::in_memory(0).into_shared();
    let ctx = context(&chain, db.clone(), 50);

    let handle = transfer_session(&ctx).spawn(None);
    wait_live(&handle, 100).await;

    chain.mine(101, vec![transfer_single(101, 0, Address::ZERO, addr(2), 101, 1)]);
    wait_live(&handle, 101).await;

    // At or below the checkpoint: a no-op.
    chain.mine(90, vec![transfer_single(90, 3, Address::ZERO, addr(2), 900, 1)]);
    chain.mine(101, vec![transfer_single(101, 4, Address::ZERO, addr(2), 901, 1)]);
    chain.mine(102, vec![transfer_single(102, 0, Address::ZERO, addr(2), 102, 1)]);
    wait_live(&handle, 102).await;

    handle.close();
    let report = handle.join().await.unwrap();
    assert_eq!(report.live_blocks, 2);
    assert_eq!(report.discarded, 2);

    let guard = store::read(&db).unwrap();
    let table = guard.table(StoreName::Transfer);
    assert!(table.contains(&PrimaryKey::new(101, 0, 0)));
    assert!(table.contains(&PrimaryKey::new(102, 0, 0)));
    assert!(!table.contains(&PrimaryKey::new(90, 3, 0)));
    assert!(!table.contains(&PrimaryKey::new(101, 4, 0)));
    assert_eq!(guard.checkpoints().committed(StoreName::Transfer), Some(102));
}

#[tokio::test]
async fn dropped_subscription_backfills_then_resubscribes() {
    let chain = MockChainSource::new();
    chain.push_logs(mints(0, 100));
    let db = Database::in_memory(0).into_shared();
    let ctx = context(&chain, db.clone(), 50);

    let handle = transfer_session(&ctx).spawn(None);
    wait_live(&handle, 100).await;
    assert_eq!(chain.subscribe_calls(), 1);

    // Blocks produced while the connection is down never arrive live.
    chain.push_logs(mints(110, 130));
    chain.drop_subscriptions();

    wait_live(&handle, 130).await;
    assert_eq!(chain.subscribe_calls(), 2);
    assert_eq!(chain.live_subscribers(), 1);
    assert!(chain.queries().contains(&(101, 130)));
    assert_eq!(transfer_count(&db), 14);

    handle.close();
    let report = handle.join().await.unwrap();
    assert_eq!(report.restarts, 1);
}

#[tokio::test]
async fn close_is_idempotent_and_cancels_the_subscription() {
    let chain = MockChainSource::new();
    chain.push_logs(mints(0, 10));
    let db = Database::in_memory(0).into_shared();
    let ctx = context(&chain, db, 50);

    let handle = transfer_session(&ctx).spawn(None);
    wait_live(&handle, 10).await;
    assert_eq!(chain.live_subscribers(), 1);

    handle.close();
    handle.close();
    let status = handle.subscribe_status();
    handle.join().await.unwrap();

    assert_eq!(*status.borrow(), SyncStatus::Closed);
    assert_eq!(chain.live_subscribers(), 0);
}

// =========================================================================
// Manager
// =========================================================================

#[tokio::test]
async fn manager_syncs_every_configured_store() {
    let chain = MockChainSource::new();
    let seller = addr(0x5);
    let buyer = addr(0xb);
    chain.push_logs(vec![
        transfer_single(1, 0, Address::ZERO, seller, 7, 10),
        claim(1, 1, seller, 7, 0x55),
        list(2, 0, 7, seller),
        replenish(3, 0, 7, seller, 120, 5),
        purchase(4, 0, 7, seller, buyer, 2),
        set_basic_pfa(5, 0, buyer, "ipfs://pfa"),
        set_app_pfp(6, 0, buyer, token(7)),
    ]);
    chain.set_head(10);
    chain.set_token_state(IPFT, Word::from_u64(7), false, None);

    let db = Database::in_memory(0).into_shared();
    let contracts = ContractsConfig {
        ipft_redeemable: IPFT,
        open_store: STORE,
        persona: Some(PERSONA),
        app: Some(APP),
    };
    let manager = SyncManager::start(context(&chain, db.clone(), 100), &contracts, Some(10));
    assert_eq!(manager.handles().len(), StoreName::ALL.len());

    for (store_name, result) in manager.join_all().await {
        result.unwrap_or_else(|e| panic!("{store_name} failed: {e}"));
        assert_eq!(checkpoint(&db, store_name), Some(10), "{store_name}");
    }

    let guard = store::read(&db).unwrap();
    let derived = guard.derived();
    let listing = derived.listing(&listing_id(7, seller)).unwrap();
    assert_eq!(listing.price, Some(120));
    assert_eq!(listing.stock, 3);
    assert_eq!(listing.sold, 2);
    assert_eq!(
        derived.token(&Word::from_u64(7)).unwrap().finalized,
        Some(false)
    );

    let persona = derived.persona(&buyer).unwrap();
    assert_eq!(persona.basic.pfa.as_deref(), Some("ipfs://pfa"));
    assert_eq!(persona.for_app(&APP).pfp, Some(token(7)));
    assert_eq!(persona.for_app(&APP).pfa.as_deref(), Some("ipfs://pfa"));
}

#[tokio::test]
async fn manager_skips_persona_without_contract() {
    let chain = MockChainSource::new();
    let db = Database::in_memory(0).into_shared();
    let contracts = ContractsConfig {
        ipft_redeemable: IPFT,
        open_store: STORE,
        persona: None,
        app: None,
    };

    let manager = SyncManager::start(context(&chain, db, 100), &contracts, Some(0));
    assert_eq!(manager.handles().len(), 6);
    assert!(manager.handle(StoreName::PersonaBasicPfa).is_none());
    manager.close_all();
    for (_, result) in manager.join_all().await {
        result.unwrap();
    }
}
