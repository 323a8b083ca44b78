//! Read-only access to committed state: ordered index scans and derived
//! entity lookups.
//!
//! Every call takes the read lock once, so one call never sees a
//! half-applied commit.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use crate::error::StoreError;
use crate::events::index::IndexKey;
use crate::events::{
    Address, EventPayload, EventRecord, ListingId, NftRef, PrimaryKey, StoreName, TokenId,
};
use crate::index_key;
use crate::store::{
    self, AccountPersona, Direction, KeyRange, ListingState, Persona, SharedDatabase, TokenOwner,
    TokenState,
};

/// How many records a scan may return. `None` is unbounded.
pub type Limit = Option<usize>;

#[derive(Debug, Clone)]
pub struct QueryLayer {
    db: SharedDatabase,
}

impl QueryLayer {
    pub fn new(db: SharedDatabase) -> Self {
        Self { db }
    }

    pub fn get(&self, store: StoreName, key: &PrimaryKey) -> Result<Option<EventRecord>, StoreError> {
        Ok(store::read(&self.db)?.table(store).get(key).cloned())
    }

    pub fn checkpoint(&self, store: StoreName) -> Result<Option<u64>, StoreError> {
        Ok(store::read(&self.db)?.checkpoints().committed(store))
    }

    /// Ordered scan over a secondary index.
    pub fn scan(
        &self,
        store: StoreName,
        index: &str,
        range: &KeyRange,
        direction: Direction,
        limit: Limit,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let db = store::read(&self.db)?;
        let records = db.table(store).scan(index, range, direction)?.cloned();
        Ok(match limit {
            Some(n) => records.take(n).collect(),
            None => records.collect(),
        })
    }

    /// Like [`QueryLayer::scan`], but yields only the first record for each
    /// distinct index key, in scan order.
    pub fn scan_unique(
        &self,
        store: StoreName,
        index: &str,
        range: &KeyRange,
        direction: Direction,
        limit: Limit,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let db = store::read(&self.db)?;
        let mut seen: BTreeSet<&IndexKey> = BTreeSet::new();
        let records = db
            .table(store)
            .scan_entries(index, range, direction)?
            .filter(|(key, _)| seen.insert(*key))
            .map(|(_, record)| record.clone());
        Ok(match limit {
            Some(n) => records.take(n).collect(),
            None => records.collect(),
        })
    }

    /// First match in scan order.
    pub fn find_event(
        &self,
        store: StoreName,
        index: &str,
        range: &KeyRange,
        direction: Direction,
    ) -> Result<Option<EventRecord>, StoreError> {
        let db = store::read(&self.db)?;
        let first = db.table(store).scan(index, range, direction)?.next().cloned();
        Ok(first)
    }

    // =====================================================================
    // Derived entities
    // =====================================================================

    pub fn owner_of(&self, contract: &Address, id: &TokenId) -> Result<Option<TokenOwner>, StoreError> {
        Ok(store::read(&self.db)?.derived().owner(contract, id).cloned())
    }

    pub fn balance_of(
        &self,
        contract: &Address,
        id: &TokenId,
        holder: &Address,
    ) -> Result<u128, StoreError> {
        Ok(store::read(&self.db)?.derived().balance(contract, id, holder))
    }

    pub fn token_state(&self, id: &TokenId) -> Result<Option<TokenState>, StoreError> {
        Ok(store::read(&self.db)?.derived().token(id).cloned())
    }

    pub fn listing(&self, id: &ListingId) -> Result<Option<ListingState>, StoreError> {
        Ok(store::read(&self.db)?.derived().listing(id).cloned())
    }

    pub fn persona(&self, account: &Address) -> Result<Option<AccountPersona>, StoreError> {
        Ok(store::read(&self.db)?.derived().persona(account).cloned())
    }

    // =====================================================================
    // Read models
    // =====================================================================

    /// Most recent `List` of `token` in `app`.
    pub fn latest_listing_for_token(
        &self,
        app: &Address,
        token: &NftRef,
    ) -> Result<Option<EventRecord>, StoreError> {
        self.find_event(
            StoreName::List,
            "token-blockNumber",
            &KeyRange::Prefix(index_key![*app, token.contract, token.id]),
            Direction::Backward,
        )
    }

    /// Mints, listings and purchases of `token`, newest first.
    pub fn token_history(
        &self,
        app: &Address,
        token: &NftRef,
        limit: Limit,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let db = store::read(&self.db)?;
        let mut records: Vec<EventRecord> = db
            .table(StoreName::Transfer)
            .scan(
                "from-id",
                &KeyRange::Only(index_key![Address::ZERO, token.id]),
                Direction::Backward,
            )?
            .filter(|record| match &record.payload {
                EventPayload::Transfer(t) => t.contract == token.contract,
                _ => false,
            })
            .cloned()
            .collect();

        let by_token = KeyRange::Prefix(index_key![*app, token.contract, token.id]);
        for store_name in [StoreName::List, StoreName::Purchase] {
            records.extend(
                db.table(store_name)
                    .scan("token-blockNumber", &by_token, Direction::Backward)?
                    .cloned(),
            );
        }

        Ok(newest_first(records, limit))
    }

    /// Listings created by `seller` in `app`, newest first.
    pub fn account_listings(
        &self,
        app: &Address,
        seller: &Address,
        limit: Limit,
    ) -> Result<Vec<EventRecord>, StoreError> {
        self.scan(
            StoreName::List,
            "seller-blockNumber",
            &KeyRange::Prefix(index_key![*app, *seller]),
            Direction::Backward,
            limit,
        )
    }

    /// Listings and purchases made by `account` in `app`, newest first.
    pub fn account_feed(
        &self,
        app: &Address,
        account: &Address,
        limit: Limit,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let mut records = self.account_listings(app, account, limit)?;
        records.extend(self.scan(
            StoreName::Purchase,
            "buyer-blockNumber",
            &KeyRange::Prefix(index_key![*app, *account]),
            Direction::Backward,
            limit,
        )?);
        Ok(newest_first(records, limit))
    }

    /// Every listing and purchase in `app`, newest first.
    pub fn feed(&self, app: &Address, limit: Limit) -> Result<Vec<EventRecord>, StoreError> {
        let by_app = KeyRange::Prefix(index_key![*app]);
        let mut records = self.scan(
            StoreName::List,
            "blockNumber",
            &by_app,
            Direction::Backward,
            limit,
        )?;
        records.extend(self.scan(
            StoreName::Purchase,
            "blockNumber",
            &by_app,
            Direction::Backward,
            limit,
        )?);
        Ok(newest_first(records, limit))
    }
}

fn newest_first(mut records: Vec<EventRecord>, limit: Limit) -> Vec<EventRecord> {
    records.sort_by(|a, b| b.key.cmp(&a.key));
    if let Some(n) = limit {
        records.truncate(n);
    }
    records
}

// =====================================================================
// Persona cache
// =====================================================================

#[derive(Debug, Default)]
struct CacheState {
    seq: u64,
    entries: HashMap<Address, Option<AccountPersona>>,
    hits: u64,
    misses: u64,
}

/// Read-through cache over the persona table. Any commit clears it.
#[derive(Debug)]
pub struct PersonaCache {
    db: SharedDatabase,
    state: Mutex<CacheState>,
}

impl PersonaCache {
    pub fn new(db: SharedDatabase) -> Self {
        Self {
            db,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn get(&self, account: &Address) -> Result<Option<AccountPersona>, StoreError> {
        let db = store::read(&self.db)?;
        let mut state = self.state.lock().map_err(|_| StoreError::Poisoned)?;

        if state.seq != db.commit_seq() {
            state.entries.clear();
            state.seq = db.commit_seq();
        }

        if let Some(hit) = state.entries.get(account).cloned() {
            state.hits += 1;
            return Ok(hit);
        }

        state.misses += 1;
        let value = db.derived().persona(account).cloned();
        state.entries.insert(*account, value.clone());
        Ok(value)
    }

    /// The persona shown inside `app`, falling back to the basic one per
    /// field.
    pub fn for_app(&self, account: &Address, app: &Address) -> Result<Option<Persona>, StoreError> {
        Ok(self.get(account)?.map(|persona| persona.for_app(app)))
    }

    /// `(hits, misses)` since creation.
    pub fn stats(&self) -> Result<(u64, u64), StoreError> {
        let state = self.state.lock().map_err(|_| StoreError::Poisoned)?;
        Ok((state.hits, state.misses))
    }
}
