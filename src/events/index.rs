//! Secondary index definitions.
//!
//! An index is a named projection of record fields to an ordered key. Keys are
//! compared component by component, so `[seller, blockNumber]` can be scanned
//! by seller prefix and still come out in block order.

use serde::{Deserialize, Serialize};

use super::{Address, EventPayload, EventRecord, StoreName, Word};

/// One component of a compound index key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum IndexValue {
    Height(u64),
    Address(Address),
    Word(Word),
    /// Sorts after every other value. Only used as a scan bound.
    Max,
}

impl From<u64> for IndexValue {
    fn from(value: u64) -> Self {
        IndexValue::Height(value)
    }
}

impl From<Address> for IndexValue {
    fn from(value: Address) -> Self {
        IndexValue::Address(value)
    }
}

impl From<Word> for IndexValue {
    fn from(value: Word) -> Self {
        IndexValue::Word(value)
    }
}

pub type IndexKey = Vec<IndexValue>;

/// Builds an index key from heterogeneous components.
#[macro_export]
macro_rules! index_key {
    ($($value:expr),* $(,)?) => {
        vec![$($crate::events::index::IndexValue::from($value)),*]
    };
}

const TRANSFER_INDEXES: &[&str] = &[
    "blockNumber",
    "from",
    "to",
    "id",
    "from-blockNumber",
    "from-id",
    "from-to-blockNumber",
    "to-blockNumber",
    "id-blockNumber",
    "to-id-blockNumber",
];

const CLAIM_INDEXES: &[&str] = &["blockNumber", "author", "id", "author-blockNumber"];

const LIST_INDEXES: &[&str] = &[
    "blockNumber",
    "listingId",
    "token",
    "seller",
    "token-blockNumber",
    "seller-blockNumber",
];

const LISTING_MOVEMENT_INDEXES: &[&str] = &["listingId", "listingId-blockNumber"];

const PURCHASE_INDEXES: &[&str] = &[
    "blockNumber",
    "token",
    "listingId",
    "buyer",
    "token-blockNumber",
    "listingId-blockNumber",
    "buyer-blockNumber",
];

const PERSONA_INDEXES: &[&str] = &["account"];

/// Index names maintained for `store`.
pub fn index_names(store: StoreName) -> &'static [&'static str] {
    match store {
        StoreName::Transfer => TRANSFER_INDEXES,
        StoreName::Claim => CLAIM_INDEXES,
        StoreName::List => LIST_INDEXES,
        StoreName::Replenish | StoreName::Withdraw => LISTING_MOVEMENT_INDEXES,
        StoreName::Purchase => PURCHASE_INDEXES,
        _ => PERSONA_INDEXES,
    }
}

/// Projects `record` onto the named index.
///
/// Returns `None` when the index does not exist for the record's store.
pub fn project(record: &EventRecord, index: &str) -> Option<IndexKey> {
    let h = record.block_height();

    let key = match &record.payload {
        EventPayload::Transfer(t) => match index {
            "blockNumber" => index_key![h],
            "from" => index_key![t.from],
            "to" => index_key![t.to],
            "id" => index_key![t.id],
            "from-blockNumber" => index_key![t.from, h],
            "from-id" => index_key![t.from, t.id],
            "from-to-blockNumber" => index_key![t.from, t.to, h],
            "to-blockNumber" => index_key![t.to, h],
            "id-blockNumber" => index_key![t.id, h],
            "to-id-blockNumber" => index_key![t.to, t.id, h],
            _ => return None,
        },
        EventPayload::Claim(c) => match index {
            "blockNumber" => index_key![h],
            "author" => index_key![c.author],
            "id" => index_key![c.id],
            "author-blockNumber" => index_key![c.author, h],
            _ => return None,
        },
        EventPayload::List(l) => match index {
            "blockNumber" => index_key![l.app, h],
            "listingId" => index_key![l.listing_id],
            "token" => index_key![l.app, l.token.contract, l.token.id],
            "seller" => index_key![l.app, l.seller],
            "token-blockNumber" => index_key![l.app, l.token.contract, l.token.id, h],
            "seller-blockNumber" => index_key![l.app, l.seller, h],
            _ => return None,
        },
        EventPayload::Replenish(r) => movement_key(index, r.listing_id, h)?,
        EventPayload::Withdraw(w) => movement_key(index, w.listing_id, h)?,
        EventPayload::Purchase(p) => match index {
            "blockNumber" => index_key![p.app, h],
            "token" => index_key![p.app, p.token.contract, p.token.id],
            "listingId" => index_key![p.listing_id],
            "buyer" => index_key![p.app, p.buyer],
            "token-blockNumber" => index_key![p.app, p.token.contract, p.token.id, h],
            "listingId-blockNumber" => index_key![p.listing_id, h],
            "buyer-blockNumber" => index_key![p.app, p.buyer, h],
            _ => return None,
        },
        EventPayload::Persona(p) => match index {
            "account" => index_key![p.account],
            _ => return None,
        },
    };

    Some(key)
}

fn movement_key(index: &str, listing_id: Word, h: u64) -> Option<IndexKey> {
    match index {
        "listingId" => Some(index_key![listing_id]),
        "listingId-blockNumber" => Some(index_key![listing_id, h]),
        _ => None,
    }
}
