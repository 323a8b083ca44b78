//! Typed event records: one closed variant per store.
//!
//! Everything here is plain data. Mapping raw logs into these records lives in
//! [`crate::mapper`], storing them in [`crate::store`].

pub mod index;
pub mod types;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use types::{Address, ListingId, NftRef, ParseHexError, TokenId, Word};

// =====================================================================
// Primary key
// =====================================================================

/// `(blockHeight, logIndex, subIndex)`: globally unique per store.
///
/// Field order matters, the derived `Ord` is the canonical event order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PrimaryKey {
    pub block_height: u64,
    pub log_index: u64,
    pub sub_index: u64,
}

impl PrimaryKey {
    pub const MIN: PrimaryKey = PrimaryKey::new(0, 0, 0);
    pub const MAX: PrimaryKey = PrimaryKey::new(u64::MAX, u64::MAX, u64::MAX);

    pub const fn new(block_height: u64, log_index: u64, sub_index: u64) -> Self {
        Self {
            block_height,
            log_index,
            sub_index,
        }
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({},{},{})",
            self.block_height, self.log_index, self.sub_index
        )
    }
}

// =====================================================================
// Store names
// =====================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StoreName {
    #[serde(rename = "IPFTRedeemable.Transfer")]
    Transfer,
    #[serde(rename = "IPFTRedeemable.Claim")]
    Claim,
    #[serde(rename = "OpenStore.List")]
    List,
    #[serde(rename = "OpenStore.Replenish")]
    Replenish,
    #[serde(rename = "OpenStore.Withdraw")]
    Withdraw,
    #[serde(rename = "OpenStore.Purchase")]
    Purchase,
    #[serde(rename = "Persona.SetBasicPfp")]
    PersonaBasicPfp,
    #[serde(rename = "Persona.SetBasicBgp")]
    PersonaBasicBgp,
    #[serde(rename = "Persona.SetBasicPfa")]
    PersonaBasicPfa,
    #[serde(rename = "Persona.SetBasicMetadata")]
    PersonaBasicMetadata,
    #[serde(rename = "Persona.SetAppPfp")]
    PersonaAppPfp,
    #[serde(rename = "Persona.SetAppBgp")]
    PersonaAppBgp,
    #[serde(rename = "Persona.SetAppPfa")]
    PersonaAppPfa,
    #[serde(rename = "Persona.SetAppMetadata")]
    PersonaAppMetadata,
}

impl StoreName {
    pub const ALL: [StoreName; 14] = [
        StoreName::Transfer,
        StoreName::Claim,
        StoreName::List,
        StoreName::Replenish,
        StoreName::Withdraw,
        StoreName::Purchase,
        StoreName::PersonaBasicPfp,
        StoreName::PersonaBasicBgp,
        StoreName::PersonaBasicPfa,
        StoreName::PersonaBasicMetadata,
        StoreName::PersonaAppPfp,
        StoreName::PersonaAppBgp,
        StoreName::PersonaAppPfa,
        StoreName::PersonaAppMetadata,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StoreName::Transfer => "IPFTRedeemable.Transfer",
            StoreName::Claim => "IPFTRedeemable.Claim",
            StoreName::List => "OpenStore.List",
            StoreName::Replenish => "OpenStore.Replenish",
            StoreName::Withdraw => "OpenStore.Withdraw",
            StoreName::Purchase => "OpenStore.Purchase",
            StoreName::PersonaBasicPfp => "Persona.SetBasicPfp",
            StoreName::PersonaBasicBgp => "Persona.SetBasicBgp",
            StoreName::PersonaBasicPfa => "Persona.SetBasicPfa",
            StoreName::PersonaBasicMetadata => "Persona.SetBasicMetadata",
            StoreName::PersonaAppPfp => "Persona.SetAppPfp",
            StoreName::PersonaAppBgp => "Persona.SetAppBgp",
            StoreName::PersonaAppPfa => "Persona.SetAppPfa",
            StoreName::PersonaAppMetadata => "Persona.SetAppMetadata",
        }
    }

    pub fn is_persona(&self) -> bool {
        matches!(
            self,
            StoreName::PersonaBasicPfp
                | StoreName::PersonaBasicBgp
                | StoreName::PersonaBasicPfa
                | StoreName::PersonaBasicMetadata
                | StoreName::PersonaAppPfp
                | StoreName::PersonaAppBgp
                | StoreName::PersonaAppPfa
                | StoreName::PersonaAppMetadata
        )
    }

    /// Persona stores only exist from journal schema v2 onwards.
    pub fn since_schema(&self) -> u32 {
        if self.is_persona() {
            2
        } else {
            1
        }
    }
}

impl fmt::Display for StoreName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for StoreName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StoreName::ALL
            .into_iter()
            .find(|store| store.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown store {s}"))
    }
}

// =====================================================================
// Payloads
// =====================================================================

/// One ERC-1155 transfer. Batched transfers become one record per id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub contract: Address,
    pub operator: Address,
    pub from: Address,
    pub to: Address,
    pub id: TokenId,
    pub value: u128,
}

impl Transfer {
    pub fn is_mint(&self) -> bool {
        self.from.is_zero()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub contract: Address,
    pub operator: Address,
    pub author: Address,
    pub id: TokenId,
    pub codec: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct List {
    pub token: NftRef,
    pub seller: Address,
    pub app: Address,
    pub listing_id: ListingId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replenish {
    pub token: NftRef,
    pub app: Address,
    pub listing_id: ListingId,
    pub price: u128,
    pub amount: u128,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Withdraw {
    pub token: NftRef,
    pub app: Address,
    pub listing_id: ListingId,
    pub to: Address,
    pub amount: u128,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Purchase {
    pub token: NftRef,
    pub listing_id: ListingId,
    pub buyer: Address,
    pub amount: u128,
    pub income: u128,
    pub royalty_address: Address,
    pub royalty_value: u128,
    pub app: Address,
    pub app_fee: u128,
    pub profit: u128,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PersonaField {
    Pfp(NftRef),
    Bgp(NftRef),
    Pfa(String),
    Metadata(Vec<u8>),
}

/// A persona update, either basic (`app == None`) or scoped to one app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonaUpdate {
    pub account: Address,
    pub app: Option<Address>,
    pub field: PersonaField,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventPayload {
    Transfer(Transfer),
    Claim(Claim),
    List(List),
    Replenish(Replenish),
    Withdraw(Withdraw),
    Purchase(Purchase),
    Persona(PersonaUpdate),
}

impl EventPayload {
    pub fn store(&self) -> StoreName {
        match self {
            EventPayload::Transfer(_) => StoreName::Transfer,
            EventPayload::Claim(_) => StoreName::Claim,
            EventPayload::List(_) => StoreName::List,
            EventPayload::Replenish(_) => StoreName::Replenish,
            EventPayload::Withdraw(_) => StoreName::Withdraw,
            EventPayload::Purchase(_) => StoreName::Purchase,
            EventPayload::Persona(p) => match (&p.app, &p.field) {
                (None, PersonaField::Pfp(_)) => StoreName::PersonaBasicPfp,
                (None, PersonaField::Bgp(_)) => StoreName::PersonaBasicBgp,
                (None, PersonaField::Pfa(_)) => StoreName::PersonaBasicPfa,
                (None, PersonaField::Metadata(_)) => StoreName::PersonaBasicMetadata,
                (Some(_), PersonaField::Pfp(_)) => StoreName::PersonaAppPfp,
                (Some(_), PersonaField::Bgp(_)) => StoreName::PersonaAppBgp,
                (Some(_), PersonaField::Pfa(_)) => StoreName::PersonaAppPfa,
                (Some(_), PersonaField::Metadata(_)) => StoreName::PersonaAppMetadata,
            },
        }
    }
}

// =====================================================================
// EventRecord
// =====================================================================

/// An immutable fact derived from one log entry (or one element of a batch).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub key: PrimaryKey,
    pub tx_hash: Word,
    pub payload: EventPayload,
}

impl EventRecord {
    pub fn new(key: PrimaryKey, tx_hash: Word, payload: EventPayload) -> Self {
        Self {
            key,
            tx_hash,
            payload,
        }
    }

    pub fn store(&self) -> StoreName {
        self.payload.store()
    }

    pub fn block_height(&self) -> u64 {
        self.key.block_height
    }
}
