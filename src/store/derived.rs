//! Derived entities and the fold rules that build them from events.
//!
//! Folding is a pure function from (current entity values, record, aux data)
//! to a list of upserts. The write transaction supplies the current values and
//! stages the upserts next to the inserted records, so both land in the same
//! commit.

use std::collections::BTreeMap;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::events::{
    Address, EventPayload, EventRecord, ListingId, NftRef, PersonaField, PersonaUpdate,
    PrimaryKey, TokenId,
};

/// Confirmed chain state fetched by a side-effect resolver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuxData {
    TokenState {
        finalized: bool,
        expires_at: Option<u64>,
    },
}

// =====================================================================
// Entities
// =====================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenOwner {
    pub owner: Address,
    pub minter: Option<Address>,
    pub last_transfer: PrimaryKey,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenState {
    pub author: Option<Address>,
    pub codec: Option<u32>,
    pub claimed_at: Option<u64>,
    pub finalized: Option<bool>,
    pub expires_at: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingState {
    pub listing_id: ListingId,
    pub token: Option<NftRef>,
    pub seller: Option<Address>,
    pub app: Option<Address>,
    pub listed_at: Option<u64>,
    pub price: Option<u128>,
    /// Key of the replenish that set `price`; an older one never overrides it.
    pub price_key: Option<PrimaryKey>,
    /// Replenished minus withdrawn minus purchased. Signed because the
    /// listing stores sync independently and may land out of order.
    pub stock: i128,
    pub sold: u128,
}

impl ListingState {
    fn empty(listing_id: ListingId) -> Self {
        Self {
            listing_id,
            token: None,
            seller: None,
            app: None,
            listed_at: None,
            price: None,
            price_key: None,
            stock: 0,
            sold: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Persona {
    pub pfp: Option<NftRef>,
    pub bgp: Option<NftRef>,
    pub pfa: Option<String>,
    pub metadata: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountPersona {
    pub account: Address,
    pub basic: Persona,
    pub apps: BTreeMap<Address, Persona>,
}

impl AccountPersona {
    fn empty(account: Address) -> Self {
        Self {
            account,
            basic: Persona::default(),
            apps: BTreeMap::new(),
        }
    }

    /// App persona with the basic persona as fallback per field.
    pub fn for_app(&self, app: &Address) -> Persona {
        let scoped = self.apps.get(app);
        let pick = |f: fn(&Persona) -> Option<&NftRef>| {
            scoped.and_then(f).or_else(|| f(&self.basic)).copied()
        };
        Persona {
            pfp: pick(|p| p.pfp.as_ref()),
            bgp: pick(|p| p.bgp.as_ref()),
            pfa: scoped
                .and_then(|p| p.pfa.clone())
                .or_else(|| self.basic.pfa.clone()),
            metadata: scoped
                .and_then(|p| p.metadata.clone())
                .or_else(|| self.basic.metadata.clone()),
        }
    }
}

// =====================================================================
// Tables
// =====================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DerivedTables {
    owners: BTreeMap<(Address, TokenId), TokenOwner>,
    balances: BTreeMap<(Address, TokenId, Address), u128>,
    tokens: BTreeMap<TokenId, TokenState>,
    listings: BTreeMap<ListingId, ListingState>,
    personas: BTreeMap<Address, AccountPersona>,
}

impl DerivedTables {
    pub fn owner(&self, contract: &Address, id: &TokenId) -> Option<&TokenOwner> {
        self.owners.get(&(*contract, *id))
    }

    pub fn balance(&self, contract: &Address, id: &TokenId, holder: &Address) -> u128 {
        self.balances
            .get(&(*contract, *id, *holder))
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn balance_entry(
        &self,
        contract: &Address,
        id: &TokenId,
        holder: &Address,
    ) -> Option<u128> {
        self.balances.get(&(*contract, *id, *holder)).copied()
    }

    pub fn token(&self, id: &TokenId) -> Option<&TokenState> {
        self.tokens.get(id)
    }

    pub fn listing(&self, id: &ListingId) -> Option<&ListingState> {
        self.listings.get(id)
    }

    pub fn persona(&self, account: &Address) -> Option<&AccountPersona> {
        self.personas.get(account)
    }

    pub fn entity_count(&self) -> usize {
        self.owners.len()
            + self.balances.len()
            + self.tokens.len()
            + self.listings.len()
            + self.personas.len()
    }

    pub(crate) fn apply(&mut self, upsert: DerivedUpsert) {
        match upsert {
            DerivedUpsert::Owner {
                contract,
                id,
                value,
            } => {
                self.owners.insert((contract, id), value);
            }
            DerivedUpsert::Balance {
                contract,
                id,
                holder,
                amount,
            } => {
                self.balances.insert((contract, id, holder), amount);
            }
            DerivedUpsert::Token { id, value } => {
                self.tokens.insert(id, value);
            }
            DerivedUpsert::Listing { value } => {
                self.listings.insert(value.listing_id, value);
            }
            DerivedUpsert::Persona { value } => {
                self.personas.insert(value.account, value);
            }
        }
    }
}

/// One entity write, as staged in a transaction and stored in the journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DerivedUpsert {
    Owner {
        contract: Address,
        id: TokenId,
        value: TokenOwner,
    },
    Balance {
        contract: Address,
        id: TokenId,
        holder: Address,
        amount: u128,
    },
    Token {
        id: TokenId,
        value: TokenState,
    },
    Listing {
        value: ListingState,
    },
    Persona {
        value: AccountPersona,
    },
}

/// Current entity values as seen from inside a transaction.
pub(crate) trait DerivedView {
    fn owner(&self, contract: &Address, id: &TokenId) -> Option<TokenOwner>;
    fn balance(&self, contract: &Address, id: &TokenId, holder: &Address) -> u128;
    fn token(&self, id: &TokenId) -> Option<TokenState>;
    fn listing(&self, id: &ListingId) -> Option<ListingState>;
    fn persona(&self, account: &Address) -> Option<AccountPersona>;
}

impl DerivedView for DerivedTables {
    fn owner(&self, contract: &Address, id: &TokenId) -> Option<TokenOwner> {
        DerivedTables::owner(self, contract, id).cloned()
    }

    fn balance(&self, contract: &Address, id: &TokenId, holder: &Address) -> u128 {
        DerivedTables::balance(self, contract, id, holder)
    }

    fn token(&self, id: &TokenId) -> Option<TokenState> {
        DerivedTables::token(self, id).cloned()
    }

    fn listing(&self, id: &ListingId) -> Option<ListingState> {
        DerivedTables::listing(self, id).cloned()
    }

    fn persona(&self, account: &Address) -> Option<AccountPersona> {
        DerivedTables::persona(self, account).cloned()
    }
}

// =====================================================================
// Fold rules
// =====================================================================

/// Computes the entity writes caused by one newly inserted record.
pub(crate) fn fold(
    view: &impl DerivedView,
    record: &EventRecord,
    aux: Option<&AuxData>,
) -> Result<Vec<DerivedUpsert>, StoreError> {
    let mut out = Vec::new();

    match &record.payload {
        EventPayload::Transfer(t) => {
            let owner = match view.owner(&t.contract, &t.id) {
                Some(mut current) => {
                    current.owner = t.to;
                    current.last_transfer = record.key;
                    current
                }
                None => TokenOwner {
                    owner: t.to,
                    minter: t.is_mint().then_some(t.to),
                    last_transfer: record.key,
                },
            };
            out.push(DerivedUpsert::Owner {
                contract: t.contract,
                id: t.id,
                value: owner,
            });

            // A self-transfer leaves every balance as it was.
            if t.from != t.to {
                if !t.from.is_zero() {
                    let held = view.balance(&t.contract, &t.id, &t.from);
                    if held < t.value {
                        // Tokens received before the genesis height are not
                        // in the local history.
                        warn!(
                            "[STORE] {} sends {} of token {} at {} but holds {} locally; clamping to zero",
                            t.from, t.value, t.id, record.key, held
                        );
                    }
                    out.push(DerivedUpsert::Balance {
                        contract: t.contract,
                        id: t.id,
                        holder: t.from,
                        amount: held.saturating_sub(t.value),
                    });
                }
                if !t.to.is_zero() {
                    let held = view.balance(&t.contract, &t.id, &t.to);
                    let amount = held.checked_add(t.value).ok_or_else(|| {
                        StoreError::Fold(format!(
                            "balance overflow for {} on token {}",
                            t.to, t.id
                        ))
                    })?;
                    out.push(DerivedUpsert::Balance {
                        contract: t.contract,
                        id: t.id,
                        holder: t.to,
                        amount,
                    });
                }
            }

            if let Some(aux) = aux {
                out.push(token_with_aux(view, t.id, aux));
            }
        }

        EventPayload::Claim(c) => {
            let mut state = view.token(&c.id).unwrap_or_default();
            state.author = Some(c.author);
            state.codec = Some(c.codec);
            state.claimed_at = Some(record.block_height());
            if let Some(aux) = aux {
                apply_aux(&mut state, aux);
            }
            out.push(DerivedUpsert::Token {
                id: c.id,
                value: state,
            });
        }

        EventPayload::List(l) => {
            let mut listing = view
                .listing(&l.listing_id)
                .unwrap_or_else(|| ListingState::empty(l.listing_id));
            listing.token = Some(l.token);
            listing.seller = Some(l.seller);
            listing.app = Some(l.app);
            listing.listed_at = Some(record.block_height());
            out.push(DerivedUpsert::Listing { value: listing });
        }

        EventPayload::Replenish(r) => {
            let mut listing = view
                .listing(&r.listing_id)
                .unwrap_or_else(|| ListingState::empty(r.listing_id));
            if listing.price_key.map_or(true, |k| k < record.key) {
                listing.price = Some(r.price);
                listing.price_key = Some(record.key);
            }
            listing.token.get_or_insert(r.token);
            listing.app.get_or_insert(r.app);
            listing.stock = listing
                .stock
                .checked_add(signed(r.amount, record)?)
                .ok_or_else(|| stock_overflow(record))?;
            out.push(DerivedUpsert::Listing { value: listing });
        }

        EventPayload::Withdraw(w) => {
            let mut listing = view
                .listing(&w.listing_id)
                .unwrap_or_else(|| ListingState::empty(w.listing_id));
            listing.token.get_or_insert(w.token);
            listing.app.get_or_insert(w.app);
            listing.stock = listing
                .stock
                .checked_sub(signed(w.amount, record)?)
                .ok_or_else(|| stock_overflow(record))?;
            out.push(DerivedUpsert::Listing { value: listing });
        }

        EventPayload::Purchase(p) => {
            let mut listing = view
                .listing(&p.listing_id)
                .unwrap_or_else(|| ListingState::empty(p.listing_id));
            listing.token.get_or_insert(p.token);
            listing.app.get_or_insert(p.app);
            listing.stock = listing
                .stock
                .checked_sub(signed(p.amount, record)?)
                .ok_or_else(|| stock_overflow(record))?;
            listing.sold = listing.sold.saturating_add(p.amount);
            out.push(DerivedUpsert::Listing { value: listing });
        }

        EventPayload::Persona(update) => {
            let mut persona = view
                .persona(&update.account)
                .unwrap_or_else(|| AccountPersona::empty(update.account));
            apply_persona(&mut persona, update);
            out.push(DerivedUpsert::Persona { value: persona });
        }
    }

    Ok(out)
}

fn token_with_aux(view: &impl DerivedView, id: TokenId, aux: &AuxData) -> DerivedUpsert {
    let mut state = view.token(&id).unwrap_or_default();
    apply_aux(&mut state, aux);
    DerivedUpsert::Token { id, value: state }
}

fn apply_aux(state: &mut TokenState, aux: &AuxData) {
    match aux {
        AuxData::TokenState {
            finalized,
            expires_at,
        } => {
            state.finalized = Some(*finalized);
            state.expires_at = *expires_at;
        }
    }
}

fn apply_persona(persona: &mut AccountPersona, update: &PersonaUpdate) {
    let target = match update.app {
        Some(app) => persona.apps.entry(app).or_default(),
        None => &mut persona.basic,
    };
    match &update.field {
        PersonaField::Pfp(token) => target.pfp = Some(*token),
        PersonaField::Bgp(token) => target.bgp = Some(*token),
        PersonaField::Pfa(uri) => target.pfa = Some(uri.clone()),
        PersonaField::Metadata(bytes) => target.metadata = Some(bytes.clone()),
    }
}

fn signed(amount: u128, record: &EventRecord) -> Result<i128, StoreError> {
    i128::try_from(amount).map_err(|_| stock_overflow(record))
}

fn stock_overflow(record: &EventRecord) -> StoreError {
    StoreError::Fold(format!("listing stock overflow at {}", record.key))
}
