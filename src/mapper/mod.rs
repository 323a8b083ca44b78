//! Raw log → typed event records.
//!
//! The mapper is a pure, synchronous function of its input. It holds only the
//! topic table computed at construction, so backfill and live tailing map the
//! same entry to the same records.


use std::collections::HashMap;

use ethers::abi::{self, ParamType, Token};
use ethers::types::U256;
use ethers::utils::keccak256;
use log::trace;
use thiserror::Error;

use crate::error::MalformedEventError;
use crate::events::{
    Address, Claim, EventPayload, EventRecord, List, NftRef, PersonaField, PersonaUpdate,
    PrimaryKey, Purchase, Replenish, StoreName, Transfer, Withdraw, Word,
};
use crate::sync::source::{LogFilter, RawLogEntry};

/// Why a log's topics or data could not be decoded.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error(transparent)]
    Abi(#[from] abi::Error),

    #[error("topic {0} is not an address")]
    NotAnAddress(usize),

    #[error("{field} does not fit in {bits} bits")]
    Overflow { field: &'static str, bits: u32 },

    #[error("expected {expected} for {field}")]
    UnexpectedToken {
        field: &'static str,
        expected: &'static str,
    },

    #[error("batch has {ids} ids but {values} values")]
    LengthMismatch { ids: usize, values: usize },
}

/// `(address, uint256)`, the ABI shape of the contracts' `NFT` struct.
fn nft_param() -> ParamType {
    ParamType::Tuple(vec![ParamType::Address, ParamType::Uint(256)])
}

/// `keccak256(abi.encode(contract, id, seller, app))`
pub fn listing_id(token: &NftRef, seller: &Address, app: &Address) -> Word {
    let encoded = abi::encode(&[
        Token::Address(token.contract.0),
        Token::Uint(token.id.to_uint()),
        Token::Address(seller.0),
        Token::Address(app.0),
    ]);
    Word(keccak256(encoded).into())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    TransferSingle,
    TransferBatch,
    Claim,
    List,
    Replenish,
    Withdraw,
    Purchase,
    SetBasicPfp,
    SetBasicBgp,
    SetBasicPfa,
    SetBasicMetadata,
    SetAppPfp,
    SetAppBgp,
    SetAppPfa,
    SetAppMetadata,
}

impl EventKind {
    pub const ALL: [EventKind; 15] = [
        EventKind::TransferSingle,
        EventKind::TransferBatch,
        EventKind::Claim,
        EventKind::List,
        EventKind::Replenish,
        EventKind::Withdraw,
        EventKind::Purchase,
        EventKind::SetBasicPfp,
        EventKind::SetBasicBgp,
        EventKind::SetBasicPfa,
        EventKind::SetBasicMetadata,
        EventKind::SetAppPfp,
        EventKind::SetAppBgp,
        EventKind::SetAppPfa,
        EventKind::SetAppMetadata,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            EventKind::TransferSingle => "TransferSingle",
            EventKind::TransferBatch => "TransferBatch",
            EventKind::Claim => "Claim",
            EventKind::List => "List",
            EventKind::Replenish => "Replenish",
            EventKind::Withdraw => "Withdraw",
            EventKind::Purchase => "Purchase",
            EventKind::SetBasicPfp => "SetBasicPfp",
            EventKind::SetBasicBgp => "SetBasicBgp",
            EventKind::SetBasicPfa => "SetBasicPfa",
            EventKind::SetBasicMetadata => "SetBasicMetadata",
            EventKind::SetAppPfp => "SetAppPfp",
            EventKind::SetAppBgp => "SetAppBgp",
            EventKind::SetAppPfa => "SetAppPfa",
            EventKind::SetAppMetadata => "SetAppMetadata",
        }
    }

    /// Event inputs in declaration order, each flagged `true` when indexed.
    pub fn params(&self) -> Vec<(ParamType, bool)> {
        use ParamType::{Address as Addr, Array, Bytes, FixedBytes, String as Str, Uint};
        match self {
            EventKind::TransferSingle => vec![
                (Addr, true),
                (Addr, true),
                (Addr, true),
                (Uint(256), false),
                (Uint(256), false),
            ],
            EventKind::TransferBatch => vec![
                (Addr, true),
                (Addr, true),
                (Addr, true),
                (Array(Box::new(Uint(256))), false),
                (Array(Box::new(Uint(256))), false),
            ],
            EventKind::Claim => vec![
                (Addr, false),
                (Addr, true),
                (Uint(256), false),
                (Uint(32), false),
            ],
            EventKind::List => vec![(nft_param(), false), (Addr, true), (Addr, true)],
            EventKind::Replenish => vec![
                (nft_param(), false),
                (Addr, true),
                (FixedBytes(32), true),
                (Uint(256), false),
                (Uint(256), false),
            ],
            EventKind::Withdraw => vec![
                (nft_param(), false),
                (Addr, true),
                (FixedBytes(32), true),
                (Addr, false),
                (Uint(256), false),
            ],
            EventKind::Purchase => vec![
                (nft_param(), false),
                (FixedBytes(32), true),
                (Addr, true),
                (Uint(256), false),
                (Uint(256), false),
                (Addr, false),
                (Uint(256), false),
                (Addr, true),
                (Uint(256), false),
                (Uint(256), false),
            ],
            EventKind::SetBasicPfp | EventKind::SetBasicBgp => {
                vec![(Addr, true), (Addr, false), (Uint(256), false)]
            }
            EventKind::SetBasicPfa => vec![(Addr, true), (Str, false)],
            EventKind::SetBasicMetadata => vec![(Addr, true), (Bytes, false)],
            EventKind::SetAppPfp | EventKind::SetAppBgp => vec![
                (Addr, true),
                (Addr, true),
                (Addr, false),
                (Uint(256), false),
            ],
            EventKind::SetAppPfa => vec![(Addr, true), (Addr, true), (Str, false)],
            EventKind::SetAppMetadata => vec![(Addr, true), (Addr, true), (Bytes, false)],
        }
    }

    /// `topic0`: keccak of the canonical signature.
    pub fn topic(&self) -> Word {
        let types: Vec<ParamType> = self.params().into_iter().map(|(p, _)| p).collect();
        Word(abi::long_signature(self.name(), &types))
    }

    /// Types of the non-indexed inputs, which make up the log data.
    fn data_params(&self) -> Vec<ParamType> {
        self.params()
            .into_iter()
            .filter_map(|(p, indexed)| (!indexed).then_some(p))
            .collect()
    }

    /// Number of topics including `topic0`.
    fn topic_count(&self) -> usize {
        1 + self.params().iter().filter(|(_, indexed)| *indexed).count()
    }

    pub fn store(&self) -> StoreName {
        match self {
            EventKind::TransferSingle | EventKind::TransferBatch => StoreName::Transfer,
            EventKind::Claim => StoreName::Claim,
            EventKind::List => StoreName::List,
            EventKind::Replenish => StoreName::Replenish,
            EventKind::Withdraw => StoreName::Withdraw,
            EventKind::Purchase => StoreName::Purchase,
            EventKind::SetBasicPfp => StoreName::PersonaBasicPfp,
            EventKind::SetBasicBgp => StoreName::PersonaBasicBgp,
            EventKind::SetBasicPfa => StoreName::PersonaBasicPfa,
            EventKind::SetBasicMetadata => StoreName::PersonaBasicMetadata,
            EventKind::SetAppPfp => StoreName::PersonaAppPfp,
            EventKind::SetAppBgp => StoreName::PersonaAppBgp,
            EventKind::SetAppPfa => StoreName::PersonaAppPfa,
            EventKind::SetAppMetadata => StoreName::PersonaAppMetadata,
        }
    }

    /// Position of the indexed app address, for stores filtered by app.
    fn app_topic(&self) -> Option<usize> {
        match self {
            EventKind::List => Some(2),
            EventKind::Replenish | EventKind::Withdraw => Some(1),
            EventKind::Purchase => Some(3),
            EventKind::SetAppPfp
            | EventKind::SetAppBgp
            | EventKind::SetAppPfa
            | EventKind::SetAppMetadata => Some(2),
            _ => None,
        }
    }
}

/// Maps raw logs to event records.
#[derive(Debug, Clone)]
pub struct EventMapper {
    kinds: HashMap<Word, EventKind>,
}

impl Default for EventMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl EventMapper {
    pub fn new() -> Self {
        let kinds = EventKind::ALL
            .into_iter()
            .map(|kind| (kind.topic(), kind))
            .collect();
        Self { kinds }
    }

    pub fn kind_of(&self, entry: &RawLogEntry) -> Option<EventKind> {
        entry
            .topics
            .first()
            .and_then(|topic| self.kinds.get(topic))
            .copied()
    }

    /// Log filter selecting every event of `store` emitted by `contract`,
    /// optionally restricted to one app.
    pub fn filter(store: StoreName, contract: Address, app: Option<Address>) -> LogFilter {
        let kinds: Vec<EventKind> = EventKind::ALL
            .into_iter()
            .filter(|kind| kind.store() == store)
            .collect();

        let mut filter =
            LogFilter::new(contract).with_topic(0, kinds.iter().map(EventKind::topic).collect());

        if let (Some(app), Some(position)) = (app, kinds.first().and_then(EventKind::app_topic)) {
            filter = filter.with_topic(position, vec![Word::from_address(&app)]);
        }
        filter
    }

    /// Maps one raw entry. A batched transfer yields one record per id with
    /// `sub_index` set to its position in the batch.
    pub fn map(&self, entry: &RawLogEntry) -> Result<Vec<EventRecord>, MalformedEventError> {
        let malformed = |reason: String| MalformedEventError {
            block_height: entry.block_height,
            log_index: entry.log_index,
            reason,
        };

        let kind = self.kind_of(entry).ok_or_else(|| {
            malformed(match entry.topics.first() {
                Some(topic) => format!("unknown event topic {topic}"),
                None => "log has no topics".to_string(),
            })
        })?;

        if entry.topics.len() != kind.topic_count() {
            return Err(malformed(format!(
                "{:?} expects {} topics, got {}",
                kind,
                kind.topic_count(),
                entry.topics.len()
            )));
        }

        let records = decode(kind, entry).map_err(|e| malformed(format!("{kind:?}: {e}")))?;
        trace!(
            "[MAPPER] {:?} at ({},{}) -> {} records",
            kind,
            entry.block_height,
            entry.log_index,
            records.len()
        );
        Ok(records)
    }
}

fn topic_address(entry: &RawLogEntry, index: usize) -> Result<Address, DecodeError> {
    entry.topics[index]
        .to_address()
        .ok_or(DecodeError::NotAnAddress(index))
}

/// Cursor over the decoded data tokens of one log.
struct Fields {
    tokens: std::vec::IntoIter<Token>,
}

impl Fields {
    fn next(&mut self, field: &'static str, expected: &'static str) -> Result<Token, DecodeError> {
        self.tokens
            .next()
            .ok_or(DecodeError::UnexpectedToken { field, expected })
    }

    fn address(&mut self, field: &'static str) -> Result<Address, DecodeError> {
        match self.next(field, "address")? {
            Token::Address(a) => Ok(Address(a)),
            _ => Err(DecodeError::UnexpectedToken {
                field,
                expected: "address",
            }),
        }
    }

    fn uint(&mut self, field: &'static str) -> Result<U256, DecodeError> {
        match self.next(field, "uint")? {
            Token::Uint(v) => Ok(v),
            _ => Err(DecodeError::UnexpectedToken {
                field,
                expected: "uint",
            }),
        }
    }

    fn word(&mut self, field: &'static str) -> Result<Word, DecodeError> {
        self.uint(field).map(Word::from_uint)
    }

    fn u128(&mut self, field: &'static str) -> Result<u128, DecodeError> {
        to_u128(self.uint(field)?, field)
    }

    fn u32(&mut self, field: &'static str) -> Result<u32, DecodeError> {
        let value = self.uint(field)?;
        if value.bits() > 32 {
            return Err(DecodeError::Overflow { field, bits: 32 });
        }
        Ok(value.as_u32())
    }

    fn nft(&mut self, field: &'static str) -> Result<NftRef, DecodeError> {
        match self.next(field, "(address,uint256)")? {
            Token::Tuple(parts) => Fields {
                tokens: parts.into_iter(),
            }
            .flat_nft(field),
            _ => Err(DecodeError::UnexpectedToken {
                field,
                expected: "(address,uint256)",
            }),
        }
    }

    /// An NFT reference spread over two consecutive inputs.
    fn flat_nft(&mut self, field: &'static str) -> Result<NftRef, DecodeError> {
        Ok(NftRef {
            contract: self.address(field)?,
            id: self.word(field)?,
        })
    }

    fn uints(&mut self, field: &'static str) -> Result<Vec<U256>, DecodeError> {
        match self.next(field, "uint256[]")? {
            Token::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Token::Uint(v) => Ok(v),
                    _ => Err(DecodeError::UnexpectedToken {
                        field,
                        expected: "uint256",
                    }),
                })
                .collect(),
            _ => Err(DecodeError::UnexpectedToken {
                field,
                expected: "uint256[]",
            }),
        }
    }

    fn string(&mut self, field: &'static str) -> Result<String, DecodeError> {
        match self.next(field, "string")? {
            Token::String(s) => Ok(s),
            _ => Err(DecodeError::UnexpectedToken {
                field,
                expected: "string",
            }),
        }
    }

    fn bytes(&mut self, field: &'static str) -> Result<Vec<u8>, DecodeError> {
        match self.next(field, "bytes")? {
            Token::Bytes(b) => Ok(b),
            _ => Err(DecodeError::UnexpectedToken {
                field,
                expected: "bytes",
            }),
        }
    }
}

fn to_u128(value: U256, field: &'static str) -> Result<u128, DecodeError> {
    if value.bits() > 128 {
        return Err(DecodeError::Overflow { field, bits: 128 });
    }
    Ok(value.as_u128())
}

fn decode(kind: EventKind, entry: &RawLogEntry) -> Result<Vec<EventRecord>, DecodeError> {
    let mut data = Fields {
        tokens: abi::decode(&kind.data_params(), &entry.data)?.into_iter(),
    };
    let record = |sub_index: u64, payload: EventPayload| {
        EventRecord::new(
            PrimaryKey::new(entry.block_height, entry.log_index, sub_index),
            entry.tx_hash,
            payload,
        )
    };
    let single = |payload: EventPayload| Ok(vec![record(0, payload)]);

    match kind {
        EventKind::TransferSingle => single(EventPayload::Transfer(Transfer {
            contract: entry.address,
            operator: topic_address(entry, 1)?,
            from: topic_address(entry, 2)?,
            to: topic_address(entry, 3)?,
            id: data.word("id")?,
            value: data.u128("value")?,
        })),

        EventKind::TransferBatch => {
            let operator = topic_address(entry, 1)?;
            let from = topic_address(entry, 2)?;
            let to = topic_address(entry, 3)?;
            let ids = data.uints("ids")?;
            let values = data.uints("values")?;
            if ids.len() != values.len() {
                return Err(DecodeError::LengthMismatch {
                    ids: ids.len(),
                    values: values.len(),
                });
            }

            ids.into_iter()
                .zip(values)
                .enumerate()
                .map(|(i, (id, value))| {
                    Ok(record(
                        i as u64,
                        EventPayload::Transfer(Transfer {
                            contract: entry.address,
                            operator,
                            from,
                            to,
                            id: Word::from_uint(id),
                            value: to_u128(value, "values")?,
                        }),
                    ))
                })
                .collect()
        }

        EventKind::Claim => single(EventPayload::Claim(Claim {
            contract: entry.address,
            operator: data.address("operator")?,
            author: topic_address(entry, 1)?,
            id: data.word("id")?,
            codec: data.u32("codec")?,
        })),

        EventKind::List => {
            let token = data.nft("token")?;
            let seller = topic_address(entry, 1)?;
            let app = topic_address(entry, 2)?;
            single(EventPayload::List(List {
                token,
                seller,
                app,
                listing_id: listing_id(&token, &seller, &app),
            }))
        }

        EventKind::Replenish => single(EventPayload::Replenish(Replenish {
            token: data.nft("token")?,
            app: topic_address(entry, 1)?,
            listing_id: entry.topics[2],
            price: data.u128("price")?,
            amount: data.u128("amount")?,
        })),

        EventKind::Withdraw => single(EventPayload::Withdraw(Withdraw {
            token: data.nft("token")?,
            app: topic_address(entry, 1)?,
            listing_id: entry.topics[2],
            to: data.address("to")?,
            amount: data.u128("amount")?,
        })),

        EventKind::Purchase => single(EventPayload::Purchase(Purchase {
            token: data.nft("token")?,
            listing_id: entry.topics[1],
            buyer: topic_address(entry, 2)?,
            amount: data.u128("amount")?,
            income: data.u128("income")?,
            royalty_address: data.address("royaltyAddress")?,
            royalty_value: data.u128("royaltyValue")?,
            app: topic_address(entry, 3)?,
            app_fee: data.u128("appFee")?,
            profit: data.u128("profit")?,
        })),

        EventKind::SetBasicPfp
        | EventKind::SetBasicBgp
        | EventKind::SetBasicPfa
        | EventKind::SetBasicMetadata
        | EventKind::SetAppPfp
        | EventKind::SetAppBgp
        | EventKind::SetAppPfa
        | EventKind::SetAppMetadata => {
            let account = topic_address(entry, 1)?;
            let app = match kind.app_topic() {
                Some(position) => Some(topic_address(entry, position)?),
                None => None,
            };
            let field = match kind {
                EventKind::SetBasicPfp | EventKind::SetAppPfp => {
                    PersonaField::Pfp(data.flat_nft("pfp")?)
                }
                EventKind::SetBasicBgp | EventKind::SetAppBgp => {
                    PersonaField::Bgp(data.flat_nft("bgp")?)
                }
                EventKind::SetBasicPfa | EventKind::SetAppPfa => {
                    PersonaField::Pfa(data.string("pfa")?)
                }
                _ => PersonaField::Metadata(data.bytes("metadata")?),
            };
            single(EventPayload::Persona(PersonaUpdate {
                account,
                app,
                field,
            }))
        }
    }
}
