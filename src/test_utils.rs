//! Raw log builders shared by the unit tests.

use ethers::abi::{encode, Token};

use crate::events::{Address, NftRef, Word};
use crate::mapper::{self, EventKind};
use crate::sync::source::RawLogEntry;

pub const IPFT: Address = Address::repeat_byte(0x1f);
pub const STORE: Address = Address::repeat_byte(0x5e);
pub const PERSONA: Address = Address::repeat_byte(0x9e);
pub const APP: Address = Address::repeat_byte(0xa9);

pub fn addr(byte: u8) -> Address {
    Address::repeat_byte(byte)
}

fn topic(address: &Address) -> Word {
    Word::from_address(address)
}

fn address(a: &Address) -> Token {
    Token::Address(a.0)
}

fn uint(value: u128) -> Token {
    Token::Uint(value.into())
}

fn nft(token: &NftRef) -> Token {
    Token::Tuple(vec![address(&token.contract), Token::Uint(token.id.to_uint())])
}

fn raw(
    address: Address,
    kind: EventKind,
    indexed: Vec<Word>,
    data: Vec<u8>,
    height: u64,
    log_index: u64,
) -> RawLogEntry {
    let mut topics = vec![kind.topic()];
    topics.extend(indexed);
    RawLogEntry {
        address,
        topics,
        data,
        block_height: height,
        log_index,
        tx_hash: Word::from_u64(height * 1_000 + log_index),
    }
}

pub fn transfer_single(
    height: u64,
    log_index: u64,
    from: Address,
    to: Address,
    id: u64,
    value: u128,
) -> RawLogEntry {
    raw(
        IPFT,
        EventKind::TransferSingle,
        vec![topic(&from), topic(&from), topic(&to)],
        encode(&[uint(id as u128), uint(value)]),
        height,
        log_index,
    )
}

pub fn transfer_batch(
    height: u64,
    log_index: u64,
    from: Address,
    to: Address,
    ids: &[u64],
    values: &[u128],
) -> RawLogEntry {
    raw(
        IPFT,
        EventKind::TransferBatch,
        vec![topic(&from), topic(&from), topic(&to)],
        encode(&[
            Token::Array(ids.iter().map(|id| uint(*id as u128)).collect()),
            Token::Array(values.iter().map(|v| uint(*v)).collect()),
        ]),
        height,
        log_index,
    )
}

pub fn claim(height: u64, log_index: u64, author: Address, id: u64, codec: u32) -> RawLogEntry {
    raw(
        IPFT,
        EventKind::Claim,
        vec![topic(&author)],
        encode(&[address(&author), uint(id as u128), uint(codec as u128)]),
        height,
        log_index,
    )
}

pub fn token(id: u64) -> NftRef {
    NftRef {
        contract: IPFT,
        id: Word::from_u64(id),
    }
}

pub fn list(height: u64, log_index: u64, id: u64, seller: Address) -> RawLogEntry {
    let token = token(id);
    raw(
        STORE,
        EventKind::List,
        vec![topic(&seller), topic(&APP)],
        encode(&[nft(&token)]),
        height,
        log_index,
    )
}

pub fn listing_id(id: u64, seller: Address) -> Word {
    mapper::listing_id(&token(id), &seller, &APP)
}

pub fn replenish(
    height: u64,
    log_index: u64,
    id: u64,
    seller: Address,
    price: u128,
    amount: u128,
) -> RawLogEntry {
    let token = token(id);
    raw(
        STORE,
        EventKind::Replenish,
        vec![topic(&APP), listing_id(id, seller)],
        encode(&[nft(&token), uint(price), uint(amount)]),
        height,
        log_index,
    )
}

pub fn purchase(
    height: u64,
    log_index: u64,
    id: u64,
    seller: Address,
    buyer: Address,
    amount: u128,
) -> RawLogEntry {
    let token = token(id);
    raw(
        STORE,
        EventKind::Purchase,
        vec![listing_id(id, seller), topic(&buyer), topic(&APP)],
        encode(&[
            nft(&token),
            uint(amount),
            uint(amount * 100),
            address(&seller),
            uint(0),
            uint(1),
            uint(amount * 100 - 1),
        ]),
        height,
        log_index,
    )
}

pub fn set_basic_pfa(height: u64, log_index: u64, account: Address, uri: &str) -> RawLogEntry {
    raw(
        PERSONA,
        EventKind::SetBasicPfa,
        vec![topic(&account)],
        encode(&[Token::String(uri.to_string())]),
        height,
        log_index,
    )
}

pub fn set_app_pfp(
    height: u64,
    log_index: u64,
    account: Address,
    pfp: NftRef,
) -> RawLogEntry {
    raw(
        PERSONA,
        EventKind::SetAppPfp,
        vec![topic(&account), topic(&APP)],
        encode(&[address(&pfp.contract), Token::Uint(pfp.id.to_uint())]),
        height,
        log_index,
    )
}
