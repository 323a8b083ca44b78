use std::fmt;
use std::str::FromStr;

use ethers::types::{H160, H256, U256};
use serde::{Deserialize, Serialize};

/// Error returned when a hex value cannot be parsed into a fixed-width type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind}: {reason}")]
pub struct ParseHexError {
    kind: &'static str,
    reason: String,
}

fn strip_0x(s: &str) -> &str {
    let s = s.trim();
    s.strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s)
}

// =====================================================================
// Address
// =====================================================================

/// A 20-byte account or contract address.
///
/// Always rendered as full lowercase `0x`-prefixed hex so that index keys
/// built from addresses compare the same way regardless of the checksum
/// casing the chain node used.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(pub H160);

impl Address {
    pub const ZERO: Address = Address(H160([0u8; 20]));

    pub const fn repeat_byte(byte: u8) -> Self {
        Address(H160([byte; 20]))
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl From<H160> for Address {
    fn from(value: H160) -> Self {
        Address(value)
    }
}

impl From<Address> for H160 {
    fn from(value: Address) -> Self {
        value.0
    }
}

impl FromStr for Address {
    type Err = ParseHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        H160::from_str(strip_0x(s))
            .map(Address)
            .map_err(|e| ParseHexError {
                kind: "address",
                reason: e.to_string(),
            })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

// =====================================================================
// Word
// =====================================================================

/// A 32-byte ABI word: token ids, listing ids, topics and transaction hashes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Word(pub H256);

/// ERC-1155 token ids are full 256-bit words (the IPFT ids are CID digests).
pub type TokenId = Word;

/// `keccak256(abi.encode(contract, id, seller, app))`.
pub type ListingId = Word;

impl Word {
    pub const ZERO: Word = Word(H256([0u8; 32]));

    pub const fn repeat_byte(byte: u8) -> Self {
        Word(H256([byte; 32]))
    }

    pub fn from_u64(value: u64) -> Self {
        Self::from_uint(U256::from(value))
    }

    pub fn from_u128(value: u128) -> Self {
        Self::from_uint(U256::from(value))
    }

    pub fn from_uint(value: U256) -> Self {
        let mut out = [0u8; 32];
        value.to_big_endian(&mut out);
        Word(H256(out))
    }

    /// The word read as a big-endian `uint256`.
    pub fn to_uint(&self) -> U256 {
        U256::from_big_endian(self.0.as_bytes())
    }

    /// Left-pads an address into a word, as the ABI encodes `address`.
    pub fn from_address(address: &Address) -> Self {
        Word(H256::from(address.0))
    }

    /// Returns the value if it fits in 128 bits.
    pub fn to_u128(&self) -> Option<u128> {
        let value = self.to_uint();
        (value.bits() <= 128).then(|| value.as_u128())
    }

    pub fn to_u64(&self) -> Option<u64> {
        self.to_u128().and_then(|v| u64::try_from(v).ok())
    }

    /// Interprets the word as an ABI-encoded address (upper 12 bytes zero).
    pub fn to_address(&self) -> Option<Address> {
        if self.0[..12].iter().any(|b| *b != 0) {
            return None;
        }
        Some(Address(H160::from(self.0)))
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl From<H256> for Word {
    fn from(value: H256) -> Self {
        Word(value)
    }
}

impl From<Word> for H256 {
    fn from(value: Word) -> Self {
        value.0
    }
}

impl FromStr for Word {
    type Err = ParseHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        H256::from_str(strip_0x(s))
            .map(Word)
            .map_err(|e| ParseHexError {
                kind: "word",
                reason: e.to_string(),
            })
    }
}

impl fmt::Display for Word {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for Word {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Word({})", self)
    }
}

/// A token reference: the contract that minted it and its id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NftRef {
    pub contract: Address,
    pub id: TokenId,
}
