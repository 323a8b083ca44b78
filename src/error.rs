use std::io;

use ethers::providers::{ProviderError, RpcError};
use thiserror::Error;

use crate::events::{PrimaryKey, StoreName};

/// A raw log entry did not match the shape of any known event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed log at block {block_height} index {log_index}: {reason}")]
pub struct MalformedEventError {
    pub block_height: u64,
    pub log_index: u64,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate key {key} in {store}")]
    DuplicateKey { store: StoreName, key: PrimaryKey },

    #[error("checkpoint regression in {store}: current {current}, requested {requested}")]
    CheckpointRegression {
        store: StoreName,
        current: u64,
        requested: u64,
    },

    #[error("unknown index {index} on {store}")]
    UnknownIndex { store: StoreName, index: String },

    #[error("record for {found} cannot be written to {expected}")]
    WrongStore { expected: StoreName, found: StoreName },

    #[error("fold failed: {0}")]
    Fold(String),

    #[error("journal I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("journal encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("journal corrupted: {0}")]
    Corrupted(String),

    #[error("journal refuses writes: {0}")]
    JournalPoisoned(String),

    #[error("journal schema v{found} is newer than supported v{supported}")]
    UnsupportedSchema { found: u32, supported: u32 },

    #[error("database lock poisoned")]
    Poisoned,

    #[error("commit task failed: {0}")]
    Task(String),
}

impl StoreError {
    /// Commit failures caused by the environment are worth retrying,
    /// invariant violations are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Io(_) | StoreError::Task(_))
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("unexpected response: {0}")]
    Decode(String),

    #[error("source unavailable: {0}")]
    Unavailable(String),
}

impl SourceError {
    /// Undecodable responses are fatal; everything else is retried.
    pub fn is_transient(&self) -> bool {
        !matches!(self, SourceError::Decode(_))
    }
}

impl From<ProviderError> for SourceError {
    fn from(err: ProviderError) -> Self {
        if let Some(response) = err.as_error_response() {
            return SourceError::Rpc {
                code: response.code,
                message: response.message.clone(),
            };
        }
        if err.as_serde_error().is_some() {
            return SourceError::Decode(err.to_string());
        }
        SourceError::Transport(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("side-effect lookup failed: {0}")]
    Source(#[from] SourceError),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Malformed(#[from] MalformedEventError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<SyncError> },

    #[error("session task aborted: {0}")]
    Aborted(String),
}

impl SyncError {
    /// Transient errors abort the batch and retry it from the same checkpoint.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Source(e) => e.is_transient(),
            SyncError::Resolve(ResolveError::Source(e)) => e.is_transient(),
            SyncError::Store(e) => e.is_transient(),
            SyncError::Malformed(_)
            | SyncError::RetriesExhausted { .. }
            | SyncError::Aborted(_) => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io { path: String, source: io::Error },

    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        let malformed = SyncError::from(MalformedEventError {
            block_height: 1,
            log_index: 0,
            reason: "short data".into(),
        });
        assert!(!malformed.is_transient());

        let regression = SyncError::from(StoreError::CheckpointRegression {
            store: StoreName::Transfer,
            current: 10,
            requested: 5,
        });
        assert!(!regression.is_transient());

        let io = SyncError::from(StoreError::Io(io::Error::other("disk")));
        assert!(io.is_transient());

        let source = SyncError::from(SourceError::Unavailable("down".into()));
        assert!(source.is_transient());

        let rpc = SyncError::from(SourceError::Rpc {
            code: -32005,
            message: "limit exceeded".into(),
        });
        assert!(rpc.is_transient());

        let decode = SyncError::from(SourceError::Decode("result is not an array".into()));
        assert!(!decode.is_transient());

        let resolve = SyncError::from(ResolveError::Source(SourceError::Decode("bool".into())));
        assert!(!resolve.is_transient());
    }
}
