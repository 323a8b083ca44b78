use std::future::Future;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::SourceError;
use crate::events::{Address, Word};

/// One log entry as the chain node reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLogEntry {
    pub address: Address,
    pub topics: Vec<Word>,
    pub data: Vec<u8>,
    pub block_height: u64,
    pub log_index: u64,
    pub tx_hash: Word,
}

/// Every matching log of one block, delivered as a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveBlock {
    pub height: u64,
    pub entries: Vec<RawLogEntry>,
}

/// Log filter: emitting contract plus per-position topic alternatives.
///
/// `topics[i] == None` matches anything at position `i`; `Some(set)` matches
/// any of the listed words.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LogFilter {
    pub address: Address,
    pub topics: Vec<Option<Vec<Word>>>,
}

impl LogFilter {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            topics: Vec::new(),
        }
    }

    /// Restricts topic position `position` to `values`.
    pub fn with_topic(mut self, position: usize, values: Vec<Word>) -> Self {
        if self.topics.len() <= position {
            self.topics.resize(position + 1, None);
        }
        self.topics[position] = Some(values);
        self
    }

    pub fn matches(&self, entry: &RawLogEntry) -> bool {
        if entry.address != self.address {
            return false;
        }
        self.topics.iter().enumerate().all(|(i, allowed)| match allowed {
            None => true,
            Some(values) => entry
                .topics
                .get(i)
                .is_some_and(|topic| values.contains(topic)),
        })
    }
}

/// Live feed handed out by [`ChainLogSource::subscribe`].
///
/// Dropping it cancels the producer. `recv` returning `None` means the source
/// dropped the subscription.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::Receiver<LiveBlock>,
    cancel: CancellationToken,
}

impl Subscription {
    pub fn new(rx: mpsc::Receiver<LiveBlock>, cancel: CancellationToken) -> Self {
        Self { rx, cancel }
    }

    pub async fn recv(&mut self) -> Option<LiveBlock> {
        self.rx.recv().await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Append-only chain log source.
///
/// `query_logs` must return entries ordered by `(block_height, log_index)`.
/// `subscribe` delivers every matching block at or above `from`, in height
/// order, including blocks that already exist when it is called.
pub trait ChainLogSource: Send + Sync + 'static {
    fn head_height(&self) -> impl Future<Output = Result<u64, SourceError>> + Send;

    fn query_logs(
        &self,
        filter: &LogFilter,
        from: u64,
        to: u64,
    ) -> impl Future<Output = Result<Vec<RawLogEntry>, SourceError>> + Send;

    fn subscribe(
        &self,
        filter: &LogFilter,
        from: u64,
    ) -> impl Future<Output = Result<Subscription, SourceError>> + Send;
}

/// Groups ordered entries into per-block batches.
pub fn group_by_block(entries: Vec<RawLogEntry>) -> Vec<LiveBlock> {
    let mut blocks: Vec<LiveBlock> = Vec::new();
    for entry in entries {
        match blocks.last_mut() {
            Some(block) if block.height == entry.block_height => block.entries.push(entry),
            _ => blocks.push(LiveBlock {
                height: entry.block_height,
                entries: vec![entry],
            }),
        }
    }
    blocks
}
