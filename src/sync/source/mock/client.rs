use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::SourceError;
use crate::events::{Address, TokenId};
use crate::sync::resolver::ContractReader;
use crate::sync::source::api::group_by_block;
use crate::sync::source::{ChainLogSource, LiveBlock, LogFilter, RawLogEntry, Subscription};

const DEFAULT_CAPACITY: usize = 1024;

struct Subscriber {
    filter: LogFilter,
    tx: mpsc::Sender<LiveBlock>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct MockChain {
    head: u64,
    logs: Vec<RawLogEntry>,
    failures: VecDeque<SourceError>,
    queries: Vec<(u64, u64)>,
    subscribe_calls: usize,
    subscribers: Vec<Subscriber>,
    token_states: HashMap<(Address, TokenId), (bool, Option<u64>)>,
}

impl MockChain {
    fn insert(&mut self, entries: Vec<RawLogEntry>) {
        for entry in entries {
            self.head = self.head.max(entry.block_height);
            self.logs.push(entry);
        }
        self.logs
            .sort_by_key(|entry| (entry.block_height, entry.log_index));
    }

    fn take_failure(&mut self) -> Result<(), SourceError> {
        match self.failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn matching(&self, filter: &LogFilter, from: u64, to: u64) -> Vec<RawLogEntry> {
        self.logs
            .iter()
            .filter(|e| e.block_height >= from && e.block_height <= to && filter.matches(e))
            .cloned()
            .collect()
    }
}

/// In-memory chain for tests: controllable head, failure injection and
/// subscription drops.
#[derive(Clone, Default)]
pub struct MockChainSource {
    inner: Arc<Mutex<MockChain>>,
}

impl MockChainSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn chain(&self) -> MutexGuard<'_, MockChain> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds historical logs without notifying subscribers. Raises the head to
    /// the highest block seen.
    pub fn push_logs(&self, entries: Vec<RawLogEntry>) {
        self.chain().insert(entries);
    }

    /// Mines block `height` with `entries` and pushes it to live subscribers.
    pub fn mine(&self, height: u64, entries: Vec<RawLogEntry>) {
        let mut chain = self.chain();
        chain.insert(entries.clone());
        chain.head = chain.head.max(height);

        chain.subscribers.retain(|sub| {
            if sub.cancel.is_cancelled() || sub.tx.is_closed() {
                return false;
            }
            let matching: Vec<RawLogEntry> = entries
                .iter()
                .filter(|e| sub.filter.matches(e))
                .cloned()
                .collect();
            if matching.is_empty() {
                return true;
            }
            sub.tx
                .try_send(LiveBlock {
                    height,
                    entries: matching,
                })
                .is_ok()
        });
    }

    pub fn set_head(&self, height: u64) {
        self.chain().head = height;
    }

    /// The next `count` log queries or contract reads fail with a transient
    /// error. Head queries are never failed.
    pub fn fail_next(&self, count: u32) {
        let mut chain = self.chain();
        chain.failures.clear();
        chain
            .failures
            .extend((0..count).map(|_| SourceError::Unavailable("injected failure".into())));
    }

    /// Queues `err` for the next log query or contract read.
    pub fn fail_next_with(&self, err: SourceError) {
        self.chain().failures.push_back(err);
    }

    /// Closes every live subscription, as a dropped connection would.
    pub fn drop_subscriptions(&self) {
        self.chain().subscribers.clear();
    }

    /// Ranges passed to `query_logs`, in call order.
    pub fn queries(&self) -> Vec<(u64, u64)> {
        self.chain().queries.clone()
    }

    /// What `isFinalized` / `expiredAt` report for a token.
    pub fn set_token_state(
        &self,
        contract: Address,
        id: TokenId,
        finalized: bool,
        expires_at: Option<u64>,
    ) {
        self.chain()
            .token_states
            .insert((contract, id), (finalized, expires_at));
    }

    pub fn subscribe_calls(&self) -> usize {
        self.chain().subscribe_calls
    }

    pub fn live_subscribers(&self) -> usize {
        self.chain()
            .subscribers
            .iter()
            .filter(|s| !s.cancel.is_cancelled() && !s.tx.is_closed())
            .count()
    }
}

impl ChainLogSource for MockChainSource {
    async fn head_height(&self) -> Result<u64, SourceError> {
        Ok(self.chain().head)
    }

    async fn query_logs(
        &self,
        filter: &LogFilter,
        from: u64,
        to: u64,
    ) -> Result<Vec<RawLogEntry>, SourceError> {
        let mut chain = self.chain();
        chain.queries.push((from, to));
        chain.take_failure()?;
        Ok(chain.matching(filter, from, to))
    }

    async fn subscribe(&self, filter: &LogFilter, from: u64) -> Result<Subscription, SourceError> {
        let mut chain = self.chain();
        chain.subscribe_calls += 1;

        let (tx, rx) = mpsc::channel(DEFAULT_CAPACITY);
        let cancel = CancellationToken::new();

        // Blocks mined between the end of backfill and this call.
        let head = chain.head;
        for block in group_by_block(chain.matching(filter, from, head)) {
            tx.try_send(block)
                .map_err(|e| SourceError::Unavailable(format!("catch-up overflow: {e}")))?;
        }

        chain.subscribers.push(Subscriber {
            filter: filter.clone(),
            tx,
            cancel: cancel.clone(),
        });
        Ok(Subscription::new(rx, cancel))
    }
}

impl ContractReader for MockChainSource {
    async fn is_finalized(&self, contract: Address, id: TokenId) -> Result<bool, SourceError> {
        let mut chain = self.chain();
        chain.take_failure()?;
        Ok(chain
            .token_states
            .get(&(contract, id))
            .map_or(false, |(finalized, _)| *finalized))
    }

    async fn expired_at(&self, contract: Address, id: TokenId) -> Result<Option<u64>, SourceError> {
        let mut chain = self.chain();
        chain.take_failure()?;
        Ok(chain
            .token_states
            .get(&(contract, id))
            .and_then(|(_, expires_at)| *expires_at))
    }
}
