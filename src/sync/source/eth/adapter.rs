//! Ethereum adapter over an `ethers` provider.
//!
//! Implements [`ChainLogSource`] with `eth_blockNumber` / `eth_getLogs`, and
//! [`ContractReader`] with `eth_call`.
//!
//! # Live subscription
//! HTTP has no push channel, so `subscribe` spawns a background task that
//! polls the head and fetches every new block range with `eth_getLogs`. All
//! logs of a block come from the same response, so each block is sent whole.
//! After `max_poll_failures` consecutive errors the task stops and the
//! channel closes, which the session treats as a dropped subscription.

use std::sync::Arc;
use std::time::Duration;

use ethers::abi::{self, ParamType, Token};
use ethers::providers::{Http, JsonRpcClient, Middleware, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Filter, Log, TransactionRequest, ValueOrArray, U256};
use ethers::utils;
use log::{debug, error, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::SourceError;
use crate::events::{Address, TokenId, Word};
use crate::sync::resolver::ContractReader;
use crate::sync::source::api::group_by_block;
use crate::sync::source::{ChainLogSource, LiveBlock, LogFilter, RawLogEntry, Subscription};

/// Widest block range a single poll asks for.
const MAX_POLL_RANGE: u64 = 1_000;

/// `eth_getLogs` filter for a block range.
pub fn to_filter(filter: &LogFilter, from: u64, to: u64) -> Filter {
    let mut out = Filter::new()
        .address(filter.address.0)
        .from_block(from)
        .to_block(to);

    for (slot, position) in out.topics.iter_mut().zip(&filter.topics) {
        *slot = position
            .as_ref()
            .map(|values| ValueOrArray::Array(values.iter().map(|w| Some(w.0)).collect()));
    }
    out
}

impl TryFrom<Log> for RawLogEntry {
    type Error = SourceError;

    fn try_from(log: Log) -> Result<Self, Self::Error> {
        let block_height = log
            .block_number
            .ok_or_else(|| SourceError::Decode("log without block number".into()))?
            .as_u64();
        let log_index = log
            .log_index
            .ok_or_else(|| SourceError::Decode("log without log index".into()))?;
        if log_index > U256::from(u64::MAX) {
            return Err(SourceError::Decode(format!("log index {log_index} out of range")));
        }
        let tx_hash = log
            .transaction_hash
            .ok_or_else(|| SourceError::Decode("log without transaction hash".into()))?;

        Ok(RawLogEntry {
            address: log.address.into(),
            topics: log.topics.into_iter().map(Word::from).collect(),
            data: log.data.to_vec(),
            block_height,
            log_index: log_index.as_u64(),
            tx_hash: tx_hash.into(),
        })
    }
}

// =====================================================================
// ChainLogSource
// =====================================================================

#[derive(Debug)]
pub struct EthSource<P: JsonRpcClient = Http> {
    provider: Arc<Provider<P>>,
    poll_interval: Duration,
    max_poll_failures: u32,
    buffer: usize,
}

impl<P: JsonRpcClient> Clone for EthSource<P> {
    fn clone(&self) -> Self {
        Self {
            provider: self.provider.clone(),
            poll_interval: self.poll_interval,
            max_poll_failures: self.max_poll_failures,
            buffer: self.buffer,
        }
    }
}

impl EthSource<Http> {
    pub fn new(url: &str, poll_interval: Duration, buffer: usize) -> Result<Self, SourceError> {
        let provider = Provider::<Http>::try_from(url)
            .map_err(|e| SourceError::Transport(format!("bad rpc url {url}: {e}")))?;
        Ok(Self::with_provider(provider, poll_interval, buffer))
    }
}

impl<P: JsonRpcClient + 'static> EthSource<P> {
    pub fn with_provider(provider: Provider<P>, poll_interval: Duration, buffer: usize) -> Self {
        Self {
            provider: Arc::new(provider),
            poll_interval,
            max_poll_failures: 5,
            buffer: buffer.max(1),
        }
    }

    pub fn with_max_poll_failures(mut self, max: u32) -> Self {
        self.max_poll_failures = max.max(1);
        self
    }

    pub fn provider(&self) -> &Provider<P> {
        &self.provider
    }

    /// `eth_call` of a `(uint256)` view function at the latest block.
    async fn call(&self, contract: Address, signature: &str, token: &TokenId) -> Result<Vec<u8>, SourceError> {
        let mut data = utils::id(signature).to_vec();
        data.extend(abi::encode(&[Token::Uint(token.to_uint())]));
        let tx: TypedTransaction = TransactionRequest::new().to(contract.0).data(data).into();
        let out = self.provider.call(&tx, None).await?;
        Ok(out.to_vec())
    }
}

async fn block_number<P: JsonRpcClient>(provider: &Provider<P>) -> Result<u64, SourceError> {
    Ok(provider.get_block_number().await?.as_u64())
}

async fn get_logs<P: JsonRpcClient>(
    provider: &Provider<P>,
    filter: &LogFilter,
    from: u64,
    to: u64,
) -> Result<Vec<RawLogEntry>, SourceError> {
    let mut entries = provider
        .get_logs(&to_filter(filter, from, to))
        .await?
        .into_iter()
        .map(RawLogEntry::try_from)
        .collect::<Result<Vec<_>, _>>()?;

    // Nodes return ascending order already; make it a guarantee.
    entries.sort_by_key(|e| (e.block_height, e.log_index));
    debug!("[RPC] eth_getLogs [{}, {}] -> {} logs", from, to, entries.len());
    Ok(entries)
}

impl<P: JsonRpcClient + 'static> ChainLogSource for EthSource<P> {
    async fn head_height(&self) -> Result<u64, SourceError> {
        block_number(&self.provider).await
    }

    async fn query_logs(
        &self,
        filter: &LogFilter,
        from: u64,
        to: u64,
    ) -> Result<Vec<RawLogEntry>, SourceError> {
        get_logs(&self.provider, filter, from, to).await
    }

    async fn subscribe(&self, filter: &LogFilter, from: u64) -> Result<Subscription, SourceError> {
        let (tx, rx) = mpsc::channel(self.buffer);
        let cancel = CancellationToken::new();

        let poller = Poller {
            provider: self.provider.clone(),
            filter: filter.clone(),
            next: from,
            interval: self.poll_interval,
            max_failures: self.max_poll_failures,
        };
        tokio::spawn(poller.run(tx, cancel.clone()));

        debug!("[RPC] subscribed to {} from block {}", filter.address, from);
        Ok(Subscription::new(rx, cancel))
    }
}

struct Poller<P: JsonRpcClient> {
    provider: Arc<Provider<P>>,
    filter: LogFilter,
    next: u64,
    interval: Duration,
    max_failures: u32,
}

impl<P: JsonRpcClient + 'static> Poller<P> {
    async fn run(mut self, tx: mpsc::Sender<LiveBlock>, cancel: CancellationToken) {
        let mut failures = 0u32;

        loop {
            match self.poll_once().await {
                Ok(blocks) => {
                    failures = 0;
                    for block in blocks {
                        if tx.send(block).await.is_err() {
                            debug!("[RPC] subscriber gone, stopping poller");
                            return;
                        }
                    }
                }
                Err(e) => {
                    failures += 1;
                    warn!("[RPC] poll failed ({}/{}): {}", failures, self.max_failures, e);
                    if failures >= self.max_failures {
                        error!(
                            "[RPC] dropping subscription for {} after {} failed polls",
                            self.filter.address, failures
                        );
                        return;
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("[RPC] subscription cancelled");
                    return;
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    /// Fetches every block from `next` up to the head (bounded by
    /// [`MAX_POLL_RANGE`]) and advances `next` past it.
    async fn poll_once(&mut self) -> Result<Vec<LiveBlock>, SourceError> {
        let head = block_number(&self.provider).await?;
        if head < self.next {
            return Ok(Vec::new());
        }

        let to = head.min(self.next.saturating_add(MAX_POLL_RANGE - 1));
        let entries = get_logs(&self.provider, &self.filter, self.next, to).await?;
        self.next = to + 1;
        Ok(group_by_block(entries))
    }
}

// =====================================================================
// ContractReader
// =====================================================================

impl<P: JsonRpcClient + 'static> ContractReader for EthSource<P> {
    async fn is_finalized(&self, contract: Address, id: TokenId) -> Result<bool, SourceError> {
        let out = self.call(contract, "isFinalized(uint256)", &id).await?;
        match abi::decode(&[ParamType::Bool], &out).as_deref() {
            Ok([Token::Bool(finalized)]) => Ok(*finalized),
            Ok(other) => Err(SourceError::Decode(format!("isFinalized returned {other:?}"))),
            Err(e) => Err(SourceError::Decode(format!("isFinalized: {e}"))),
        }
    }

    async fn expired_at(&self, contract: Address, id: TokenId) -> Result<Option<u64>, SourceError> {
        let out = self.call(contract, "expiredAt(uint256)", &id).await?;
        let seconds = match abi::decode(&[ParamType::Uint(256)], &out).as_deref() {
            Ok([Token::Uint(seconds)]) => *seconds,
            Ok(other) => return Err(SourceError::Decode(format!("expiredAt returned {other:?}"))),
            Err(e) => return Err(SourceError::Decode(format!("expiredAt: {e}"))),
        };
        if seconds > U256::from(u64::MAX) {
            return Err(SourceError::Decode(format!("expiredAt {seconds} out of range")));
        }
        let seconds = seconds.as_u64();
        Ok((seconds != 0).then_some(seconds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::providers::MockProvider;
    use ethers::types::{Bytes, H256, U64};

    fn mocked() -> (EthSource<MockProvider>, MockProvider) {
        let (provider, mock) = Provider::mocked();
        (EthSource::with_provider(provider, Duration::from_millis(10), 16), mock)
    }

    fn provider_log(height: Option<u64>, index: u64) -> Log {
        Log {
            address: Address::repeat_byte(0x1f).0,
            topics: vec![
                Word::from_u64(0xc3).0,
                Word::from_u64(1).0,
            ],
            data: Bytes::from(vec![1, 2]),
            block_number: height.map(U64::from),
            log_index: Some(U256::from(index)),
            transaction_hash: Some(H256::from_low_u64_be(0xaa)),
            ..Default::default()
        }
    }

    #[test]
    fn converts_provider_log() {
        let entry = RawLogEntry::try_from(provider_log(Some(100), 3)).unwrap();
        assert_eq!(entry.address, Address::repeat_byte(0x1f));
        assert_eq!(entry.block_height, 100);
        assert_eq!(entry.log_index, 3);
        assert_eq!(entry.data, vec![1, 2]);
        assert_eq!(entry.topics, vec![Word::from_u64(0xc3), Word::from_u64(1)]);
        assert_eq!(entry.tx_hash, Word::from_u64(0xaa));
    }

    #[test]
    fn pending_log_is_a_decode_error() {
        assert!(matches!(
            RawLogEntry::try_from(provider_log(None, 0)),
            Err(SourceError::Decode(_))
        ));
    }

    #[test]
    fn filter_keeps_wildcard_positions() {
        let filter = LogFilter::new(Address::repeat_byte(2)).with_topic(2, vec![Word::from_u64(1)]);
        let out = to_filter(&filter, 16, 31);

        assert_eq!(out.address, Some(ValueOrArray::Value(Address::repeat_byte(2).0)));
        assert_eq!(out.get_from_block(), Some(U64::from(16)));
        assert_eq!(out.get_to_block(), Some(U64::from(31)));
        assert_eq!(out.topics[0], None);
        assert_eq!(out.topics[1], None);
        assert_eq!(
            out.topics[2],
            Some(ValueOrArray::Array(vec![Some(Word::from_u64(1).0)]))
        );
        assert_eq!(out.topics[3], None);
    }

    #[tokio::test]
    async fn reads_head_and_sorts_logs() {
        let (source, mock) = mocked();
        mock.push::<U64, _>(U64::from(42)).unwrap();
        assert_eq!(source.head_height().await.unwrap(), 42);

        let unordered = vec![
            provider_log(Some(101), 0),
            provider_log(Some(100), 5),
            provider_log(Some(100), 2),
        ];
        mock.push::<Vec<Log>, _>(unordered).unwrap();
        let filter = LogFilter::new(Address::repeat_byte(0x1f));
        let entries = source.query_logs(&filter, 100, 101).await.unwrap();
        let order: Vec<_> = entries.iter().map(|e| (e.block_height, e.log_index)).collect();
        assert_eq!(order, vec![(100, 2), (100, 5), (101, 0)]);
    }

    #[tokio::test]
    async fn undecodable_log_response_is_fatal() {
        let (source, mock) = mocked();
        mock.push::<Vec<Log>, _>(vec![provider_log(None, 0)]).unwrap();

        let filter = LogFilter::new(Address::repeat_byte(0x1f));
        let err = source.query_logs(&filter, 0, 10).await.unwrap_err();
        assert!(matches!(err, SourceError::Decode(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn reads_token_state() {
        let (source, mock) = mocked();
        let contract = Address::repeat_byte(3);
        let token = Word::from_u64(7);

        mock.push::<Bytes, _>(Bytes::from(abi::encode(&[Token::Bool(true)]))).unwrap();
        assert!(source.is_finalized(contract, token).await.unwrap());

        mock.push::<Bytes, _>(Bytes::from(abi::encode(&[Token::Uint(U256::zero())]))).unwrap();
        assert_eq!(source.expired_at(contract, token).await.unwrap(), None);

        mock.push::<Bytes, _>(Bytes::from(abi::encode(&[Token::Uint(U256::from(1_700_000_000u64))])))
            .unwrap();
        assert_eq!(
            source.expired_at(contract, token).await.unwrap(),
            Some(1_700_000_000)
        );

        mock.push::<Bytes, _>(Bytes::from(abi::encode(&[Token::Uint(U256::MAX)]))).unwrap();
        assert!(matches!(
            source.expired_at(contract, token).await,
            Err(SourceError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn short_call_output_is_a_decode_error() {
        let (source, mock) = mocked();
        mock.push::<Bytes, _>(Bytes::from(vec![0u8; 4])).unwrap();
        assert!(matches!(
            source.is_finalized(Address::repeat_byte(3), Word::from_u64(7)).await,
            Err(SourceError::Decode(_))
        ));
    }
}
