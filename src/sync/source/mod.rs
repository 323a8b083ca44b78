pub mod api;
pub mod eth;
pub mod mock;

pub use api::{ChainLogSource, LiveBlock, LogFilter, RawLogEntry, Subscription};
pub use eth::EthSource;
pub use mock::MockChainSource;
