//! Chain event sync and indexing engine for an NFT marketplace.
//!
//! Raw contract logs are mapped into typed event records, applied to an
//! indexed local store in checkpointed batches, and folded into derived
//! entities (owners, listings, personas) that the query layer serves.

pub mod config;
pub mod error;
pub mod events;
pub mod mapper;
pub mod persistence;
pub mod query;
pub mod store;
pub mod sync;

#[cfg(test)]
pub mod test_utils;

pub use config::{AppConfig, ContractsConfig, RetryPolicy, SyncConfig};
pub use error::{MalformedEventError, ResolveError, SourceError, StoreError, SyncError};
pub use persistence::open_database;
pub use query::{PersonaCache, QueryLayer};
