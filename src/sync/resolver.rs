//! Side-effect resolution: confirmed chain state attached to an event before
//! it is applied.
//!
//! Resolvers only read. Whatever they return is persisted by the applier in
//! the same transaction as the event itself, and a failure aborts the whole
//! batch so it is retried from the same checkpoint.

use std::future::Future;
use std::sync::Arc;

use log::trace;

use crate::error::{ResolveError, SourceError};
use crate::events::{Address, EventPayload, EventRecord, TokenId};
use crate::store::AuxData;

pub trait SideEffectResolver: Send + Sync + 'static {
    fn resolve(
        &self,
        record: &EventRecord,
    ) -> impl Future<Output = Result<Option<AuxData>, ResolveError>> + Send;
}

/// For stores whose folds need nothing beyond the event itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSideEffects;

impl SideEffectResolver for NoSideEffects {
    async fn resolve(&self, _record: &EventRecord) -> Result<Option<AuxData>, ResolveError> {
        Ok(None)
    }
}

/// Read-only contract calls needed by [`TokenStateResolver`].
pub trait ContractReader: Send + Sync + 'static {
    fn is_finalized(
        &self,
        contract: Address,
        id: TokenId,
    ) -> impl Future<Output = Result<bool, SourceError>> + Send;

    /// Expiry as a unix timestamp in seconds, `None` when the token never
    /// expires.
    fn expired_at(
        &self,
        contract: Address,
        id: TokenId,
    ) -> impl Future<Output = Result<Option<u64>, SourceError>> + Send;
}

impl<T: ContractReader> ContractReader for Arc<T> {
    fn is_finalized(
        &self,
        contract: Address,
        id: TokenId,
    ) -> impl Future<Output = Result<bool, SourceError>> + Send {
        T::is_finalized(self, contract, id)
    }

    fn expired_at(
        &self,
        contract: Address,
        id: TokenId,
    ) -> impl Future<Output = Result<Option<u64>, SourceError>> + Send {
        T::expired_at(self, contract, id)
    }
}

/// Attaches the current finalization and expiry of claimed tokens.
#[derive(Debug, Clone)]
pub struct TokenStateResolver<C> {
    reader: C,
}

impl<C: ContractReader> TokenStateResolver<C> {
    pub fn new(reader: C) -> Self {
        Self { reader }
    }
}

impl<C: ContractReader> SideEffectResolver for TokenStateResolver<C> {
    async fn resolve(&self, record: &EventRecord) -> Result<Option<AuxData>, ResolveError> {
        let EventPayload::Claim(claim) = &record.payload else {
            return Ok(None);
        };

        let finalized = self.reader.is_finalized(claim.contract, claim.id).await?;
        let expires_at = self.reader.expired_at(claim.contract, claim.id).await?;
        trace!(
            "[RESOLVER] token {} finalized={} expires_at={:?}",
            claim.id,
            finalized,
            expires_at
        );

        Ok(Some(AuxData::TokenState {
            finalized,
            expires_at,
        }))
    }
}
