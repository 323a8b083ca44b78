use std::sync::Arc;

use log::info;

use crate::config::ContractsConfig;
use crate::error::SyncError;
use crate::events::{Address, StoreName};
use crate::mapper::EventMapper;
use crate::sync::context::SyncContext;
use crate::sync::resolver::{ContractReader, NoSideEffects, TokenStateResolver};
use crate::sync::runtime::orchestrator::SyncSession;
use crate::sync::runtime::status::{SessionHandle, SessionReport, SyncStatus};
use crate::sync::source::ChainLogSource;

/// Contract whose logs feed `store`, if that contract is configured.
pub fn contract_for(store: StoreName, contracts: &ContractsConfig) -> Option<Address> {
    match store {
        StoreName::Transfer | StoreName::Claim => Some(contracts.ipft_redeemable),
        StoreName::List | StoreName::Replenish | StoreName::Withdraw | StoreName::Purchase => {
            Some(contracts.open_store)
        }
        _ => contracts.persona,
    }
}

/// One running session per store, all sharing the same source and database.
#[derive(Debug)]
pub struct SyncManager {
    handles: Vec<SessionHandle>,
}

impl SyncManager {
    /// Spawns a session for every store whose contract is configured. Claims
    /// are resolved against the chain; the other stores need no side
    /// effects.
    pub fn start<S>(ctx: SyncContext<S>, contracts: &ContractsConfig, target: Option<u64>) -> Self
    where
        S: ChainLogSource + ContractReader,
    {
        let mapper = Arc::new(EventMapper::new());
        let mut handles = Vec::new();

        for store in StoreName::ALL {
            let Some(contract) = contract_for(store, contracts) else {
                info!("[MANAGER] no contract configured for {}, skipping", store);
                continue;
            };
            let filter = EventMapper::filter(store, contract, contracts.app);

            let handle = if store == StoreName::Claim {
                let resolver = Arc::new(TokenStateResolver::new(ctx.source.clone()));
                SyncSession::new(ctx.clone(), store, filter, mapper.clone(), resolver).spawn(target)
            } else {
                let resolver = Arc::new(NoSideEffects);
                SyncSession::new(ctx.clone(), store, filter, mapper.clone(), resolver).spawn(target)
            };
            handles.push(handle);
        }

        info!("[MANAGER] started {} sessions", handles.len());
        Self { handles }
    }

    pub fn handles(&self) -> &[SessionHandle] {
        &self.handles
    }

    pub fn handle(&self, store: StoreName) -> Option<&SessionHandle> {
        self.handles.iter().find(|h| h.store() == store)
    }

    pub fn statuses(&self) -> Vec<(StoreName, SyncStatus)> {
        self.handles
            .iter()
            .map(|h| (h.store(), h.status()))
            .collect()
    }

    pub fn close_all(&self) {
        for handle in &self.handles {
            handle.close();
        }
    }

    /// Waits for every session to finish, in store order.
    pub async fn join_all(self) -> Vec<(StoreName, Result<SessionReport, SyncError>)> {
        let mut results = Vec::with_capacity(self.handles.len());
        for handle in self.handles {
            let store = handle.store();
            results.push((store, handle.join().await));
        }
        results
    }
}
