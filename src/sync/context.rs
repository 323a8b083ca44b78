use std::sync::Arc;

use crate::config::SyncConfig;
use crate::store::SharedDatabase;

/// Everything a sync session needs from the outside, passed in at
/// construction.
pub struct SyncContext<S> {
    pub source: Arc<S>,
    pub db: SharedDatabase,
    pub config: SyncConfig,
}

impl<S> SyncContext<S> {
    pub fn new(source: Arc<S>, db: SharedDatabase, config: SyncConfig) -> Self {
        Self { source, db, config }
    }
}

impl<S> Clone for SyncContext<S> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            db: self.db.clone(),
            config: self.config.clone(),
        }
    }
}
