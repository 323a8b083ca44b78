use std::fmt;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::SyncError;
use crate::events::StoreName;

/// What a session is doing, as seen by callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStatus {
    Idle,
    Backfilling {
        checkpoint: Option<u64>,
        target: u64,
    },
    Live {
        checkpoint: Option<u64>,
    },
    /// The session halted; nothing past `height` was applied.
    Stalled {
        height: u64,
        reason: String,
    },
    Closed,
}

impl SyncStatus {
    pub fn checkpoint(&self) -> Option<u64> {
        match self {
            SyncStatus::Backfilling { checkpoint, .. } | SyncStatus::Live { checkpoint } => {
                *checkpoint
            }
            SyncStatus::Stalled { height, .. } => Some(*height),
            SyncStatus::Idle | SyncStatus::Closed => None,
        }
    }

    /// Closed or stalled: the session will not change state again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncStatus::Closed | SyncStatus::Stalled { .. })
    }

    pub fn is_live_at(&self, height: u64) -> bool {
        matches!(self, SyncStatus::Live { checkpoint: Some(c) } if *c >= height)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |c: &Option<u64>| c.map_or_else(|| "-".to_string(), |c| c.to_string());
        match self {
            SyncStatus::Idle => write!(f, "idle"),
            SyncStatus::Backfilling { checkpoint, target } => {
                write!(f, "backfilling {}/{}", show(checkpoint), target)
            }
            SyncStatus::Live { checkpoint } => write!(f, "live at {}", show(checkpoint)),
            SyncStatus::Stalled { height, reason } => {
                write!(f, "sync stalled at height {height}: {reason}")
            }
            SyncStatus::Closed => write!(f, "closed"),
        }
    }
}

/// Counters reported when a session ends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionReport {
    pub batches: u64,
    pub live_blocks: u64,
    pub discarded: u64,
    pub inserted: u64,
    pub duplicates: u64,
    pub retries: u64,
    pub restarts: u64,
}

/// Caller side of a spawned session.
#[derive(Debug)]
pub struct SessionHandle {
    store: StoreName,
    cancel: CancellationToken,
    status: watch::Receiver<SyncStatus>,
    task: JoinHandle<Result<SessionReport, SyncError>>,
}

impl SessionHandle {
    pub(crate) fn new(
        store: StoreName,
        cancel: CancellationToken,
        status: watch::Receiver<SyncStatus>,
        task: JoinHandle<Result<SessionReport, SyncError>>,
    ) -> Self {
        Self {
            store,
            cancel,
            status,
            task,
        }
    }

    pub fn store(&self) -> StoreName {
        self.store
    }

    /// Stops the session. Safe to call any number of times; a batch already
    /// in flight completes first.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    /// Waits until the status satisfies `done`, or the session ends. Returns
    /// the last status seen.
    pub async fn wait_for(&self, done: impl FnMut(&SyncStatus) -> bool) -> SyncStatus {
        let mut rx = self.status.clone();
        let reached = rx.wait_for(done).await.map(|status| status.clone());
        reached.unwrap_or_else(|_| rx.borrow().clone())
    }

    pub async fn join(self) -> Result<SessionReport, SyncError> {
        self.task
            .await
            .map_err(|e| SyncError::Aborted(e.to_string()))?
    }
}
