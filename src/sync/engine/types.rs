use crate::sync::source::LiveBlock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Backfilling,
    LiveTailing,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The driver read the checkpoint and picked a target.
    Started {
        next_height: u64,
        target: u64,
        /// Keep tailing live blocks once the target is reached.
        follow: bool,
    },
    /// A backfill batch finished; `checkpoint` is the store's checkpoint
    /// afterwards, whether the batch committed or was stale.
    BatchDone { checkpoint: u64 },
    LiveBlock(LiveBlock),
    LiveApplied { checkpoint: u64 },
    SubscriptionDropped,
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    QueryRange { from: u64, to: u64 },
    Subscribe { from: u64 },
    ApplyLive(LiveBlock),
    DiscardLive { height: u64 },
    Unsubscribe,
    /// Start a fresh session instance from the committed checkpoint.
    Restart,
}
