//! Sync session decision engine.
//!
//! This module is the **Functional Core** of a sync session. It is a pure
//! state machine:
//! - **Input**: `SessionEvent` (checkpoints, live blocks, drops, close).
//! - **Output**: `Vec<SessionCommand>` (side effects the orchestrator runs).
//!
//! # Guarantees
//! * **No I/O**: it never touches the chain source or the store.
//! * **No Async**: every handler is synchronous and cheap.
//! * **Deterministic**: the same events in the same order yield the same
//!   commands.
//!
//! Phases only move forward: `Idle → Backfilling → LiveTailing → Closed`. A
//! dropped subscription closes this instance and asks for a fresh one.

mod logic;
pub mod state;
pub mod types;


pub use types::{SessionCommand, SessionEvent, SessionPhase};

use logic::*;
use state::SessionState;

#[derive(Debug)]
pub struct SessionEngine {
    state: SessionState,
}

impl SessionEngine {
    /// `batch_size` is the width of one backfill range, clamped to at least 1.
    pub fn new(batch_size: u64) -> Self {
        Self {
            state: SessionState {
                phase: SessionPhase::Idle,
                next_height: 0,
                target_height: 0,
                batch_size: batch_size.max(1),
                follow: false,
                subscribed: false,
            },
        }
    }

    /// Consumes an event and returns the commands the orchestrator must
    /// execute, in order.
    pub fn handle_event(&mut self, event: SessionEvent) -> Vec<SessionCommand> {
        match event {
            SessionEvent::Started {
                next_height,
                target,
                follow,
            } => on_started(&mut self.state, next_height, target, follow),
            SessionEvent::BatchDone { checkpoint } => on_batch_done(&mut self.state, checkpoint),
            SessionEvent::LiveBlock(block) => on_live_block(&mut self.state, block),
            SessionEvent::LiveApplied { checkpoint } => on_live_applied(&mut self.state, checkpoint),
            SessionEvent::SubscriptionDropped => on_subscription_dropped(&mut self.state),
            SessionEvent::Close => on_close(&mut self.state),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.phase
    }

    pub fn is_closed(&self) -> bool {
        self.state.phase == SessionPhase::Closed
    }

    pub fn next_height(&self) -> u64 {
        self.state.next_height
    }

    pub fn target_height(&self) -> u64 {
        self.state.target_height
    }
}
