use crate::sync::engine::state::SessionState;
use crate::sync::engine::types::{SessionCommand, SessionPhase};
use crate::sync::source::LiveBlock;

pub fn on_started(
    state: &mut SessionState,
    next_height: u64,
    target: u64,
    follow: bool,
) -> Vec<SessionCommand> {
    if state.phase != SessionPhase::Idle {
        log::warn!("[ENGINE] ignoring start in phase {:?}", state.phase);
        return Vec::new();
    }

    log::info!(
        "[ENGINE] start: next height {}, target {}, follow={}",
        next_height,
        target,
        follow
    );
    state.next_height = next_height;
    state.target_height = target;
    state.follow = follow;
    state.phase = SessionPhase::Backfilling;

    continue_backfill(state)
}

pub fn on_batch_done(state: &mut SessionState, checkpoint: u64) -> Vec<SessionCommand> {
    if state.phase != SessionPhase::Backfilling {
        log::debug!("[ENGINE] batch result in phase {:?}, ignoring", state.phase);
        return Vec::new();
    }

    state.next_height = state.next_height.max(checkpoint.saturating_add(1));
    continue_backfill(state)
}

/// Either the next batch, or the hand-over to live tailing once the target is
/// covered.
fn continue_backfill(state: &mut SessionState) -> Vec<SessionCommand> {
    if state.next_height <= state.target_height {
        let to = state
            .target_height
            .min(state.next_height.saturating_add(state.batch_size - 1));
        log::debug!("[ENGINE] backfill [{}, {}]", state.next_height, to);
        return vec![SessionCommand::QueryRange {
            from: state.next_height,
            to,
        }];
    }

    if !state.follow {
        log::info!("[ENGINE] reached target {}, done", state.target_height);
        state.phase = SessionPhase::Closed;
        return Vec::new();
    }

    log::info!(
        "[ENGINE] backfill complete at {}, tailing from {}",
        state.target_height,
        state.next_height
    );
    state.phase = SessionPhase::LiveTailing;
    state.subscribed = true;
    vec![SessionCommand::Subscribe {
        from: state.next_height,
    }]
}

pub fn on_live_block(state: &mut SessionState, block: LiveBlock) -> Vec<SessionCommand> {
    if state.phase != SessionPhase::LiveTailing || block.height < state.next_height {
        log::trace!(
            "[ENGINE] discard live block {} (next {}, phase {:?})",
            block.height,
            state.next_height,
            state.phase
        );
        return vec![SessionCommand::DiscardLive {
            height: block.height,
        }];
    }
    vec![SessionCommand::ApplyLive(block)]
}

pub fn on_live_applied(state: &mut SessionState, checkpoint: u64) -> Vec<SessionCommand> {
    state.next_height = state.next_height.max(checkpoint.saturating_add(1));
    Vec::new()
}

pub fn on_subscription_dropped(state: &mut SessionState) -> Vec<SessionCommand> {
    if state.phase == SessionPhase::Closed {
        return Vec::new();
    }

    log::warn!(
        "[ENGINE] subscription dropped at next height {}, restarting",
        state.next_height
    );
    state.phase = SessionPhase::Closed;
    state.subscribed = false;
    vec![SessionCommand::Restart]
}

pub fn on_close(state: &mut SessionState) -> Vec<SessionCommand> {
    if state.phase == SessionPhase::Closed {
        return Vec::new();
    }

    log::info!("[ENGINE] close in phase {:?}", state.phase);
    state.phase = SessionPhase::Closed;
    if std::mem::take(&mut state.subscribed) {
        vec![SessionCommand::Unsubscribe]
    } else {
        Vec::new()
    }
}
