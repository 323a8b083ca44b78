use super::types::SessionPhase;

#[derive(Debug)]
pub struct SessionState {
    pub phase: SessionPhase,

    /// First block height not yet covered by the store's checkpoint.
    pub next_height: u64,
    pub target_height: u64,
    pub batch_size: u64,
    pub follow: bool,
    pub subscribed: bool,
}
