pub mod manager;
pub mod orchestrator;
pub mod status;

#[cfg(test)]
mod tests;

pub use manager::SyncManager;
pub use orchestrator::SyncSession;
pub use status::{SessionHandle, SessionReport, SyncStatus};
