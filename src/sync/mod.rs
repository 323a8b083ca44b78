//! Chain-to-store synchronization: sources, the session engine and its
//! async driver.

pub mod applier;
pub mod context;
pub mod engine;
pub mod resolver;
pub mod runtime;
pub mod source;

pub use applier::{ApplyOutcome, ResolvedEvent, TransactionalApplier};
pub use context::SyncContext;
pub use resolver::{ContractReader, NoSideEffects, SideEffectResolver, TokenStateResolver};
pub use runtime::{SessionHandle, SessionReport, SyncManager, SyncSession, SyncStatus};
