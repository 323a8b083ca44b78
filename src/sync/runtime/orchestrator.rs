use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, error, info, trace, warn};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::SyncError;
use crate::events::StoreName;
use crate::mapper::EventMapper;
use crate::store;
use crate::sync::applier::{ApplyOutcome, ResolvedEvent, TransactionalApplier};
use crate::sync::context::SyncContext;
use crate::sync::engine::{SessionCommand, SessionEngine, SessionEvent};
use crate::sync::resolver::SideEffectResolver;
use crate::sync::runtime::status::{SessionHandle, SessionReport, SyncStatus};
use crate::sync::source::{ChainLogSource, LiveBlock, LogFilter, RawLogEntry, Subscription};

#[derive(Debug, Default)]
struct Counters {
    batches: AtomicU64,
    live_blocks: AtomicU64,
    discarded: AtomicU64,
    inserted: AtomicU64,
    duplicates: AtomicU64,
    retries: AtomicU64,
    restarts: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SessionReport {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        SessionReport {
            batches: get(&self.batches),
            live_blocks: get(&self.live_blocks),
            discarded: get(&self.discarded),
            inserted: get(&self.inserted),
            duplicates: get(&self.duplicates),
            retries: get(&self.retries),
            restarts: get(&self.restarts),
        }
    }
}

/// How one session instance ended.
enum Exit {
    Closed,
    Restart,
}

/// **SyncSession**
///
/// The imperative shell around [`SessionEngine`] for one store. It:
/// 1. Reads the store's checkpoint and picks a target height.
/// 2. Feeds the engine events and executes the commands it returns: block
///    range queries, subscriptions, live applies.
/// 3. Retries transient failures with backoff and publishes a
///    [`SyncStatus`] after every step.
///
/// A dropped subscription ends the current instance; the session then starts
/// a fresh one, which backfills up to a new head before tailing again.
pub struct SyncSession<S, R> {
    ctx: SyncContext<S>,
    store: StoreName,
    filter: LogFilter,
    mapper: Arc<EventMapper>,
    resolver: Arc<R>,
    applier: TransactionalApplier,
    status: watch::Sender<SyncStatus>,
    cancel: CancellationToken,
    counters: Counters,
}

impl<S, R> SyncSession<S, R>
where
    S: ChainLogSource,
    R: SideEffectResolver,
{
    pub fn new(
        ctx: SyncContext<S>,
        store: StoreName,
        filter: LogFilter,
        mapper: Arc<EventMapper>,
        resolver: Arc<R>,
    ) -> Self {
        let applier = TransactionalApplier::new(ctx.db.clone());
        let (status, _) = watch::channel(SyncStatus::Idle);
        Self {
            ctx,
            store,
            filter,
            mapper,
            resolver,
            applier,
            status,
            cancel: CancellationToken::new(),
            counters: Counters::default(),
        }
    }

    pub fn store(&self) -> StoreName {
        self.store
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs the session on the tokio runtime.
    pub fn spawn(self, target: Option<u64>) -> SessionHandle {
        let store = self.store;
        let cancel = self.cancel.clone();
        let status = self.status.subscribe();
        let task = tokio::spawn(self.run(target));
        SessionHandle::new(store, cancel, status, task)
    }

    /// Syncs the store.
    ///
    /// With `Some(target)` the session backfills up to `target` and returns.
    /// With `None` it backfills up to the current head, then tails live
    /// blocks until closed.
    ///
    /// A non-transient error (malformed input, exhausted retries, a store
    /// invariant) stalls the session: the status becomes
    /// [`SyncStatus::Stalled`] and the error is returned.
    pub async fn run(self, target: Option<u64>) -> Result<SessionReport, SyncError> {
        info!("[SESSION] {} starting (target {:?})", self.store, target);

        match self.run_instances(target).await {
            Ok(()) => {
                self.set_status(SyncStatus::Closed);
                let report = self.counters.snapshot();
                info!("[SESSION] {} closed: {:?}", self.store, report);
                Ok(report)
            }
            Err(e) => {
                let height = self.checkpoint_or_genesis();
                error!("[SESSION] {} stalled at height {}: {}", self.store, height, e);
                self.set_status(SyncStatus::Stalled {
                    height,
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn run_instances(&self, target: Option<u64>) -> Result<(), SyncError> {
        loop {
            match self.run_instance(target).await? {
                Exit::Closed => return Ok(()),
                Exit::Restart => {
                    Counters::bump(&self.counters.restarts, 1);
                    let delay = self.ctx.config.retry.backoff(1);
                    info!("[SESSION] {} restarting in {:?}", self.store, delay);
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// One pass of the state machine, from `Idle` to `Closed`.
    async fn run_instance(&self, until: Option<u64>) -> Result<Exit, SyncError> {
        let mut engine = SessionEngine::new(self.ctx.config.batch_size);
        let next_height = self.next_height()?;

        let Some(head) = self.with_retry("head query", move || self.head()).await? else {
            return Ok(Exit::Closed);
        };
        // A bounded run never queries past the chain head.
        let (target, follow) = match until {
            Some(until) => (until.min(head), false),
            None => (head, true),
        };

        let mut queue: VecDeque<SessionCommand> = engine
            .handle_event(SessionEvent::Started {
                next_height,
                target,
                follow,
            })
            .into();
        let mut subscription: Option<Subscription> = None;

        loop {
            while let Some(cmd) = queue.pop_front() {
                if self.cancel.is_cancelled() && !engine.is_closed() {
                    queue.clear();
                    queue.extend(engine.handle_event(SessionEvent::Close));
                    continue;
                }

                trace!("[SESSION] {} cmd: {:?}", self.store, cmd);
                match cmd {
                    SessionCommand::QueryRange { from, to } => {
                        self.set_status(SyncStatus::Backfilling {
                            checkpoint: self.checkpoint()?,
                            target,
                        });
                        let Some(outcome) = self
                            .with_retry("backfill", move || self.backfill_batch(from, to))
                            .await?
                        else {
                            continue;
                        };
                        Counters::bump(&self.counters.batches, 1);
                        self.record(&outcome);
                        queue.extend(engine.handle_event(SessionEvent::BatchDone {
                            checkpoint: outcome.checkpoint(),
                        }));
                    }

                    SessionCommand::Subscribe { from } => {
                        let Some(sub) = self
                            .with_retry("subscribe", move || self.subscribe(from))
                            .await?
                        else {
                            continue;
                        };
                        subscription = Some(sub);
                        self.set_status(SyncStatus::Live {
                            checkpoint: self.checkpoint()?,
                        });
                        info!("[SESSION] {} tailing from block {}", self.store, from);
                    }

                    SessionCommand::ApplyLive(block) => {
                        let block = &block;
                        let Some(outcome) = self
                            .with_retry("live apply", move || self.apply_live(block))
                            .await?
                        else {
                            continue;
                        };
                        Counters::bump(&self.counters.live_blocks, 1);
                        self.record(&outcome);
                        queue.extend(engine.handle_event(SessionEvent::LiveApplied {
                            checkpoint: outcome.checkpoint(),
                        }));
                        self.set_status(SyncStatus::Live {
                            checkpoint: Some(outcome.checkpoint()),
                        });
                    }

                    SessionCommand::DiscardLive { height } => {
                        debug!(
                            "[SESSION] {} live block {} already covered, discarded",
                            self.store, height
                        );
                        Counters::bump(&self.counters.discarded, 1);
                    }

                    SessionCommand::Unsubscribe => {
                        if let Some(sub) = subscription.take() {
                            sub.cancel();
                        }
                    }

                    SessionCommand::Restart => return Ok(Exit::Restart),
                }
            }

            let Some(sub) = subscription.as_mut() else {
                return Ok(Exit::Closed);
            };

            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => SessionEvent::Close,
                block = sub.recv() => match block {
                    Some(block) => SessionEvent::LiveBlock(block),
                    None => SessionEvent::SubscriptionDropped,
                },
            };
            queue.extend(engine.handle_event(event));
        }
    }

    // =====================================================================
    // Side effects
    // =====================================================================

    async fn head(&self) -> Result<u64, SyncError> {
        Ok(self.ctx.source.head_height().await?)
    }

    async fn subscribe(&self, from: u64) -> Result<Subscription, SyncError> {
        Ok(self.ctx.source.subscribe(&self.filter, from).await?)
    }

    async fn backfill_batch(&self, from: u64, to: u64) -> Result<ApplyOutcome, SyncError> {
        let entries = self.ctx.source.query_logs(&self.filter, from, to).await?;
        debug!(
            "[SESSION] {} [{}, {}] -> {} logs",
            self.store,
            from,
            to,
            entries.len()
        );
        let events = self.prepare(&entries).await?;
        Ok(self.applier.apply(self.store, events, to).await?)
    }

    async fn apply_live(&self, block: &LiveBlock) -> Result<ApplyOutcome, SyncError> {
        let events = self.prepare(&block.entries).await?;
        Ok(self.applier.apply(self.store, events, block.height).await?)
    }

    /// Maps every entry and resolves each record's side effects.
    async fn prepare(&self, entries: &[RawLogEntry]) -> Result<Vec<ResolvedEvent>, SyncError> {
        let mut events = Vec::with_capacity(entries.len());
        for entry in entries {
            for record in self.mapper.map(entry)? {
                let aux = self.resolver.resolve(&record).await?;
                events.push(ResolvedEvent::new(record, aux));
            }
        }
        Ok(events)
    }

    /// Runs `op` until it succeeds, retrying transient errors with backoff.
    ///
    /// Returns `Ok(None)` if the session is closed while waiting to retry.
    async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<Option<T>, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let policy = &self.ctx.config.retry;
        let mut failed = 0u32;

        loop {
            let err = match op().await {
                Ok(value) => return Ok(Some(value)),
                Err(e) if e.is_transient() => e,
                Err(e) => return Err(e),
            };

            failed += 1;
            if !policy.allows(failed) {
                return Err(SyncError::RetriesExhausted {
                    attempts: failed,
                    last: Box::new(err),
                });
            }

            let delay = policy.backoff(failed);
            Counters::bump(&self.counters.retries, 1);
            warn!(
                "[SESSION] {} {} failed (attempt {}), retrying in {:?}: {}",
                self.store, what, failed, delay, err
            );

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("[SESSION] {} closed while retrying {}", self.store, what);
                    return Ok(None);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    // =====================================================================
    // Helpers
    // =====================================================================

    fn record(&self, outcome: &ApplyOutcome) {
        if let ApplyOutcome::Committed(summary) = outcome {
            Counters::bump(&self.counters.inserted, summary.inserted as u64);
            Counters::bump(&self.counters.duplicates, summary.duplicates as u64);
        }
    }

    fn next_height(&self) -> Result<u64, SyncError> {
        Ok(store::read(&self.ctx.db)?
            .checkpoints()
            .next_height(self.store))
    }

    fn checkpoint(&self) -> Result<Option<u64>, SyncError> {
        Ok(store::read(&self.ctx.db)?
            .checkpoints()
            .committed(self.store))
    }

    fn checkpoint_or_genesis(&self) -> u64 {
        match store::read(&self.ctx.db) {
            Ok(db) => db.checkpoints().get(self.store),
            Err(_) => self.ctx.config.genesis_height,
        }
    }

    fn set_status(&self, status: SyncStatus) {
        let changed = *self.status.borrow() != status;
        if changed {
            debug!("[SESSION] {} status: {}", self.store, status);
            self.status.send_replace(status);
        }
    }
}
