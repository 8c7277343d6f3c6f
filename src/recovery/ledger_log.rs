//! The ledger backed [`LogBackend`].

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tracing::instrument;

use crate::config::LedgerLogConfig;
use crate::config::SwapMismatchPolicy;
use crate::errors::LedgerError;
use crate::errors::Result;
use crate::errors::SlotLogError;
use crate::recovery::codec::EntryCodec;
use crate::recovery::coordinator::LedgerCoordinator;
use crate::recovery::model::*;
use crate::recovery::playback::Playback;
use crate::recovery::replica::ReplicaView;
use crate::recovery::store::LedgerHandle;
use crate::recovery::store::LedgerStore;
use crate::recovery::AckCallback;
use crate::recovery::CompactionPhase;
use crate::recovery::KillSignals;
use crate::recovery::LogBackend;
use crate::recovery::Publication;
use crate::recovery::SlotEvent;

/// The ledgers a slot is currently using.
///
/// Only ever touched with the lock held and never across an await.
#[derive(Debug)]
struct Ledgers {
    active: LedgerHandle,
    next: Option<LedgerHandle>,
    phase: watch::Sender<CompactionPhase>,
    closed: bool,
}

impl Ledgers {
    fn phase(&self) -> CompactionPhase {
        *self.phase.borrow()
    }

    fn set_phase(&self, phase: CompactionPhase) {
        self.phase.send_replace(phase);
    }
}

/// Per slot state of a [`LedgerLog`].
///
/// Cheap to clone; clones refer to the same slot.
#[derive(Debug, Clone)]
pub struct LogHandle {
    slot: SlotKey,
    ledgers: Arc<Mutex<Ledgers>>,
    /// Runtime compaction swaps are spawned on, so entries can be
    /// stored from outside of it.
    rt: tokio::runtime::Handle,
}

impl LogHandle {
    fn new(slot: SlotKey, active: LedgerHandle, rt: tokio::runtime::Handle) -> Self {
        let (phase, _) = watch::channel(CompactionPhase::Active);
        Self {
            slot,
            ledgers: Arc::new(Mutex::new(Ledgers {
                active,
                next: None,
                phase,
                closed: false,
            })),
            rt,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Ledgers> {
        self.ledgers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn slot(&self) -> &SlotKey {
        &self.slot
    }

    pub fn active_ledger_id(&self) -> LedgerId {
        self.lock().active.id()
    }

    /// The published ledger waiting to become active, if a
    /// compaction is pending.
    pub fn next_ledger_id(&self) -> Option<LedgerId> {
        self.lock().next.as_ref().map(LedgerHandle::id)
    }

    pub fn phase(&self) -> CompactionPhase {
        self.lock().phase()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Resolves once no compaction swap is running.
    ///
    /// A pending compaction only swaps on the next write, so call
    /// this after that write.
    pub async fn compaction_settled(&self) {
        let mut rx = self.lock().phase.subscribe();
        // The sender lives in `self`, so this can't see it dropped.
        let _ = rx
            .wait_for(|phase| *phase == CompactionPhase::Active)
            .await;
    }
}

#[derive(Debug)]
enum SwapOutcome {
    Swapped { compacted: LedgerId },
    Mismatch,
    Cancelled,
    Failed(SlotLogError),
}

impl SwapOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Swapped { .. } => "swapped",
            Self::Mismatch => "mismatch",
            Self::Cancelled => "cancelled",
            Self::Failed(_) => "failed",
        }
    }
}

/// Append and wait for the store to confirm.
async fn append_durable<S: LedgerStore>(
    store: &S,
    ledger: &LedgerHandle,
    payload: Vec<u8>,
) -> std::result::Result<EntryId, LedgerError> {
    let (tx, rx) = oneshot::channel();
    store.async_append(
        ledger,
        payload,
        Box::new(move |res| {
            let _ = tx.send(res);
        }),
    );
    rx.await.map_err(|_| LedgerError::Shutdown)?
}

/// A [`LogBackend`] keeping each slot's chain of ledgers in a
/// [`LedgerStore`] and publishing it through a [`ReplicaView`].
///
/// One of these serves every slot in a process; each slot gets its
/// own [`LogHandle`] from [`LogBackend::initialize`]. The store is
/// shared by all of them and released when the last clone of this is
/// dropped.
pub struct LedgerLog<S, R> {
    inner: Arc<LedgerCoordinator<S, R>>,
    codec: Arc<dyn EntryCodec>,
}

impl<S, R> Clone for LedgerLog<S, R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            codec: self.codec.clone(),
        }
    }
}

impl<S, R> LedgerLog<S, R>
where
    S: LedgerStore,
    R: ReplicaView,
{
    /// Commands for the replica are sent on `commands`.
    pub fn new(
        store: Arc<S>,
        replica: Arc<R>,
        commands: UnboundedSender<Command>,
        config: LedgerLogConfig,
    ) -> Result<Self> {
        config.validate()?;
        let codec = config.codec.build();
        Ok(Self {
            inner: Arc::new(LedgerCoordinator::new(store, replica, commands, config)),
            codec,
        })
    }

    pub fn config(&self) -> &LedgerLogConfig {
        &self.inner.config
    }

    /// [`LogBackend::store_log_entry`], resolving once the entry is
    /// durable.
    pub async fn store_log_entry_durable(
        &self,
        handle: &LogHandle,
        event: &SlotEvent,
        state: &SlotState,
        entry: &LogEntry,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.store_log_entry(
            handle,
            event,
            state,
            entry,
            Box::new(move |res| {
                let _ = tx.send(res);
            }),
        );
        rx.await
            .map_err(|_| SlotLogError::Ledger(LedgerError::Shutdown))?
    }

    /// Perform a pending compaction swap now instead of on the next
    /// write. Returns if there was one.
    ///
    /// `state` must be what would be passed to the next
    /// [`LogBackend::store_log_entry`].
    pub fn trigger_swap(&self, handle: &LogHandle, event: &SlotEvent, state: &SlotState) -> bool {
        let mut ledgers = handle.lock();
        !ledgers.closed && self.swap_if_pending(handle, &mut ledgers, state, &event.kill)
    }

    /// Promote the next ledger and hand the rest of the swap to a
    /// background task.
    fn swap_if_pending(
        &self,
        handle: &LogHandle,
        ledgers: &mut Ledgers,
        state: &SlotState,
        kill: &KillSignals,
    ) -> bool {
        let Some(next) = ledgers.next.take() else {
            return false;
        };
        let promoted = next.id();
        let superseded = std::mem::replace(&mut ledgers.active, next);
        ledgers.set_phase(CompactionPhase::Swapping);
        tracing::info!(
            "Swapping active ledger of slot {} from {} to {promoted}",
            handle.slot,
            superseded.id()
        );

        let task = self.clone().run_swap(
            handle.clone(),
            kill.clone(),
            superseded,
            promoted,
            state.clone(),
        );
        handle.rt.spawn(task);
        true
    }

    async fn begin_compaction(
        &self,
        handle: &LogHandle,
        kill: &KillSignals,
    ) -> Result<Publication<()>> {
        {
            let ledgers = handle.lock();
            if ledgers.closed {
                return Err(SlotLogError::LogClosed);
            }
            if ledgers.phase() != CompactionPhase::Active {
                return Err(SlotLogError::CompactionInProgress);
            }
            ledgers.set_phase(CompactionPhase::PreCompacting);
        }

        let res = self
            .inner
            .create_and_publish(&handle.slot, kill, "next ledger")
            .await;

        let orphan = {
            let mut ledgers = handle.lock();
            match res {
                Ok(Publication::Confirmed(next)) if !ledgers.closed => {
                    tracing::info!(
                        "Ledger {} is ready to replace active ledger {} of slot {}",
                        next.id(),
                        ledgers.active.id(),
                        handle.slot
                    );
                    ledgers.next = Some(next);
                    return Ok(Publication::Confirmed(()));
                }
                Ok(Publication::Confirmed(next)) => {
                    ledgers.set_phase(CompactionPhase::Active);
                    next
                }
                Ok(Publication::Cancelled) => {
                    ledgers.set_phase(CompactionPhase::Active);
                    return Ok(Publication::Cancelled);
                }
                Err(err) => {
                    ledgers.set_phase(CompactionPhase::Active);
                    return Err(err);
                }
            }
        };
        // The log was closed while we were publishing.
        self.inner.store.close_ledger(&orphan).await?;
        Err(SlotLogError::LogClosed)
    }

    async fn run_swap(
        self,
        handle: LogHandle,
        kill: KillSignals,
        superseded: LedgerHandle,
        promoted: LedgerId,
        snapshot: SlotState,
    ) {
        let outcome = self
            .try_swap(&handle.slot, &kill, &superseded, promoted, snapshot)
            .await;
        match &outcome {
            SwapOutcome::Swapped { compacted } => tracing::info!(
                "Compacted chain of slot {} into ledger {compacted}",
                handle.slot
            ),
            SwapOutcome::Mismatch => {}
            SwapOutcome::Cancelled => tracing::info!(
                "Compaction of slot {} cancelled; chain left uncompacted",
                handle.slot
            ),
            SwapOutcome::Failed(err) => tracing::warn!(
                "Compaction of slot {} failed, chain left uncompacted: {err}",
                handle.slot
            ),
        }

        let [job_id, task_id, slot_id] = handle.slot.labels();
        self.inner.metrics.compactions.add(
            1,
            &[job_id, task_id, slot_id, KeyValue::new("outcome", outcome.label())],
        );
        handle.lock().set_phase(CompactionPhase::Active);

        if matches!(outcome, SwapOutcome::Mismatch)
            && self.inner.config.swap_mismatch == SwapMismatchPolicy::RetryImmediately
        {
            tracing::info!("Retrying compaction of slot {}", handle.slot);
            match self.begin_compaction(&handle, &kill).await {
                Ok(Publication::Confirmed(())) => {}
                Ok(Publication::Cancelled) => {
                    tracing::info!("Compaction retry of slot {} cancelled", handle.slot)
                }
                Err(err) => {
                    tracing::warn!("Compaction retry of slot {} failed: {err}", handle.slot)
                }
            }
        }
    }

    /// Seal the superseded ledger, write the snapshot into a fresh
    /// compacted ledger, then swap it in for everything before the
    /// promoted ledger.
    #[instrument(skip(self, slot, kill, superseded, snapshot), fields(slot = %slot))]
    async fn try_swap(
        &self,
        slot: &SlotKey,
        kill: &KillSignals,
        superseded: &LedgerHandle,
        promoted: LedgerId,
        snapshot: SlotState,
    ) -> SwapOutcome {
        let store = &self.inner.store;
        if let Err(err) = store.close_ledger(superseded).await {
            return SwapOutcome::Failed(err.into());
        }

        let chain = self.inner.replica.ledger_ids(slot);
        if chain.last() != Some(&promoted) {
            tracing::warn!(
                "Chain of slot {slot} is {chain:?} but expected promoted ledger {promoted} at its tail; abandoning compaction"
            );
            return SwapOutcome::Mismatch;
        }
        let prev = chain[..chain.len() - 1].to_vec();
        if prev.is_empty() {
            tracing::warn!("Chain of slot {slot} has nothing before ledger {promoted} to compact");
            return SwapOutcome::Mismatch;
        }

        let payload = match self.codec.encode(&StoredEntry::Snapshot(snapshot)) {
            Ok(payload) => payload,
            Err(err) => return SwapOutcome::Failed(err.into()),
        };
        let compacted = match store.create_ledger(&self.inner.config.ledger_options()).await {
            Ok(compacted) => compacted,
            Err(err) => return SwapOutcome::Failed(err.into()),
        };
        let compacted_id = compacted.id();
        tracing::debug!("Writing snapshot of slot {slot} into ledger {compacted_id}");
        if let Err(err) = append_durable(&**store, &compacted, payload).await {
            return SwapOutcome::Failed(err.into());
        }
        if let Err(err) = store.close_ledger(&compacted).await {
            return SwapOutcome::Failed(err.into());
        }

        if let Err(err) = self
            .inner
            .submit(Command::compact(slot, prev.clone(), compacted_id))
        {
            return SwapOutcome::Failed(err);
        }
        let publication = self
            .inner
            .await_chain(slot, kill, "compacted ledger", |chain| {
                chain.first() == Some(&compacted_id) || !chain.starts_with(&prev)
            })
            .await;
        match publication {
            Publication::Confirmed(chain) if chain.first() == Some(&compacted_id) => {
                SwapOutcome::Swapped {
                    compacted: compacted_id,
                }
            }
            Publication::Confirmed(chain) => {
                tracing::warn!(
                    "Chain of slot {slot} changed to {chain:?} before ledgers {prev:?} could be compacted into {compacted_id}; abandoning compaction"
                );
                SwapOutcome::Mismatch
            }
            Publication::Cancelled => SwapOutcome::Cancelled,
        }
    }
}

#[async_trait]
impl<S, R> LogBackend for LedgerLog<S, R>
where
    S: LedgerStore,
    R: ReplicaView,
{
    type Handle = LogHandle;

    #[instrument(skip_all, fields(slot = %event.slot))]
    async fn initialize(&self, event: &SlotEvent) -> Result<Publication<LogHandle>> {
        let rt = tokio::runtime::Handle::try_current().map_err(|_| SlotLogError::NoRuntime)?;
        let publication = self
            .inner
            .create_and_publish(&event.slot, &event.kill, "active ledger")
            .await?;
        Ok(publication.map(|active| LogHandle::new(event.slot.clone(), active, rt)))
    }

    async fn playback_log_entries(
        &self,
        handle: &LogHandle,
        event: &SlotEvent,
        initial: SlotState,
    ) -> Result<SlotState> {
        let (active, next) = {
            let ledgers = handle.lock();
            (ledgers.active.id(), ledgers.next.as_ref().map(LedgerHandle::id))
        };
        let prior: Vec<LedgerId> = self
            .inner
            .replica
            .ledger_ids(&event.slot)
            .into_iter()
            .filter(|id| *id != active && Some(*id) != next)
            .collect();

        let playback = Playback {
            store: &*self.inner.store,
            codec: &*self.codec,
            config: &self.inner.config,
            metrics: &self.inner.metrics,
        };
        let labels = event.slot.labels();
        with_timer!(
            self.inner.metrics.playback_duration,
            labels,
            playback
                .play(&event.slot, &event.windows, &prior, initial)
                .await
        )
    }

    fn store_log_entry(
        &self,
        handle: &LogHandle,
        event: &SlotEvent,
        state: &SlotState,
        entry: &LogEntry,
        on_ack: AckCallback,
    ) {
        let payload = match self.codec.encode(&StoredEntry::Delta(entry.clone())) {
            Ok(payload) => payload,
            Err(err) => return on_ack(Err(err.into())),
        };

        // Stores that complete on the caller's runtime need one even
        // if the caller is not on it.
        let _guard = handle.rt.enter();
        let mut ledgers = handle.lock();
        if ledgers.closed {
            drop(ledgers);
            return on_ack(Err(SlotLogError::LogClosed));
        }
        self.swap_if_pending(handle, &mut ledgers, state, &event.kill);

        let inner = self.inner.clone();
        let labels = handle.slot.labels();
        let ledger_id = ledgers.active.id();
        // Issued under the lock so a swap can't seal the ledger first.
        self.inner.store.async_append(
            &ledgers.active,
            payload,
            Box::new(move |res| match res {
                Ok(entry_id) => {
                    tracing::trace!("Entry {entry_id} of ledger {ledger_id} is durable");
                    inner.metrics.appends.add(1, &labels);
                    on_ack(Ok(()));
                }
                Err(err) => {
                    tracing::warn!("Append to ledger {ledger_id} failed: {err}");
                    inner.metrics.append_errors.add(1, &labels);
                    on_ack(Err(err.into()));
                }
            }),
        );
    }

    #[instrument(skip_all, fields(slot = %event.slot))]
    async fn compact_log(&self, handle: &LogHandle, event: &SlotEvent) -> Result<Publication<()>> {
        self.begin_compaction(handle, &event.kill).await
    }

    #[instrument(skip_all, fields(slot = %event.slot))]
    async fn close_log(&self, handle: &LogHandle, event: &SlotEvent) -> Result<()> {
        let (active, next) = {
            let mut ledgers = handle.lock();
            if ledgers.closed {
                return Ok(());
            }
            ledgers.closed = true;
            (ledgers.active.clone(), ledgers.next.take())
        };
        tracing::info!("Closing log of slot {}", event.slot);

        self.inner.store.close_ledger(&active).await?;
        if let Some(next) = next {
            self.inner.store.close_ledger(&next).await?;
        }
        Ok(())
    }
}
