//! Durable logging and recovery of slot state.
//!
//! Architecture
//! ------------
//!
//! Each slot of a task owns a **chain**: the ordered list of ledger
//! ids in the [`replica::ReplicaView`] that together hold every
//! change ever made to the slot's [`model::SlotState`]. The last
//! ledger of the chain is the **active** one and is the only one
//! written to; all others are sealed.
//!
//! Ledgers live in a [`store::LedgerStore`]. Creating a ledger and
//! adding it to the chain are separate steps, and another peer could
//! race us to extend the chain, so every newly created ledger goes
//! through the [`coordinator`]: announce it with an
//! `assign-ledger-id` [`model::Command`], then poll the replica until
//! it shows up as the tail. That wait is cancellable by either of the
//! [`KillSignals`] and yields a [`Publication`].
//!
//! The lifecycle of a slot is:
//!
//! 1. [`LogBackend::initialize`] creates and publishes the first
//!    active ledger.
//!
//! 2. [`LogBackend::playback_log_entries`] replays every other ledger
//!    of the chain, oldest first, to rebuild state. See [`playback`].
//!
//! 3. [`LogBackend::store_log_entry`] appends each new entry to the
//!    active ledger and acks once it is durable.
//!
//! 4. [`LogBackend::compact_log`] is called periodically by whatever
//!    schedules compaction.
//!
//! 5. [`LogBackend::close_log`] seals the ledgers.
//!
//! Compaction
//! ----------
//!
//! Replaying a chain gets slower the longer it is, so its prefix is
//! periodically replaced by a single ledger holding a snapshot of the
//! slot state. This runs through the phases of [`CompactionPhase`]:
//!
//! - **Active**: one active ledger. Steady state.
//!
//! - **PreCompacting**: [`LogBackend::compact_log`] created and
//!   published a **next** ledger. Writes still go to the active one.
//!
//! - **Swapping**: the next write saw the next ledger, promoted it to
//!   active and handed a snapshot of the state to a background task.
//!   That task seals the old active ledger, writes the snapshot into a
//!   fresh compacted ledger, then sends `compact-ledger-ids` replacing
//!   everything before the promoted ledger with the compacted one, so
//!   the chain becomes `[compacted, active]`. Once the replica shows
//!   that, the phase is **Active** again.
//!
//! The swap happens inside the write path and under the same lock as
//! the append, so no entry is ever written to a superseded ledger and
//! entries after the swap point are never split across ledgers.
//!
//! Compaction is only an optimization: the uncompacted chain always
//! replays to the same state. So if the chain tail is not the
//! promoted ledger when the swap task looks, or anything in the task
//! fails, compaction is abandoned with a warning and the phase goes
//! back to Active. See [`crate::config::SwapMismatchPolicy`] for when
//! it is tried again.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::errors::Result;
use crate::errors::SlotLogError;
use crate::window::Windows;

pub mod codec;
pub(crate) mod coordinator;
mod ledger_log;
pub mod model;
mod noop;
pub(crate) mod playback;
pub mod replica;
pub mod store;

pub use ledger_log::LedgerLog;
pub use ledger_log::LogHandle;
pub use noop::NoOpLog;

use self::model::LogEntry;
use self::model::SlotKey;
use self::model::SlotState;

/// Outcome of waiting for a ledger id to be published.
///
/// Cancellation is not an error: the caller decides whether to retry
/// or give up on the slot.
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Publication<T> {
    Confirmed(T),
    Cancelled,
}

impl<T> Publication<T> {
    pub fn confirmed(self) -> Option<T> {
        match self {
            Self::Confirmed(value) => Some(value),
            Self::Cancelled => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Publication<U> {
        match self {
            Self::Confirmed(value) => Publication::Confirmed(f(value)),
            Self::Cancelled => Publication::Cancelled,
        }
    }
}

/// The two independent reasons to stop waiting.
///
/// Either one firing counts as killed.
#[derive(Debug, Clone, Default)]
pub struct KillSignals {
    /// The whole process is shutting down.
    pub kill: CancellationToken,
    /// Just this task is.
    pub task_kill: CancellationToken,
}

impl KillSignals {
    pub fn new(kill: CancellationToken, task_kill: CancellationToken) -> Self {
        Self { kill, task_kill }
    }

    pub fn is_killed(&self) -> bool {
        self.kill.is_cancelled() || self.task_kill.is_cancelled()
    }

    /// Resolves once either signal fires.
    pub async fn killed(&self) {
        tokio::select! {
            _ = self.kill.cancelled() => {}
            _ = self.task_kill.cancelled() => {}
        }
    }
}

/// Everything a log backend needs to know about the slot it is
/// acting for.
#[derive(Debug, Clone)]
pub struct SlotEvent {
    pub slot: SlotKey,
    pub windows: Windows,
    pub kill: KillSignals,
}

impl SlotEvent {
    pub fn new(slot: SlotKey, windows: Windows) -> Self {
        Self {
            slot,
            windows,
            kill: KillSignals::default(),
        }
    }

    pub fn with_kill(mut self, kill: KillSignals) -> Self {
        self.kill = kill;
        self
    }
}

/// Where a slot is in the compaction cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionPhase {
    Active,
    PreCompacting,
    Swapping,
}

/// Called exactly once per stored entry, with `Ok` once it is
/// durable or the failure. Normally runs off the storing thread's
/// stack; only while the runtime is shutting down can it run inline.
pub type AckCallback = Box<dyn FnOnce(std::result::Result<(), SlotLogError>) + Send + 'static>;

/// Interchangeable durable logs for slot state.
///
/// The surrounding engine holds one backend and one `Handle` per
/// slot, and is responsible for only having one writer per slot.
#[async_trait]
pub trait LogBackend: Send + Sync {
    type Handle: Send + Sync;

    /// Bootstrap a slot's log. Blocks until its first ledger is
    /// published or the slot is killed.
    async fn initialize(&self, event: &SlotEvent) -> Result<Publication<Self::Handle>>;

    /// Rebuild state from everything logged before
    /// [`LogBackend::initialize`].
    async fn playback_log_entries(
        &self,
        handle: &Self::Handle,
        event: &SlotEvent,
        initial: SlotState,
    ) -> Result<SlotState>;

    /// Durably log an entry.
    ///
    /// `state` is the slot state with every previously stored entry
    /// applied and `entry` not yet applied; it is what a pending
    /// compaction snapshots. Does not wait for durability; `on_ack`
    /// reports it.
    fn store_log_entry(
        &self,
        handle: &Self::Handle,
        event: &SlotEvent,
        state: &SlotState,
        entry: &LogEntry,
        on_ack: AckCallback,
    );

    /// Begin a compaction cycle. Blocks until the next ledger is
    /// published or the slot is killed.
    async fn compact_log(&self, handle: &Self::Handle, event: &SlotEvent) -> Result<Publication<()>>;

    /// Seal this slot's ledgers. Does not wait for in-flight appends.
    async fn close_log(&self, handle: &Self::Handle, event: &SlotEvent) -> Result<()>;
}

#[tokio::test]
async fn killed_by_either_signal() {
    let signals = KillSignals::default();
    assert!(!signals.is_killed());

    signals.task_kill.cancel();
    assert!(signals.is_killed());
    signals.killed().await;

    let signals = KillSignals::default();
    signals.kill.cancel();
    assert!(signals.is_killed());
    signals.killed().await;
}

#[test]
fn publication_map() {
    assert_eq!(Publication::Confirmed(1).map(|x| x + 1), Publication::Confirmed(2));
    assert_eq!(
        Publication::<i32>::Cancelled.map(|x| x + 1).confirmed(),
        None
    );
}
