//! Creating ledgers and getting them into a slot's chain.
//!
//! Creation in the Ledger Store and publication in the replica are
//! not atomic, and another writer for the same slot could publish in
//! between. So after announcing a ledger we keep polling the replica
//! until we see that *our* id is the chain's tail before using it.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc::UnboundedSender;
use tracing::instrument;

use crate::config::LedgerLogConfig;
use crate::errors::Result;
use crate::errors::SlotLogError;
use crate::metrics::LogMetrics;
use crate::recovery::model::*;
use crate::recovery::replica::ReplicaView;
use crate::recovery::store::LedgerHandle;
use crate::recovery::store::LedgerStore;
use crate::recovery::KillSignals;
use crate::recovery::Publication;

/// Owns ledger creation and publication for every slot of a log.
pub(crate) struct LedgerCoordinator<S, R> {
    pub(crate) store: Arc<S>,
    pub(crate) replica: Arc<R>,
    commands: UnboundedSender<Command>,
    pub(crate) config: LedgerLogConfig,
    pub(crate) metrics: LogMetrics,
}

impl<S, R> LedgerCoordinator<S, R>
where
    S: LedgerStore,
    R: ReplicaView,
{
    pub(crate) fn new(
        store: Arc<S>,
        replica: Arc<R>,
        commands: UnboundedSender<Command>,
        config: LedgerLogConfig,
    ) -> Self {
        Self {
            store,
            replica,
            commands,
            config,
            metrics: LogMetrics::new(),
        }
    }

    /// Put a command on the outbound channel.
    pub(crate) fn submit(&self, cmd: Command) -> Result<()> {
        tracing::debug!("Submitting {cmd:?}");
        self.commands
            .send(cmd)
            .map_err(|_| SlotLogError::CommandChannelClosed)
    }

    /// Create a new ledger and wait until it is the tail of `slot`'s
    /// chain.
    ///
    /// If the wait is cancelled, the new ledger is closed again before
    /// returning, since nothing will ever write to it.
    #[instrument(skip(self, slot, kill), fields(slot = %slot))]
    pub(crate) async fn create_and_publish(
        &self,
        slot: &SlotKey,
        kill: &KillSignals,
        purpose: &str,
    ) -> Result<Publication<LedgerHandle>> {
        let ledger = self
            .store
            .create_ledger(&self.config.ledger_options())
            .await?;
        let id = ledger.id();
        tracing::debug!("Created ledger {id} for {purpose}");

        if let Err(err) = self.submit(Command::assign(slot, id)) {
            self.discard(&ledger).await;
            return Err(err);
        }

        let labels = slot.labels();
        let publication = with_timer!(
            self.metrics.publish_wait_duration,
            labels,
            self.await_chain(slot, kill, purpose, |chain| chain.last() == Some(&id))
                .await
        );
        match publication {
            Publication::Confirmed(_) => {
                tracing::info!("Ledger {id} published as {purpose} of slot {slot}");
                Ok(Publication::Confirmed(ledger))
            }
            Publication::Cancelled => {
                self.discard(&ledger).await;
                Ok(Publication::Cancelled)
            }
        }
    }

    /// Close a ledger we gave up on. Failing to is only worth a
    /// warning; it was never part of a chain.
    async fn discard(&self, ledger: &LedgerHandle) {
        if let Err(err) = self.store.close_ledger(ledger).await {
            tracing::warn!("Unable to close abandoned ledger {}: {err}", ledger.id());
        }
    }

    /// Poll the replica until `done` holds for `slot`'s chain or the
    /// slot is killed.
    ///
    /// Both kill signals are checked before every poll and also wake
    /// the sleep between polls.
    pub(crate) async fn await_chain<F>(
        &self,
        slot: &SlotKey,
        kill: &KillSignals,
        purpose: &str,
        mut done: F,
    ) -> Publication<Vec<LedgerId>>
    where
        F: FnMut(&[LedgerId]) -> bool,
    {
        let start = Instant::now();
        let log_every = self.config.progress_log_every.max(1);
        let mut polls: u32 = 0;
        loop {
            if kill.is_killed() {
                tracing::info!(
                    "Stopped waiting for {purpose} of slot {slot} after {polls} polls; killed"
                );
                return Publication::Cancelled;
            }

            let chain = self.replica.ledger_ids(slot);
            if done(&chain) {
                return Publication::Confirmed(chain);
            }

            polls += 1;
            if polls % log_every == 0 {
                tracing::info!(
                    "Still waiting for {purpose} of slot {slot} after {polls} polls and {:?}; chain is {chain:?}",
                    start.elapsed()
                );
            }

            tokio::select! {
                _ = kill.killed() => {}
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
            }
        }
    }
}
