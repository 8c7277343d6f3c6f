//! The cluster's view of every slot's ledger chain.
//!
//! A slot never edits its chain directly. It sends [`Command`]s on the
//! outbound channel and then polls a [`ReplicaView`] until the change
//! shows up. How commands are agreed on across the cluster is not
//! this crate's concern; [`InMemReplica`] applies them in arrival
//! order within one process, which is what tests and single-node
//! deployments need.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::recovery::model::*;

/// Read-only, eventually consistent snapshot of ledger chains.
pub trait ReplicaView: Send + Sync + 'static {
    /// The chain of `slot`, oldest first. Empty if the slot has never
    /// published a ledger.
    fn ledger_ids(&self, slot: &SlotKey) -> Vec<LedgerId>;
}

/// Chains held in process memory.
///
/// Clones share the same chains.
#[derive(Debug, Clone, Default)]
pub struct InMemReplica {
    chains: Arc<RwLock<HashMap<SlotKey, Vec<LedgerId>>>>,
}

impl InMemReplica {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one command to the chains.
    ///
    /// `assign-ledger-id` appends to the chain. `compact-ledger-ids`
    /// only takes effect if the previous ids are exactly the chain's
    /// current prefix; otherwise the chain moved on under the
    /// compaction and the command is dropped.
    pub fn apply(&self, cmd: &Command) {
        let slot = cmd.slot();
        let mut chains = self.chains.write().unwrap_or_else(PoisonError::into_inner);
        let chain = chains.entry(slot.clone()).or_default();
        match cmd {
            Command::AssignLedgerId(assign) => {
                if chain.contains(&assign.ledger_id) {
                    tracing::warn!(
                        "Ledger {} already in chain of slot {slot}; ignoring",
                        assign.ledger_id
                    );
                } else {
                    chain.push(assign.ledger_id);
                }
            }
            Command::CompactLedgerIds(compact) => {
                if chain.starts_with(&compact.prev_ledger_ids) {
                    let rest = chain.split_off(compact.prev_ledger_ids.len());
                    *chain = compact.new_ledger_ids.clone();
                    chain.extend(rest);
                } else {
                    tracing::warn!(
                        "Compaction of slot {slot} expected prefix {:?} but chain is {chain:?}; ignoring",
                        compact.prev_ledger_ids
                    );
                }
            }
        }
        tracing::trace!("Chain of slot {slot} is now {chain:?}");
    }

    /// Overwrite a slot's chain. Simulates commands from other peers.
    pub fn set_ledger_ids(&self, slot: &SlotKey, ledger_ids: Vec<LedgerId>) {
        self.chains
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(slot.clone(), ledger_ids);
    }

    /// Consume an outbound command channel, applying each command
    /// `delay` after it arrives.
    ///
    /// Must be called within a Tokio runtime. The task ends when every
    /// sender is dropped.
    pub fn spawn(
        &self,
        mut rx: mpsc::UnboundedReceiver<Command>,
        delay: Duration,
    ) -> JoinHandle<()> {
        let replica = self.clone();
        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                tracing::debug!("Replica applying {cmd:?}");
                replica.apply(&cmd);
            }
        })
    }

    /// New outbound channel with this replica applying its commands.
    pub fn connect(&self) -> mpsc::UnboundedSender<Command> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.spawn(rx, Duration::ZERO);
        tx
    }
}

impl ReplicaView for InMemReplica {
    fn ledger_ids(&self, slot: &SlotKey) -> Vec<LedgerId> {
        self.chains
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(slot)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assign_appends() {
        let replica = InMemReplica::new();
        let slot = SlotKey::new("job", "task", 0);

        replica.apply(&Command::assign(&slot, LedgerId(1)));
        replica.apply(&Command::assign(&slot, LedgerId(2)));
        replica.apply(&Command::assign(&slot, LedgerId(2)));

        assert_eq!(replica.ledger_ids(&slot), vec![LedgerId(1), LedgerId(2)]);
        assert!(replica.ledger_ids(&SlotKey::new("job", "task", 1)).is_empty());
    }

    #[test]
    fn compact_replaces_prefix() {
        let replica = InMemReplica::new();
        let slot = SlotKey::new("job", "task", 0);
        replica.set_ledger_ids(&slot, vec![LedgerId(1), LedgerId(2), LedgerId(3)]);

        replica.apply(&Command::compact(
            &slot,
            vec![LedgerId(1), LedgerId(2)],
            LedgerId(4),
        ));

        assert_eq!(replica.ledger_ids(&slot), vec![LedgerId(4), LedgerId(3)]);
    }

    #[test]
    fn compact_of_stale_prefix_is_dropped() {
        let replica = InMemReplica::new();
        let slot = SlotKey::new("job", "task", 0);
        replica.set_ledger_ids(&slot, vec![LedgerId(5), LedgerId(3)]);

        replica.apply(&Command::compact(
            &slot,
            vec![LedgerId(1), LedgerId(2)],
            LedgerId(4),
        ));

        assert_eq!(replica.ledger_ids(&slot), vec![LedgerId(5), LedgerId(3)]);
    }

    #[tokio::test]
    async fn spawned_replica_applies_commands() {
        let replica = InMemReplica::new();
        let slot = SlotKey::new("job", "task", 0);
        let (tx, rx) = mpsc::unbounded_channel();
        let task = replica.spawn(rx, Duration::from_millis(1));

        tx.send(Command::assign(&slot, LedgerId(1))).unwrap();
        drop(tx);
        task.await.unwrap();

        assert_eq!(replica.ledger_ids(&slot), vec![LedgerId(1)]);
    }
}
