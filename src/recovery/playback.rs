//! Rebuilding slot state from a chain.
//!
//! Ledgers are replayed in chain order and entries in ledger order,
//! each entry folded into the state with [`SlotState::apply_entry`].
//! Nothing is reordered or skipped besides empty ledgers and
//! duplicate unique ids, so replaying the same ledgers always yields
//! the same state.
//!
//! A compacted ledger's only entry is a snapshot, which replaces the
//! state built so far. In a well formed chain that is always the
//! first entry played.

use tracing::instrument;

use crate::errors::Result;
use crate::errors::SlotLogError;
use crate::metrics::LogMetrics;
use crate::recovery::codec::EntryCodec;
use crate::recovery::model::*;
use crate::recovery::store::LedgerStore;
use crate::window::Windows;
use crate::LedgerLogConfig;

pub(crate) struct Playback<'a, S> {
    pub(crate) store: &'a S,
    pub(crate) codec: &'a dyn EntryCodec,
    pub(crate) config: &'a LedgerLogConfig,
    pub(crate) metrics: &'a LogMetrics,
}

impl<'a, S> Playback<'a, S>
where
    S: LedgerStore,
{
    /// Replay `ledger_ids`, oldest first, on top of `state`.
    #[instrument(skip(self, slot, windows, state), fields(slot = %slot))]
    pub(crate) async fn play(
        &self,
        slot: &SlotKey,
        windows: &Windows,
        ledger_ids: &[LedgerId],
        mut state: SlotState,
    ) -> Result<SlotState> {
        let labels = slot.labels();
        for ledger_id in ledger_ids {
            state = self
                .play_ledger(*ledger_id, windows, state, &labels)
                .await?;
        }
        tracing::info!(
            "Played back {} ledgers for slot {slot}; {} aggregates, {} ids seen",
            ledger_ids.len(),
            state.windows.len(),
            state.seen.len()
        );
        Ok(state)
    }

    async fn play_ledger(
        &self,
        ledger_id: LedgerId,
        windows: &Windows,
        mut state: SlotState,
        labels: &[opentelemetry::KeyValue],
    ) -> Result<SlotState> {
        let ledger = self
            .store
            .open_ledger(ledger_id, self.config.digest, &self.config.password)
            .await?;
        let Some(last) = self.store.last_confirmed(&ledger).await? else {
            tracing::debug!("Ledger {ledger_id} is empty; skipping");
            return Ok(state);
        };
        tracing::debug!("Playing back entries 0..={last} of ledger {ledger_id}");

        let batch = self.config.read_batch_size.max(1);
        let mut from = EntryId(0);
        while from <= last {
            let to = EntryId((from.0 + batch - 1).min(last.0));
            let payloads = self.store.read_entries(&ledger, from, to).await?;
            for (payload, entry_id) in payloads.iter().zip((from.0..).map(EntryId)) {
                let entry = self.codec.decode(payload)?;
                self.metrics.playback_entries.add(1, labels);
                match entry {
                    StoredEntry::Snapshot(snapshot) => {
                        tracing::debug!(
                            "Ledger {ledger_id} entry {entry_id} is a snapshot; replacing state"
                        );
                        state = snapshot;
                    }
                    StoredEntry::Delta(entry) => {
                        tracing::trace!("Applying ledger {ledger_id} entry {entry_id}");
                        let applied = state.apply_entry(&entry, windows).map_err(|window| {
                            SlotLogError::UnknownWindow {
                                window,
                                ledger: ledger_id,
                                entry: entry_id,
                            }
                        })?;
                        if applied == Applied::Duplicate {
                            self.metrics.playback_duplicates.add(1, labels);
                        }
                    }
                }
            }
            from = to.next();
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;

    use proptest::prelude::*;
    use serde_json::json;
    use tokio::sync::oneshot;

    use super::*;
    use crate::recovery::model::arbitrary;
    use crate::recovery::codec::JsonCodec;
    use crate::recovery::store::InMemLedgerStore;
    use crate::recovery::store::LedgerHandle;
    use crate::window::Extent;
    use crate::window::SumWindow;
    use crate::window::WindowId;

    async fn write(store: &InMemLedgerStore, ledger: &LedgerHandle, entry: StoredEntry) {
        let (tx, rx) = oneshot::channel();
        store.async_append(
            ledger,
            JsonCodec.encode(&entry).unwrap(),
            Box::new(move |res| {
                let _ = tx.send(res);
            }),
        );
        rx.await.unwrap().unwrap();
    }

    fn delta(id: Option<&str>, window: &str, extent: i64, value: i64) -> StoredEntry {
        let deltas = vec![StateDelta(window.into(), Extent(extent), json!(value))];
        StoredEntry::Delta(match id {
            Some(id) => LogEntry::with_id(id, deltas),
            None => LogEntry::new(deltas),
        })
    }

    struct Fixture {
        store: InMemLedgerStore,
        config: LedgerLogConfig,
        metrics: LogMetrics,
        windows: Windows,
        slot: SlotKey,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: InMemLedgerStore::new(),
                config: LedgerLogConfig {
                    read_batch_size: 2,
                    ..Default::default()
                },
                metrics: LogMetrics::new(),
                windows: Windows::new()
                    .register("w1", SumWindow)
                    .register("w2", SumWindow),
                slot: SlotKey::new("job", "task", 0),
            }
        }

        async fn ledger(&self, entries: Vec<StoredEntry>) -> LedgerId {
            let ledger = self
                .store
                .create_ledger(&self.config.ledger_options())
                .await
                .unwrap();
            for entry in entries {
                write(&self.store, &ledger, entry).await;
            }
            ledger.id()
        }

        async fn play(&self, ledger_ids: &[LedgerId]) -> Result<SlotState> {
            let playback = Playback {
                store: &self.store,
                codec: &JsonCodec,
                config: &self.config,
                metrics: &self.metrics,
            };
            playback
                .play(&self.slot, &self.windows, ledger_ids, SlotState::new())
                .await
        }
    }

    #[tokio::test]
    async fn plays_ledgers_in_order_across_batches() {
        let fixture = Fixture::new();
        let first = fixture
            .ledger(vec![
                delta(None, "w1", 0, 1),
                delta(None, "w1", 0, 1),
                delta(None, "w1", 0, 1),
            ])
            .await;
        let empty = fixture.ledger(vec![]).await;
        let second = fixture.ledger(vec![delta(None, "w2", 5, 7)]).await;

        let state = fixture.play(&[first, empty, second]).await.unwrap();

        assert_eq!(state.windows.get(&"w1".into(), &Extent(0)), Some(&json!(3)));
        assert_eq!(state.windows.get(&"w2".into(), &Extent(5)), Some(&json!(7)));
    }

    #[tokio::test]
    async fn playback_is_deterministic() {
        let fixture = Fixture::new();
        let mut entries = Vec::new();
        for i in 0..7 {
            entries.push(delta(Some(format!("m{}", i % 4).as_str()), "w1", i % 3, i));
        }
        let ledger = fixture.ledger(entries).await;

        let once = fixture.play(&[ledger]).await.unwrap();
        let twice = fixture.play(&[ledger]).await.unwrap();

        assert_eq!(once, twice);
        assert_eq!(once.seen.len(), 4);
    }

    #[tokio::test]
    async fn duplicates_apply_once() {
        let fixture = Fixture::new();
        let first = fixture.ledger(vec![delta(Some("m1"), "w1", 0, 5)]).await;
        let second = fixture
            .ledger(vec![delta(Some("m1"), "w1", 0, 5), delta(None, "w1", 0, 1)])
            .await;

        let state = fixture.play(&[first, second]).await.unwrap();

        assert_eq!(state.windows.get(&"w1".into(), &Extent(0)), Some(&json!(6)));
    }

    #[tokio::test]
    async fn snapshot_replaces_state() {
        let fixture = Fixture::new();
        let mut snapshot = SlotState::new();
        let entry = LogEntry::with_id("m1", vec![StateDelta("w1".into(), Extent(0), json!(10))]);
        snapshot.apply_entry(&entry, &fixture.windows).unwrap();
        let compacted = fixture.ledger(vec![StoredEntry::Snapshot(snapshot)]).await;
        let active = fixture
            .ledger(vec![delta(Some("m1"), "w1", 0, 10), delta(None, "w1", 0, 1)])
            .await;

        let state = fixture.play(&[compacted, active]).await.unwrap();

        assert_eq!(
            state.windows.get(&"w1".into(), &Extent(0)),
            Some(&json!(11))
        );
    }

    #[tokio::test]
    async fn unknown_window_is_fatal() {
        let fixture = Fixture::new();
        let ledger = fixture
            .ledger(vec![delta(None, "w1", 0, 1), delta(None, "gone", 0, 1)])
            .await;

        let found = fixture.play(&[ledger]).await;

        match found {
            Err(SlotLogError::UnknownWindow {
                window,
                ledger: found_ledger,
                entry,
            }) => {
                assert_eq!(window, WindowId::from("gone"));
                assert_eq!(found_ledger, ledger);
                assert_eq!(entry, EntryId(1));
            }
            other => panic!("expected unknown window error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_ledger_is_an_error() {
        let fixture = Fixture::new();

        assert!(matches!(
            fixture.play(&[LedgerId(42)]).await,
            Err(SlotLogError::Ledger(_))
        ));
    }

    fn block_on<F: Future>(fut: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(fut)
    }

    fn deltas(entries: &[LogEntry]) -> Vec<StoredEntry> {
        entries.iter().cloned().map(StoredEntry::Delta).collect()
    }

    fn arbitrary_fixture() -> Fixture {
        Fixture {
            windows: arbitrary::windows(),
            ..Fixture::new()
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]

        #[test]
        fn playback_is_the_ordered_fold(
            entries in arbitrary::entries(),
            split in 0usize..24,
        ) {
            let split = split.min(entries.len());
            let (once, twice) = block_on(async {
                let fixture = arbitrary_fixture();
                let first = fixture.ledger(deltas(&entries[..split])).await;
                let second = fixture.ledger(deltas(&entries[split..])).await;
                let once = fixture.play(&[first, second]).await.unwrap();
                let twice = fixture.play(&[first, second]).await.unwrap();
                (once, twice)
            });

            prop_assert_eq!(&once, &arbitrary::fold(&entries));
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn snapshot_then_tail_matches_full_replay(
            entries in arbitrary::entries(),
            split in 0usize..24,
        ) {
            let split = split.min(entries.len());
            let found = block_on(async {
                let fixture = arbitrary_fixture();
                let snapshot = arbitrary::fold(&entries[..split]);
                let compacted = fixture.ledger(vec![StoredEntry::Snapshot(snapshot)]).await;
                let active = fixture.ledger(deltas(&entries[split..])).await;
                fixture.play(&[compacted, active]).await.unwrap()
            });

            prop_assert_eq!(found, arbitrary::fold(&entries));
        }

        #[test]
        fn replaying_identified_entries_again_changes_nothing(entries in arbitrary::entries()) {
            let entries: Vec<_> = entries
                .into_iter()
                .enumerate()
                .map(|(i, mut entry)| {
                    entry.id.get_or_insert_with(|| UniqueId(format!("u{i}")));
                    entry
                })
                .collect();
            let (once, again) = block_on(async {
                let fixture = arbitrary_fixture();
                let ledger = fixture.ledger(deltas(&entries)).await;
                let once = fixture.play(&[ledger]).await.unwrap();
                let again = fixture.play(&[ledger, ledger]).await.unwrap();
                (once, again)
            });

            prop_assert_eq!(once, again);
        }
    }
}
