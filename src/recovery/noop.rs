//! A log backend which does nothing.

use async_trait::async_trait;

use crate::errors::Result;
use crate::recovery::model::*;
use crate::recovery::AckCallback;
use crate::recovery::LogBackend;
use crate::recovery::Publication;
use crate::recovery::SlotEvent;

/// Entries are dropped and playback always starts from the given
/// state. Use when recovery is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpLog;

impl NoOpLog {
    pub fn new() -> Self {
        NoOpLog {}
    }
}

#[async_trait]
impl LogBackend for NoOpLog {
    type Handle = ();

    async fn initialize(&self, _event: &SlotEvent) -> Result<Publication<()>> {
        Ok(Publication::Confirmed(()))
    }

    async fn playback_log_entries(
        &self,
        _handle: &(),
        _event: &SlotEvent,
        initial: SlotState,
    ) -> Result<SlotState> {
        Ok(initial)
    }

    fn store_log_entry(
        &self,
        _handle: &(),
        _event: &SlotEvent,
        _state: &SlotState,
        _entry: &LogEntry,
        on_ack: AckCallback,
    ) {
        on_ack(Ok(()))
    }

    async fn compact_log(&self, _handle: &(), _event: &SlotEvent) -> Result<Publication<()>> {
        Ok(Publication::Confirmed(()))
    }

    async fn close_log(&self, _handle: &(), _event: &SlotEvent) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn noop_log_acks_and_forgets() {
    use std::sync::mpsc;

    use crate::window::Windows;

    let log = NoOpLog::new();
    let event = SlotEvent::new(SlotKey::new("job", "task", 0), Windows::new());

    let handle = log.initialize(&event).await.unwrap().confirmed().unwrap();
    let (tx, rx) = mpsc::channel();
    log.store_log_entry(
        &handle,
        &event,
        &SlotState::new(),
        &LogEntry::new(vec![]),
        Box::new(move |res| tx.send(res).unwrap()),
    );
    assert!(rx.recv().unwrap().is_ok());

    let state = log
        .playback_log_entries(&handle, &event, SlotState::new())
        .await
        .unwrap();
    assert_eq!(state, SlotState::new());
    assert!(!log.compact_log(&handle, &event).await.unwrap().is_cancelled());
    log.close_log(&handle, &event).await.unwrap();
}
