//! Ledger Store with all ledgers in memory.
//!
//! Everything is lost when the last clone is dropped, so this is for
//! tests and single-process experiments. Clones share the same
//! ledgers, which is how a test "restarts" a slot against the same
//! durable data.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use async_trait::async_trait;

use super::*;

#[derive(Debug)]
struct StoredEntry {
    payload: Vec<u8>,
    digest: Option<u64>,
}

#[derive(Debug)]
struct StoredLedger {
    password_hash: u64,
    closed: bool,
    entries: Vec<StoredEntry>,
}

impl StoredLedger {
    fn last_confirmed(&self) -> Option<EntryId> {
        self.entries
            .len()
            .checked_sub(1)
            .map(|last| EntryId(last as u64))
    }
}

#[derive(Debug, Default)]
struct Inner {
    next_id: u64,
    ledgers: BTreeMap<LedgerId, StoredLedger>,
    fail_all_appends: bool,
    fail_appends_to: HashSet<LedgerId>,
}

impl Inner {
    fn ledger(&self, id: LedgerId) -> Result<&StoredLedger, LedgerError> {
        self.ledgers.get(&id).ok_or(LedgerError::NoSuchLedger(id))
    }

    fn append(&mut self, ledger: &LedgerHandle, payload: Vec<u8>) -> Result<EntryId, LedgerError> {
        let id = ledger.id();
        if !ledger.is_writable() {
            return Err(LedgerError::ReadOnly(id));
        }
        if self.fail_all_appends || self.fail_appends_to.contains(&id) {
            return Err(LedgerError::Injected(id));
        }
        let stored = self
            .ledgers
            .get_mut(&id)
            .ok_or(LedgerError::NoSuchLedger(id))?;
        if stored.closed {
            return Err(LedgerError::Closed(id));
        }

        let entry = EntryId(stored.entries.len() as u64);
        let digest = ledger.digest_of(entry, &payload);
        stored.entries.push(StoredEntry { payload, digest });
        Ok(entry)
    }
}

/// A Ledger Store with all data in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemLedgerStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every following append fail, or stop doing so.
    pub fn fail_appends(&self, fail: bool) {
        self.lock().fail_all_appends = fail;
    }

    /// Make every following append to one ledger fail.
    pub fn fail_appends_to(&self, ledger: LedgerId) {
        self.lock().fail_appends_to.insert(ledger);
    }

    /// Ids of every ledger ever created, in creation order.
    pub fn ledger_ids(&self) -> Vec<LedgerId> {
        self.lock().ledgers.keys().copied().collect()
    }

    pub fn is_closed(&self, ledger: LedgerId) -> Option<bool> {
        self.lock().ledgers.get(&ledger).map(|stored| stored.closed)
    }

    /// Number of entries written to a ledger.
    pub fn entry_count(&self, ledger: LedgerId) -> Option<usize> {
        self.lock()
            .ledgers
            .get(&ledger)
            .map(|stored| stored.entries.len())
    }

    #[cfg(test)]
    pub(crate) fn corrupt(&self, ledger: LedgerId, entry: EntryId) {
        let mut inner = self.lock();
        let stored = inner.ledgers.get_mut(&ledger).unwrap();
        stored.entries[entry.0 as usize].payload.push(0);
    }
}

/// An append result waiting to be handed to its callback.
///
/// Dropping it unfired fires it, so a spawned completion the runtime
/// discards on shutdown still acks exactly once.
struct Completion {
    callback: Option<AppendCallback>,
    res: Option<Result<EntryId, LedgerError>>,
}

impl Completion {
    fn fire(&mut self) {
        if let (Some(callback), Some(res)) = (self.callback.take(), self.res.take()) {
            callback(res);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.fire();
    }
}

/// Run an append callback outside of the caller's stack if there is
/// a runtime to run it on.
fn complete(callback: AppendCallback, res: Result<EntryId, LedgerError>) {
    let mut completion = Completion {
        callback: Some(callback),
        res: Some(res),
    };
    match tokio::runtime::Handle::try_current() {
        Ok(rt) => {
            rt.spawn(async move { completion.fire() });
        }
        Err(_) => completion.fire(),
    }
}

#[async_trait]
impl LedgerStore for InMemLedgerStore {
    async fn create_ledger(&self, options: &LedgerOptions) -> Result<LedgerHandle, LedgerError> {
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = LedgerId(inner.next_id);
        inner.ledgers.insert(
            id,
            StoredLedger {
                password_hash: password_hash(&options.password),
                closed: false,
                entries: Vec::new(),
            },
        );
        tracing::trace!("Created in-memory ledger {id}");
        Ok(LedgerHandle::new(
            id,
            true,
            options.digest,
            &options.password,
        ))
    }

    async fn open_ledger(
        &self,
        id: LedgerId,
        digest: DigestType,
        password: &str,
    ) -> Result<LedgerHandle, LedgerError> {
        let inner = self.lock();
        let stored = inner.ledger(id)?;
        if stored.password_hash != password_hash(password) {
            return Err(LedgerError::Unauthorized(id));
        }
        Ok(LedgerHandle::new(id, false, digest, password))
    }

    fn async_append(&self, ledger: &LedgerHandle, payload: Vec<u8>, callback: AppendCallback) {
        // Entry ids are assigned under the lock, so confirmation order
        // is issue order even though callbacks may run in any order.
        let res = self.lock().append(ledger, payload);
        complete(callback, res);
    }

    async fn last_confirmed(&self, ledger: &LedgerHandle) -> Result<Option<EntryId>, LedgerError> {
        Ok(self.lock().ledger(ledger.id())?.last_confirmed())
    }

    async fn read_entries(
        &self,
        ledger: &LedgerHandle,
        from: EntryId,
        to: EntryId,
    ) -> Result<Vec<Vec<u8>>, LedgerError> {
        let inner = self.lock();
        let stored = inner.ledger(ledger.id())?;
        check_range(ledger.id(), from, to, stored.last_confirmed())?;

        stored.entries[from.0 as usize..=to.0 as usize]
            .iter()
            .zip(from.0..)
            .map(|(entry, index)| -> Result<Vec<u8>, LedgerError> {
                ledger.verify(EntryId(index), &entry.payload, entry.digest)?;
                Ok(entry.payload.clone())
            })
            .collect()
    }

    async fn close_ledger(&self, ledger: &LedgerHandle) -> Result<(), LedgerError> {
        let mut inner = self.lock();
        let id = ledger.id();
        let stored = inner
            .ledgers
            .get_mut(&id)
            .ok_or(LedgerError::NoSuchLedger(id))?;
        if !stored.closed {
            tracing::trace!("Closing in-memory ledger {id}");
            stored.closed = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::oneshot;

    use super::*;

    fn options() -> LedgerOptions {
        LedgerOptions {
            ensemble_size: 3,
            quorum_size: 2,
            digest: DigestType::SeaHash,
            password: String::from("pw"),
        }
    }

    async fn append(
        store: &InMemLedgerStore,
        ledger: &LedgerHandle,
        payload: &[u8],
    ) -> Result<EntryId, LedgerError> {
        let (tx, rx) = oneshot::channel();
        store.async_append(
            ledger,
            payload.to_vec(),
            Box::new(move |res| {
                let _ = tx.send(res);
            }),
        );
        rx.await.unwrap()
    }

    #[tokio::test]
    async fn ids_increase() {
        let store = InMemLedgerStore::new();
        let first = store.create_ledger(&options()).await.unwrap();
        let second = store.create_ledger(&options()).await.unwrap();

        assert!(first.id() < second.id());
        assert_eq!(store.ledger_ids(), vec![first.id(), second.id()]);
    }

    #[tokio::test]
    async fn append_then_read() {
        let store = InMemLedgerStore::new();
        let ledger = store.create_ledger(&options()).await.unwrap();

        assert_eq!(store.last_confirmed(&ledger).await.unwrap(), None);
        for (i, payload) in [b"a", b"b", b"c"].into_iter().enumerate() {
            let found = append(&store, &ledger, payload).await.unwrap();
            assert_eq!(found, EntryId(i as u64));
        }

        let reader = store
            .open_ledger(ledger.id(), DigestType::SeaHash, "pw")
            .await
            .unwrap();
        assert_eq!(
            store.last_confirmed(&reader).await.unwrap(),
            Some(EntryId(2))
        );
        assert_eq!(
            store
                .read_entries(&reader, EntryId(1), EntryId(2))
                .await
                .unwrap(),
            vec![b"b".to_vec(), b"c".to_vec()]
        );
    }

    #[tokio::test]
    async fn closed_and_read_only_reject_appends() {
        let store = InMemLedgerStore::new();
        let ledger = store.create_ledger(&options()).await.unwrap();
        let reader = store
            .open_ledger(ledger.id(), DigestType::SeaHash, "pw")
            .await
            .unwrap();

        assert!(matches!(
            append(&store, &reader, b"a").await,
            Err(LedgerError::ReadOnly(_))
        ));

        store.close_ledger(&ledger).await.unwrap();
        store.close_ledger(&ledger).await.unwrap();
        assert!(matches!(
            append(&store, &ledger, b"a").await,
            Err(LedgerError::Closed(_))
        ));
        assert_eq!(store.is_closed(ledger.id()), Some(true));
    }

    #[tokio::test]
    async fn wrong_password_is_unauthorized() {
        let store = InMemLedgerStore::new();
        let ledger = store.create_ledger(&options()).await.unwrap();

        assert!(matches!(
            store
                .open_ledger(ledger.id(), DigestType::SeaHash, "nope")
                .await,
            Err(LedgerError::Unauthorized(_))
        ));
        assert!(matches!(
            store
                .open_ledger(LedgerId(99), DigestType::SeaHash, "pw")
                .await,
            Err(LedgerError::NoSuchLedger(_))
        ));
    }

    #[tokio::test]
    async fn corrupted_entry_fails_digest() {
        let store = InMemLedgerStore::new();
        let ledger = store.create_ledger(&options()).await.unwrap();
        append(&store, &ledger, b"a").await.unwrap();
        store.corrupt(ledger.id(), EntryId(0));

        assert!(matches!(
            store.read_entries(&ledger, EntryId(0), EntryId(0)).await,
            Err(LedgerError::DigestMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn injected_failures() {
        let store = InMemLedgerStore::new();
        let ledger = store.create_ledger(&options()).await.unwrap();

        store.fail_appends(true);
        assert!(matches!(
            append(&store, &ledger, b"a").await,
            Err(LedgerError::Injected(_))
        ));
        store.fail_appends(false);
        assert_eq!(append(&store, &ledger, b"a").await.unwrap(), EntryId(0));

        store.fail_appends_to(ledger.id());
        assert!(append(&store, &ledger, b"b").await.is_err());
        assert_eq!(store.entry_count(ledger.id()), Some(1));
    }

    #[test]
    fn callback_runs_inline_without_runtime() {
        let store = InMemLedgerStore::new();
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let ledger = rt.block_on(store.create_ledger(&options())).unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        store.async_append(
            &ledger,
            b"a".to_vec(),
            Box::new(move |res| tx.send(res).unwrap()),
        );
        assert_eq!(rx.try_recv().unwrap().unwrap(), EntryId(0));
    }

    #[test]
    fn callback_runs_when_runtime_shuts_down_first() {
        let store = InMemLedgerStore::new();
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let ledger = rt.block_on(store.create_ledger(&options())).unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        {
            // Spawned onto the runtime but never polled.
            let _guard = rt.enter();
            store.async_append(
                &ledger,
                b"a".to_vec(),
                Box::new(move |res| tx.send(res).unwrap()),
            );
        }
        assert!(rx.try_recv().is_err());
        drop(rt);

        assert_eq!(rx.try_recv().unwrap().unwrap(), EntryId(0));
        assert!(rx.try_recv().is_err());
    }
}
