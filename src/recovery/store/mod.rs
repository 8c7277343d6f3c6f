//! Ledger Stores.
//!
//! A Ledger Store holds append-only, immutable-once-closed ledgers
//! of opaque byte entries. The log only ever talks to it through
//! [`LedgerStore`], so anything offering create / open / append /
//! last confirmed / read / close can back a slot's chain.
//!
//! There are 2 implementations: [`InMemLedgerStore`], used in tests
//! and able to inject append failures, and [`SqliteLedgerStore`],
//! keeping every ledger of a process in one local SQLite file.
//!
//! Each entry carries a digest keyed by the ledger's password which
//! is checked again on read, so a corrupted or foreign entry is an
//! error instead of garbage handed to the codec.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

use crate::errors::LedgerError;
use crate::recovery::model::EntryId;
use crate::recovery::model::LedgerId;

pub(crate) mod in_mem;
pub(crate) mod sqlite;

pub use in_mem::InMemLedgerStore;
pub use sqlite::SqliteLedgerStore;

/// How entries are checksummed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DigestType {
    /// Seeded [`seahash`] of the payload.
    #[default]
    SeaHash,
    /// No checksum at all.
    None,
}

impl DigestType {
    /// Digest of one entry.
    ///
    /// Keyed on the ledger and entry position as well as the
    /// password, so an entry copied to another place in the store
    /// does not verify.
    pub(crate) fn compute(
        &self,
        password: &str,
        ledger: LedgerId,
        entry: EntryId,
        payload: &[u8],
    ) -> Option<u64> {
        match self {
            Self::SeaHash => Some(seahash::hash_seeded(
                payload,
                password_hash(password),
                ledger.0,
                entry.0,
                0x6c65_6467_6572_6c6f,
            )),
            Self::None => None,
        }
    }
}

pub(crate) fn password_hash(password: &str) -> u64 {
    seahash::hash(password.as_bytes())
}

/// Parameters for creating a ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerOptions {
    /// Number of storage nodes the ledger is striped over.
    pub ensemble_size: u32,
    /// Number of nodes that must confirm each entry.
    pub quorum_size: u32,
    pub digest: DigestType,
    pub password: String,
}

/// A reference to one ledger.
///
/// Returned writable from [`LedgerStore::create_ledger`] and
/// read-only from [`LedgerStore::open_ledger`]. Cheap to clone.
#[derive(Debug, Clone)]
pub struct LedgerHandle {
    id: LedgerId,
    writable: bool,
    digest: DigestType,
    password: Arc<str>,
}

impl LedgerHandle {
    pub(crate) fn new(id: LedgerId, writable: bool, digest: DigestType, password: &str) -> Self {
        Self {
            id,
            writable,
            digest,
            password: Arc::from(password),
        }
    }

    pub fn id(&self) -> LedgerId {
        self.id
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub(crate) fn digest_of(&self, entry: EntryId, payload: &[u8]) -> Option<u64> {
        self.digest.compute(&self.password, self.id, entry, payload)
    }

    /// Check a stored entry against the digest this handle expects.
    pub(crate) fn verify(
        &self,
        entry: EntryId,
        payload: &[u8],
        stored: Option<u64>,
    ) -> Result<(), LedgerError> {
        match self.digest_of(entry, payload) {
            Some(expected) if stored != Some(expected) => Err(LedgerError::DigestMismatch {
                ledger: self.id,
                entry,
            }),
            _ => Ok(()),
        }
    }
}

/// Called exactly once with the outcome of an append, from the
/// store's own execution context.
pub type AppendCallback = Box<dyn FnOnce(Result<EntryId, LedgerError>) + Send + 'static>;

/// The storage primitive a slot's chain lives in.
///
/// Appends to one ledger are confirmed in the order they were
/// issued, and a close issued after an append is ordered after it.
#[async_trait]
pub trait LedgerStore: Debug + Send + Sync + 'static {
    /// Create a new, empty, writable ledger. Ids are assigned in
    /// increasing order and never reused.
    async fn create_ledger(&self, options: &LedgerOptions) -> Result<LedgerHandle, LedgerError>;

    /// Open an existing ledger for reading.
    async fn open_ledger(
        &self,
        id: LedgerId,
        digest: DigestType,
        password: &str,
    ) -> Result<LedgerHandle, LedgerError>;

    /// Queue `payload` to be appended.
    ///
    /// Does not wait for durability; `callback` reports the assigned
    /// entry id once it is confirmed, or the failure. It is called
    /// exactly once, even if the store shuts down first.
    fn async_append(&self, ledger: &LedgerHandle, payload: Vec<u8>, callback: AppendCallback);

    /// Index of the last durably written entry, if any.
    async fn last_confirmed(&self, ledger: &LedgerHandle) -> Result<Option<EntryId>, LedgerError>;

    /// Payloads of entries `from..=to`, in order.
    async fn read_entries(
        &self,
        ledger: &LedgerHandle,
        from: EntryId,
        to: EntryId,
    ) -> Result<Vec<Vec<u8>>, LedgerError>;

    /// Seal a ledger. No appends are accepted afterwards. Closing a
    /// closed ledger is fine.
    async fn close_ledger(&self, ledger: &LedgerHandle) -> Result<(), LedgerError>;
}

/// Check `from..=to` against the confirmed range of a ledger.
pub(crate) fn check_range(
    ledger: LedgerId,
    from: EntryId,
    to: EntryId,
    last: Option<EntryId>,
) -> Result<(), LedgerError> {
    match last {
        Some(last) if from <= to && to <= last => Ok(()),
        _ => Err(LedgerError::OutOfRange {
            ledger,
            from,
            to,
            last,
        }),
    }
}

#[test]
fn digest_depends_on_position_and_password() {
    let digest = DigestType::SeaHash;
    let found = digest.compute("pw", LedgerId(1), EntryId(0), b"x");

    assert_eq!(found, digest.compute("pw", LedgerId(1), EntryId(0), b"x"));
    assert_ne!(found, digest.compute("pw", LedgerId(1), EntryId(1), b"x"));
    assert_ne!(found, digest.compute("pw", LedgerId(2), EntryId(0), b"x"));
    assert_ne!(found, digest.compute("other", LedgerId(1), EntryId(0), b"x"));
    assert_eq!(
        DigestType::None.compute("pw", LedgerId(1), EntryId(0), b"x"),
        None
    );
}

#[test]
fn verify_rejects_changed_payload() {
    let handle = LedgerHandle::new(LedgerId(1), false, DigestType::SeaHash, "pw");
    let stored = handle.digest_of(EntryId(0), b"x");

    assert!(handle.verify(EntryId(0), b"x", stored).is_ok());
    assert!(matches!(
        handle.verify(EntryId(0), b"y", stored),
        Err(LedgerError::DigestMismatch { .. })
    ));
}

#[test]
fn check_range_bounds() {
    let ledger = LedgerId(1);
    assert!(check_range(ledger, EntryId(0), EntryId(2), Some(EntryId(2))).is_ok());
    assert!(check_range(ledger, EntryId(0), EntryId(3), Some(EntryId(2))).is_err());
    assert!(check_range(ledger, EntryId(2), EntryId(1), Some(EntryId(2))).is_err());
    assert!(check_range(ledger, EntryId(0), EntryId(0), None).is_err());
}
