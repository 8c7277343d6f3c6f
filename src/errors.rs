//! Error taxonomy.
//!
//! Ledger Store failures are never retried here; they are surfaced so
//! the surrounding engine can crash and redeliver. Cancelled
//! publication and swap mismatches are not errors at all, see
//! [`crate::recovery::Publication`] and
//! [`crate::recovery::CompactionPhase`].

use thiserror::Error;

use crate::recovery::model::EntryId;
use crate::recovery::model::LedgerId;
use crate::window::WindowId;

pub type Result<T> = std::result::Result<T, SlotLogError>;

/// A failure reported by a [`crate::recovery::store::LedgerStore`].
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger {0} does not exist")]
    NoSuchLedger(LedgerId),
    #[error("ledger {0} is closed")]
    Closed(LedgerId),
    #[error("ledger {0} was opened read-only")]
    ReadOnly(LedgerId),
    #[error("bad password for ledger {0}")]
    Unauthorized(LedgerId),
    #[error("digest mismatch in ledger {ledger} at entry {entry}")]
    DigestMismatch { ledger: LedgerId, entry: EntryId },
    #[error("entries {from}..={to} out of range for ledger {ledger} (last confirmed {last:?})")]
    OutOfRange {
        ledger: LedgerId,
        from: EntryId,
        to: EntryId,
        last: Option<EntryId>,
    },
    #[error("ledger store has shut down")]
    Shutdown,
    #[error("injected append failure on ledger {0}")]
    Injected(LedgerId),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("sqlite migration error: {0}")]
    Migration(#[from] rusqlite_migration::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A failure turning entries into bytes or back.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("compression error: {0}")]
    Compression(#[from] std::io::Error),
}

/// Everything a [`crate::recovery::LogBackend`] operation can fail
/// with.
#[derive(Debug, Error)]
pub enum SlotLogError {
    #[error("ledger store failure: {0}")]
    Ledger(#[from] LedgerError),
    #[error("entry codec failure: {0}")]
    Codec(#[from] CodecError),
    /// Entries were written for a window that is no longer
    /// configured. Deployment and log disagree; never skip these.
    #[error(
        "no update function registered for window {window:?} \
         (ledger {ledger}, entry {entry}); entries and configured windows disagree"
    )]
    UnknownWindow {
        window: WindowId,
        ledger: LedgerId,
        entry: EntryId,
    },
    #[error("compaction already in progress for this slot")]
    CompactionInProgress,
    #[error("log is closed")]
    LogClosed,
    #[error("outbound command channel is closed")]
    CommandChannelClosed,
    #[error("log operations must run within a Tokio runtime")]
    NoRuntime,
    #[error("config error: {0}")]
    Config(String),
}
