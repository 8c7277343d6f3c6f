//! Identifiers of slots, ledgers and entries.

use std::fmt::Display;

use opentelemetry::KeyValue;
use serde::Deserialize;
use serde::Serialize;

/// ID of a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

/// ID of a task within a job.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

/// Index of one partition of a task.
///
/// Each slot owns an independent ledger chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotId(pub u64);

/// Key of a ledger chain in the replica.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotKey {
    pub job_id: JobId,
    pub task_id: TaskId,
    pub slot_id: SlotId,
}

impl SlotKey {
    pub fn new(job_id: impl Into<String>, task_id: impl Into<String>, slot_id: u64) -> Self {
        Self {
            job_id: JobId(job_id.into()),
            task_id: TaskId(task_id.into()),
            slot_id: SlotId(slot_id),
        }
    }

    /// Metric labels identifying this slot.
    pub(crate) fn labels(&self) -> [KeyValue; 3] {
        [
            KeyValue::new("job_id", self.job_id.0.clone()),
            KeyValue::new("task_id", self.task_id.0.clone()),
            KeyValue::new("slot_id", self.slot_id.0 as i64),
        ]
    }
}

impl Display for SlotKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.job_id.0, self.task_id.0, self.slot_id.0)
    }
}

/// ID of a ledger, assigned by the Ledger Store.
///
/// Ids are handed out in increasing order, so a later-created ledger
/// always compares greater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LedgerId(pub u64);

impl Display for LedgerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Sequence index of an entry within a ledger. Starts at 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub u64);

impl Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl EntryId {
    pub(crate) fn next(self) -> Self {
        Self(self.0 + 1)
    }
}
