//! Data model representing windowed state and the entries that
//! change it.
//!
//! A slot's state is a two level map from [`WindowId`] to [`Extent`]
//! to aggregate, plus the [`DedupFilter`] of unique message ids that
//! have already been applied. Both are rebuilt from scratch on every
//! restart, so everything here must apply deterministically.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::hash::BuildHasherDefault;

use seahash::SeaHasher;
use serde::Deserialize;
use serde::Serialize;

use crate::window::Extent;
use crate::window::Value;
use crate::window::WindowId;
use crate::window::Windows;

/// Unique message id attached to an entry for deduplication.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UniqueId(pub String);

impl From<&str> for UniqueId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// A change to one extent of one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDelta(pub WindowId, pub Extent, pub Value);

/// One record in the log.
///
/// Entries are opaque to the Ledger Store; only playback looks
/// inside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: Option<UniqueId>,
    pub deltas: Vec<StateDelta>,
}

impl LogEntry {
    pub fn new(deltas: Vec<StateDelta>) -> Self {
        Self { id: None, deltas }
    }

    pub fn with_id(id: impl Into<UniqueId>, deltas: Vec<StateDelta>) -> Self {
        Self {
            id: Some(id.into()),
            deltas,
        }
    }
}

/// Aggregates per window per extent.
///
/// Serializes as the flat list of `(window, extent, aggregate)` rows
/// so any codec can carry it, not just ones with rich map keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(into = "Vec<StateDelta>", from = "Vec<StateDelta>")]
pub struct WindowedState(BTreeMap<WindowId, BTreeMap<Extent, Value>>);

impl WindowedState {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn get(&self, window_id: &WindowId, extent: &Extent) -> Option<&Value> {
        self.0.get(window_id).and_then(|extents| extents.get(extent))
    }

    /// All extents of a window.
    pub fn extents(&self, window_id: &WindowId) -> Option<&BTreeMap<Extent, Value>> {
        self.0.get(window_id)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of `(window, extent)` aggregates held.
    pub fn len(&self) -> usize {
        self.0.values().map(BTreeMap::len).sum()
    }

    /// Apply `delta` to the aggregate at `(window_id, extent)`,
    /// initializing the aggregate first if this extent is new.
    fn update(&mut self, window_id: &WindowId, extent: Extent, delta: &Value, windows: &Windows) {
        let Some(logic) = windows.get(window_id) else {
            return;
        };
        let extents = self.0.entry(window_id.clone()).or_default();
        let aggregate = extents.remove(&extent).unwrap_or_else(|| logic.init());
        extents.insert(extent, logic.apply(aggregate, delta));
    }
}

impl From<WindowedState> for Vec<StateDelta> {
    fn from(state: WindowedState) -> Self {
        state
            .0
            .into_iter()
            .flat_map(|(window_id, extents)| {
                extents
                    .into_iter()
                    .map(move |(extent, value)| StateDelta(window_id.clone(), extent, value))
            })
            .collect()
    }
}

impl From<Vec<StateDelta>> for WindowedState {
    fn from(rows: Vec<StateDelta>) -> Self {
        let mut state = Self::new();
        for StateDelta(window_id, extent, value) in rows {
            state.0.entry(window_id).or_default().insert(extent, value);
        }
        state
    }
}

/// Remembers which unique message ids have been applied.
///
/// Uses [`SeaHasher`] so membership does not depend on a per-process
/// random seed. Serializes as a sorted list so snapshots of equal
/// filters encode to equal bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "Vec<UniqueId>", from = "Vec<UniqueId>")]
pub struct DedupFilter(HashSet<UniqueId, BuildHasherDefault<SeaHasher>>);

impl DedupFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `id` as seen. Returns `false` if it already was.
    pub fn apply(&mut self, id: &UniqueId) -> bool {
        if self.0.contains(id) {
            false
        } else {
            self.0.insert(id.clone())
        }
    }

    pub fn contains(&self, id: &UniqueId) -> bool {
        self.0.contains(id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<DedupFilter> for Vec<UniqueId> {
    fn from(filter: DedupFilter) -> Self {
        let mut ids: Vec<_> = filter.0.into_iter().collect();
        ids.sort();
        ids
    }
}

impl From<Vec<UniqueId>> for DedupFilter {
    fn from(ids: Vec<UniqueId>) -> Self {
        Self(ids.into_iter().collect())
    }
}

/// What happened when an entry was applied to a [`SlotState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// All deltas were folded in.
    Updated,
    /// The entry's unique id had been seen before; nothing changed.
    Duplicate,
}

/// Everything a slot rebuilds on restart.
///
/// This is also the content of a compacted ledger's sole entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SlotState {
    pub windows: WindowedState,
    pub seen: DedupFilter,
}

impl SlotState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold an entry into this state.
    ///
    /// Every window referenced by the entry must be registered; if
    /// one is not, nothing is applied and its id is returned. The
    /// entry is checked as a whole first so a failure never leaves a
    /// half-applied entry behind.
    pub fn apply_entry(&mut self, entry: &LogEntry, windows: &Windows) -> Result<Applied, WindowId> {
        if let Some(StateDelta(window_id, ..)) = entry
            .deltas
            .iter()
            .find(|StateDelta(window_id, ..)| !windows.contains(window_id))
        {
            return Err(window_id.clone());
        }

        if let Some(id) = &entry.id {
            if !self.seen.apply(id) {
                tracing::trace!("Skipping duplicate entry {id:?}");
                return Ok(Applied::Duplicate);
            }
        }

        for StateDelta(window_id, extent, delta) in &entry.deltas {
            self.windows.update(window_id, *extent, delta, windows);
        }
        Ok(Applied::Updated)
    }
}

/// What is actually encoded into a ledger entry.
///
/// A compacted ledger holds exactly one [`StoredEntry::Snapshot`];
/// every other entry is a [`StoredEntry::Delta`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoredEntry {
    Delta(LogEntry),
    Snapshot(SlotState),
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::window::SumWindow;

    fn sum_windows() -> Windows {
        Windows::new().register("w1", SumWindow)
    }

    #[test]
    fn apply_initializes_then_updates() {
        let windows = sum_windows();
        let mut state = SlotState::new();
        let entry = LogEntry::new(vec![StateDelta("w1".into(), Extent(0), json!(2))]);

        assert_eq!(state.apply_entry(&entry, &windows), Ok(Applied::Updated));
        assert_eq!(state.apply_entry(&entry, &windows), Ok(Applied::Updated));
        assert_eq!(
            state.windows.get(&"w1".into(), &Extent(0)),
            Some(&json!(4))
        );
    }

    #[test]
    fn apply_skips_seen_ids() {
        let windows = sum_windows();
        let mut state = SlotState::new();
        let entry = LogEntry::with_id("m1", vec![StateDelta("w1".into(), Extent(0), json!(1))]);

        assert_eq!(state.apply_entry(&entry, &windows), Ok(Applied::Updated));
        assert_eq!(state.apply_entry(&entry, &windows), Ok(Applied::Duplicate));
        assert_eq!(
            state.windows.get(&"w1".into(), &Extent(0)),
            Some(&json!(1))
        );
        assert!(state.seen.contains(&"m1".into()));
    }

    #[test]
    fn apply_unknown_window_changes_nothing() {
        let windows = sum_windows();
        let mut state = SlotState::new();
        let entry = LogEntry::with_id(
            "m1",
            vec![
                StateDelta("w1".into(), Extent(0), json!(1)),
                StateDelta("gone".into(), Extent(0), json!(1)),
            ],
        );

        assert_eq!(
            state.apply_entry(&entry, &windows),
            Err(WindowId::from("gone"))
        );
        assert_eq!(state, SlotState::new());
    }

    #[test]
    fn windowed_state_serializes_as_rows() {
        let mut state = WindowedState::new();
        state.update(&"w1".into(), Extent(3), &json!(5), &sum_windows());

        let found = serde_json::to_value(&state).unwrap();
        assert_eq!(found, json!([["w1", 3, 5]]));
    }

    #[test]
    fn dedup_filter_serializes_sorted() {
        let mut filter = DedupFilter::new();
        for id in ["c", "a", "b"] {
            filter.apply(&id.into());
        }

        let found = serde_json::to_value(&filter).unwrap();
        assert_eq!(found, json!(["a", "b", "c"]));
    }
}
