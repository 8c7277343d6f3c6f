//! Window aggregation functions applied during playback.
//!
//! Architecture
//! ------------
//!
//! A window is identified by a [`WindowId`] and keeps one aggregate
//! per [`Extent`], the bucket an item falls into (a tumbling time
//! interval, a grouping key hash, ...). How an aggregate evolves is
//! defined by a [`WindowLogic`]: an `init` function building a fresh
//! aggregate and an `apply` function folding one delta into it.
//!
//! The log itself never interprets deltas. Only playback calls into
//! the [`Windows`] registry, and an entry referencing an unregistered
//! window aborts playback, since it means the entries on disk were
//! written by a differently configured deployment.
//!
//! Aggregates and deltas are dynamic [`Value`]s so that differently
//! typed windows can share one log and one codec.

use std::collections::HashMap;
use std::fmt::Debug;
use std::fmt::Display;
use std::sync::Arc;

use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
pub use serde_json::Value;

pub(crate) mod fold_window;
pub(crate) mod reduce_window;

pub use fold_window::FoldWindow;
pub use reduce_window::ReduceWindow;
pub use reduce_window::SumWindow;

/// Unique ID for a window definition within a slot.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WindowId(pub String);

impl Display for WindowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl From<&str> for WindowId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Bucket key of a window.
///
/// For time windows this is the index of the interval since the
/// alignment instant; see [`Extent::tumbling`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Extent(pub i64);

impl Extent {
    /// The tumbling window an item at `item_time` falls into.
    ///
    /// Windows start at `align_to + n * length`, start inclusive and
    /// end exclusive. Times before `align_to` give negative extents.
    pub fn tumbling(align_to: DateTime<Utc>, length: Duration, item_time: DateTime<Utc>) -> Self {
        let since = (item_time - align_to).num_milliseconds();
        let length = length.num_milliseconds().max(1);
        Self(since.div_euclid(length))
    }

    /// Start instant of this extent when it is a tumbling window.
    pub fn start(&self, align_to: DateTime<Utc>, length: Duration) -> DateTime<Utc> {
        align_to + Duration::milliseconds(length.num_milliseconds() * self.0)
    }
}

/// Defines how a window's aggregate is built and updated.
///
/// Both functions must be deterministic: playback of the same entries
/// has to rebuild the same aggregates on every restart.
pub trait WindowLogic: Send + Sync {
    /// Build the aggregate for an extent seen for the first time.
    fn init(&self) -> Value;

    /// Fold one delta into an aggregate, returning the new aggregate.
    fn apply(&self, aggregate: Value, delta: &Value) -> Value;
}

/// Registry of the update functions for all windows of a slot.
#[derive(Clone, Default)]
pub struct Windows(HashMap<WindowId, Arc<dyn WindowLogic>>);

impl Windows {
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    /// Register `logic` under `window_id`, replacing any previous
    /// registration.
    pub fn register(
        mut self,
        window_id: impl Into<WindowId>,
        logic: impl WindowLogic + 'static,
    ) -> Self {
        self.0.insert(window_id.into(), Arc::new(logic));
        self
    }

    pub fn get(&self, window_id: &WindowId) -> Option<&dyn WindowLogic> {
        self.0.get(window_id).map(|logic| logic.as_ref())
    }

    pub fn contains(&self, window_id: &WindowId) -> bool {
        self.0.contains_key(window_id)
    }
}

impl Debug for Windows {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<_> = self.0.keys().collect();
        ids.sort();
        f.debug_tuple("Windows").field(&ids).finish()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn tumbling_extent_works() {
        let align_to = Utc.with_ymd_and_hms(2023, 3, 16, 9, 0, 0).unwrap();
        let length = Duration::seconds(10);

        //            9:00:13
        //            I
        // [0--------)
        //           [1--------)
        let item_time = Utc.with_ymd_and_hms(2023, 3, 16, 9, 0, 13).unwrap();
        assert_eq!(Extent::tumbling(align_to, length, item_time), Extent(1));
        assert_eq!(
            Extent(1).start(align_to, length),
            Utc.with_ymd_and_hms(2023, 3, 16, 9, 0, 10).unwrap()
        );
    }

    #[test]
    fn tumbling_extent_start_is_inclusive() {
        let align_to = Utc.with_ymd_and_hms(2023, 3, 16, 9, 0, 0).unwrap();
        let length = Duration::seconds(10);

        let item_time = Utc.with_ymd_and_hms(2023, 3, 16, 9, 0, 10).unwrap();
        assert_eq!(Extent::tumbling(align_to, length, item_time), Extent(1));
    }

    #[test]
    fn tumbling_extent_before_align_is_negative() {
        let align_to = Utc.with_ymd_and_hms(2023, 3, 16, 9, 0, 0).unwrap();
        let length = Duration::seconds(10);

        //   8:59:55
        //   I
        // [-1-------)
        //           [0--------)
        let item_time = Utc.with_ymd_and_hms(2023, 3, 16, 8, 59, 55).unwrap();
        assert_eq!(Extent::tumbling(align_to, length, item_time), Extent(-1));
    }

    #[test]
    fn registry_lookup() {
        let windows = Windows::new().register("sum", SumWindow);
        assert!(windows.contains(&WindowId::from("sum")));
        assert!(windows.get(&WindowId::from("nope")).is_none());
        assert_eq!(format!("{windows:?}"), "Windows([WindowId(\"sum\")])");
    }
}
