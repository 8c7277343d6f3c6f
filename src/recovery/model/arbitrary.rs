//! Generators of entries and states for property tests.

use proptest::prelude::*;
use serde_json::Value as JsonValue;

use super::*;
use crate::window::Extent;
use crate::window::ReduceWindow;
use crate::window::SumWindow;
use crate::window::Windows;

/// `sum` adds numbers; `last` keeps the latest delta verbatim, so
/// any generated aggregate can end up in the state as is.
pub(crate) fn windows() -> Windows {
    Windows::new()
        .register("sum", SumWindow)
        .register("last", ReduceWindow::new(|_, delta| delta.clone()))
}

pub(crate) fn aggregate() -> impl Strategy<Value = JsonValue> {
    prop_oneof![
        any::<i64>().prop_map(JsonValue::from),
        any::<u64>().prop_map(JsonValue::from),
        any::<f64>()
            .prop_filter("json numbers are finite", |f| f.is_finite())
            .prop_map(JsonValue::from),
    ]
}

pub(crate) fn delta() -> impl Strategy<Value = StateDelta> {
    (prop_oneof![Just("sum"), Just("last")], -4i64..4, aggregate())
        .prop_map(|(window, extent, value)| StateDelta(window.into(), Extent(extent), value))
}

/// Ids are drawn from a small pool so duplicates are common.
pub(crate) fn entry() -> impl Strategy<Value = LogEntry> {
    (
        proptest::option::of(0u8..8),
        proptest::collection::vec(delta(), 0..4),
    )
        .prop_map(|(id, deltas)| LogEntry {
            id: id.map(|id| UniqueId(format!("m{id}"))),
            deltas,
        })
}

pub(crate) fn entries() -> impl Strategy<Value = Vec<LogEntry>> {
    proptest::collection::vec(entry(), 0..24)
}

pub(crate) fn slot_state() -> impl Strategy<Value = SlotState> {
    entries().prop_map(|entries| fold(&entries))
}

/// The state `entries` build when applied in order.
pub(crate) fn fold(entries: &[LogEntry]) -> SlotState {
    let windows = windows();
    let mut state = SlotState::new();
    for entry in entries {
        state.apply_entry(entry, &windows).unwrap();
    }
    state
}
