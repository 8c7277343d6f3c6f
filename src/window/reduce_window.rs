use serde_json::Number;

use super::Value;
use super::WindowLogic;

type Reducer = Box<dyn Fn(Value, &Value) -> Value + Send + Sync>;

/// Implements a reduce window.
///
/// The first delta in an extent becomes the aggregate; later deltas
/// are combined into it with the reducer. The fresh aggregate is
/// [`Value::Null`].
pub struct ReduceWindow {
    reducer: Reducer,
}

impl ReduceWindow {
    pub fn new(reducer: impl Fn(Value, &Value) -> Value + Send + Sync + 'static) -> Self {
        Self {
            reducer: Box::new(reducer),
        }
    }
}

impl WindowLogic for ReduceWindow {
    fn init(&self) -> Value {
        Value::Null
    }

    #[tracing::instrument(name = "reduce_window", level = "trace", skip(self))]
    fn apply(&self, aggregate: Value, delta: &Value) -> Value {
        match aggregate {
            Value::Null => delta.clone(),
            aggregate => (self.reducer)(aggregate, delta),
        }
    }
}

/// Additive window over numbers.
///
/// Integer deltas keep the sum integral; any float delta, or an
/// integer sum leaving the `i64` range, turns it into a float.
/// Non-numeric deltas are ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct SumWindow;

impl WindowLogic for SumWindow {
    fn init(&self) -> Value {
        Value::from(0)
    }

    fn apply(&self, aggregate: Value, delta: &Value) -> Value {
        match (&aggregate, delta) {
            (Value::Number(a), Value::Number(d)) => match (a.as_i64(), d.as_i64()) {
                (Some(ai), Some(di)) if ai.checked_add(di).is_some() => Value::from(ai + di),
                _ => {
                    let sum = a.as_f64().unwrap_or_default() + d.as_f64().unwrap_or_default();
                    Number::from_f64(sum).map_or(aggregate, Value::Number)
                }
            },
            _ => {
                tracing::trace!("Ignoring non-numeric delta {delta:?}");
                aggregate
            }
        }
    }
}

#[test]
fn reduce_starts_from_first_delta() {
    use serde_json::json;

    let logic = ReduceWindow::new(|acc, delta| {
        let acc = acc.as_str().unwrap_or_default();
        let delta = delta.as_str().unwrap_or_default();
        json!(format!("{acc}{delta}"))
    });

    let acc = logic.apply(logic.init(), &json!("a"));
    let acc = logic.apply(acc, &json!("b"));
    assert_eq!(acc, json!("ab"));
}

#[test]
fn sum_mixes_ints_and_floats() {
    use serde_json::json;

    let acc = SumWindow.apply(SumWindow.init(), &json!(2));
    assert_eq!(acc, json!(2));
    let acc = SumWindow.apply(acc, &json!(0.5));
    assert_eq!(acc, json!(2.5));
}

#[test]
fn sum_ignores_non_numbers() {
    use serde_json::json;

    let acc = SumWindow.apply(json!(3), &json!("x"));
    assert_eq!(acc, json!(3));
}

#[test]
fn sum_overflow_becomes_float() {
    use serde_json::json;

    let acc = SumWindow.apply(json!(i64::MAX), &json!(1));
    assert_eq!(acc, json!(i64::MAX as f64 + 1.0));
    let acc = SumWindow.apply(json!(i64::MIN), &json!(-1));
    assert_eq!(acc, json!(i64::MIN as f64 - 1.0));
}
