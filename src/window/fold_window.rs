use super::Value;
use super::WindowLogic;

type Builder = Box<dyn Fn() -> Value + Send + Sync>;
type Folder = Box<dyn Fn(Value, &Value) -> Value + Send + Sync>;

/// Implements a fold window.
///
/// Combine deltas within an extent into an accumulator built by the
/// builder function.
pub struct FoldWindow {
    builder: Builder,
    folder: Folder,
}

impl FoldWindow {
    pub fn new(
        builder: impl Fn() -> Value + Send + Sync + 'static,
        folder: impl Fn(Value, &Value) -> Value + Send + Sync + 'static,
    ) -> Self {
        Self {
            builder: Box::new(builder),
            folder: Box::new(folder),
        }
    }
}

impl WindowLogic for FoldWindow {
    fn init(&self) -> Value {
        (self.builder)()
    }

    #[tracing::instrument(name = "fold_window", level = "trace", skip(self))]
    fn apply(&self, aggregate: Value, delta: &Value) -> Value {
        (self.folder)(aggregate, delta)
    }
}

#[test]
fn fold_collects_in_order() {
    use serde_json::json;

    let logic = FoldWindow::new(
        || json!([]),
        |acc, delta| {
            let mut items = match acc {
                Value::Array(items) => items,
                other => vec![other],
            };
            items.push(delta.clone());
            Value::Array(items)
        },
    );

    let acc = logic.init();
    let acc = logic.apply(acc, &json!("a"));
    let acc = logic.apply(acc, &json!("b"));
    assert_eq!(acc, json!(["a", "b"]));
}
