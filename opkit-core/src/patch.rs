//! The per-cycle patch accumulator.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Accumulates changes to an object, shaped like a partial body.
///
/// Handlers and the framework write into the patch during one handling
/// cycle; the reactor flushes it as a single JSON merge patch at the end.
/// A `Value::Null` leaf expresses deletion, per RFC 7386.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[serde(transparent)]
pub struct Patch(Map<String, Value>);

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Read back a previously accumulated value.
    pub fn get(&self, path: &[&str]) -> Option<&Value> {
        let (first, rest) = path.split_first()?;
        let mut current = self.0.get(*first)?;
        for key in rest {
            current = current.get(*key)?;
        }
        Some(current)
    }

    /// Write a value, creating intermediate objects along the path.
    ///
    /// A non-object intermediate already present is replaced: the framework
    /// owns the paths it writes to, and the deepest write wins.
    pub fn set(&mut self, path: &[&str], value: Value) {
        let Some((last, parents)) = path.split_last() else {
            return;
        };
        let mut current = &mut self.0;
        for key in parents {
            let entry = current
                .entry((*key).to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            // Unwrap is safe: just ensured it is an object.
            current = entry.as_object_mut().expect("just replaced with an object");
        }
        current.insert((*last).to_string(), value);
    }

    /// Remove an accumulated entry from the patch itself (not a deletion
    /// marker; use `set(path, Value::Null)` for that).
    pub fn remove(&mut self, path: &[&str]) {
        let Some((last, parents)) = path.split_last() else {
            return;
        };
        let mut current = &mut self.0;
        for key in parents {
            match current.get_mut(*key).and_then(Value::as_object_mut) {
                Some(next) => current = next,
                None => return,
            }
        }
        current.remove(*last);
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Map<String, Value>> for Patch {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}
