//! Structural diffs between two JSON values.

use serde_json::Value;
use std::fmt;

/// What happened to one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffOp {
    Add,
    Remove,
    Change,
}

impl fmt::Display for DiffOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiffOp::Add => f.write_str("add"),
            DiffOp::Remove => f.write_str("remove"),
            DiffOp::Change => f.write_str("change"),
        }
    }
}

/// One entry of a [`Diff`]: an operation at a key path, with both sides.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffItem {
    pub op: DiffOp,
    pub path: Vec<String>,
    pub old: Option<Value>,
    pub new: Option<Value>,
}

/// An ordered sequence of field-level changes, sorted by path.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Diff(Vec<DiffItem>);

impl Diff {
    pub fn new(mut items: Vec<DiffItem>) -> Self {
        items.sort_by(|a, b| a.path.cmp(&b.path));
        Self(items)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DiffItem> {
        self.0.iter()
    }

    pub fn items(&self) -> &[DiffItem] {
        &self.0
    }

    /// Narrow the diff to one field: entries outside the field are dropped,
    /// entries under it get paths relative to it, and an entry *above* it
    /// has its values resolved down the remaining path. Entries where both
    /// sides resolve to nothing are dropped: the field was not involved.
    pub fn reduce(&self, field: &[String]) -> Diff {
        let mut items = Vec::new();
        for item in &self.0 {
            if item.path.len() >= field.len() && item.path[..field.len()] == *field {
                items.push(DiffItem {
                    op: item.op,
                    path: item.path[field.len()..].to_vec(),
                    old: item.old.clone(),
                    new: item.new.clone(),
                });
            } else if field.len() > item.path.len() && field[..item.path.len()] == *item.path {
                let rest = &field[item.path.len()..];
                let old = resolve(item.old.as_ref(), rest).cloned();
                let new = resolve(item.new.as_ref(), rest).cloned();
                if old.is_some() || new.is_some() {
                    items.push(DiffItem {
                        op: item.op,
                        path: Vec::new(),
                        old,
                        new,
                    });
                }
            }
        }
        Diff::new(items)
    }
}

impl<'a> IntoIterator for &'a Diff {
    type IntoIter = std::slice::Iter<'a, DiffItem>;
    type Item = &'a DiffItem;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Resolve a nested value by key path.
pub fn resolve<'a>(value: Option<&'a Value>, path: &[String]) -> Option<&'a Value> {
    let mut current = value?;
    for key in path {
        current = current.get(key)?;
    }
    Some(current)
}

/// Compute the structural diff between two optional values.
///
/// Objects are recursed into; arrays and scalars compare atomically.
/// Absent-to-present is an `Add`, present-to-absent a `Remove`, anything
/// else unequal a `Change`.
pub fn diff(old: Option<&Value>, new: Option<&Value>) -> Diff {
    let mut items = Vec::new();
    diff_at(old, new, &mut Vec::new(), &mut items);
    Diff::new(items)
}

fn diff_at(
    old: Option<&Value>,
    new: Option<&Value>,
    path: &mut Vec<String>,
    out: &mut Vec<DiffItem>,
) {
    match (old, new) {
        (None, None) => {}
        (None, Some(n)) => out.push(DiffItem {
            op: DiffOp::Add,
            path: path.clone(),
            old: None,
            new: Some(n.clone()),
        }),
        (Some(o), None) => out.push(DiffItem {
            op: DiffOp::Remove,
            path: path.clone(),
            old: Some(o.clone()),
            new: None,
        }),
        (Some(o), Some(n)) if o == n => {}
        (Some(Value::Object(o)), Some(Value::Object(n))) => {
            let keys: std::collections::BTreeSet<&String> = o.keys().chain(n.keys()).collect();
            for key in keys {
                path.push(key.clone());
                diff_at(o.get(key), n.get(key), path, out);
                path.pop();
            }
        }
        (Some(o), Some(n)) => out.push(DiffItem {
            op: DiffOp::Change,
            path: path.clone(),
            old: Some(o.clone()),
            new: Some(n.clone()),
        }),
    }
}
