//! Structured item filters.
//!
//! A [`Filter`] is a conjunction of field conditions matched against an
//! item's document form. Filters are deliberately small: equality per field,
//! array-contains for list fields, dotted paths into nested objects. The
//! subscription engine merges a washer kind's default filter with the
//! instance-configured one by AND-ing their conditions.

use crate::item::Item;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A conjunction of field conditions.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Filter {
    conditions: Vec<Condition>,
}

/// One field condition: the document value at `field` must equal `value`,
/// or contain it when the document value is an array.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Dotted path into the item document (e.g. `tags`, `meta.kind`).
    pub field: String,
    /// The expected value.
    pub value: Value,
}

impl Filter {
    /// An empty filter that matches everything.
    pub fn new() -> Self {
        Filter::default()
    }

    /// Add a field condition.
    pub fn field(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    /// Whether this filter has no conditions.
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Logical AND of two optional filters.
    ///
    /// Returns `None` when neither side has conditions, otherwise the
    /// concatenation of both condition lists.
    pub fn and(a: Option<&Filter>, b: Option<&Filter>) -> Option<Filter> {
        match (a, b) {
            (None, None) => None,
            (Some(f), None) | (None, Some(f)) => Some(f.clone()),
            (Some(a), Some(b)) => {
                let mut merged = a.clone();
                merged.conditions.extend(b.conditions.iter().cloned());
                Some(merged)
            }
        }
    }

    /// Whether an item satisfies every condition.
    pub fn matches(&self, item: &Item) -> bool {
        if self.conditions.is_empty() {
            return true;
        }
        let doc = item.to_document();
        self.conditions.iter().all(|c| {
            match lookup(&doc, &c.field) {
                Some(Value::Array(values)) => values.contains(&c.value),
                Some(found) => *found == c.value,
                None => false,
            }
        })
    }
}

/// Resolve a dotted path within a document.
fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}
