use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{invalid_argument, SyncResult};

/// Dotted path addressing a (possibly nested) field inside a document.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_dot_separated(path: &str) -> SyncResult<Self> {
        if path.is_empty() || path.starts_with('.') || path.ends_with('.') || path.contains("..") {
            return Err(invalid_argument(format!("Invalid field path: {path}")));
        }
        Ok(Self::from_segments(path.split('.')))
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn canonical_string(&self) -> String {
        self.segments.join(".")
    }
}

/// Field map of a document. Values are JSON values; nested maps are addressed
/// through [`FieldPath`]s.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectValue {
    fields: BTreeMap<String, Value>,
}

impl ObjectValue {
    pub fn new(fields: BTreeMap<String, Value>) -> Self {
        Self { fields }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    pub fn get(&self, path: &FieldPath) -> Option<&Value> {
        let (first, rest) = path.segments().split_first()?;
        let mut value = self.fields.get(first)?;
        for segment in rest {
            match value {
                Value::Object(map) => value = map.get(segment)?,
                _ => return None,
            }
        }
        Some(value)
    }

    /// Writes `value` at `path`, materializing intermediate maps and
    /// overwriting any non-map value on the way.
    pub fn set(&mut self, path: &FieldPath, value: Value) {
        let segments = path.segments();
        let (last, parents) = match segments.split_last() {
            Some(parts) => parts,
            None => return,
        };

        let (first, mid) = match parents.split_first() {
            Some(parts) => parts,
            None => {
                self.fields.insert(last.clone(), value);
                return;
            }
        };

        let mut current = self
            .fields
            .entry(first.clone())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        if !current.is_object() {
            *current = Value::Object(serde_json::Map::new());
        }

        for segment in mid {
            let child = current
                .as_object_mut()
                .expect("intermediate value forced to a map")
                .entry(segment.clone())
                .or_insert_with(|| Value::Object(serde_json::Map::new()));
            if !child.is_object() {
                *child = Value::Object(serde_json::Map::new());
            }
            current = child;
        }

        current
            .as_object_mut()
            .expect("intermediate value forced to a map")
            .insert(last.clone(), value);
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over JSON values used for query ordering: null < bool <
/// number < string < array < object, with element-wise comparison inside each
/// class.
pub fn value_compare(left: &Value, right: &Value) -> Ordering {
    match (left, right) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        (Value::Number(a), Value::Number(b)) => {
            let a = a.as_f64().unwrap_or(f64::NAN);
            let b = b.as_f64().unwrap_or(f64::NAN);
            a.partial_cmp(&b).unwrap_or(Ordering::Equal)
        }
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (Value::Array(a), Value::Array(b)) => {
            for (left, right) in a.iter().zip(b.iter()) {
                let ordering = value_compare(left, right);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            a.len().cmp(&b.len())
        }
        (Value::Object(a), Value::Object(b)) => {
            for ((left_key, left_value), (right_key, right_value)) in a.iter().zip(b.iter()) {
                let ordering = left_key
                    .cmp(right_key)
                    .then_with(|| value_compare(left_value, right_value));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            a.len().cmp(&b.len())
        }
        _ => type_rank(left).cmp(&type_rank(right)),
    }
}

/// Whether two values belong to the same comparison class. Relational filters
/// never match across classes.
pub fn values_comparable(left: &Value, right: &Value) -> bool {
    type_rank(left) == type_rank(right)
}
