//! Entries: schema-free rows with a typed identifier.
//!
//! The backend and the wire speak [`Row`]s (open JSON field maps). Inside the
//! engine every row becomes an [`Entry`]: the identifier is lifted out of the
//! field map into a typed [`EntryId`], so it can't be overwritten by a partial
//! mutation and never has to be re-parsed. Conversion happens at the boundary
//! with [`Entry::from_row`] / [`Entry::to_row`], using the configured index name.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// An open field map, as stored by the backend and carried on the wire.
pub type Row = Map<String, Value>;

/// Identifier of an entry.
///
/// Tables usually have integer or text primary keys; ephemeral sets use
/// UUID v4 strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntryId {
    Int(i64),
    Text(String),
}

impl EntryId {
    /// Parse an identifier out of a JSON value.
    ///
    /// Strings and integers in the `i64` range are accepted, including
    /// integral floats such as `1.0`. Unsigned keys above `i64::MAX` and
    /// fractional numbers are not identifiers.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().or_else(|| integral(n.as_f64()?)).map(EntryId::Int),
            Value::String(s) => Some(EntryId::Text(s.clone())),
            _ => None,
        }
    }

    /// Generate a fresh identifier for an entry that has no durable home.
    pub fn random() -> Self {
        EntryId::Text(Uuid::new_v4().to_string())
    }

    pub fn to_value(&self) -> Value {
        match self {
            EntryId::Int(n) => Value::from(*n),
            EntryId::Text(s) => Value::from(s.as_str()),
        }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryId::Int(n) => write!(f, "{}", n),
            EntryId::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for EntryId {
    fn from(n: i64) -> Self {
        EntryId::Int(n)
    }
}

impl From<i32> for EntryId {
    fn from(n: i32) -> Self {
        EntryId::Int(n.into())
    }
}

impl From<&str> for EntryId {
    fn from(s: &str) -> Self {
        EntryId::Text(s.to_string())
    }
}

impl From<String> for EntryId {
    fn from(s: String) -> Self {
        EntryId::Text(s)
    }
}

impl From<Uuid> for EntryId {
    fn from(u: Uuid) -> Self {
        EntryId::Text(u.to_string())
    }
}

fn integral(f: f64) -> Option<i64> {
    // i64::MAX as f64 rounds up to 2^63, which is out of range.
    let in_range = f >= i64::MIN as f64 && f < i64::MAX as f64;
    (f.fract() == 0.0 && in_range).then_some(f as i64)
}

/// Read the identifier of a row without consuming it.
pub fn row_id(row: &Row, index_name: &str) -> Option<EntryId> {
    row.get(index_name).and_then(EntryId::from_value)
}

/// Remove the identifier field from a partial row, if present.
///
/// Returns `true` if a field was removed.
pub fn strip_id(row: &mut Row, index_name: &str) -> bool {
    row.remove(index_name).is_some()
}

/// One row of the replica.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    id: EntryId,
    fields: Row,
}

impl Entry {
    /// Build an entry from an identifier and its non-identifier fields.
    pub fn new(id: impl Into<EntryId>, fields: Row) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Split a backend row into identifier + fields.
    ///
    /// Returns `None` if the row has no usable identifier under `index_name`.
    pub fn from_row(mut row: Row, index_name: &str) -> Option<Self> {
        let id = row.remove(index_name).as_ref().and_then(EntryId::from_value)?;
        Some(Self { id, fields: row })
    }

    /// Reassemble the row with the identifier under `index_name`.
    pub fn to_row(&self, index_name: &str) -> Row {
        let mut row = self.fields.clone();
        row.insert(index_name.to_string(), self.id.to_value());
        row
    }

    pub fn id(&self) -> &EntryId {
        &self.id
    }

    /// Fields without the identifier.
    pub fn fields(&self) -> &Row {
        &self.fields
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Field-level overwrite: fields present in `patch` replace ours,
    /// everything else is kept.
    pub fn merge(&mut self, patch: &Row) {
        for (key, value) in patch {
            self.fields.insert(key.clone(), value.clone());
        }
    }

    /// Copy of this entry with `patch` merged in.
    pub fn merged(&self, patch: &Row) -> Self {
        let mut next = self.clone();
        next.merge(patch);
        next
    }
}
