//! The typed value model shared by rows, queries and indexes.
//!
//! `Value` carries every type the engine can store. It implements a *total*
//! order (floats compare via `f64::total_cmp`) so values can live in sorted
//! containers and be compared for diffing without panics.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Property name under which an entity's id travels on the wire.
pub const ID_KEY: &str = "id";

/// An entity id. Opaque once stored; empty means "not assigned yet".
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key(String);

impl Key {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn is_null(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Whole seconds since the Unix epoch. The zero timestamp is the "unset"
/// marker and encodes to nothing.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn now() -> Self {
        let secs = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Self(secs)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

/// A typed value. Containers hold scalars only; `Entity::validate` enforces
/// that on the way in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Nil,
    Int(i64),
    Uint(u64),
    Float(f64),
    Bool(bool),
    Text(String),
    Binary(Bytes),
    Timestamp(Timestamp),
    Set(BTreeSet<Value>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn is_scalar(&self) -> bool {
        !matches!(self, Value::Set(_) | Value::List(_) | Value::Map(_))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Int(_) => "int",
            Value::Uint(_) => "uint",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::Text(_) => "text",
            Value::Binary(_) => "binary",
            Value::Timestamp(_) => "timestamp",
            Value::Set(_) => "set",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Uint(u) => i64::try_from(*u).ok(),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            Value::Uint(u) => Some(*u as f64),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Nil => 0,
            Value::Int(_) => 1,
            Value::Uint(_) => 2,
            Value::Float(_) => 3,
            Value::Bool(_) => 4,
            Value::Text(_) => 5,
            Value::Binary(_) => 6,
            Value::Timestamp(_) => 7,
            Value::Set(_) => 8,
            Value::List(_) => 9,
            Value::Map(_) => 10,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        use std::cmp::Ordering;
        use Value::*;

        match (self, other) {
            (Nil, Nil) => Ordering::Equal,
            (Int(a), Int(b)) => a.cmp(b),
            (Uint(a), Uint(b)) => a.cmp(b),
            (Float(a), Float(b)) => a.total_cmp(b),
            (Bool(a), Bool(b)) => a.cmp(b),
            (Text(a), Text(b)) => a.cmp(b),
            (Binary(a), Binary(b)) => a.cmp(b),
            (Timestamp(a), Timestamp(b)) => a.cmp(b),
            (Set(a), Set(b)) => a.cmp(b),
            (List(a), List(b)) => a.cmp(b),
            (Map(a), Map(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Uint(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Value::Binary(v)
    }
}

impl From<Timestamp> for Value {
    fn from(v: Timestamp) -> Self {
        Value::Timestamp(v)
    }
}

/// An addressable row: id, property bag, optional TTL.
///
/// The TTL is write-only: it is applied on Put and never read back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Entity {
    pub id: Key,
    pub properties: BTreeMap<String, Value>,
    /// Zero means "no expiry".
    pub ttl: Duration,
}

impl Entity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(id: impl Into<Key>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn set(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn expire(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn get(&self, property: &str) -> Option<&Value> {
        self.properties.get(property)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in &self.properties {
            if name.is_empty() {
                return Err(Error::validation("empty property names are not allowed"));
            }
            match value {
                Value::Set(items) => validate_elements(name, items.iter())?,
                Value::List(items) => validate_elements(name, items.iter())?,
                Value::Map(entries) => {
                    if entries.keys().any(|k| k.is_empty()) {
                        return Err(Error::validation(format!(
                            "map property {name} contains an empty key"
                        )));
                    }
                    validate_elements(name, entries.values())?;
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn validate_elements<'a>(name: &str, mut items: impl Iterator<Item = &'a Value>) -> Result<()> {
    if items.any(|v| !v.is_scalar()) {
        return Err(Error::validation(format!(
            "container property {name} may only hold scalar values"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_values_order_totally() {
        let mut set = BTreeSet::new();
        set.insert(Value::Float(1.5));
        set.insert(Value::Float(-0.5));
        set.insert(Value::Float(1.5));
        assert_eq!(set.len(), 2);
        assert_eq!(set.iter().next(), Some(&Value::Float(-0.5)));
    }

    #[test]
    fn entity_validation_rejects_nested_containers() {
        let ent = Entity::new().set("tags", Value::List(vec![Value::List(vec![])]));
        assert!(ent.validate().is_err());

        let ent = Entity::new().set("tags", Value::List(vec![Value::Int(1)]));
        assert!(ent.validate().is_ok());
    }

    #[test]
    fn entity_validation_rejects_empty_names() {
        let mut ent = Entity::new();
        ent.properties.insert(String::new(), Value::Int(1));
        assert!(ent.validate().is_err());
    }
}
