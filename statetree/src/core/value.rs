//! Immutable tree values with `Arc`-shared containers.
//!
//! A `StateValue` is never mutated in place. Writers build a new value and
//! reuse every untouched container, so two values can be compared cheaply by
//! reference identity (`same`) as well as structurally (`==`).

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Number, Value};

pub type StateMap = BTreeMap<String, StateValue>;

#[derive(Debug, Clone, PartialEq, Default)]
pub enum StateValue {
    #[default]
    Null,
    Bool(bool),
    Number(Number),
    String(Arc<str>),
    List(Arc<Vec<StateValue>>),
    Map(Arc<StateMap>),
}

impl StateValue {
    pub fn empty_map() -> Self {
        StateValue::Map(Arc::new(StateMap::new()))
    }

    pub fn from_map(map: StateMap) -> Self {
        StateValue::Map(Arc::new(map))
    }

    pub fn from_list(items: Vec<StateValue>) -> Self {
        StateValue::List(Arc::new(items))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, StateValue::Null)
    }

    pub fn is_map(&self) -> bool {
        matches!(self, StateValue::Map(_))
    }

    pub fn is_list(&self) -> bool {
        matches!(self, StateValue::List(_))
    }

    pub fn as_map(&self) -> Option<&StateMap> {
        match self {
            StateValue::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[StateValue]> {
        match self {
            StateValue::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            StateValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            StateValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            StateValue::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            StateValue::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    /// Look up a direct key of a map value.
    pub fn get(&self, key: &str) -> Option<&StateValue> {
        self.as_map().and_then(|map| map.get(key))
    }

    /// Reference identity: containers must share the same allocation,
    /// scalars compare by value.
    pub fn same(&self, other: &StateValue) -> bool {
        match (self, other) {
            (StateValue::Map(a), StateValue::Map(b)) => Arc::ptr_eq(a, b),
            (StateValue::List(a), StateValue::List(b)) => Arc::ptr_eq(a, b),
            (StateValue::String(a), StateValue::String(b)) => a == b,
            (StateValue::Number(a), StateValue::Number(b)) => a == b,
            (StateValue::Bool(a), StateValue::Bool(b)) => a == b,
            (StateValue::Null, StateValue::Null) => true,
            _ => false,
        }
    }

    /// Human-readable category used in error messages.
    pub fn kind_label(&self) -> &'static str {
        match self {
            StateValue::Null => "null",
            StateValue::Bool(_) | StateValue::Number(_) | StateValue::String(_) => "a scalar",
            StateValue::List(_) => "a list",
            StateValue::Map(_) => "a map",
        }
    }

    /// Copy-on-write insert of `key` into a map value.
    ///
    /// Non-map values are replaced by a fresh map holding only `key`.
    pub fn with_entry(&self, key: &str, value: StateValue) -> StateValue {
        let mut map = self.as_map().cloned().unwrap_or_default();
        map.insert(key.to_string(), value);
        StateValue::from_map(map)
    }

    pub fn to_json(&self) -> Value {
        match self {
            StateValue::Null => Value::Null,
            StateValue::Bool(b) => Value::Bool(*b),
            StateValue::Number(n) => Value::Number(n.clone()),
            StateValue::String(s) => Value::String(s.to_string()),
            StateValue::List(items) => Value::Array(items.iter().map(StateValue::to_json).collect()),
            StateValue::Map(map) => Value::Object(
                map.iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect(),
            ),
        }
    }
}

impl From<Value> for StateValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => StateValue::Null,
            Value::Bool(b) => StateValue::Bool(b),
            Value::Number(n) => StateValue::Number(n),
            Value::String(s) => StateValue::String(Arc::from(s)),
            Value::Array(items) => {
                StateValue::from_list(items.into_iter().map(StateValue::from).collect())
            }
            Value::Object(map) => StateValue::from_map(
                map.into_iter()
                    .map(|(key, value)| (key, StateValue::from(value)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for StateValue {
    fn from(value: &str) -> Self {
        StateValue::String(Arc::from(value))
    }
}

impl From<String> for StateValue {
    fn from(value: String) -> Self {
        StateValue::String(Arc::from(value))
    }
}

impl From<bool> for StateValue {
    fn from(value: bool) -> Self {
        StateValue::Bool(value)
    }
}

impl From<i64> for StateValue {
    fn from(value: i64) -> Self {
        StateValue::Number(Number::from(value))
    }
}

impl From<f64> for StateValue {
    fn from(value: f64) -> Self {
        Number::from_f64(value).map_or(StateValue::Null, StateValue::Number)
    }
}

impl From<StateMap> for StateValue {
    fn from(value: StateMap) -> Self {
        StateValue::from_map(value)
    }
}

impl From<Vec<StateValue>> for StateValue {
    fn from(value: Vec<StateValue>) -> Self {
        StateValue::from_list(value)
    }
}

impl Serialize for StateValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            StateValue::Null => serializer.serialize_unit(),
            StateValue::Bool(b) => serializer.serialize_bool(*b),
            StateValue::Number(n) => n.serialize(serializer),
            StateValue::String(s) => serializer.serialize_str(s),
            StateValue::List(items) => serializer.collect_seq(items.iter()),
            StateValue::Map(map) => serializer.collect_map(map.iter()),
        }
    }
}

impl<'de> Deserialize<'de> for StateValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(StateValue::from)
    }
}
