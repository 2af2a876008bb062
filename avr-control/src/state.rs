//! Property state snapshot
//!
//! The snapshot maps property names to the last value decoded from the
//! receiver. It is only meaningful while connected: the session clears it
//! whenever the connection closes, so an absent key means "unknown".

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A decoded property value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Text(String),
}

impl PropertyValue {
    /// Parse user input, treating `true`/`false` as booleans.
    pub fn parse_loose(input: &str) -> Self {
        match input {
            "true" => Self::Bool(true),
            "false" => Self::Bool(false),
            other => Self::Text(other.to_string()),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            Self::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            Self::Bool(_) => None,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(value) => write!(f, "{}", value),
            Self::Text(value) => f.write_str(value),
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<u8> for PropertyValue {
    fn from(value: u8) -> Self {
        Self::Text(value.to_string())
    }
}

/// Last observed value of every decoded property.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct PropertyState {
    values: BTreeMap<String, PropertyValue>,
}

impl PropertyState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Store a value, returning whether it changed.
    pub fn set(&mut self, name: &str, value: PropertyValue) -> bool {
        if self.values.get(name) == Some(&value) {
            return false;
        }
        self.values.insert(name.to_string(), value);
        true
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PropertyValue)> {
        self.values.iter().map(|(name, value)| (name.as_str(), value))
    }
}

/// What an inbound line was classified as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateEvent {
    /// A registered property was reported
    Property { name: String, value: PropertyValue },
    /// The line matched no registered property
    Unknown { line: String },
}

/// Payload of the state-change callback.
#[derive(Debug, Clone)]
pub struct StateUpdate {
    pub event: StateEvent,
    pub snapshot: PropertyState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_reports_change() {
        let mut state = PropertyState::new();
        assert!(state.set("volume", "35".into()));
        assert!(!state.set("volume", "35".into()));
        assert!(state.set("volume", "40".into()));
        assert_eq!(state.get("volume"), Some(&PropertyValue::from("40")));
    }

    #[test]
    fn test_clear_forgets_everything() {
        let mut state = PropertyState::new();
        state.set("volume", "35".into());
        state.set("muted", true.into());
        assert_eq!(state.len(), 2);
        state.clear();
        assert!(state.is_empty());
        assert!(!state.contains("muted"));
    }

    #[test]
    fn test_snapshot_serializes_as_flat_object() {
        let mut state = PropertyState::new();
        state.set("volume", "35".into());
        state.set("muted", false.into());
        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(json, r#"{"muted":false,"volume":"35"}"#);
    }

    #[test]
    fn test_parse_loose() {
        assert_eq!(PropertyValue::parse_loose("true"), PropertyValue::Bool(true));
        assert_eq!(PropertyValue::parse_loose("false"), PropertyValue::Bool(false));
        assert_eq!(PropertyValue::parse_loose("ON"), PropertyValue::from("ON"));
        assert_eq!(PropertyValue::parse_loose("35").to_string(), "35");
    }
}
