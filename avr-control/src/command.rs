//! Command specifications
//!
//! A [`CommandSpec`] describes one controllable property of the receiver:
//! the wire prefix used to set and query it, the pattern that recognizes
//! lines reporting it, and an optional dictionary translating logical values
//! to wire tokens (e.g. `true` ↔ `ON`).
//!
//! ```text
//! set volume 35   ->  "MV35\r"
//! get volume      ->  "MV?\r"
//! "MV35\r"        ->  volume = "35"
//! ```

use std::time::Duration;

use regex::Regex;

use crate::error::{AvrError, Result};
use crate::state::PropertyValue;

// ============================================================================
// Value dictionary
// ============================================================================

/// Ordered bidirectional mapping between logical values and wire tokens.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValueDict {
    entries: Vec<(PropertyValue, String)>,
}

impl ValueDict {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dictionary for on/off style properties: `true` ↔ `on`, `false` ↔ `off`.
    pub fn boolean(on: &str, off: &str) -> Self {
        Self::new().with(true, on).with(false, off)
    }

    pub fn with(mut self, logical: impl Into<PropertyValue>, wire: impl Into<String>) -> Self {
        self.entries.push((logical.into(), wire.into()));
        self
    }

    pub fn to_wire(&self, logical: &PropertyValue) -> Option<&str> {
        self.entries
            .iter()
            .find(|(value, _)| value == logical)
            .map(|(_, wire)| wire.as_str())
    }

    pub fn to_logical(&self, wire: &str) -> Option<&PropertyValue> {
        self.entries
            .iter()
            .find(|(_, token)| token == wire)
            .map(|(value, _)| value)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&PropertyValue, &str)> {
        self.entries.iter().map(|(value, wire)| (value, wire.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// Accessors
// ============================================================================

/// Operation a derived accessor name stands for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Accessor {
    /// `set<Name>(value)`
    Set(String),
    /// `get<Name>()`
    Get(String),
    /// Zero-argument accessor fixing one side of a two-entry dictionary
    Fixed {
        property: String,
        value: PropertyValue,
    },
}

fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

// ============================================================================
// CommandSpec
// ============================================================================

/// Registered description of one controllable property.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    name: String,
    aliases: Vec<String>,
    prefix: String,
    pattern: Regex,
    values: Option<ValueDict>,
    settle: Duration,
}

impl CommandSpec {
    /// Create a spec from its name, send prefix and match pattern.
    ///
    /// The pattern may contain at most one capture group; when present it
    /// selects the value token, otherwise the whole match is the token.
    pub fn new(name: impl Into<String>, prefix: impl Into<String>, pattern: &str) -> Result<Self> {
        let name = name.into();
        let pattern = Regex::new(pattern)?;
        // captures_len() counts the implicit whole-match group
        let groups = pattern.captures_len() - 1;
        if groups > 1 {
            return Err(AvrError::TooManyCaptures { name, groups });
        }

        Ok(Self {
            name,
            aliases: Vec::new(),
            prefix: prefix.into(),
            pattern,
            values: None,
            settle: Duration::ZERO,
        })
    }

    pub fn with_aliases<I, S>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aliases = aliases.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_values(mut self, values: ValueDict) -> Self {
        self.values = Some(values);
        self
    }

    /// Hold the dispatcher for `settle` after this command resolves.
    ///
    /// Power transitions make the receiver ignore commands for a while.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn aliases(&self) -> &[String] {
        &self.aliases
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn pattern(&self) -> &Regex {
        &self.pattern
    }

    pub fn values(&self) -> Option<&ValueDict> {
        self.values.as_ref()
    }

    pub fn settle(&self) -> Duration {
        self.settle
    }

    /// Map a caller-supplied value to its logical form.
    ///
    /// With a dictionary, both logical values and raw wire tokens are
    /// accepted; anything else is rejected. Without one, values pass through.
    pub fn normalize(&self, value: PropertyValue) -> Result<PropertyValue> {
        let Some(dict) = &self.values else {
            return Ok(value);
        };

        if dict.to_wire(&value).is_some() {
            return Ok(value);
        }
        if let PropertyValue::Text(token) = &value {
            if let Some(logical) = dict.to_logical(token) {
                return Ok(logical.clone());
            }
        }

        Err(AvrError::InvalidValue {
            property: self.name.clone(),
            value: value.to_string(),
        })
    }

    /// Wire text setting this property to `value`.
    pub fn set_command(&self, value: &PropertyValue) -> Result<String> {
        let logical = self.normalize(value.clone())?;
        let token = match &self.values {
            Some(dict) => dict.to_wire(&logical).unwrap_or_default().to_string(),
            None => logical.to_string(),
        };
        Ok(format!("{}{}", self.prefix, token))
    }

    /// Wire text querying this property.
    pub fn get_command(&self) -> String {
        format!("{}?", self.prefix)
    }

    /// Decode a line reporting this property.
    pub fn decode(&self, line: &str) -> Option<PropertyValue> {
        let caps = self.pattern.captures(line)?;
        let token = caps.get(1).or_else(|| caps.get(0))?.as_str();
        Some(
            self.values
                .as_ref()
                .and_then(|dict| dict.to_logical(token))
                .cloned()
                .unwrap_or_else(|| PropertyValue::Text(token.to_string())),
        )
    }

    /// Whether two specs would claim the same inbound lines.
    ///
    /// Responses mirror the send prefix space, so a prefix that extends
    /// another (`PS` / `PSDYNVOL `) or a pattern matching the other's bare
    /// prefix indicates a conflict.
    pub fn overlaps(&self, other: &CommandSpec) -> bool {
        self.prefix.starts_with(&other.prefix)
            || other.prefix.starts_with(&self.prefix)
            || self.pattern.is_match(&other.prefix)
            || other.pattern.is_match(&self.prefix)
    }

    /// Accessor names derived from this spec.
    ///
    /// Each alias (or the name, without aliases) yields `set<Alias>` and
    /// `get<Alias>`. Exactly two aliases over a two-entry dictionary instead
    /// yield one zero-argument accessor per alias, e.g. `on` / `off`.
    pub fn accessors(&self) -> Vec<(String, Accessor)> {
        if let Some(dict) = self.values.as_ref().filter(|dict| dict.len() == 2) {
            if self.aliases.len() == 2 {
                return self
                    .aliases
                    .iter()
                    .zip(dict.entries())
                    .map(|(alias, (value, _))| {
                        (
                            alias.clone(),
                            Accessor::Fixed {
                                property: self.name.clone(),
                                value: value.clone(),
                            },
                        )
                    })
                    .collect();
            }
        }

        let bases: Vec<&str> = if self.aliases.is_empty() {
            vec![self.name.as_str()]
        } else {
            self.aliases.iter().map(String::as_str).collect()
        };

        bases
            .into_iter()
            .flat_map(|base| {
                let base = capitalize(base);
                [
                    (format!("set{}", base), Accessor::Set(self.name.clone())),
                    (format!("get{}", base), Accessor::Get(self.name.clone())),
                ]
            })
            .collect()
    }
}
