use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Entropy Unique Identifier of an output channel: `#<node>/<output>`.
///
/// EUIs key endpoint resolution, archive tables, and port locks. Parsing is
/// centralized here; the executor never treats them as free-form text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Eui {
    node: String,
    output: String,
}

impl Eui {
    pub fn new(node: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            output: output.into(),
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    /// True for strings that denote a runtime reference rather than a literal.
    ///
    /// A reference starts with `#` followed by a node name, i.e. the second
    /// character is not `/` (strings like `#/j1` are job identifiers, not
    /// channel references).
    pub fn is_reference(s: &str) -> bool {
        let mut chars = s.chars();
        chars.next() == Some('#') && !matches!(chars.next(), Some('/') | None)
    }
}

impl fmt::Display for Eui {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}/{}", self.node, self.output)
    }
}

impl FromStr for Eui {
    type Err = EuiParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s
            .strip_prefix('#')
            .ok_or_else(|| EuiParseError(s.to_string()))?;
        let (node, output) = body.split_once('/').ok_or_else(|| EuiParseError(s.to_string()))?;
        if node.is_empty() || output.is_empty() || output.contains('/') {
            return Err(EuiParseError(s.to_string()));
        }
        Ok(Eui::new(node, output))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("not a valid output reference: '{0}' (expected '#<node>/<output>')")]
pub struct EuiParseError(pub String);

impl Serialize for Eui {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Eui {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A node input binding: either a literal JSON value or a reference to
/// another node's output.
#[derive(Debug, Clone, PartialEq)]
pub enum InputValue {
    Literal(serde_json::Value),
    Reference(Eui),
}

impl InputValue {
    /// Classify a raw JSON value from a workflow or parameter file.
    pub fn from_json(value: serde_json::Value) -> Self {
        if let serde_json::Value::String(s) = &value {
            if Eui::is_reference(s) {
                if let Ok(eui) = s.parse() {
                    return InputValue::Reference(eui);
                }
            }
        }
        InputValue::Literal(value)
    }

    /// The raw JSON form as stored in the directory resolution row.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            InputValue::Literal(v) => v.clone(),
            InputValue::Reference(eui) => serde_json::Value::String(eui.to_string()),
        }
    }

    pub fn as_reference(&self) -> Option<&Eui> {
        match self {
            InputValue::Reference(eui) => Some(eui),
            InputValue::Literal(_) => None,
        }
    }
}
