use crate::error::WorkflowError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Delivery semantics of a node input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    /// Keeps only the most recent value; the first read blocks, later reads
    /// return the cached value without blocking.
    State,
    /// Queues every published value; each read consumes one, blocking when
    /// the queue is empty.
    Stream,
}

impl InputKind {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(InputKind::State),
            2 => Some(InputKind::Stream),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            InputKind::State => 1,
            InputKind::Stream => 2,
        }
    }
}

/// How long values published on an output live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Retention {
    /// Transient: delivered to subscribers only.
    Transient,
    /// Persisted in the runtime table for the duration of the run.
    Runtime,
    /// Persisted and copied to the final archive file.
    Archive,
}

impl Retention {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Retention::Transient),
            1 => Some(Retention::Runtime),
            2 => Some(Retention::Archive),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Retention::Transient => 0,
            Retention::Runtime => 1,
            Retention::Archive => 2,
        }
    }

    pub fn is_retained(self) -> bool {
        self != Retention::Transient
    }
}

/// Input declarations of a node class, keyed by input name.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct InputBlock {
    #[serde(default)]
    pub description: BTreeMap<String, String>,
    #[serde(default)]
    pub units: BTreeMap<String, String>,
    #[serde(rename = "type", default)]
    pub kind: BTreeMap<String, u8>,
}

/// Output declarations of a node class, keyed by output name.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct OutputBlock {
    #[serde(default)]
    pub description: BTreeMap<String, String>,
    #[serde(default)]
    pub units: BTreeMap<String, String>,
    #[serde(default)]
    pub retention: BTreeMap<String, u8>,
}

/// Schema of one node class as stored in `entropynodes/schema/<Class>.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeSchema {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub command: String,
    pub bin: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub inputs: Vec<InputBlock>,
    #[serde(default)]
    pub outputs: Vec<OutputBlock>,
}

impl NodeSchema {
    fn input_block(&self) -> Option<&InputBlock> {
        self.inputs.first()
    }

    fn output_block(&self) -> Option<&OutputBlock> {
        self.outputs.first()
    }

    pub fn input_names(&self) -> impl Iterator<Item = &str> {
        self.input_block()
            .into_iter()
            .flat_map(|b| b.kind.keys().map(String::as_str))
    }

    pub fn output_names(&self) -> impl Iterator<Item = &str> {
        self.output_block()
            .into_iter()
            .flat_map(|b| b.retention.keys().map(String::as_str))
    }

    pub fn input_kind(&self, input: &str) -> Option<InputKind> {
        self.input_block()
            .and_then(|b| b.kind.get(input))
            .copied()
            .and_then(InputKind::from_code)
    }

    pub fn retention(&self, output: &str) -> Option<Retention> {
        self.output_block()
            .and_then(|b| b.retention.get(output))
            .copied()
            .and_then(Retention::from_code)
    }

    pub fn declares_output(&self, output: &str) -> bool {
        self.output_block()
            .map(|b| b.retention.contains_key(output))
            .unwrap_or(false)
    }

    pub fn output_description(&self, output: &str) -> &str {
        self.output_block()
            .and_then(|b| b.description.get(output))
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn output_units(&self, output: &str) -> &str {
        self.output_block()
            .and_then(|b| b.units.get(output))
            .map(String::as_str)
            .unwrap_or("")
    }
}

/// Registry of node schemas keyed by class name.
#[derive(Debug, Default, Clone)]
pub struct SchemaRegistry {
    schemas: BTreeMap<String, NodeSchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, class: impl Into<String>, schema: NodeSchema) {
        self.schemas.insert(class.into(), schema);
    }

    pub fn get(&self, class: &str) -> Option<&NodeSchema> {
        self.schemas.get(class)
    }

    pub fn require(&self, class: &str) -> Result<&NodeSchema, WorkflowError> {
        self.schemas
            .get(class)
            .ok_or_else(|| WorkflowError::UnknownClass(class.to_string()))
    }

    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }

    /// Load `<dir>/<Class>.json` for one class, caching nothing on failure.
    pub fn load_class(&mut self, dir: &Path, class: &str) -> Result<&NodeSchema, WorkflowError> {
        if !self.schemas.contains_key(class) {
            let path = dir.join(format!("{class}.json"));
            let raw = std::fs::read_to_string(&path).map_err(|e| {
                WorkflowError::Invalid(format!(
                    "cannot read node schema {}: {e}",
                    path.display()
                ))
            })?;
            let schema: NodeSchema = serde_json::from_str(&raw).map_err(|e| {
                WorkflowError::Invalid(format!(
                    "cannot parse node schema {}: {e}",
                    path.display()
                ))
            })?;
            self.schemas.insert(class.to_string(), schema);
        }
        Ok(&self.schemas[class])
    }
}
