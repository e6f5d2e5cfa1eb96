//! Loads the workflow definition and parameter bindings into the node list
//! the supervisor executes.
//!
//! The workflow file is the JSON document produced by the authoring surface;
//! the parameter file resolves remaining inputs, with `#node/output` strings
//! wiring nodes together. Node schemas are read from
//! `entropynodes/schema/<Class>.json` next to the workflow.

use flamecore::{
    FlameError, HostOptions, InputValue, NodeInstance, SchemaRegistry, Workflow, WorkflowError,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct WorkflowFile {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    nodes: Vec<NodeEntry>,
}

#[derive(Debug, Deserialize)]
struct NodeEntry {
    name: String,
    class: String,
    #[serde(default)]
    inputs: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    host: HostOptions,
}

/// A workflow ready to execute: validated nodes plus their schemas.
#[derive(Debug)]
pub struct LoadedWorkflow {
    pub workflow: Workflow,
    pub registry: SchemaRegistry,
}

impl LoadedWorkflow {
    /// The fully resolved parameter map, node by node. Feeding this back
    /// through the loader yields the same map.
    pub fn resolved_parameters(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .workflow
            .nodes()
            .iter()
            .map(|n| (n.name.clone(), n.resolved_inputs()))
            .collect();
        serde_json::Value::Object(map)
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path, what: &str) -> Result<T, FlameError> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        FlameError::Workflow(WorkflowError::NotFound(format!(
            "{what} {}: {e}",
            path.display()
        )))
    })?;
    serde_json::from_str(&raw).map_err(|e| {
        FlameError::Workflow(WorkflowError::Invalid(format!(
            "cannot parse {what} {}: {e}",
            path.display()
        )))
    })
}

/// Load and validate a workflow: definition file, parameter file, and the
/// schema directory.
pub fn load(
    workflow_path: &Path,
    parameters_path: &Path,
    schema_dir: &Path,
) -> Result<LoadedWorkflow, FlameError> {
    let file: WorkflowFile = read_json(workflow_path, "workflow file")?;
    let parameters: BTreeMap<String, BTreeMap<String, serde_json::Value>> =
        read_json(parameters_path, "parameter file")?;

    let mut workflow = Workflow::new(file.name, file.description);
    for entry in file.nodes {
        let mut node = NodeInstance::new(entry.name, entry.class);
        node.host = entry.host;
        for (input, value) in entry.inputs {
            node.set_input(input, InputValue::from_json(value));
        }
        workflow.add(node)?;
    }

    for (node_name, bindings) in parameters {
        let node = workflow
            .nodes_mut()
            .iter_mut()
            .find(|n| n.name == node_name)
            .ok_or_else(|| {
                WorkflowError::Invalid(format!(
                    "parameter file binds unknown node '{node_name}'"
                ))
            })?;
        for (input, value) in bindings {
            node.set_input(input, InputValue::from_json(value));
        }
    }

    let mut registry = SchemaRegistry::new();
    for node in workflow.nodes() {
        registry.load_class(schema_dir, &node.class)?;
    }
    workflow.validate(&registry)?;

    tracing::info!(
        workflow = %workflow.name,
        nodes = workflow.len(),
        "Workflow loaded"
    );
    Ok(LoadedWorkflow { workflow, registry })
}
