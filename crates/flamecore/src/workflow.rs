use crate::error::WorkflowError;
use crate::eui::{Eui, InputValue};
use crate::schema::SchemaRegistry;
use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

/// Host-specific execution options of one node instance.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct HostOptions {
    /// Extra environment variables set for the node process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Working directory override for the node process.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

/// One node of the workflow: a name, a class key into the schema registry,
/// and the input bindings (literals or `#node/output` references).
#[derive(Debug, Clone)]
pub struct NodeInstance {
    pub name: String,
    pub class: String,
    pub inputs: BTreeMap<String, InputValue>,
    pub host: HostOptions,
}

impl NodeInstance {
    pub fn new(name: impl Into<String>, class: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            class: class.into(),
            inputs: BTreeMap::new(),
            host: HostOptions::default(),
        }
    }

    pub fn set_input(&mut self, name: impl Into<String>, value: InputValue) {
        self.inputs.insert(name.into(), value);
    }

    /// The input map in its directory-resolution JSON form.
    pub fn resolved_inputs(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .inputs
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        serde_json::Value::Object(map)
    }

    pub fn references(&self) -> impl Iterator<Item = (&str, &Eui)> {
        self.inputs
            .iter()
            .filter_map(|(name, v)| v.as_reference().map(|eui| (name.as_str(), eui)))
    }
}

/// An ordered set of node instances wired together by output references.
#[derive(Debug, Clone, Default)]
pub struct Workflow {
    pub name: String,
    pub description: String,
    nodes: Vec<NodeInstance>,
}

impl Workflow {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            nodes: Vec::new(),
        }
    }

    /// Add a node, rejecting duplicate names.
    pub fn add(&mut self, node: NodeInstance) -> Result<(), WorkflowError> {
        if self.nodes.iter().any(|n| n.name == node.name) {
            return Err(WorkflowError::DuplicateNode(node.name));
        }
        self.nodes.push(node);
        Ok(())
    }

    pub fn nodes(&self) -> &[NodeInstance] {
        &self.nodes
    }

    pub fn nodes_mut(&mut self) -> &mut [NodeInstance] {
        &mut self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn find(&self, name: &str) -> Option<&NodeInstance> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Check the workflow against the schema registry: every class known,
    /// every reference pointing at a declared output of an existing node,
    /// and every schema input bound. Cycles are legal (stream feedback).
    pub fn validate(&self, registry: &SchemaRegistry) -> Result<(), WorkflowError> {
        for node in &self.nodes {
            registry.require(&node.class)?;
        }

        for node in &self.nodes {
            for (input, eui) in node.references() {
                let provider = self.find(eui.node()).ok_or_else(|| {
                    WorkflowError::UnresolvedReference {
                        node: node.name.clone(),
                        input: input.to_string(),
                        reference: eui.to_string(),
                    }
                })?;
                let schema = registry.require(&provider.class)?;
                if !schema.declares_output(eui.output()) {
                    return Err(WorkflowError::UnresolvedReference {
                        node: node.name.clone(),
                        input: input.to_string(),
                        reference: eui.to_string(),
                    });
                }
            }
        }

        let mut missing = BTreeMap::new();
        for node in &self.nodes {
            let schema = registry.require(&node.class)?;
            let unbound: Vec<&str> = schema
                .input_names()
                .filter(|name| !node.inputs.contains_key(*name))
                .collect();
            if !unbound.is_empty() {
                missing.insert(
                    node.name.clone(),
                    unbound.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
                );
            }
        }
        if !missing.is_empty() {
            let listing = serde_json::to_string_pretty(&missing)
                .unwrap_or_else(|_| format!("{missing:?}"));
            return Err(WorkflowError::MissingParameters(listing));
        }

        Ok(())
    }

    /// The wiring graph: one vertex per node, one edge per reference input,
    /// weighted with the referenced EUI.
    pub fn wiring_graph(&self) -> DiGraph<String, Eui> {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        for node in &self.nodes {
            let idx = graph.add_node(node.name.clone());
            index.insert(node.name.as_str(), idx);
        }
        for node in &self.nodes {
            for (_, eui) in node.references() {
                if let Some(&from) = index.get(eui.node()) {
                    graph.add_edge(from, index[node.name.as_str()], eui.clone());
                }
            }
        }
        graph
    }

    /// JSON summary of the workflow for dashboards: nodes, classes, edges,
    /// and the resolved input map.
    pub fn to_graph_json(&self) -> serde_json::Value {
        let graph = self.wiring_graph();
        let edges: Vec<serde_json::Value> = graph
            .edge_indices()
            .filter_map(|e| {
                let (a, b) = graph.edge_endpoints(e)?;
                Some(serde_json::json!({
                    "source": graph[a],
                    "target": graph[b],
                    "channel": graph[e].to_string(),
                }))
            })
            .collect();
        let nodes: Vec<serde_json::Value> = self
            .nodes
            .iter()
            .map(|n| serde_json::json!({"name": n.name, "class": n.class}))
            .collect();
        let resolved: BTreeMap<&str, serde_json::Value> = self
            .nodes
            .iter()
            .map(|n| (n.name.as_str(), n.resolved_inputs()))
            .collect();
        serde_json::json!({
            "name": self.name,
            "description": self.description,
            "nodes": nodes,
            "edges": edges,
            "resolved_inputs": resolved,
        })
    }
}
