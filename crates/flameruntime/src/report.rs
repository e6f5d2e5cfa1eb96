//! Aggregation of per-node statuses into the final outcome message.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Success,
    Failure,
    #[serde(rename = "Partially successful")]
    PartiallySuccessful,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Success => write!(f, "Success"),
            RunStatus::Failure => write!(f, "Failure"),
            RunStatus::PartiallySuccessful => write!(f, "Partially successful"),
        }
    }
}

/// The one-line JSON outcome printed on stdout at the end of a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Report {
    pub status: RunStatus,
    pub status_message: String,
    pub nodes_success: usize,
    pub nodes_error: usize,
    pub nodes_count: usize,
    pub nodes: BTreeMap<String, String>,
}

impl Report {
    /// Build the outcome from the final status map and the two run-level
    /// failure flags.
    pub fn build(
        nodes: BTreeMap<String, String>,
        execution_timeout: bool,
        connection_problem: bool,
    ) -> Self {
        let status_message = if connection_problem {
            "Connection between nodes timed out before being established.".to_string()
        } else if execution_timeout {
            "Execution timed out.".to_string()
        } else {
            String::new()
        };

        let nodes_success = nodes.values().filter(|v| *v == "success").count();
        let nodes_error = nodes.len() - nodes_success;

        let status = if !nodes.is_empty() && nodes_error == nodes.len() {
            RunStatus::Failure
        } else if status_message.is_empty() && nodes_error == 0 {
            RunStatus::Success
        } else {
            RunStatus::PartiallySuccessful
        };

        Self {
            status,
            status_message,
            nodes_success,
            nodes_error,
            nodes_count: nodes.len(),
            nodes,
        }
    }
}
