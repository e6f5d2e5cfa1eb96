//! Typed node outputs.
//!
//! Every declared output binds the publisher endpoint the executor resolved
//! for it. Publishing a value on a retained output additionally appends a
//! `(now, encoded value)` row to the output's runtime table.

use crate::retention::RetentionWriter;
use flamecore::transport::{Endpoint, Publisher};
use flamecore::wire::ping;
use flamecore::{DirectoryClient, DirectoryError, Eui, FlameError, Retention};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
struct OutputDecl {
    retention: Retention,
    #[allow(dead_code)]
    description: String,
    #[allow(dead_code)]
    units: String,
}

/// The declared outputs of one node and their bound publishers.
#[derive(Default)]
pub struct Outputs {
    declarations: BTreeMap<String, OutputDecl>,
    publishers: BTreeMap<String, Publisher>,
    writer: Option<RetentionWriter>,
}

impl Outputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare one output with its retention level.
    pub fn define(&mut self, name: &str, description: &str, units: &str, retention: Retention) {
        self.declarations.insert(
            name.to_string(),
            OutputDecl {
                retention,
                description: description.to_string(),
                units: units.to_string(),
            },
        );
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.declarations.keys().map(String::as_str)
    }

    /// Bind one publisher per declared output at the endpoint the executor
    /// resolved, and open the runtime database when anything is retained.
    pub async fn bind(
        &mut self,
        directory: &DirectoryClient,
        identity: &str,
    ) -> Result<(), FlameError> {
        for (name, decl) in &self.declarations {
            let eui = Eui::new(identity, name);
            let address = directory
                .get(&eui.to_string())
                .await?
                .ok_or_else(|| DirectoryError::Protocol(format!("'{eui}' has no endpoint")))?;
            let endpoint: Endpoint = address.parse()?;
            let publisher = Publisher::bind(&endpoint).await?;
            self.publishers.insert(name.clone(), publisher);

            if decl.retention.is_retained() && self.writer.is_none() {
                self.writer = Some(RetentionWriter::open(directory).await?);
            }
        }
        Ok(())
    }

    /// Publish one value, appending it to the runtime table when retained.
    pub fn set(&mut self, identity: &str, name: &str, value: &serde_json::Value) -> Result<(), FlameError> {
        let decl = self.declarations.get(name).ok_or_else(|| {
            FlameError::Directory(DirectoryError::Protocol(format!(
                "undeclared output '{name}'"
            )))
        })?;
        let publisher = self.publishers.get(name).ok_or_else(|| {
            FlameError::Directory(DirectoryError::Protocol(format!(
                "output '{name}' is not bound"
            )))
        })?;
        publisher.send(value)?;

        if decl.retention.is_retained() {
            if let Some(writer) = &self.writer {
                writer.insert(&Eui::new(identity, name), value)?;
            }
        }
        Ok(())
    }

    /// Emit the connect-phase ping on every bound output.
    pub fn ping_all(&self) {
        for publisher in self.publishers.values() {
            let _ = publisher.send(&ping());
        }
    }
}
