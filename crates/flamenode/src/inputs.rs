//! Typed node inputs.
//!
//! A state input keeps only the most recent value: the first read blocks
//! until something has arrived, later reads return the cached value without
//! blocking. A stream input queues every value: each read consumes one and
//! blocks while the queue is empty. Literal bindings resolve immediately.

use flamecore::transport::{Endpoint, SubscribeMode, Subscriber};
use flamecore::wire::is_ping;
use flamecore::{DirectoryClient, DirectoryError, FlameError, InputKind, TransportError};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

#[derive(Debug, Clone)]
struct InputDecl {
    kind: InputKind,
    #[allow(dead_code)]
    description: String,
    #[allow(dead_code)]
    units: String,
}

enum Binding {
    Literal(serde_json::Value),
    Channel(Subscriber),
}

/// The declared inputs of one node and their resolved bindings.
#[derive(Default)]
pub struct Inputs {
    declarations: BTreeMap<String, InputDecl>,
    bindings: BTreeMap<String, Binding>,
    pinged: HashSet<String>,
}

impl Inputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a state input.
    pub fn state(&mut self, name: &str, description: &str, units: &str) {
        self.declare(name, InputKind::State, description, units);
    }

    /// Declare a stream input.
    pub fn stream(&mut self, name: &str, description: &str, units: &str) {
        self.declare(name, InputKind::Stream, description, units);
    }

    fn declare(&mut self, name: &str, kind: InputKind, description: &str, units: &str) {
        self.declarations.insert(
            name.to_string(),
            InputDecl {
                kind,
                description: description.to_string(),
                units: units.to_string(),
            },
        );
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.declarations.keys().map(String::as_str)
    }

    /// Resolve every declared input from the node's directory row: literal
    /// values bind directly, `#node/output` references open subscribers.
    pub async fn connect(
        &mut self,
        directory: &DirectoryClient,
        identity: &str,
    ) -> Result<(), FlameError> {
        let row = directory
            .get(&format!("#{identity}"))
            .await?
            .ok_or_else(|| {
                DirectoryError::Protocol(format!("no parameter resolution for '{identity}'"))
            })?;
        let resolved: BTreeMap<String, serde_json::Value> =
            serde_json::from_str(&row).map_err(|e| {
                FlameError::Directory(DirectoryError::Protocol(format!(
                    "bad parameter resolution for '{identity}': {e}"
                )))
            })?;

        for (name, decl) in &self.declarations {
            let value = resolved.get(name).cloned().ok_or_else(|| {
                DirectoryError::Protocol(format!("input '{name}' of '{identity}' is unresolved"))
            })?;
            let binding = match flamecore::InputValue::from_json(value) {
                flamecore::InputValue::Literal(v) => Binding::Literal(v),
                flamecore::InputValue::Reference(eui) => {
                    let address =
                        directory.get(&eui.to_string()).await?.ok_or_else(|| {
                            DirectoryError::Protocol(format!("'{eui}' has no endpoint"))
                        })?;
                    let endpoint: Endpoint = address.parse()?;
                    let mode = match decl.kind {
                        InputKind::State => SubscribeMode::KeepLast,
                        InputKind::Stream => SubscribeMode::Queue,
                    };
                    let subscriber = connect_with_retry(&endpoint, mode).await?;
                    Binding::Channel(subscriber)
                }
            };
            self.bindings.insert(name.clone(), binding);
        }
        Ok(())
    }

    /// Read one input. State inputs return the most recent value, stream
    /// inputs consume the next queued one.
    pub async fn get(&mut self, name: &str) -> Result<serde_json::Value, FlameError> {
        let kind = self
            .declarations
            .get(name)
            .map(|d| d.kind)
            .ok_or_else(|| {
                FlameError::Directory(DirectoryError::Protocol(format!(
                    "undeclared input '{name}'"
                )))
            })?;
        match self.bindings.get_mut(name) {
            Some(Binding::Literal(value)) => Ok(value.clone()),
            Some(Binding::Channel(subscriber)) => {
                let value = match kind {
                    InputKind::State => subscriber.latest().await,
                    InputKind::Stream => subscriber.recv().await,
                };
                value.ok_or(FlameError::Transport(TransportError::Closed))
            }
            None => Err(FlameError::Directory(DirectoryError::Protocol(format!(
                "input '{name}' is not connected"
            )))),
        }
    }

    /// Non-blocking read; `None` when nothing is available.
    pub fn try_get(&mut self, name: &str) -> Option<serde_json::Value> {
        match self.bindings.get_mut(name) {
            Some(Binding::Literal(value)) => Some(value.clone()),
            Some(Binding::Channel(subscriber)) => subscriber.try_recv(),
            None => None,
        }
    }

    /// Poll every channel input with no-wait receives, recording which ones
    /// have delivered at least one ping. True once all have.
    pub fn poll_pings(&mut self) -> bool {
        for (name, binding) in self.bindings.iter_mut() {
            if let Binding::Channel(subscriber) = binding {
                if self.pinged.contains(name) {
                    continue;
                }
                if let Some(value) = subscriber.try_recv() {
                    if is_ping(&value) {
                        self.pinged.insert(name.clone());
                    }
                }
            }
        }
        self.bindings
            .iter()
            .filter(|(_, b)| matches!(b, Binding::Channel(_)))
            .all(|(name, _)| self.pinged.contains(name))
    }

    /// Drain everything buffered (the flush phase of the barrier).
    pub fn flush(&mut self) {
        for binding in self.bindings.values_mut() {
            if let Binding::Channel(subscriber) = binding {
                subscriber.clear();
            }
        }
    }
}

/// The publisher may not have bound yet when a subscriber starts; retry
/// until it shows up.
async fn connect_with_retry(
    endpoint: &Endpoint,
    mode: SubscribeMode,
) -> Result<Subscriber, FlameError> {
    const ATTEMPT_INTERVAL: Duration = Duration::from_millis(100);
    const MAX_ATTEMPTS: u32 = 600;

    for _ in 0..MAX_ATTEMPTS {
        match Subscriber::connect(endpoint, mode).await {
            Ok(subscriber) => return Ok(subscriber),
            Err(_) => tokio::time::sleep(ATTEMPT_INTERVAL).await,
        }
    }
    Err(FlameError::Transport(TransportError::Connect {
        endpoint: endpoint.to_string(),
        source: std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "publisher never bound its endpoint",
        ),
    }))
}
