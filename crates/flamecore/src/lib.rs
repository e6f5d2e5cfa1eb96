//! Core abstractions for the flame executor
//!
//! This crate provides the types and wire plumbing shared by the supervisor
//! runtime, the node-side runtime, and the CLI: EUI parsing, node schemas,
//! the workflow model, the frame codec, the pub/sub transport, the directory
//! client, and the status exchange.

pub mod directory;
mod error;
mod eui;
pub mod events;
mod schema;
mod state;
pub mod transport;
pub mod wire;
mod workflow;

pub use directory::DirectoryClient;
pub use error::{DirectoryError, FlameError, Result, TransportError, WorkflowError};
pub use eui::{Eui, EuiParseError, InputValue};
pub use schema::{InputBlock, InputKind, NodeSchema, OutputBlock, Retention, SchemaRegistry};
pub use state::{NodeState, TERMINATION_REQUEST};
pub use transport::{Collector, Emitter, Endpoint, Publisher, SubscribeMode, Subscriber};
pub use wire::{ControlCommand, StatusFrame};
pub use workflow::{HostOptions, NodeInstance, Workflow};
