use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlameError {
    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),

    #[error("No free ports for connecting nodes found (searched up to {ceiling})")]
    NoFreePort { ceiling: u16 },

    #[error("Failed to launch node '{node}': {source}")]
    Spawn {
        node: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Debug bridge error: {0}")]
    Bridge(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Workflow file not found: {0}")]
    NotFound(String),

    #[error("Invalid workflow: {0}")]
    Invalid(String),

    #[error("Node '{0}' is declared more than once")]
    DuplicateNode(String),

    #[error("Unknown node class: {0}")]
    UnknownClass(String),

    #[error("Input '{input}' of node '{node}' references '{reference}', which no node provides")]
    UnresolvedReference {
        node: String,
        input: String,
        reference: String,
    },

    #[error("Workflow parameters are not completely resolved:\n{0}")]
    MissingParameters(String),
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Channel closed")]
    Closed,

    #[error("Malformed frame: {0}")]
    Codec(String),

    #[error("Frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("Failed to reach directory at {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Directory protocol error: {0}")]
    Protocol(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Result type for flame operations
pub type Result<T> = std::result::Result<T, FlameError>;
