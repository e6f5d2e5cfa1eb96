//! The flame executor runtime
//!
//! This crate hosts the supervisor and its collaborators: the directory
//! store and server, the port allocator, the runtime archive store and the
//! archive-file container, the workflow loader, the debug bridge, and the
//! result reporter.

pub mod archive;
pub mod bridge;
pub mod container;
pub mod directory;
pub mod loader;
pub mod ports;
pub mod report;
pub mod supervisor;

pub use archive::{ArchiveError, ArchiveStore};
pub use bridge::{DebugBridge, DebugTap};
pub use container::{ArchiveDocument, ArchiveGroup, ContainerError, Dataset, DatasetData};
pub use directory::{DirectoryServer, DirectoryStore};
pub use loader::{load, LoadedWorkflow};
pub use ports::{PortAllocator, DEFAULT_PORT_CEILING, DEFAULT_PORT_START};
pub use report::{Report, RunStatus};
pub use supervisor::{ExecuteOptions, ExecutionOutcome, Metadata, Supervisor};
