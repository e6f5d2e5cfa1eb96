//! Node-side runtime for flame workflows
//!
//! A node executable links against this crate to honor the executor's wire
//! contract: directory discovery through the playbook address, one bound
//! publisher per output, state/stream input subscriptions, the four-phase
//! startup barrier, and runtime-table inserts for retained outputs.

mod inputs;
mod nodeio;
mod outputs;
mod playbook;
mod retention;

pub use inputs::Inputs;
pub use nodeio::NodeIo;
pub use outputs::Outputs;
pub use playbook::{parse_node_args, PlaybookAddress};
pub use retention::RetentionWriter;
