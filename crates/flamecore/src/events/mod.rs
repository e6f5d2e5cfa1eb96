mod iggy_bus;
mod status;

pub use iggy_bus::{BusMessage, IggyBus, IggyBusConfig, IggyBusError};
pub use status::{status_routing_key, BroadcastSink, StatusSink, StatusUpdate};
