use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Human-readable status event published on every node state change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusUpdate {
    pub node: String,
    pub msg: String,
    pub style: String,
}

impl StatusUpdate {
    pub fn new(
        node: impl Into<String>,
        msg: impl Into<String>,
        style: impl Into<String>,
    ) -> Self {
        Self {
            node: node.into(),
            msg: msg.into(),
            style: style.into(),
        }
    }
}

/// Routing key for status updates of one job on one runtime.
pub fn status_routing_key(runtime_id: i64, job_id: &str) -> String {
    format!("status_updates.{runtime_id}.{job_id}")
}

/// Where status updates go. The supervisor publishes into every configured
/// sink; a sink failing must never fail the run.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn publish(&self, routing_key: &str, update: &StatusUpdate);
}

/// In-process fan-out of status updates, for local observers and tests.
pub struct BroadcastSink {
    sender: broadcast::Sender<StatusUpdate>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusUpdate> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl StatusSink for BroadcastSink {
    async fn publish(&self, _routing_key: &str, update: &StatusUpdate) {
        // no receivers is fine
        let _ = self.sender.send(update.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_key_format() {
        assert_eq!(status_routing_key(1, "j1"), "status_updates.1.j1");
        assert_eq!(status_routing_key(-1, "output_data"), "status_updates.-1.output_data");
    }

    #[tokio::test]
    async fn broadcast_sink_delivers() {
        let sink = BroadcastSink::new(16);
        let mut rx = sink.subscribe();
        let update = StatusUpdate::new("a", "initialised", "initialised");
        sink.publish("status_updates.1.j", &update).await;
        assert_eq!(rx.recv().await.unwrap(), update);
    }

    #[test]
    fn update_json_shape() {
        let update = StatusUpdate::new("probe", "error, exit code 3", "error");
        let value = serde_json::to_value(&update).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"node": "probe", "msg": "error, exit code 3", "style": "error"})
        );
    }
}
