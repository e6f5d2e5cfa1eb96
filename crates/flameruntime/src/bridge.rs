//! Debug bridge: relays one subscribed output stream to the topic exchange
//! at a capped rate, so a dashboard can peek at live data.
//!
//! Requests arrive on the consume routing key as
//! `{"event": "sub"|"unsub", "output_name": "#node/out", "rate": seconds}`;
//! samples leave on the publish routing key as
//! `{"output_name": ..., "message": ...}`. Exactly one subscription is
//! active at a time; a new `sub` implicitly ends the previous one.

use crate::directory::DirectoryStore;
use flamecore::events::{BusMessage, IggyBus};
use flamecore::transport::{Endpoint, SubscribeMode, Subscriber};
use flamecore::FlameError;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub fn consume_routing_key(runtime_id: i64) -> String {
    format!("consume_debug_output.{runtime_id}")
}

pub fn publish_routing_key(runtime_id: i64, job_id: &str) -> String {
    format!("publish_debug_output.{runtime_id}.{job_id}")
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct DebugRequest {
    pub event: String,
    #[serde(default)]
    pub output_name: String,
    #[serde(default = "default_rate")]
    pub rate: f64,
}

fn default_rate() -> f64 {
    0.5
}

struct TapWorker {
    token: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

/// The single-subscription sampling worker behind the bridge. Samples are
/// pushed into a channel; the bridge forwards them to the exchange.
pub struct DebugTap {
    directory: DirectoryStore,
    samples: mpsc::UnboundedSender<serde_json::Value>,
    worker: Option<TapWorker>,
}

impl DebugTap {
    pub fn new(
        directory: DirectoryStore,
        samples: mpsc::UnboundedSender<serde_json::Value>,
    ) -> Self {
        Self {
            directory,
            samples,
            worker: None,
        }
    }

    /// Subscribe to one output, ending any previous subscription.
    pub async fn start(&mut self, output_name: &str, rate: f64) -> Result<(), FlameError> {
        self.stop();

        let address = self.directory.get(output_name).ok_or_else(|| {
            FlameError::Bridge(format!("'{output_name}' has no registered endpoint"))
        })?;
        let endpoint: Endpoint = address.parse()?;
        let mut subscriber = Subscriber::connect(&endpoint, SubscribeMode::KeepLast).await?;

        let token = CancellationToken::new();
        let worker_token = token.clone();
        let samples = self.samples.clone();
        let name = output_name.to_string();
        let period = Duration::from_secs_f64(rate.max(0.01));
        let handle = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(period);
            ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = worker_token.cancelled() => break,
                    _ = ticks.tick() => {
                        if let Some(message) = subscriber.try_recv() {
                            let sample = serde_json::json!({
                                "output_name": name,
                                "message": message,
                            });
                            if samples.send(sample).is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        });

        tracing::debug!("Debug tap subscribed to {output_name} at {rate}s");
        self.worker = Some(TapWorker { token, handle });
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.token.cancel();
            worker.handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Dispatch one decoded request.
    pub async fn handle(&mut self, request: DebugRequest) -> Result<(), FlameError> {
        match request.event.as_str() {
            "sub" => self.start(&request.output_name, request.rate).await,
            "unsub" => {
                self.stop();
                Ok(())
            }
            other => {
                tracing::warn!("Unknown debug request event: {other}");
                Ok(())
            }
        }
    }
}

impl Drop for DebugTap {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Exchange-facing loop: polls for requests on the consume key, forwards
/// samples on the publish key.
pub struct DebugBridge {
    shutdown: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

impl DebugBridge {
    pub fn spawn(
        bus: Arc<IggyBus>,
        directory: DirectoryStore,
        runtime_id: i64,
        job_id: &str,
    ) -> Self {
        let consume_key = consume_routing_key(runtime_id);
        let publish_key = publish_routing_key(runtime_id, job_id);
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();

        // a consumer group of one, unique per executor instance
        let consumer_id = format!("flame-debug-bridge-{}", uuid::Uuid::new_v4());

        let handle = tokio::spawn(async move {
            let (samples_tx, mut samples_rx) = mpsc::unbounded_channel();
            let mut tap = DebugTap::new(directory, samples_tx);
            let mut poll = tokio::time::interval(Duration::from_millis(250));
            poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    Some(sample) = samples_rx.recv() => {
                        if let Err(e) = bus.publish(&publish_key, sample).await {
                            tracing::warn!("Debug sample not published: {e}");
                        }
                    }
                    _ = poll.tick() => {
                        let messages = match bus.poll(&consumer_id).await {
                            Ok(messages) => messages,
                            Err(e) => {
                                tracing::warn!("Debug request poll failed: {e}");
                                continue;
                            }
                        };
                        for BusMessage { routing_key, body } in messages {
                            if routing_key != consume_key {
                                continue;
                            }
                            let request: DebugRequest = match serde_json::from_value(body) {
                                Ok(request) => request,
                                Err(e) => {
                                    tracing::warn!("Malformed debug request: {e}");
                                    continue;
                                }
                            };
                            let ack = serde_json::json!(format!(
                                "event: {}; output: {}",
                                request.event, request.output_name
                            ));
                            if let Err(e) = tap.handle(request).await {
                                tracing::warn!("Debug request failed: {e}");
                                continue;
                            }
                            if let Err(e) = bus.publish(&publish_key, ack).await {
                                tracing::warn!("Debug ack not published: {e}");
                            }
                        }
                    }
                }
            }
            tap.stop();
        });

        Self { shutdown, handle }
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.handle.await;
    }
}
