//! Publish/subscribe message sockets.
//!
//! One publisher binds per output endpoint; any number of subscribers
//! connect. Publishing has no flow control: frames sent while no subscriber
//! is connected are dropped, which is exactly why the startup barrier
//! exists. The control bus reuses the same framing with a many-to-one
//! `Collector` on the supervisor side and an `Emitter` per node.

use crate::error::TransportError;
use crate::wire::{encode_frame, read_frame};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio_util::sync::CancellationToken;

/// A transport endpoint: `tcp://<host>:<port>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn local(port: u16) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port,
        }
    }

    /// `host:port` form used for socket addresses.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp://{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix("tcp://")
            .ok_or_else(|| TransportError::Codec(format!("not a tcp endpoint: {s}")))?;
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| TransportError::Codec(format!("endpoint without port: {s}")))?;
        let port = port
            .parse()
            .map_err(|_| TransportError::Codec(format!("invalid port in endpoint: {s}")))?;
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

const PUBLISH_BUFFER: usize = 1024;

/// Publishing side of one output endpoint. Binds, fans frames out to every
/// connected subscriber, drops frames when nobody listens.
pub struct Publisher {
    endpoint: Endpoint,
    frames: broadcast::Sender<Arc<Vec<u8>>>,
    shutdown: CancellationToken,
}

impl Publisher {
    pub async fn bind(endpoint: &Endpoint) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(endpoint.authority())
            .await
            .map_err(|source| TransportError::Bind {
                endpoint: endpoint.to_string(),
                source,
            })?;
        let bound_port = listener
            .local_addr()
            .map(|a| a.port())
            .unwrap_or(endpoint.port);
        let endpoint = Endpoint {
            host: endpoint.host.clone(),
            port: bound_port,
        };
        let (frames, _) = broadcast::channel(PUBLISH_BUFFER);
        let shutdown = CancellationToken::new();

        let accept_frames = frames.clone();
        let accept_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_shutdown.cancelled() => break,
                    accepted = listener.accept() => {
                        let (stream, _) = match accepted {
                            Ok(pair) => pair,
                            Err(_) => break,
                        };
                        let rx = accept_frames.subscribe();
                        tokio::spawn(forward_frames(stream, rx, accept_shutdown.clone()));
                    }
                }
            }
        });

        Ok(Self {
            endpoint,
            frames,
            shutdown,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Send one message to every currently connected subscriber.
    pub fn send(&self, value: &serde_json::Value) -> Result<(), TransportError> {
        let frame = Arc::new(encode_frame(value)?);
        // no subscribers is not an error
        let _ = self.frames.send(frame);
        Ok(())
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn forward_frames(
    mut stream: TcpStream,
    mut rx: broadcast::Receiver<Arc<Vec<u8>>>,
    shutdown: CancellationToken,
) {
    use tokio::io::AsyncWriteExt;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = rx.recv() => match frame {
                Ok(frame) => {
                    if stream.write_all(&frame).await.is_err() {
                        break;
                    }
                }
                // a slow subscriber loses messages rather than stalling the
                // publisher
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

/// Delivery mode selected by the subscriber on connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeMode {
    /// Only the most recent message is retained (state inputs).
    KeepLast,
    /// Every message is queued (stream inputs).
    Queue,
}

#[derive(Default)]
struct Slot {
    current: Option<serde_json::Value>,
    fresh: bool,
    closed: bool,
}

enum SubscriberInner {
    Queue(mpsc::UnboundedReceiver<serde_json::Value>),
    KeepLast {
        slot: Arc<Mutex<Slot>>,
        notify: Arc<Notify>,
    },
}

/// Subscribing side of an endpoint.
pub struct Subscriber {
    inner: SubscriberInner,
    shutdown: CancellationToken,
}

impl Subscriber {
    pub async fn connect(endpoint: &Endpoint, mode: SubscribeMode) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(endpoint.authority())
            .await
            .map_err(|source| TransportError::Connect {
                endpoint: endpoint.to_string(),
                source,
            })?;
        let shutdown = CancellationToken::new();

        let inner = match mode {
            SubscribeMode::Queue => {
                let (tx, rx) = mpsc::unbounded_channel();
                let token = shutdown.clone();
                tokio::spawn(async move {
                    let mut stream = stream;
                    loop {
                        tokio::select! {
                            _ = token.cancelled() => break,
                            frame = read_frame(&mut stream) => match frame {
                                Ok(value) => {
                                    if tx.send(value).is_err() {
                                        break;
                                    }
                                }
                                Err(_) => break,
                            },
                        }
                    }
                });
                SubscriberInner::Queue(rx)
            }
            SubscribeMode::KeepLast => {
                let slot = Arc::new(Mutex::new(Slot::default()));
                let notify = Arc::new(Notify::new());
                let task_slot = slot.clone();
                let task_notify = notify.clone();
                let token = shutdown.clone();
                tokio::spawn(async move {
                    let mut stream = stream;
                    loop {
                        tokio::select! {
                            _ = token.cancelled() => break,
                            frame = read_frame(&mut stream) => match frame {
                                Ok(value) => {
                                    let mut guard = task_slot.lock().unwrap();
                                    guard.current = Some(value);
                                    guard.fresh = true;
                                    drop(guard);
                                    task_notify.notify_waiters();
                                }
                                Err(_) => {
                                    task_slot.lock().unwrap().closed = true;
                                    task_notify.notify_waiters();
                                    break;
                                }
                            },
                        }
                    }
                });
                SubscriberInner::KeepLast { slot, notify }
            }
        };

        Ok(Self { inner, shutdown })
    }

    /// Consume the next message, waiting for one to arrive. `None` once the
    /// publisher is gone and nothing is buffered.
    pub async fn recv(&mut self) -> Option<serde_json::Value> {
        match &mut self.inner {
            SubscriberInner::Queue(rx) => rx.recv().await,
            SubscriberInner::KeepLast { slot, notify } => loop {
                let notified = notify.notified();
                {
                    let mut guard = slot.lock().unwrap();
                    if guard.fresh {
                        guard.fresh = false;
                        return guard.current.clone();
                    }
                    if guard.closed {
                        return None;
                    }
                }
                notified.await;
            },
        }
    }

    /// Non-blocking receive: the next queued message, or the unread latest
    /// for keep-last subscriptions.
    pub fn try_recv(&mut self) -> Option<serde_json::Value> {
        match &mut self.inner {
            SubscriberInner::Queue(rx) => rx.try_recv().ok(),
            SubscriberInner::KeepLast { slot, .. } => {
                let mut guard = slot.lock().unwrap();
                if guard.fresh {
                    guard.fresh = false;
                    guard.current.clone()
                } else {
                    None
                }
            }
        }
    }

    /// The most recent value, waiting only if none has ever arrived. For
    /// queue subscriptions this is the same as `recv`.
    pub async fn latest(&mut self) -> Option<serde_json::Value> {
        if let SubscriberInner::KeepLast { slot, notify } = &mut self.inner {
            loop {
                let notified = notify.notified();
                {
                    let guard = slot.lock().unwrap();
                    if let Some(value) = &guard.current {
                        return Some(value.clone());
                    }
                    if guard.closed {
                        return None;
                    }
                }
                notified.await;
            }
        } else {
            self.recv().await
        }
    }

    /// Drop everything buffered (the flush phase of the barrier).
    pub fn clear(&mut self) {
        match &mut self.inner {
            SubscriberInner::Queue(rx) => while rx.try_recv().is_ok() {},
            SubscriberInner::KeepLast { slot, .. } => {
                let mut guard = slot.lock().unwrap();
                guard.current = None;
                guard.fresh = false;
            }
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Many-to-one receiving end of the control bus (`executor_input`): binds an
/// endpoint and merges frames from every connected emitter.
pub struct Collector {
    endpoint: Endpoint,
    rx: mpsc::UnboundedReceiver<serde_json::Value>,
    shutdown: CancellationToken,
}

impl Collector {
    pub async fn bind(endpoint: &Endpoint) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(endpoint.authority())
            .await
            .map_err(|source| TransportError::Bind {
                endpoint: endpoint.to_string(),
                source,
            })?;
        let bound_port = listener
            .local_addr()
            .map(|a| a.port())
            .unwrap_or(endpoint.port);
        let endpoint = Endpoint {
            host: endpoint.host.clone(),
            port: bound_port,
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = listener.accept() => {
                        let (stream, _) = match accepted {
                            Ok(pair) => pair,
                            Err(_) => break,
                        };
                        let tx = tx.clone();
                        let conn_token = token.clone();
                        tokio::spawn(async move {
                            let mut stream = stream;
                            loop {
                                tokio::select! {
                                    _ = conn_token.cancelled() => break,
                                    frame = read_frame(&mut stream) => match frame {
                                        Ok(value) => {
                                            if tx.send(value).is_err() {
                                                break;
                                            }
                                        }
                                        Err(_) => break,
                                    },
                                }
                            }
                        });
                    }
                }
            }
        });

        Ok(Self {
            endpoint,
            rx,
            shutdown,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Receive with a bounded wait, so control loops can keep checking
    /// their exit conditions.
    pub async fn recv_timeout(&mut self, wait: Duration) -> Option<serde_json::Value> {
        tokio::time::timeout(wait, self.rx.recv()).await.ok()?
    }

    pub fn try_recv(&mut self) -> Option<serde_json::Value> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Node-side sending end of the control bus: connects to `executor_input`.
pub struct Emitter {
    stream: TcpStream,
}

impl Emitter {
    pub async fn connect(endpoint: &Endpoint) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(endpoint.authority())
            .await
            .map_err(|source| TransportError::Connect {
                endpoint: endpoint.to_string(),
                source,
            })?;
        Ok(Self { stream })
    }

    pub async fn send<T: serde::Serialize>(&mut self, value: &T) -> Result<(), TransportError> {
        crate::wire::write_frame(&mut self.stream, value).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[test]
    fn endpoint_round_trip() {
        let ep: Endpoint = "tcp://127.0.0.1:9001".parse().unwrap();
        assert_eq!(ep, Endpoint::local(9001));
        assert_eq!(ep.to_string(), "tcp://127.0.0.1:9001");
        assert_eq!(ep.authority(), "127.0.0.1:9001");
        assert!("127.0.0.1:9001".parse::<Endpoint>().is_err());
        assert!("tcp://127.0.0.1:x".parse::<Endpoint>().is_err());
    }

    #[tokio::test]
    async fn stream_subscription_preserves_order() {
        let publisher = Publisher::bind(&Endpoint::local(0)).await.unwrap();
        let mut sub = Subscriber::connect(publisher.endpoint(), SubscribeMode::Queue)
            .await
            .unwrap();
        settle().await;

        for i in 0..5 {
            publisher.send(&json!(i)).unwrap();
        }
        for i in 0..5 {
            assert_eq!(sub.recv().await, Some(json!(i)));
        }
        assert_eq!(sub.try_recv(), None);
    }

    #[tokio::test]
    async fn keep_last_subscription_conflates() {
        let publisher = Publisher::bind(&Endpoint::local(0)).await.unwrap();
        let mut sub = Subscriber::connect(publisher.endpoint(), SubscribeMode::KeepLast)
            .await
            .unwrap();
        settle().await;

        for i in 0..5 {
            publisher.send(&json!(i)).unwrap();
        }
        settle().await;

        // only the most recent message is visible
        assert_eq!(sub.try_recv(), Some(json!(4)));
        // already consumed
        assert_eq!(sub.try_recv(), None);
        // but latest still answers without blocking
        assert_eq!(sub.latest().await, Some(json!(4)));
    }

    #[tokio::test]
    async fn clear_discards_buffered_messages() {
        let publisher = Publisher::bind(&Endpoint::local(0)).await.unwrap();
        let mut state = Subscriber::connect(publisher.endpoint(), SubscribeMode::KeepLast)
            .await
            .unwrap();
        let mut stream = Subscriber::connect(publisher.endpoint(), SubscribeMode::Queue)
            .await
            .unwrap();
        settle().await;

        publisher.send(&crate::wire::ping()).unwrap();
        settle().await;

        state.clear();
        stream.clear();
        assert_eq!(state.try_recv(), None);
        assert_eq!(stream.try_recv(), None);

        publisher.send(&json!("fresh")).unwrap();
        assert_eq!(state.latest().await, Some(json!("fresh")));
        assert_eq!(stream.recv().await, Some(json!("fresh")));
    }

    #[tokio::test]
    async fn messages_before_subscribe_are_dropped() {
        let publisher = Publisher::bind(&Endpoint::local(0)).await.unwrap();
        publisher.send(&json!("lost")).unwrap();

        let mut sub = Subscriber::connect(publisher.endpoint(), SubscribeMode::Queue)
            .await
            .unwrap();
        settle().await;
        publisher.send(&json!("seen")).unwrap();
        assert_eq!(sub.recv().await, Some(json!("seen")));
    }

    #[tokio::test]
    async fn collector_merges_emitters() {
        let mut collector = Collector::bind(&Endpoint::local(0)).await.unwrap();
        let mut a = Emitter::connect(collector.endpoint()).await.unwrap();
        let mut b = Emitter::connect(collector.endpoint()).await.unwrap();

        a.send(&json!({"eui": "a", "status": "connected"}))
            .await
            .unwrap();
        b.send(&json!({"eui": "b", "status": "connected"}))
            .await
            .unwrap();

        let mut seen = Vec::new();
        for _ in 0..2 {
            let frame = collector
                .recv_timeout(Duration::from_secs(1))
                .await
                .expect("frame");
            seen.push(frame["eui"].as_str().unwrap().to_string());
        }
        seen.sort();
        assert_eq!(seen, vec!["a", "b"]);
        assert!(collector.try_recv().is_none());
    }
}
