//! The directory: the single writable cross-process state of the core.
//!
//! A flat string→string map with atomic set-if-absent, owned by the
//! supervisor and served to node processes over TCP with the shared frame
//! codec. All supervisor-side access goes through [`DirectoryStore`]
//! directly, so every reservation and cleanup shares one backing store.

use flamecore::directory::{DirRequest, DirResponse};
use flamecore::wire::{read_frame, write_frame};
use flamecore::TransportError;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// Process-wide key/value map holding endpoint addresses, PIDs, parameter
/// resolutions, and port locks.
#[derive(Debug, Default, Clone)]
pub struct DirectoryStore {
    entries: Arc<Mutex<BTreeMap<String, String>>>,
}

impl DirectoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    pub fn set(&self, key: &str, value: &str) {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
    }

    /// Atomic set-if-absent: true when this call created the key.
    pub fn set_if_absent(&self, key: &str, value: &str) -> bool {
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(key) {
            false
        } else {
            entries.insert(key.to_string(), value.to_string());
            true
        }
    }

    pub fn delete(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }

    /// All keys, for cleanup verification.
    pub fn keys(&self) -> Vec<String> {
        self.entries.lock().unwrap().keys().cloned().collect()
    }

    fn apply(&self, request: DirRequest) -> DirResponse {
        match request {
            DirRequest::Get { key } => DirResponse {
                ok: true,
                value: self.get(&key),
            },
            DirRequest::Set { key, value } => {
                self.set(&key, &value);
                DirResponse {
                    ok: true,
                    value: None,
                }
            }
            DirRequest::SetIfAbsent { key, value } => DirResponse {
                ok: self.set_if_absent(&key, &value),
                value: None,
            },
            DirRequest::Delete { key } => {
                self.delete(&key);
                DirResponse {
                    ok: true,
                    value: None,
                }
            }
        }
    }
}

/// TCP front of the directory store for node processes.
pub struct DirectoryServer {
    host: String,
    port: u16,
    shutdown: CancellationToken,
}

impl DirectoryServer {
    pub async fn bind(store: DirectoryStore) -> Result<Self, TransportError> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|source| TransportError::Bind {
                endpoint: "127.0.0.1:0".to_string(),
                source,
            })?;
        let port = listener.local_addr()?.port();
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
                        tokio::spawn(serve_connection(stream, store.clone(), token.clone()));
                    }
                }
            }
        });
        Ok(Self {
            host: "127.0.0.1".to_string(),
            port,
            shutdown,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The `host,port,db` argument handed to nodes via `--entropy-playbook`.
    pub fn playbook_arg(&self) -> String {
        format!("{},{},0", self.host, self.port)
    }
}

impl Drop for DirectoryServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    store: DirectoryStore,
    shutdown: CancellationToken,
) {
    loop {
        let raw = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = read_frame(&mut stream) => match frame {
                Ok(value) => value,
                Err(_) => break,
            },
        };
        let response = match serde_json::from_value::<DirRequest>(raw) {
            Ok(request) => store.apply(request),
            Err(e) => {
                tracing::warn!("Malformed directory request: {e}");
                break;
            }
        };
        if write_frame(&mut stream, &response).await.is_err() {
            break;
        }
    }
}
