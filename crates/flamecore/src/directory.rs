//! Client side of the directory protocol.
//!
//! The directory is a flat string→string map owned by the supervisor and
//! served over TCP with the shared frame codec; node processes reach it
//! through the coordinates passed in `--entropy-playbook`. One request frame
//! yields one response frame.

use crate::error::DirectoryError;
use crate::wire::{read_frame, write_frame};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// A directory request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DirRequest {
    Get { key: String },
    Set { key: String, value: String },
    SetIfAbsent { key: String, value: String },
    Delete { key: String },
}

/// Response to a directory request. `ok` carries the set-if-absent outcome;
/// `value` is the stored value for `get`, absent when the key is missing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DirResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// TCP client for the directory server.
pub struct DirectoryClient {
    endpoint: String,
    stream: Mutex<TcpStream>,
}

impl DirectoryClient {
    pub async fn connect(host: &str, port: u16) -> Result<Self, DirectoryError> {
        let endpoint = format!("{host}:{port}");
        let stream = TcpStream::connect(&endpoint)
            .await
            .map_err(|source| DirectoryError::Connect {
                endpoint: endpoint.clone(),
                source,
            })?;
        Ok(Self {
            endpoint,
            stream: Mutex::new(stream),
        })
    }

    async fn call(&self, request: DirRequest) -> Result<DirResponse, DirectoryError> {
        let mut stream = self.stream.lock().await;
        write_frame(&mut *stream, &request).await?;
        let raw = read_frame(&mut *stream).await?;
        serde_json::from_value(raw).map_err(|e| {
            DirectoryError::Protocol(format!("bad response from {}: {e}", self.endpoint))
        })
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, DirectoryError> {
        let response = self
            .call(DirRequest::Get {
                key: key.to_string(),
            })
            .await?;
        Ok(response.value)
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), DirectoryError> {
        self.call(DirRequest::Set {
            key: key.to_string(),
            value: value.to_string(),
        })
        .await?;
        Ok(())
    }

    /// Atomic set-if-absent. True when this call created the key.
    pub async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool, DirectoryError> {
        let response = self
            .call(DirRequest::SetIfAbsent {
                key: key.to_string(),
                value: value.to_string(),
            })
            .await?;
        Ok(response.ok)
    }

    pub async fn delete(&self, key: &str) -> Result<(), DirectoryError> {
        self.call(DirRequest::Delete {
            key: key.to_string(),
        })
        .await?;
        Ok(())
    }
}
