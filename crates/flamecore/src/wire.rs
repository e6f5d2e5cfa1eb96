//! Wire encoding shared by output endpoints, the control bus, and the
//! directory protocol.
//!
//! A frame is a 4-byte big-endian length followed by a self-describing JSON
//! payload (scalars, strings, sequences, maps; byte strings travel base64
//! encoded). One codec everywhere keeps the node contract small.

use crate::error::TransportError;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame. Anything larger is a protocol violation.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Encode one value as a length-prefixed frame, ready to be written out.
pub fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>, TransportError> {
    let payload = serde_json::to_vec(value).map_err(|e| TransportError::Codec(e.to_string()))?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(payload.len()));
    }
    let mut frame = Vec::with_capacity(payload.len() + 4);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Write one value as a length-prefixed frame.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode_frame(value)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame. Returns `Closed` on clean EOF at a frame
/// boundary.
pub async fn read_frame<R>(reader: &mut R) -> Result<serde_json::Value, TransportError>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(TransportError::Closed)
        }
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    serde_json::from_slice(&payload).map_err(|e| TransportError::Codec(e.to_string()))
}

/// The empty ping exchanged during the connect phase of the barrier.
pub fn ping() -> serde_json::Value {
    serde_json::Value::String(String::new())
}

pub fn is_ping(value: &serde_json::Value) -> bool {
    matches!(value, serde_json::Value::String(s) if s.is_empty())
}

/// Commands the supervisor broadcasts on `executor_output`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum ControlCommand {
    WaitFlush,
    Flush,
    Start,
}

impl ControlCommand {
    /// Decode a control-bus frame into a command, ignoring pings and other
    /// traffic.
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

/// Status frame a node sends on `executor_input`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusFrame {
    /// The reporting node's name.
    pub eui: String,
    pub status: String,
}

impl StatusFrame {
    pub fn new(eui: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            eui: eui.into(),
            status: status.into(),
        }
    }

    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}
