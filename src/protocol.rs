//! Wire protocol for the node control channel.
//!
//! Requests and responses are postcard-encoded and framed with a u32 (LE)
//! length prefix. One connection carries any number of request/response
//! pairs; responses are written in request order.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::error::Result;

pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound on a single frame. Control traffic is small; anything larger
/// indicates a corrupt or hostile peer.
const MAX_FRAME_BYTES: u32 = 1024 * 1024;

/// OS and version descriptor of the engine hosted by a node, captured once
/// at process start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformInfo {
    pub os_type: String,
    pub file_sep: String,
    pub path_sep: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlRequest {
    Platform,
    SetConsole { auth: Option<String> },
    Ping,
    PoolHost,
    BindClient { client_id: String },
    UnbindClient,
    RunSnippet { code: String },
    Shutdown,
    RunMainLoop { session: Uuid, command: String },
    RunAsync { session: Uuid, command: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlResponse {
    Platform(PlatformInfo),
    Console { enabled: bool },
    Pong,
    PoolHost { host: String },
    Session { token: Uuid },
    Done,
    Eval { output: String },
    Err(WireError),
}

/// Error kinds that must survive the trip back to the caller with their
/// meaning intact. Everything else collapses to `Internal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireErrorKind {
    State,
    Reset,
    Engine,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct WireError {
    pub kind: WireErrorKind,
    pub message: String,
}

pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = postcard::to_stdvec(msg)?;
    if payload.len() > MAX_FRAME_BYTES as usize {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "frame too large").into());
    }
    writer.write_all(&(payload.len() as u32).to_le_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes);
    if len > MAX_FRAME_BYTES {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "frame too large").into());
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(postcard::from_bytes(&payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let req = ControlRequest::BindClient {
            client_id: "c1".to_string(),
        };
        write_frame(&mut a, &req).await.unwrap();
        let decoded: ControlRequest = read_frame(&mut b).await.unwrap();
        assert!(matches!(decoded, ControlRequest::BindClient { client_id } if client_id == "c1"));
    }

    #[tokio::test]
    async fn response_round_trip_with_error() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let resp = ControlResponse::Err(WireError {
            kind: WireErrorKind::State,
            message: "not bound".to_string(),
        });
        write_frame(&mut a, &resp).await.unwrap();
        let decoded: ControlResponse = read_frame(&mut b).await.unwrap();
        match decoded {
            ControlResponse::Err(err) => {
                assert_eq!(err.kind, WireErrorKind::State);
                assert_eq!(err.message, "not bound");
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let _ = a.write_all(&(MAX_FRAME_BYTES + 1).to_le_bytes()).await;
        });
        let result: Result<ControlRequest> = read_frame(&mut b).await;
        assert!(result.is_err());
    }
}
