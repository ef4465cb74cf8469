//! Client stubs for the node control channel.
//!
//! [`RemoteNode`] is the control handle the launcher and pool hold for a
//! live node; [`RemoteSession`] is the endpoint returned by a successful
//! bind. Calls share one connection and pair each request with its
//! response, so concurrent callers serialize on the stream.

use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{PoolError, Result};
use crate::protocol::{read_frame, write_frame, ControlRequest, ControlResponse, PlatformInfo};

#[derive(Debug, Clone)]
pub struct RemoteNode {
    address: String,
    stream: Arc<Mutex<TcpStream>>,
}

impl RemoteNode {
    pub async fn connect(address: &str) -> Result<Self> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| PoolError::RemoteComm(format!("connect to {address}: {e}")))?;
        Ok(Self {
            address: address.to_string(),
            stream: Arc::new(Mutex::new(stream)),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn call(&self, request: ControlRequest) -> Result<ControlResponse> {
        let mut stream = self.stream.lock().await;
        write_frame(&mut *stream, &request)
            .await
            .map_err(comm_error)?;
        let response: ControlResponse = read_frame(&mut *stream).await.map_err(comm_error)?;
        match response {
            ControlResponse::Err(err) => Err(err.into()),
            other => Ok(other),
        }
    }

    pub async fn platform(&self) -> Result<PlatformInfo> {
        match self.call(ControlRequest::Platform).await? {
            ControlResponse::Platform(info) => Ok(info),
            other => Err(unexpected(other)),
        }
    }

    pub async fn ping(&self) -> Result<()> {
        match self.call(ControlRequest::Ping).await? {
            ControlResponse::Pong => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn pool_host(&self) -> Result<String> {
        match self.call(ControlRequest::PoolHost).await? {
            ControlResponse::PoolHost { host } => Ok(host),
            other => Err(unexpected(other)),
        }
    }

    /// Switch the node's console mode; returns whether console mode is now
    /// enabled.
    pub async fn set_console(&self, auth: Option<String>) -> Result<bool> {
        match self.call(ControlRequest::SetConsole { auth }).await? {
            ControlResponse::Console { enabled } => Ok(enabled),
            other => Err(unexpected(other)),
        }
    }

    pub async fn bind_client(&self, client_id: &str) -> Result<RemoteSession> {
        let request = ControlRequest::BindClient {
            client_id: client_id.to_string(),
        };
        match self.call(request).await? {
            ControlResponse::Session { token } => Ok(RemoteSession {
                node: self.clone(),
                token,
            }),
            other => Err(unexpected(other)),
        }
    }

    pub async fn unbind_client(&self) -> Result<()> {
        match self.call(ControlRequest::UnbindClient).await? {
            ControlResponse::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn run_snippet(&self, code: &str) -> Result<String> {
        let request = ControlRequest::RunSnippet {
            code: code.to_string(),
        };
        match self.call(request).await? {
            ControlResponse::Eval { output } => Ok(output),
            other => Err(unexpected(other)),
        }
    }

    pub async fn shutdown(&self) -> Result<()> {
        match self.call(ControlRequest::Shutdown).await? {
            ControlResponse::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

/// Remote counterpart of a bound session. Carries the session token of the
/// bind that created it; after an unbind/rebind the token is stale and every
/// call fails with a state error.
#[derive(Debug, Clone)]
pub struct RemoteSession {
    node: RemoteNode,
    token: Uuid,
}

impl RemoteSession {
    pub fn token(&self) -> Uuid {
        self.token
    }

    pub async fn run_main_loop(&self, command: impl Into<String>) -> Result<String> {
        let request = ControlRequest::RunMainLoop {
            session: self.token,
            command: command.into(),
        };
        match self.node.call(request).await? {
            ControlResponse::Eval { output } => Ok(output),
            other => Err(unexpected(other)),
        }
    }

    pub async fn run_async(&self, command: impl Into<String>) -> Result<String> {
        let request = ControlRequest::RunAsync {
            session: self.token,
            command: command.into(),
        };
        match self.node.call(request).await? {
            ControlResponse::Eval { output } => Ok(output),
            other => Err(unexpected(other)),
        }
    }
}

fn comm_error(e: PoolError) -> PoolError {
    match e {
        PoolError::Io(io) => PoolError::RemoteComm(io.to_string()),
        PoolError::Codec(c) => PoolError::RemoteComm(c.to_string()),
        other => other,
    }
}

fn unexpected(response: ControlResponse) -> PoolError {
    PoolError::RemoteComm(format!("unexpected response: {response:?}"))
}
