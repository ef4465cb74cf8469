use thiserror::Error;

use crate::protocol::{WireError, WireErrorKind};

#[derive(Error, Debug)]
pub enum PoolError {
    /// Rejected before any process is spawned.
    #[error("invalid node configuration: {0}")]
    Configuration(String),

    /// Spawn or handshake failure; the message carries the attempted command
    /// line and whatever the node emitted before dying.
    #[error("{0}")]
    Launch(String),

    /// The node process exited before the handshake completed.
    #[error("node process stopped (exit code = {code}){detail}")]
    ProcessExit { code: i32, detail: String },

    #[error("{0}")]
    Timeout(String),

    /// Illegal rebind attempt, or a call from a session that is not bound.
    #[error("{0}")]
    State(String),

    #[error("control channel failure: {0}")]
    RemoteComm(String),

    /// Post-unbind cleanup failed. The binding has been cleared regardless.
    #[error("error while resetting the node workspace: {0}")]
    Reset(String),

    #[error("engine error: {0}")]
    Engine(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wire format error: {0}")]
    Codec(#[from] postcard::Error),
}

pub type Result<T> = std::result::Result<T, PoolError>;

impl From<WireError> for PoolError {
    fn from(err: WireError) -> Self {
        match err.kind {
            WireErrorKind::State => PoolError::State(err.message),
            WireErrorKind::Reset => PoolError::Reset(err.message),
            WireErrorKind::Engine => PoolError::Engine(err.message),
            WireErrorKind::Internal => PoolError::RemoteComm(err.message),
        }
    }
}

impl From<&PoolError> for WireError {
    fn from(err: &PoolError) -> Self {
        let kind = match err {
            PoolError::State(_) => WireErrorKind::State,
            PoolError::Reset(_) => WireErrorKind::Reset,
            PoolError::Engine(_) => WireErrorKind::Engine,
            _ => WireErrorKind::Internal,
        };
        WireError {
            kind,
            message: err.to_string(),
        }
    }
}
