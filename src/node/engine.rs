//! Abstract interface to the computation engine hosted by a node.
//!
//! The engine has a single logical execution thread: every
//! [`Engine::run_main_loop`] turn happens while the caller holds the
//! per-node lock, switched between the dummy console, an external console,
//! or the bound client session. The engine's command semantics are not
//! defined here; [`ScratchEngine`] is the minimal built-in used by the node
//! host binary and the tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

use crate::protocol::PlatformInfo;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine stopped")]
    Stopped,
    #[error("{0}")]
    Eval(String),
    #[error("{0}")]
    Internal(String),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    Disconnected,
    Lost,
    Stopped,
}

/// One turn of the engine main loop, as seen by whoever is draining it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Output { text: String, error: bool },
    Prompt { text: String },
    Value { text: String },
    Status(EngineStatus),
    Idle,
}

#[async_trait]
pub trait Engine: Send + Sync + 'static {
    /// Attach `client` as the console consumer of the main loop.
    async fn connect(&self, client: &str) -> EngineResult<()>;

    /// Detach whatever console consumer is currently attached.
    async fn disconnect(&self) -> EngineResult<()>;

    /// Run one main-loop turn. `input` carries a command to evaluate, or
    /// `None` to just drain the next pending event.
    async fn run_main_loop(&self, client: &str, input: Option<String>) -> EngineResult<EngineEvent>;

    /// Evaluate `command` outside the main loop ordering guarantees.
    async fn run_async(&self, client: &str, command: String) -> EngineResult<String>;

    /// Restore the canonical workspace: drop user-visible bindings, reclaim
    /// memory, return to the node working directory.
    async fn reset(&self) -> EngineResult<()>;

    async fn platform(&self) -> EngineResult<PlatformInfo>;
}

/// Minimal variable-store engine.
///
/// Commands are either assignments (`name<-value`), a bare token (looked up
/// in the store, echoed back if absent), or a syntax error. Enough surface
/// to exercise binding, reset, and startup-script behavior end to end.
#[derive(Debug, Default)]
pub struct ScratchEngine {
    state: Mutex<ScratchState>,
}

#[derive(Debug, Default)]
struct ScratchState {
    vars: HashMap<String, String>,
    console: Option<String>,
    stopped: bool,
}

impl ScratchEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the engine stopped; subsequent main-loop turns report
    /// [`EngineStatus::Stopped`].
    pub fn stop(&self) {
        self.state.lock().expect("engine mutex poisoned").stopped = true;
    }

    fn eval(&self, command: &str) -> EngineResult<String> {
        let command = command.trim();
        let mut state = self.state.lock().expect("engine mutex poisoned");
        if state.stopped {
            return Err(EngineError::Stopped);
        }
        if let Some((name, value)) = command.split_once("<-") {
            let name = name.trim();
            if !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
            {
                let value = value.trim().to_string();
                state.vars.insert(name.to_string(), value.clone());
                return Ok(value);
            }
            return Err(EngineError::Eval(format!("invalid assignment target in {command:?}")));
        }
        if !command.contains(char::is_whitespace) {
            return Ok(state
                .vars
                .get(command)
                .cloned()
                .unwrap_or_else(|| command.to_string()));
        }
        Err(EngineError::Eval(format!("syntax error near {command:?}")))
    }
}

#[async_trait]
impl Engine for ScratchEngine {
    async fn connect(&self, client: &str) -> EngineResult<()> {
        let mut state = self.state.lock().expect("engine mutex poisoned");
        if state.stopped {
            return Err(EngineError::Stopped);
        }
        state.console = Some(client.to_string());
        Ok(())
    }

    async fn disconnect(&self) -> EngineResult<()> {
        self.state.lock().expect("engine mutex poisoned").console = None;
        Ok(())
    }

    async fn run_main_loop(&self, client: &str, input: Option<String>) -> EngineResult<EngineEvent> {
        match input {
            Some(command) => self.eval(&command).map(|text| EngineEvent::Value { text }),
            None => {
                let state = self.state.lock().expect("engine mutex poisoned");
                if state.stopped {
                    return Ok(EngineEvent::Status(EngineStatus::Stopped));
                }
                if state.console.as_deref() != Some(client) {
                    return Ok(EngineEvent::Status(EngineStatus::Disconnected));
                }
                Ok(EngineEvent::Idle)
            }
        }
    }

    async fn run_async(&self, _client: &str, command: String) -> EngineResult<String> {
        self.eval(&command)
    }

    async fn reset(&self) -> EngineResult<()> {
        let mut state = self.state.lock().expect("engine mutex poisoned");
        if state.stopped {
            return Err(EngineError::Stopped);
        }
        state.vars.clear();
        Ok(())
    }

    async fn platform(&self) -> EngineResult<PlatformInfo> {
        Ok(PlatformInfo {
            os_type: std::env::consts::OS.to_string(),
            file_sep: std::path::MAIN_SEPARATOR.to_string(),
            path_sep: if cfg!(windows) { ";" } else { ":" }.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }
}
