//! Per-node control object and session/console state machine.
//!
//! One `NodeController` lives inside each worker process. All engine
//! main-loop access and every state transition (console mode, client
//! binding) serializes through the single per-node lock, so the engine never
//! executes two main-loop turns concurrently.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{PoolError, Result};
use crate::node::console;
use crate::node::engine::{Engine, EngineEvent};
use crate::node::session::SessionBackend;
use crate::node::NODE_LOG_FILE;
use crate::protocol::PlatformInfo;

/// Client name the dummy console attaches to the engine as.
pub(crate) const DUMMY_CLIENT: &str = "dummy";
/// Client name used for launcher-issued setup snippets.
const SETUP_CLIENT: &str = "init";

/// Delay before a requested shutdown takes effect, so the triggering remote
/// call can return first.
const SHUTDOWN_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub(crate) struct NodeState {
    pub(crate) console_enabled: bool,
    console_auth: Option<String>,
    bound_client: Option<String>,
    bound_session: Option<Uuid>,
    /// Bumped on every console mode change; a dummy console loop retires
    /// itself as soon as it observes a generation other than its own.
    pub(crate) generation: u64,
}

pub(crate) struct Inner {
    engine: Arc<dyn Engine>,
    workdir: PathBuf,
    platform: PlatformInfo,
    state: Mutex<NodeState>,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct NodeController {
    inner: Arc<Inner>,
}

impl NodeController {
    /// Prepare the engine workspace, capture platform info, and start the
    /// initial dummy console loop.
    pub async fn start(engine: Arc<dyn Engine>, workdir: PathBuf) -> Result<Self> {
        engine
            .reset()
            .await
            .map_err(|e| PoolError::Launch(format!("error preparing the initial workspace: {e}")))?;
        let platform = engine
            .platform()
            .await
            .map_err(|e| PoolError::Launch(format!("error querying the engine platform: {e}")))?;

        let controller = Self {
            inner: Arc::new(Inner {
                engine,
                workdir,
                platform,
                state: Mutex::new(NodeState {
                    console_enabled: false,
                    console_auth: None,
                    bound_client: None,
                    bound_session: None,
                    generation: 0,
                }),
                shutdown: CancellationToken::new(),
            }),
        };
        console::spawn(controller.clone(), 0);
        Ok(controller)
    }

    pub fn platform(&self) -> PlatformInfo {
        self.inner.platform.clone()
    }

    pub fn ping(&self) -> Result<()> {
        Ok(())
    }

    /// Host of the peer driving this node, or `"<internal>"` for in-process
    /// callers.
    pub fn pool_host(&self, peer: Option<std::net::SocketAddr>) -> String {
        peer.map(|p| p.ip().to_string())
            .unwrap_or_else(|| "<internal>".to_string())
    }

    /// Cancelled once a scheduled shutdown has run; the host process exits
    /// when it fires.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub(crate) fn engine(&self) -> Arc<dyn Engine> {
        self.inner.engine.clone()
    }

    pub(crate) async fn state_lock(&self) -> MutexGuard<'_, NodeState> {
        self.inner.state.lock().await
    }

    /// Switch who drives the engine main loop.
    ///
    /// Disconnects the current console consumer, then either enables the
    /// external authenticated console (`auth` present) or re-enters pooled
    /// mode with a fresh dummy console loop. Returns whether console mode is
    /// now enabled.
    pub async fn set_console(&self, auth: Option<String>) -> Result<bool> {
        let mut state = self.inner.state.lock().await;
        self.inner
            .engine
            .disconnect()
            .await
            .map_err(|e| PoolError::Engine(e.to_string()))?;
        state.generation += 1;
        let enabled = match auth {
            Some(token) => {
                state.console_auth = Some(token);
                state.console_enabled = true;
                true
            }
            None => {
                state.console_auth = None;
                state.console_enabled = false;
                console::spawn(self.clone(), state.generation);
                false
            }
        };
        tracing::debug!(enabled, "console mode changed");
        Ok(enabled)
    }

    /// Auth token an external console consumer must present, when console
    /// mode is enabled.
    pub async fn console_auth(&self) -> Option<String> {
        self.inner.state.lock().await.console_auth.clone()
    }

    /// Bind `client_id` as the node's single client session.
    pub async fn bind_client(&self, client_id: &str) -> Result<SessionBackend> {
        let mut state = self.inner.state.lock().await;
        if state.bound_session.is_some() {
            return Err(PoolError::State(format!(
                "a client session is already bound (client {:?})",
                state.bound_client.as_deref().unwrap_or("?")
            )));
        }
        let token = Uuid::new_v4();
        state.bound_client = Some(client_id.to_string());
        state.bound_session = Some(token);
        tracing::debug!(client = client_id, session = %token, "client session bound");
        Ok(SessionBackend::new(self.clone(), client_id.to_string(), token))
    }

    /// Release the current client session, if any, and reset the engine
    /// workspace for the next consumer.
    ///
    /// The binding is cleared before the reset runs; a reset failure is
    /// reported but the node accepts a new `bind_client` regardless.
    pub async fn unbind_client(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if state.bound_session.is_none() {
            return Ok(());
        }
        let client = state.bound_client.take();
        state.bound_session = None;
        tracing::debug!(client = ?client, "client session unbound, resetting workspace");

        self.inner
            .engine
            .reset()
            .await
            .map_err(|e| PoolError::Reset(e.to_string()))?;
        let log = self.inner.workdir.join(NODE_LOG_FILE);
        match std::fs::remove_file(&log) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(PoolError::Reset(format!(
                    "could not remove {}: {e}",
                    log.display()
                )))
            }
        }
        Ok(())
    }

    /// Run one setup snippet against the engine. Only available while no
    /// client session is bound.
    pub async fn run_snippet(&self, code: &str) -> Result<String> {
        let state = self.inner.state.lock().await;
        if state.bound_session.is_some() {
            return Err(PoolError::State(
                "cannot run setup snippets while a client session is bound".to_string(),
            ));
        }
        let event = self
            .inner
            .engine
            .run_main_loop(SETUP_CLIENT, Some(code.to_string()))
            .await
            .map_err(|e| PoolError::Engine(e.to_string()))?;
        drop(state);
        render_event(event)
    }

    /// Forward a session command into the engine. The caller's token must
    /// match the currently bound session; a stale token from before a rebind
    /// is rejected even though it was once valid.
    pub(crate) async fn run_for_session(
        &self,
        token: Uuid,
        command: String,
        asynchronous: bool,
    ) -> Result<String> {
        let state = self.inner.state.lock().await;
        match state.bound_session {
            Some(current) if current == token => {}
            _ => {
                return Err(PoolError::State(
                    "session is not bound to this node".to_string(),
                ))
            }
        }
        let client = state.bound_client.clone().unwrap_or_default();
        if asynchronous {
            let output = self
                .inner
                .engine
                .run_async(&client, command)
                .await
                .map_err(|e| PoolError::Engine(e.to_string()))?;
            Ok(output)
        } else {
            let event = self
                .inner
                .engine
                .run_main_loop(&client, Some(command))
                .await
                .map_err(|e| PoolError::Engine(e.to_string()))?;
            render_event(event)
        }
    }

    /// Schedule process termination. The delay lets the in-flight control
    /// call return before the process goes away; any bound client is
    /// released first.
    pub fn shutdown(&self) {
        let controller = self.clone();
        tracing::info!("node shutdown scheduled");
        tokio::spawn(async move {
            tokio::time::sleep(SHUTDOWN_DELAY).await;
            if let Err(e) = controller.unbind_client().await {
                tracing::warn!(error = %e, "cleanup before shutdown failed");
            }
            controller.inner.shutdown.cancel();
        });
    }
}

fn render_event(event: EngineEvent) -> Result<String> {
    match event {
        EngineEvent::Value { text }
        | EngineEvent::Output { text, .. }
        | EngineEvent::Prompt { text } => Ok(text),
        EngineEvent::Idle => Ok(String::new()),
        EngineEvent::Status(status) => Err(PoolError::Engine(format!(
            "engine is not available ({status:?})"
        ))),
    }
}
