//! Per-bound-client execution handle.

use uuid::Uuid;

use crate::error::Result;
use crate::node::controller::NodeController;

/// Handle through which the bound client forwards commands into the engine.
///
/// Created by [`NodeController::bind_client`], destroyed by
/// [`NodeController::unbind_client`]; at most one is alive per node. Every
/// call revalidates the session token against the current binding, so a
/// stale handle surviving a rebind fails with a state error instead of
/// reaching the engine.
pub struct SessionBackend {
    controller: NodeController,
    client_id: String,
    token: Uuid,
}

impl std::fmt::Debug for SessionBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionBackend")
            .field("client_id", &self.client_id)
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

impl SessionBackend {
    pub(crate) fn new(controller: NodeController, client_id: String, token: Uuid) -> Self {
        Self {
            controller,
            client_id,
            token,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Session token identifying this backend as the exported endpoint.
    pub fn token(&self) -> Uuid {
        self.token
    }

    /// Run `command` through the engine main loop, serialized with every
    /// other main-loop consumer of this node.
    pub async fn run_main_loop(&self, command: impl Into<String>) -> Result<String> {
        self.controller
            .run_for_session(self.token, command.into(), false)
            .await
    }

    /// Run `command` on the engine's asynchronous path.
    pub async fn run_async(&self, command: impl Into<String>) -> Result<String> {
        self.controller
            .run_for_session(self.token, command.into(), true)
            .await
    }
}
