//! Dummy console loop.
//!
//! While a node sits pooled without a console consumer, this task drains the
//! engine's main loop and discards its output and prompt events so the
//! engine never stalls waiting for someone to answer. Each turn runs under
//! the per-node lock; the loop exits when the console generation moves on,
//! the engine reports a terminal status, or the node shuts down.

use std::time::Duration;

use crate::node::controller::{NodeController, DUMMY_CLIENT};
use crate::node::engine::EngineEvent;

/// Pause between drain turns when the engine has nothing pending.
const IDLE_INTERVAL: Duration = Duration::from_secs(5);

pub(crate) fn spawn(controller: NodeController, generation: u64) {
    tokio::spawn(async move {
        run(controller, generation).await;
    });
}

async fn run(controller: NodeController, generation: u64) {
    let engine = controller.engine();
    if let Err(e) = engine.connect(DUMMY_CLIENT).await {
        tracing::warn!(error = %e, "dummy console could not attach to the engine");
        return;
    }
    tracing::debug!(generation, "dummy console attached");

    loop {
        if controller.shutdown_token().is_cancelled() {
            break;
        }
        let event = {
            let state = controller.state_lock().await;
            if state.generation != generation || state.console_enabled {
                tracing::debug!(generation, "dummy console retired");
                break;
            }
            match engine.run_main_loop(DUMMY_CLIENT, None).await {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!(error = %e, "dummy console drain failed");
                    break;
                }
            }
        };
        match event {
            EngineEvent::Output { text, error } => {
                tracing::trace!(%text, error, "engine output discarded");
            }
            EngineEvent::Prompt { text } => {
                tracing::trace!(%text, "engine prompt discarded");
            }
            EngineEvent::Value { .. } => {}
            EngineEvent::Status(status) => {
                tracing::debug!(status = ?status, "engine main loop ended");
                break;
            }
            EngineEvent::Idle => tokio::time::sleep(IDLE_INTERVAL).await,
        }
    }
}
