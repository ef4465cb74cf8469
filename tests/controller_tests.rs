//! State machine tests for the in-process node controller: binding,
//! console mode, reset behavior, and session access checks.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use enginepool::error::PoolError;
use enginepool::node::{
    Engine, EngineError, EngineEvent, EngineStatus, NodeController, NODE_LOG_FILE,
};
use enginepool::protocol::PlatformInfo;

/// Scripted engine recording controller interactions.
#[derive(Default)]
struct MockEngine {
    resets: AtomicUsize,
    disconnects: AtomicUsize,
    drained: AtomicUsize,
    fail_reset: AtomicBool,
    events: Mutex<VecDeque<EngineEvent>>,
}

impl MockEngine {
    fn with_events(events: Vec<EngineEvent>) -> Self {
        Self {
            events: Mutex::new(events.into()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Engine for MockEngine {
    async fn connect(&self, _client: &str) -> Result<(), EngineError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), EngineError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn run_main_loop(
        &self,
        _client: &str,
        input: Option<String>,
    ) -> Result<EngineEvent, EngineError> {
        match input {
            Some(command) if command == "boom" => Err(EngineError::Eval("boom".to_string())),
            Some(command) => Ok(EngineEvent::Value {
                text: format!("ok:{command}"),
            }),
            None => {
                self.drained.fetch_add(1, Ordering::SeqCst);
                Ok(self
                    .events
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or(EngineEvent::Status(EngineStatus::Disconnected)))
            }
        }
    }

    async fn run_async(&self, _client: &str, command: String) -> Result<String, EngineError> {
        Ok(format!("async:{command}"))
    }

    async fn reset(&self) -> Result<(), EngineError> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        if self.fail_reset.load(Ordering::SeqCst) {
            return Err(EngineError::Internal("reset failed".to_string()));
        }
        Ok(())
    }

    async fn platform(&self) -> Result<PlatformInfo, EngineError> {
        Ok(PlatformInfo {
            os_type: "testos".to_string(),
            file_sep: "/".to_string(),
            path_sep: ":".to_string(),
            version: "0.0".to_string(),
        })
    }
}

async fn start_controller() -> (Arc<MockEngine>, NodeController, tempfile::TempDir) {
    let workdir = tempfile::tempdir().unwrap();
    let engine = Arc::new(MockEngine::default());
    let controller = NodeController::start(engine.clone(), workdir.path().to_path_buf())
        .await
        .unwrap();
    (engine, controller, workdir)
}

async fn wait_until(mut probe: impl FnMut() -> bool) {
    for _ in 0..100 {
        if probe() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached within 2s");
}

#[tokio::test]
async fn at_most_one_client_bound() {
    let (_engine, controller, _workdir) = start_controller().await;

    let s1 = controller.bind_client("c1").await.unwrap();
    assert_eq!(s1.client_id(), "c1");

    let err = controller.bind_client("c2").await.unwrap_err();
    assert!(matches!(err, PoolError::State(_)));
    assert!(err.to_string().contains("c1"));

    controller.unbind_client().await.unwrap();
    let s2 = controller.bind_client("c2").await.unwrap();
    assert_eq!(s2.client_id(), "c2");
}

#[tokio::test]
async fn unbind_without_binding_is_a_no_op() {
    let (engine, controller, _workdir) = start_controller().await;
    let resets_before = engine.resets.load(Ordering::SeqCst);
    controller.unbind_client().await.unwrap();
    // no binding, so no workspace reset either
    assert_eq!(engine.resets.load(Ordering::SeqCst), resets_before);
}

#[tokio::test]
async fn failed_reset_still_clears_the_binding() {
    let (engine, controller, _workdir) = start_controller().await;

    controller.bind_client("c1").await.unwrap();
    engine.fail_reset.store(true, Ordering::SeqCst);

    let err = controller.unbind_client().await.unwrap_err();
    assert!(matches!(err, PoolError::Reset(_)));
    assert!(err.to_string().contains("reset failed"));

    // the node stays usable for the next consumer
    engine.fail_reset.store(false, Ordering::SeqCst);
    controller.bind_client("c2").await.unwrap();
}

#[tokio::test]
async fn stale_session_is_rejected_after_rebind() {
    let (_engine, controller, _workdir) = start_controller().await;

    let s1 = controller.bind_client("c1").await.unwrap();
    assert_eq!(s1.run_main_loop("x<-1").await.unwrap(), "ok:x<-1");

    controller.unbind_client().await.unwrap();
    let s2 = controller.bind_client("c2").await.unwrap();

    let err = s1.run_main_loop("x").await.unwrap_err();
    assert!(matches!(err, PoolError::State(_)));
    let err = s1.run_async("x").await.unwrap_err();
    assert!(matches!(err, PoolError::State(_)));

    assert_eq!(s2.run_main_loop("x").await.unwrap(), "ok:x");
    assert_eq!(s2.run_async("y").await.unwrap(), "async:y");
}

#[tokio::test]
async fn engine_failures_surface_as_engine_errors() {
    let (_engine, controller, _workdir) = start_controller().await;
    let session = controller.bind_client("c1").await.unwrap();
    let err = session.run_main_loop("boom").await.unwrap_err();
    assert!(matches!(err, PoolError::Engine(_)));
}

#[tokio::test]
async fn snippets_are_blocked_while_a_client_is_bound() {
    let (_engine, controller, _workdir) = start_controller().await;

    assert_eq!(controller.run_snippet("setup").await.unwrap(), "ok:setup");

    controller.bind_client("c1").await.unwrap();
    let err = controller.run_snippet("setup").await.unwrap_err();
    assert!(matches!(err, PoolError::State(_)));

    controller.unbind_client().await.unwrap();
    assert_eq!(controller.run_snippet("setup").await.unwrap(), "ok:setup");
}

#[tokio::test]
async fn unbind_removes_the_diagnostic_log() {
    let (_engine, controller, workdir) = start_controller().await;
    let log = workdir.path().join(NODE_LOG_FILE);

    std::fs::write(&log, "node chatter").unwrap();
    controller.bind_client("c1").await.unwrap();
    controller.unbind_client().await.unwrap();
    assert!(!log.exists());

    // absent log is fine on the next cycle
    controller.bind_client("c2").await.unwrap();
    controller.unbind_client().await.unwrap();
}

#[tokio::test]
async fn set_console_switches_modes() {
    let (engine, controller, _workdir) = start_controller().await;

    assert!(controller.set_console(Some("token".to_string())).await.unwrap());
    assert_eq!(controller.console_auth().await.as_deref(), Some("token"));

    assert!(!controller.set_console(None).await.unwrap());
    assert_eq!(controller.console_auth().await, None);

    // each switch disconnects whoever was driving the main loop
    assert_eq!(engine.disconnects.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn dummy_console_drains_engine_events() {
    let workdir = tempfile::tempdir().unwrap();
    let engine = Arc::new(MockEngine::with_events(vec![
        EngineEvent::Output {
            text: "hello".to_string(),
            error: false,
        },
        EngineEvent::Prompt {
            text: "> ".to_string(),
        },
        EngineEvent::Status(EngineStatus::Stopped),
    ]));
    let _controller = NodeController::start(engine.clone(), workdir.path().to_path_buf())
        .await
        .unwrap();

    // the background loop consumes all scripted events, then stops on the
    // terminal status
    wait_until(|| engine.drained.load(Ordering::SeqCst) >= 3).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(engine.drained.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn shutdown_fires_after_the_grace_delay() {
    let (_engine, controller, _workdir) = start_controller().await;
    controller.bind_client("c1").await.unwrap();

    let token = controller.shutdown_token();
    controller.shutdown();
    assert!(!token.is_cancelled());

    tokio::time::timeout(Duration::from_secs(2), token.cancelled())
        .await
        .expect("shutdown did not fire");

    // the delayed action released the binding before terminating
    controller.bind_client("c2").await.unwrap();
}

#[tokio::test]
async fn ping_and_pool_host() {
    let (_engine, controller, _workdir) = start_controller().await;
    controller.ping().unwrap();
    assert_eq!(controller.pool_host(None), "<internal>");
    let peer: std::net::SocketAddr = "10.1.2.3:9999".parse().unwrap();
    assert_eq!(controller.pool_host(Some(peer)), "10.1.2.3");
}
