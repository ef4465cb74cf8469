//! Node launch pipeline.
//!
//! [`NodeLauncher`] spawns worker processes from the captured launch spec,
//! polls the directory service until the node's control address appears,
//! runs the optional startup script, and switches the node into its
//! configured console mode. Any failure along the way captures the command
//! line plus whatever the child emitted, tears the process down, and removes
//! its working directory.
//!
//! Configuration replacement and node creation share the factory-side lock;
//! it is distinct from the per-node lock inside the worker, so several nodes
//! can launch concurrently while a reconfiguration is pending.

mod spec;
pub(crate) mod teardown;

pub use self::spec::{
    ENGINE_ARCH_ENV, ENGINE_HOME_ENV, HOSTNAME_ENV, LIB_PATH_ENV, RUNTIME_HOME_ENV,
};

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};

use crate::client::RemoteNode;
use crate::config::NodeConfig;
use crate::directory::Directory;
use crate::error::{PoolError, Result};
use crate::handle::NodeHandle;
use crate::node::NODE_LOG_FILE;
use self::spec::LaunchSpec;

/// Interval between directory polls during the handshake and between exit
/// polls during teardown.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(250);
/// Polls guaranteed before a timeout can fire, to tolerate slow scheduling.
pub(crate) const MIN_POLL_ATTEMPTS: u32 = 10;
/// Bound on working-directory allocation retries.
const WORKDIR_ATTEMPTS: u32 = 20;
/// Cap on diagnostic log content folded into a launch error.
const LOG_CAP: usize = 100_000;

pub struct NodeLauncher {
    pool_id: String,
    directory: Arc<dyn Directory>,
    shared: Mutex<Shared>,
}

#[derive(Default)]
struct Shared {
    spec: Option<Arc<LaunchSpec>>,
    last_error: Option<String>,
}

impl NodeLauncher {
    pub fn new(pool_id: impl Into<String>, directory: Arc<dyn Directory>) -> Self {
        Self {
            pool_id: pool_id.into(),
            directory,
            shared: Mutex::new(Shared::default()),
        }
    }

    pub fn pool_id(&self) -> &str {
        &self.pool_id
    }

    /// Validate `config` and capture it as the launch spec for subsequent
    /// nodes. On success the previous spec is replaced atomically; on
    /// failure the old spec is dropped and the error is also reported by
    /// later `create_node` calls.
    pub fn set_config(&self, config: &NodeConfig) -> Result<()> {
        match LaunchSpec::from_config(&self.pool_id, config, self.directory.is_secure()) {
            Ok(spec) => {
                let mut shared = self.shared.lock().expect("launcher mutex poisoned");
                shared.spec = Some(Arc::new(spec));
                shared.last_error = None;
                Ok(())
            }
            Err(e) => {
                let mut shared = self.shared.lock().expect("launcher mutex poisoned");
                shared.spec = None;
                shared.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    fn current_spec(&self) -> Result<Arc<LaunchSpec>> {
        let shared = self.shared.lock().expect("launcher mutex poisoned");
        shared.spec.clone().ok_or_else(|| {
            PoolError::Configuration(
                shared
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "node launcher is not configured".to_string()),
            )
        })
    }

    /// Allocate a fresh uniquely named working directory under the base.
    /// Serialized with configuration updates so concurrent launches cannot
    /// race on the same timestamp id.
    fn allocate_workdir(&self, base: &Path) -> Result<(String, PathBuf)> {
        let _guard = self.shared.lock().expect("launcher mutex poisoned");
        for _ in 0..WORKDIR_ATTEMPTS {
            let id = format!("{}-{}", self.pool_id, Utc::now().timestamp_millis());
            let dir = base.join(&id);
            if dir.exists() {
                std::thread::sleep(Duration::from_millis(2));
                continue;
            }
            match std::fs::create_dir_all(&dir) {
                Ok(()) => return Ok((id, dir)),
                Err(e) => {
                    tracing::debug!(dir = %dir.display(), error = %e, "workdir creation failed, retrying");
                    std::thread::sleep(Duration::from_millis(2));
                }
            }
        }
        Err(PoolError::Launch(format!(
            "could not allocate a node working directory under {} after {WORKDIR_ATTEMPTS} attempts",
            base.display()
        )))
    }

    /// Launch a node and populate `handle` with its process, address, and
    /// control stub. Blocks through the whole handshake, bounded by the
    /// configured start timeout.
    pub async fn create_node(&self, handle: &mut NodeHandle) -> Result<()> {
        let spec = self.current_spec()?;
        let (id, dir) = self.allocate_workdir(&spec.base_dir)?;
        handle.id = id.clone();
        handle.dir = Some(dir.clone());
        handle.verbose = spec.verbose;
        handle.stop_timeout = spec.stop_timeout;
        handle.created_at = Some(Utc::now());

        let mut command = spec.command.clone();
        command[spec.address_idx] = id.clone();
        if spec.verbose {
            command.push("--verbose".to_string());
        }

        tracing::info!(node = %id, "launching node process");
        tracing::debug!(node = %id, command = ?command, "node command line");

        let mut child = match Command::new(&command[0])
            .args(&command[1..])
            .envs(spec.env.iter())
            .current_dir(&dir)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                let message = format!(
                    "error starting node process: {e}\n<COMMAND>\n{}\n</COMMAND>",
                    render_command(&command)
                );
                remove_workdir(&dir);
                handle.dir = None;
                return Err(PoolError::Launch(message));
            }
        };

        match self.handshake(&spec, &id, &mut child, handle).await {
            Ok(()) => {
                handle.process = Some(child);
                tracing::info!(node = %id, address = ?handle.address, "node ready");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(node = %id, error = %e, "node launch failed, collecting diagnostics");
                let diagnostics = collect_diagnostics(&mut child, &dir, &command).await;
                remove_workdir(&dir);
                handle.dir = None;
                handle.clear_runtime_fields();
                Err(attach_diagnostics(e, diagnostics))
            }
        }
    }

    async fn handshake(
        &self,
        spec: &LaunchSpec,
        id: &str,
        child: &mut Child,
        handle: &mut NodeHandle,
    ) -> Result<()> {
        let started = Instant::now();
        let mut interval = tokio::time::interval(POLL_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut attempts: u32 = 0;

        let control = loop {
            interval.tick().await;
            attempts += 1;

            match self.directory.resolve(id).await? {
                Some(address) => match RemoteNode::connect(&address).await {
                    Ok(control) => {
                        handle.address = Some(address);
                        break control;
                    }
                    Err(e) => {
                        tracing::trace!(node = %id, error = %e, "address published but not yet reachable");
                    }
                },
                None => {}
            }

            if let Some(status) = child.try_wait()? {
                return Err(PoolError::ProcessExit {
                    code: status.code().unwrap_or(-1),
                    detail: String::new(),
                });
            }

            if attempts >= MIN_POLL_ATTEMPTS {
                if let Some(timeout) = spec.start_timeout {
                    if started.elapsed() > timeout {
                        return Err(PoolError::Timeout(format!(
                            "node {id} did not publish a reachable control address within {timeout:?}"
                        )));
                    }
                }
            }
        };

        let platform = control.platform().await?;

        if let Some(script) = &spec.startup_script {
            for (lineno, line) in script.lines().enumerate() {
                let code = line.trim();
                if code.is_empty() {
                    continue;
                }
                if let Err(e) = control.run_snippet(code).await {
                    tracing::warn!(node = %id, line = lineno + 1, error = %e, "startup script failed, shutting node down");
                    best_effort_shutdown(&control).await;
                    return Err(PoolError::Launch(format!(
                        "startup script failed at line {} ({code:?}): {e}",
                        lineno + 1
                    )));
                }
            }
        }

        match control.set_console(spec.auth_token.clone()).await {
            Ok(enabled) => handle.console_enabled = enabled,
            Err(e) => {
                best_effort_shutdown(&control).await;
                return Err(e);
            }
        }

        handle.platform = Some(platform);
        handle.control = Some(control);
        Ok(())
    }

    /// Retire a node: best-effort remote shutdown, wait for the process to
    /// exit (force-killing past the stop timeout), then remove the working
    /// directory unless the node was launched verbose. Teardown failures are
    /// logged, never returned.
    pub async fn stop_node(&self, handle: &mut NodeHandle) {
        teardown::stop_node(handle).await;
    }
}

async fn best_effort_shutdown(control: &RemoteNode) {
    if let Err(e) = control.shutdown().await {
        tracing::debug!(error = %e, "best-effort node shutdown failed");
    }
}

fn render_command(command: &[String]) -> String {
    command.join(" ")
}

fn remove_workdir(dir: &Path) {
    if let Err(e) = std::fs::remove_dir_all(dir) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(dir = %dir.display(), error = %e, "could not remove node working directory");
        }
    }
}

/// Fold the command line, the child's captured output, and the node's
/// diagnostic log into one operator-readable block. The child is force
/// killed between the non-blocking and the blocking drain.
async fn collect_diagnostics(child: &mut Child, dir: &Path, command: &[String]) -> String {
    let mut out = String::new();
    out.push_str("\n<COMMAND>\n");
    out.push_str(&render_command(command));
    out.push_str("\n</COMMAND>");

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();

    out.push_str("\n<STDOUT>\n");
    if let Some(stream) = stdout.as_mut() {
        drain_available(stream, &mut out).await;
    }
    if let Some(stream) = stderr.as_mut() {
        drain_available(stream, &mut out).await;
    }

    let _ = child.start_kill();
    let _ = child.wait().await;

    if let Some(stream) = stdout.as_mut() {
        drain_to_end(stream, &mut out).await;
    }
    if let Some(stream) = stderr.as_mut() {
        drain_to_end(stream, &mut out).await;
    }
    out.push_str("</STDOUT>");

    let log = dir.join(NODE_LOG_FILE);
    if log.is_file() {
        out.push_str("\n<LOG file=\"out.log\">\n");
        match std::fs::read_to_string(&log) {
            Ok(contents) => {
                let mut capped = contents.as_str();
                if capped.len() > LOG_CAP {
                    let mut end = LOG_CAP;
                    while !capped.is_char_boundary(end) {
                        end -= 1;
                    }
                    capped = &capped[..end];
                }
                out.push_str(capped);
            }
            Err(e) => out.push_str(&format!("<unreadable: {e}>")),
        }
        out.push_str("</LOG>");
    }
    out.push_str("\n--------");
    out
}

/// Read whatever is immediately available without waiting on a live child.
async fn drain_available<R: AsyncReadExt + Unpin>(stream: &mut R, out: &mut String) {
    let mut buf = [0u8; 4096];
    loop {
        match tokio::time::timeout(Duration::from_millis(50), stream.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => out.push_str(&String::from_utf8_lossy(&buf[..n])),
            Ok(Err(_)) | Err(_) => break,
        }
    }
}

async fn drain_to_end<R: AsyncReadExt + Unpin>(stream: &mut R, out: &mut String) {
    let mut rest = Vec::new();
    if stream.read_to_end(&mut rest).await.is_ok() && !rest.is_empty() {
        out.push_str(&String::from_utf8_lossy(&rest));
    }
}

fn attach_diagnostics(err: PoolError, diagnostics: String) -> PoolError {
    match err {
        PoolError::ProcessExit { code, .. } => PoolError::ProcessExit {
            code,
            detail: diagnostics,
        },
        PoolError::Timeout(message) => PoolError::Timeout(format!("{message}{diagnostics}")),
        PoolError::Launch(message) => PoolError::Launch(format!("{message}{diagnostics}")),
        PoolError::Configuration(message) => PoolError::Configuration(message),
        other => PoolError::Launch(format!("error starting node: {other}{diagnostics}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MemoryDirectory;

    fn launcher() -> NodeLauncher {
        NodeLauncher::new("pool", Arc::new(MemoryDirectory::new()))
    }

    #[test]
    fn unconfigured_launcher_reports_configuration_error() {
        let launcher = launcher();
        let err = launcher.current_spec().unwrap_err();
        assert!(matches!(err, PoolError::Configuration(_)));
        assert!(err.to_string().contains("not configured"));
    }

    #[test]
    fn failed_set_config_is_reported_by_later_calls() {
        let launcher = launcher();
        let bad = NodeConfig::default();
        assert!(launcher.set_config(&bad).is_err());
        let err = launcher.current_spec().unwrap_err();
        assert!(err.to_string().contains("engine home"));
    }

    #[test]
    fn workdir_allocation_yields_distinct_directories() {
        let launcher = launcher();
        let base = tempfile::tempdir().unwrap();
        let (id_a, dir_a) = launcher.allocate_workdir(base.path()).unwrap();
        let (id_b, dir_b) = launcher.allocate_workdir(base.path()).unwrap();
        assert_ne!(id_a, id_b);
        assert_ne!(dir_a, dir_b);
        assert!(dir_a.is_dir());
        assert!(dir_b.is_dir());
        assert!(id_a.starts_with("pool-"));
    }

    #[test]
    fn diagnostics_keep_error_kind() {
        let err = attach_diagnostics(
            PoolError::ProcessExit {
                code: 3,
                detail: String::new(),
            },
            "\n<COMMAND>\nx\n</COMMAND>".to_string(),
        );
        assert!(matches!(err, PoolError::ProcessExit { code: 3, .. }));
        assert!(err.to_string().contains("<COMMAND>"));

        let err = attach_diagnostics(
            PoolError::Timeout("too slow".to_string()),
            " diag".to_string(),
        );
        assert!(matches!(err, PoolError::Timeout(_)));
        assert!(err.to_string().contains("too slow diag"));
    }
}
