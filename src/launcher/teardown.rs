//! Graceful-then-forced node teardown.
//!
//! Stopping a node must never fail the caller: every step here is
//! best-effort, logged on failure, and followed by the next step anyway.

use std::time::{Duration, Instant};

use crate::handle::NodeHandle;
use crate::launcher::{MIN_POLL_ATTEMPTS, POLL_INTERVAL};

/// Bound on working-directory removal retries after the process is gone.
const CLEANUP_ATTEMPTS: u32 = 20;

pub(crate) async fn stop_node(handle: &mut NodeHandle) {
    if let Some(control) = handle.control.take() {
        if let Err(e) = control.shutdown().await {
            tracing::warn!(node = %handle.id, error = %e, "remote shutdown failed");
        }
    }

    if let Some(mut child) = handle.process.take() {
        let started = Instant::now();
        let mut interval = tokio::time::interval(POLL_INTERVAL);
        let mut attempts: u32 = 0;
        let exited = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Some(status),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(node = %handle.id, error = %e, "could not poll node process");
                    break None;
                }
            }
            attempts += 1;
            if attempts >= MIN_POLL_ATTEMPTS {
                match handle.stop_timeout {
                    Some(timeout) if started.elapsed() > timeout => break None,
                    _ => {}
                }
            }
            interval.tick().await;
        };
        match exited {
            Some(status) => {
                tracing::debug!(node = %handle.id, code = ?status.code(), "node process exited");
            }
            None => {
                tracing::warn!(node = %handle.id, "node did not exit in time, killing");
                let _ = child.kill().await;
            }
        }
    }

    if let Some(dir) = handle.dir.take() {
        if handle.verbose {
            tracing::debug!(node = %handle.id, dir = %dir.display(), "keeping working directory (verbose mode)");
        } else {
            let mut removed = false;
            for _ in 0..CLEANUP_ATTEMPTS {
                match tokio::fs::remove_dir_all(&dir).await {
                    Ok(()) => {
                        removed = true;
                        break;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        removed = true;
                        break;
                    }
                    Err(e) => {
                        tracing::trace!(dir = %dir.display(), error = %e, "workdir removal failed, retrying");
                        tokio::time::sleep(POLL_INTERVAL).await;
                    }
                }
            }
            if !removed {
                tracing::warn!(node = %handle.id, dir = %dir.display(), "could not remove node working directory");
            }
        }
    }

    handle.clear_runtime_fields();
}
