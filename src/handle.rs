use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::process::Child;

use crate::client::RemoteNode;
use crate::protocol::PlatformInfo;

/// Pool-owned record of one node.
///
/// Created empty by the pool, populated by
/// [`NodeLauncher::create_node`](crate::launcher::NodeLauncher::create_node)
/// and cleared again when the node is stopped.
#[derive(Debug, Default)]
pub struct NodeHandle {
    /// Unique node name, `<poolId>-<timestamp>`. Doubles as the directory
    /// entry the node publishes its address under.
    pub id: String,
    /// Per-node working directory, unique among siblings under the base.
    pub dir: Option<PathBuf>,
    /// Resolved control address, once the handshake succeeded.
    pub address: Option<String>,
    pub process: Option<Child>,
    pub control: Option<RemoteNode>,
    pub console_enabled: bool,
    pub platform: Option<PlatformInfo>,
    /// Captured from the launch spec; a node launched verbose keeps its
    /// working directory on stop.
    pub verbose: bool,
    pub stop_timeout: Option<Duration>,
    pub created_at: Option<DateTime<Utc>>,
}

impl NodeHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the handle currently points at a launched node.
    pub fn is_live(&self) -> bool {
        self.control.is_some()
    }

    pub(crate) fn clear_runtime_fields(&mut self) {
        self.address = None;
        self.control = None;
        self.platform = None;
        self.console_enabled = false;
    }
}
