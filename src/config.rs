use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Declarative configuration for the nodes a launcher spawns.
///
/// A `NodeConfig` is mutable until it is handed to
/// [`NodeLauncher::set_config`](crate::launcher::NodeLauncher::set_config),
/// which validates it and captures it into an immutable launch spec. Timeouts
/// are `None` for unbounded.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Home of the runtime that hosts the node controller. The executable is
    /// expected at `<runtime_home>/bin/engine-host`.
    pub runtime_home: Option<PathBuf>,
    /// Explicit runtime executable, overriding `runtime_home` resolution.
    pub runtime_exec: Option<PathBuf>,
    /// Extra arguments for the runtime, placed before the controller entry
    /// point.
    pub launch_args: Vec<String>,
    /// Arguments handed to the node controller itself, after the assigned
    /// node name.
    pub node_args: Vec<String>,
    /// Installation directory of the computation engine.
    pub engine_home: Option<PathBuf>,
    /// Engine architecture name. Auto-detected from the host when unset.
    pub arch: Option<String>,
    /// Base directory for per-node working directories. Defaults to the
    /// system temp directory.
    pub base_dir: Option<PathBuf>,
    /// Environment overrides for the node process.
    pub env: HashMap<String, String>,
    /// Support library ids resolved against `lib_dir`. When empty the lib
    /// directory itself is used as the search path.
    pub libraries: Vec<String>,
    /// Directory searched for support libraries. Defaults to
    /// `<engine_home>/lib`.
    pub lib_dir: Option<PathBuf>,
    /// Allow an external authenticated console to drive the engine.
    pub enable_console: bool,
    /// Script executed line by line on the fresh node before it is handed
    /// out. Blank lines are skipped.
    pub startup_script: Option<String>,
    /// Keep the node working directory and pass `--verbose` to the node.
    pub verbose: bool,
    pub start_timeout: Option<Duration>,
    pub stop_timeout: Option<Duration>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            runtime_home: None,
            runtime_exec: None,
            launch_args: Vec::new(),
            node_args: Vec::new(),
            engine_home: None,
            arch: None,
            base_dir: None,
            env: HashMap::new(),
            libraries: Vec::new(),
            lib_dir: None,
            enable_console: false,
            startup_script: None,
            verbose: false,
            start_timeout: Some(DEFAULT_START_TIMEOUT),
            stop_timeout: Some(DEFAULT_STOP_TIMEOUT),
        }
    }
}

impl NodeConfig {
    pub fn new(engine_home: impl Into<PathBuf>) -> Self {
        Self {
            engine_home: Some(engine_home.into()),
            ..Default::default()
        }
    }

    pub fn with_runtime_exec(mut self, exec: impl Into<PathBuf>) -> Self {
        self.runtime_exec = Some(exec.into());
        self
    }

    pub fn with_base_dir(mut self, base: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(base.into());
        self
    }

    pub fn with_node_arg(mut self, arg: impl Into<String>) -> Self {
        self.node_args.push(arg.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_startup_script(mut self, script: impl Into<String>) -> Self {
        self.startup_script = Some(script.into());
        self
    }

    pub fn with_start_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.start_timeout = timeout;
        self
    }
}
