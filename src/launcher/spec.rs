//! Launch spec resolution.
//!
//! Turns a [`NodeConfig`] into the immutable command line, environment, and
//! timeout bundle a node is spawned with. All validation happens here so
//! that a bad configuration surfaces before any process is started.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::NodeConfig;
use crate::error::{PoolError, Result};

/// Environment key whose caller-supplied value is merged into the library
/// search path argument instead of being passed through.
pub const LIB_PATH_ENV: &str = "ENGINE_LIB_PATH";
/// When set in the launching process, its value is forwarded to the node as
/// the hostname override.
pub const HOSTNAME_ENV: &str = "ENGINEPOOL_HOSTNAME";

pub const RUNTIME_HOME_ENV: &str = "RUNTIME_HOME";
pub const ENGINE_HOME_ENV: &str = "ENGINE_HOME";
pub const ENGINE_ARCH_ENV: &str = "ENGINE_ARCH";

const RUNTIME_EXEC_NAME: &str = "engine-host";
/// Controller entry point on the node command line; the next argument is the
/// placeholder that receives the node's assigned name.
pub(crate) const ENTRY_POINT: &str = "host";

const PATH_LIST_SEP: char = if cfg!(windows) { ';' } else { ':' };

#[derive(Debug, Clone)]
pub(crate) struct LaunchSpec {
    pub command: Vec<String>,
    /// Index of the placeholder argument that receives the assigned node
    /// name at launch time.
    pub address_idx: usize,
    pub env: HashMap<String, String>,
    pub base_dir: PathBuf,
    pub auth_token: Option<String>,
    pub startup_script: Option<String>,
    pub start_timeout: Option<Duration>,
    pub stop_timeout: Option<Duration>,
    pub verbose: bool,
}

impl LaunchSpec {
    pub(crate) fn from_config(pool_id: &str, config: &NodeConfig, secure: bool) -> Result<Self> {
        let exec = resolve_runtime_exec(config)?;
        let runtime_home = config
            .runtime_home
            .clone()
            .or_else(|| exec.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."));

        let engine_home = config
            .engine_home
            .as_deref()
            .ok_or_else(|| PoolError::Configuration("missing engine home directory".to_string()))?;
        if !engine_home.is_dir() {
            return Err(PoolError::Configuration(format!(
                "engine home {} is not a directory",
                engine_home.display()
            )));
        }

        let arch = detect_arch(engine_home, config.arch.as_deref());
        let lib_dir = config
            .lib_dir
            .clone()
            .unwrap_or_else(|| engine_home.join("lib"));

        let mut lib_paths: Vec<String> = if config.libraries.is_empty() {
            vec![lib_dir.display().to_string()]
        } else {
            search_libraries(&lib_dir, &config.libraries)?
                .into_iter()
                .map(|p| p.display().to_string())
                .collect()
        };
        if let Some(extra) = config.env.get(LIB_PATH_ENV) {
            lib_paths.extend(
                extra
                    .split(PATH_LIST_SEP)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string),
            );
        }

        let mut command = Vec::new();
        command.push(exec.display().to_string());
        command.push("--lib-path".to_string());
        command.push(join_path_list(&lib_paths));
        command.extend(config.launch_args.iter().cloned());
        if secure {
            command.push("--secure".to_string());
        }
        if let Ok(hostname) = std::env::var(HOSTNAME_ENV) {
            if !hostname.is_empty() {
                command.push("--hostname".to_string());
                command.push(hostname);
            }
        }
        // honor caller-supplied overrides in the launch arguments
        if !config.launch_args.iter().any(|a| a == "--policy") {
            command.push("--policy".to_string());
            command.push(lib_dir.join("security.policy").display().to_string());
        }
        if !config.launch_args.iter().any(|a| a == "--codebase") {
            command.push("--codebase".to_string());
            command.push(join_path_list(&lib_paths));
        }
        command.push(ENTRY_POINT.to_string());
        let address_idx = command.len();
        command.push(String::new());
        command.extend(config.node_args.iter().cloned());

        let mut env: HashMap<String, String> = config
            .env
            .iter()
            .filter(|(k, _)| k.as_str() != LIB_PATH_ENV)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.insert(RUNTIME_HOME_ENV.to_string(), runtime_home.display().to_string());
        env.insert(ENGINE_HOME_ENV.to_string(), engine_home.display().to_string());
        if let Some(arch) = &arch {
            env.insert(ENGINE_ARCH_ENV.to_string(), arch.clone());
        }

        let exec_dir = if cfg!(windows) {
            match &arch {
                Some(arch) => engine_home.join("bin").join(arch),
                None => engine_home.join("bin"),
            }
        } else {
            engine_home.join("bin")
        };
        prefix_path_var(&mut env, "PATH", &exec_dir);
        if !cfg!(windows) {
            let engine_lib = match &arch {
                Some(arch) => engine_home.join("lib").join(arch),
                None => engine_home.join("lib"),
            };
            let var = if cfg!(target_os = "macos") {
                "DYLD_LIBRARY_PATH"
            } else {
                "LD_LIBRARY_PATH"
            };
            prefix_path_var(&mut env, var, &engine_lib);
        }

        let base_dir = config
            .base_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        if !probe_base_dir(&base_dir, pool_id) {
            return Err(PoolError::Configuration(format!(
                "invalid working directory base path {}",
                base_dir.display()
            )));
        }

        Ok(Self {
            command,
            address_idx,
            env,
            base_dir,
            auth_token: config.enable_console.then(|| "none".to_string()),
            startup_script: config.startup_script.clone(),
            start_timeout: config.start_timeout,
            stop_timeout: config.stop_timeout,
            verbose: config.verbose,
        })
    }
}

fn resolve_runtime_exec(config: &NodeConfig) -> Result<PathBuf> {
    if let Some(exec) = &config.runtime_exec {
        if !exec.is_file() {
            return Err(PoolError::Configuration(format!(
                "runtime executable {} does not exist",
                exec.display()
            )));
        }
        return Ok(exec.clone());
    }
    if let Some(home) = &config.runtime_home {
        let name = if cfg!(windows) {
            format!("{RUNTIME_EXEC_NAME}.exe")
        } else {
            RUNTIME_EXEC_NAME.to_string()
        };
        let exec = home.join("bin").join(name);
        if !exec.is_file() {
            return Err(PoolError::Configuration(format!(
                "runtime executable {} does not exist",
                exec.display()
            )));
        }
        return Ok(exec);
    }
    // self-hosting default: the pool binary doubles as the node host
    std::env::current_exe()
        .map_err(|e| PoolError::Configuration(format!("cannot locate the current executable: {e}")))
}

/// Map the requested (or host) architecture onto the engine's naming,
/// falling back through neighbouring variants when the exact directory is
/// missing. Returns `None` when the engine install carries no
/// per-architecture directories at all.
fn detect_arch(engine_home: &Path, hint: Option<&str>) -> Option<String> {
    let requested = hint
        .map(str::to_string)
        .unwrap_or_else(|| host_arch().to_string());
    let root = if cfg!(windows) {
        engine_home.join("bin")
    } else {
        engine_home.join("lib")
    };
    arch_candidates(&requested)
        .into_iter()
        .find(|candidate| root.join(candidate).is_dir())
}

fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86" => "i386",
        other => other,
    }
}

fn arch_candidates(requested: &str) -> Vec<String> {
    let mut candidates = vec![requested.to_string()];
    let fallbacks: &[&str] = match requested {
        "i386" => &["i686", "i586"],
        "i686" => &["i586", "i386"],
        "i586" => &["i386"],
        "x86_64" => &["amd64"],
        "amd64" => &["x86_64"],
        "aarch64" => &["arm64"],
        "arm64" => &["aarch64"],
        _ => &[],
    };
    candidates.extend(fallbacks.iter().map(|s| s.to_string()));
    candidates
}

fn search_libraries(lib_dir: &Path, ids: &[String]) -> Result<Vec<PathBuf>> {
    let entries: Vec<PathBuf> = std::fs::read_dir(lib_dir)
        .map_err(|e| {
            PoolError::Configuration(format!(
                "cannot read library directory {}: {e}",
                lib_dir.display()
            ))
        })?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .collect();

    let mut found = Vec::with_capacity(ids.len());
    for id in ids {
        let hit = entries.iter().find(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| {
                    name == id
                        || name.starts_with(&format!("{id}-"))
                        || name.starts_with(&format!("{id}."))
                })
        });
        match hit {
            Some(path) => found.push(path.clone()),
            None => {
                return Err(PoolError::Configuration(format!(
                    "support library {id:?} not found in {}",
                    lib_dir.display()
                )))
            }
        }
    }
    Ok(found)
}

fn join_path_list(paths: &[String]) -> String {
    paths.join(&PATH_LIST_SEP.to_string())
}

fn prefix_path_var(env: &mut HashMap<String, String>, name: &str, dir: &Path) {
    let existing = env
        .get(name)
        .cloned()
        .or_else(|| std::env::var(name).ok())
        .filter(|v| !v.is_empty());
    let value = match existing {
        Some(rest) => format!("{}{}{}", dir.display(), PATH_LIST_SEP, rest),
        None => dir.display().to_string(),
    };
    env.insert(name.to_string(), value);
}

/// The base must accept a fresh directory; tested by creating and removing a
/// probe directory next to where the node directories will go.
fn probe_base_dir(base: &Path, pool_id: &str) -> bool {
    let probe = base.join(format!("{pool_id}-probe"));
    if probe.is_dir() {
        return true;
    }
    match std::fs::create_dir_all(&probe) {
        Ok(()) => {
            let _ = std::fs::remove_dir(&probe);
            true
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_home() -> tempfile::TempDir {
        let home = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(home.path().join("bin")).unwrap();
        std::fs::create_dir_all(home.path().join("lib")).unwrap();
        home
    }

    fn runtime_exec(dir: &Path) -> PathBuf {
        let exec = dir.join("engine-host");
        std::fs::write(&exec, "").unwrap();
        exec
    }

    fn base_config(home: &tempfile::TempDir, scratch: &Path) -> NodeConfig {
        NodeConfig::new(home.path())
            .with_runtime_exec(runtime_exec(scratch))
            .with_base_dir(scratch)
    }

    #[test]
    fn missing_engine_home_is_a_configuration_error() {
        let scratch = tempfile::tempdir().unwrap();
        let config = NodeConfig::default().with_runtime_exec(runtime_exec(scratch.path()));
        let err = LaunchSpec::from_config("p", &config, false).unwrap_err();
        assert!(matches!(err, PoolError::Configuration(_)));
        assert!(err.to_string().contains("engine home"));
    }

    #[test]
    fn nonexistent_engine_home_is_rejected() {
        let scratch = tempfile::tempdir().unwrap();
        let config = NodeConfig::new("/does/not/exist")
            .with_runtime_exec(runtime_exec(scratch.path()));
        let err = LaunchSpec::from_config("p", &config, false).unwrap_err();
        assert!(err.to_string().contains("not a directory"));
    }

    #[test]
    fn unwritable_base_dir_is_rejected() {
        let home = engine_home();
        let scratch = tempfile::tempdir().unwrap();
        let file_as_base = scratch.path().join("occupied");
        std::fs::write(&file_as_base, "x").unwrap();
        let config = NodeConfig::new(home.path())
            .with_runtime_exec(runtime_exec(scratch.path()))
            .with_base_dir(&file_as_base);
        let err = LaunchSpec::from_config("p", &config, false).unwrap_err();
        assert!(matches!(err, PoolError::Configuration(_)));
        assert!(err.to_string().contains("working directory base"));
    }

    #[test]
    fn command_line_ordering() {
        let home = engine_home();
        let scratch = tempfile::tempdir().unwrap();
        let mut config = base_config(&home, scratch.path());
        config.launch_args = vec!["--quiet".to_string()];
        config.node_args = vec!["--registry".to_string(), "/reg".to_string()];

        let spec = LaunchSpec::from_config("p", &config, false).unwrap();

        assert!(spec.command[0].ends_with("engine-host"));
        assert_eq!(spec.command[1], "--lib-path");
        let quiet = spec.command.iter().position(|a| a == "--quiet").unwrap();
        let entry = spec.command.iter().position(|a| a == ENTRY_POINT).unwrap();
        assert!(quiet < entry);
        assert_eq!(spec.address_idx, entry + 1);
        assert_eq!(spec.command[spec.address_idx], "");
        assert_eq!(
            &spec.command[spec.address_idx + 1..],
            &["--registry".to_string(), "/reg".to_string()][..]
        );
        assert!(!spec.command.iter().any(|a| a == "--secure"));
    }

    #[test]
    fn caller_policy_override_suppresses_the_generated_one() {
        let home = engine_home();
        let scratch = tempfile::tempdir().unwrap();
        let mut config = base_config(&home, scratch.path());
        config.launch_args = vec!["--policy".to_string(), "/custom.policy".to_string()];

        let spec = LaunchSpec::from_config("p", &config, false).unwrap();

        assert_eq!(spec.command.iter().filter(|a| *a == "--policy").count(), 1);
        assert!(spec.command.iter().any(|a| a == "/custom.policy"));
        assert!(spec.command.iter().any(|a| a == "--codebase"));
    }

    #[test]
    fn secure_endpoint_adds_secure_flag() {
        let home = engine_home();
        let scratch = tempfile::tempdir().unwrap();
        let config = base_config(&home, scratch.path());
        let spec = LaunchSpec::from_config("p", &config, true).unwrap();
        assert!(spec.command.iter().any(|a| a == "--secure"));
    }

    #[test]
    fn lib_path_env_override_is_merged_not_replaced() {
        let home = engine_home();
        let scratch = tempfile::tempdir().unwrap();
        let config = base_config(&home, scratch.path()).with_env(LIB_PATH_ENV, "/extra/libs");

        let spec = LaunchSpec::from_config("p", &config, false).unwrap();

        let lib_path = &spec.command[2];
        assert!(lib_path.contains(&home.path().join("lib").display().to_string()));
        assert!(lib_path.contains("/extra/libs"));
        assert!(!spec.env.contains_key(LIB_PATH_ENV));
    }

    #[test]
    fn environment_contract() {
        let home = engine_home();
        let scratch = tempfile::tempdir().unwrap();
        let config = base_config(&home, scratch.path()).with_env("ENGINE_OPTS", "-q");

        let spec = LaunchSpec::from_config("p", &config, false).unwrap();

        assert_eq!(
            spec.env.get(ENGINE_HOME_ENV).cloned(),
            Some(home.path().display().to_string())
        );
        assert_eq!(spec.env.get("ENGINE_OPTS").map(String::as_str), Some("-q"));
        let path = spec.env.get("PATH").unwrap();
        assert!(path.starts_with(&home.path().join("bin").display().to_string()));
        #[cfg(all(unix, not(target_os = "macos")))]
        {
            let lib = spec.env.get("LD_LIBRARY_PATH").unwrap();
            assert!(lib.starts_with(&home.path().join("lib").display().to_string()));
        }
    }

    #[test]
    fn console_flag_resolves_auth_token() {
        let home = engine_home();
        let scratch = tempfile::tempdir().unwrap();
        let mut config = base_config(&home, scratch.path());
        assert_eq!(
            LaunchSpec::from_config("p", &config, false).unwrap().auth_token,
            None
        );
        config.enable_console = true;
        assert_eq!(
            LaunchSpec::from_config("p", &config, false).unwrap().auth_token,
            Some("none".to_string())
        );
    }

    #[test]
    fn missing_support_library_is_rejected() {
        let home = engine_home();
        let scratch = tempfile::tempdir().unwrap();
        std::fs::write(home.path().join("lib").join("engine-core-1.2.0"), "").unwrap();
        let mut config = base_config(&home, scratch.path());
        config.libraries = vec!["engine-core".to_string(), "engine-extras".to_string()];

        let err = LaunchSpec::from_config("p", &config, false).unwrap_err();
        assert!(err.to_string().contains("engine-extras"));
    }

    #[test]
    fn support_libraries_resolve_by_prefix() {
        let home = engine_home();
        let scratch = tempfile::tempdir().unwrap();
        std::fs::write(home.path().join("lib").join("engine-core-1.2.0"), "").unwrap();
        let mut config = base_config(&home, scratch.path());
        config.libraries = vec!["engine-core".to_string()];

        let spec = LaunchSpec::from_config("p", &config, false).unwrap();
        assert!(spec.command[2].contains("engine-core-1.2.0"));
    }

    #[cfg(unix)]
    #[test]
    fn arch_fallback_picks_nearest_available_variant() {
        let home = engine_home();
        std::fs::create_dir_all(home.path().join("lib").join("i586")).unwrap();
        assert_eq!(detect_arch(home.path(), Some("i386")).as_deref(), Some("i586"));
    }

    #[cfg(unix)]
    #[test]
    fn exact_arch_wins_over_fallbacks() {
        let home = engine_home();
        std::fs::create_dir_all(home.path().join("lib").join("i386")).unwrap();
        std::fs::create_dir_all(home.path().join("lib").join("i586")).unwrap();
        assert_eq!(detect_arch(home.path(), Some("i386")).as_deref(), Some("i386"));
    }

    #[test]
    fn no_arch_directories_means_no_arch() {
        let home = engine_home();
        assert_eq!(detect_arch(home.path(), Some("i386")), None);
    }
}
