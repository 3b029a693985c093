//! Pool configuration.
//!
//! A [`PoolConfig`] can be built in code, deserialized from TOML with
//! [`load_file`], or read from `SNIPPET_POOL_*` environment variables with
//! [`load`]. Invalid environment values fall back to defaults without failing.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `SNIPPET_POOL_SIZE` | logical cores | Number of workers |
//! | `SNIPPET_POOL_DEFAULT_TIMEOUT_MS` | 0 | Per-task timeout when none given (0 = none) |
//! | `SNIPPET_POOL_MAX_QUEUE_SIZE` | 0 | Max queued tasks (0 = unbounded) |
//! | `SNIPPET_POOL_PRE_WARM` | false | Spawn every worker at construction |
//! | `SNIPPET_POOL_FORCE_SINGLE_THREADED` | false | Always use the sequential executor |
//! | `SNIPPET_POOL_FORCE_MULTI_THREADED` | false | Fail construction without parallel workers |
//! | `SNIPPET_POOL_VARIANT` | singlefile | `singlefile` or `shared-fs` |
//! | `SNIPPET_POOL_SHARED_FS_MOUNT` | /data | Mount point for the shared-fs variant |
//! | `SNIPPET_POOL_THREAD_STACK_SIZE` | runtime default | Stack size of thread workers (bytes) |

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::capabilities;
use crate::protocol::{ContextOptions, InitOptions, Variant};

pub const DEFAULT_SHARED_FS_MOUNT: &str = "/data";

/// Smallest accepted worker thread stack.
const MIN_STACK_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{0}")]
    Invalid(String),
}

/// Options controlling pool construction and scheduling.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub pool_size: usize,
    /// Applied to tasks and session calls that carry no timeout. 0 disables it.
    pub default_timeout_ms: u64,
    /// 0 means unbounded.
    pub max_queue_size: usize,
    pub pre_warm: bool,
    pub force_single_threaded: bool,
    pub force_multi_threaded: bool,
    pub variant: Variant,
    pub shared_fs_mount: Option<String>,
    pub context_options: ContextOptions,
    /// Source run once in every fresh evaluator before any task.
    pub bootstrap_source: Option<String>,
    pub wasm_location: Option<String>,
    pub thread_stack_size: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: capabilities::default_pool_size(),
            default_timeout_ms: 0,
            max_queue_size: 0,
            pre_warm: false,
            force_single_threaded: false,
            force_multi_threaded: false,
            variant: Variant::SingleFile,
            shared_fs_mount: None,
            context_options: ContextOptions::default(),
            bootstrap_source: None,
            wasm_location: None,
            thread_stack_size: None,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size == 0 {
            return Err(ConfigError::Invalid("pool_size must be at least 1".into()));
        }
        if self.force_single_threaded && self.force_multi_threaded {
            return Err(ConfigError::Invalid(
                "force_single_threaded and force_multi_threaded are mutually exclusive".into(),
            ));
        }
        if let Some(size) = self.thread_stack_size {
            if size < MIN_STACK_SIZE {
                return Err(ConfigError::Invalid(format!(
                    "thread_stack_size must be at least {MIN_STACK_SIZE} bytes"
                )));
            }
        }
        Ok(())
    }

    /// Timeout for a task, preferring its own over the pool default.
    pub fn effective_timeout(&self, task_timeout_ms: Option<u64>) -> Option<Duration> {
        let ms = task_timeout_ms.unwrap_or(self.default_timeout_ms);
        (ms > 0).then(|| Duration::from_millis(ms))
    }

    /// Payload sent to every worker in its `init` message.
    pub fn init_options(&self) -> InitOptions {
        let shared_fs_mount = match self.variant {
            Variant::SharedFs => Some(
                self.shared_fs_mount.clone().unwrap_or_else(|| DEFAULT_SHARED_FS_MOUNT.into()),
            ),
            Variant::SingleFile => None,
        };
        InitOptions {
            context_options: self.context_options.clone(),
            variant: self.variant,
            shared_fs_mount,
            bootstrap_source: self.bootstrap_source.clone(),
            wasm_location: self.wasm_location.clone(),
        }
    }
}

fn parse_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<u64>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Accepts `1/0`, `true/false`, `yes/no`, `on/off`.
fn parse_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

fn parse_variant(key: &str) -> Variant {
    match std::env::var(key).as_deref().map(str::trim) {
        Ok("shared-fs") | Ok("sharedfs") => Variant::SharedFs,
        _ => Variant::SingleFile,
    }
}

/// Load configuration from environment variables.
///
/// Missing or invalid values fall back to defaults without panicking.
pub fn load() -> PoolConfig {
    let defaults = PoolConfig::default();
    let pool_size = parse_usize("SNIPPET_POOL_SIZE", defaults.pool_size).max(1);
    let stack = parse_usize("SNIPPET_POOL_THREAD_STACK_SIZE", 0);
    let thread_stack_size = (stack > 0).then(|| stack.max(MIN_STACK_SIZE));
    let mut force_multi_threaded = parse_bool("SNIPPET_POOL_FORCE_MULTI_THREADED", false);
    let force_single_threaded = parse_bool("SNIPPET_POOL_FORCE_SINGLE_THREADED", false);
    if force_single_threaded {
        force_multi_threaded = false; // single-threaded wins
    }

    PoolConfig {
        pool_size,
        default_timeout_ms: parse_u64("SNIPPET_POOL_DEFAULT_TIMEOUT_MS", 0),
        max_queue_size: parse_usize("SNIPPET_POOL_MAX_QUEUE_SIZE", 0),
        pre_warm: parse_bool("SNIPPET_POOL_PRE_WARM", false),
        force_single_threaded,
        force_multi_threaded,
        variant: parse_variant("SNIPPET_POOL_VARIANT"),
        shared_fs_mount: std::env::var("SNIPPET_POOL_SHARED_FS_MOUNT").ok().filter(|s| !s.is_empty()),
        thread_stack_size,
        ..defaults
    }
}

/// Load and validate configuration from a TOML file.
pub fn load_file(path: impl AsRef<Path>) -> Result<PoolConfig, ConfigError> {
    let text = std::fs::read_to_string(path)?;
    let config: PoolConfig = toml::from_str(&text)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;

    // Serialize env-mutating tests to avoid cross-test pollution.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const ENV_KEYS: &[&str] = &[
        "SNIPPET_POOL_SIZE",
        "SNIPPET_POOL_DEFAULT_TIMEOUT_MS",
        "SNIPPET_POOL_MAX_QUEUE_SIZE",
        "SNIPPET_POOL_PRE_WARM",
        "SNIPPET_POOL_FORCE_SINGLE_THREADED",
        "SNIPPET_POOL_FORCE_MULTI_THREADED",
        "SNIPPET_POOL_VARIANT",
        "SNIPPET_POOL_SHARED_FS_MOUNT",
        "SNIPPET_POOL_THREAD_STACK_SIZE",
    ];

    fn clear_env_vars() {
        for k in ENV_KEYS {
            std::env::remove_var(k);
        }
    }

    #[test]
    fn test_defaults_are_sensible() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        let cfg = load();
        assert_eq!(cfg.pool_size, capabilities::default_pool_size());
        assert_eq!(cfg.default_timeout_ms, 0);
        assert_eq!(cfg.max_queue_size, 0);
        assert!(!cfg.pre_warm);
        assert_eq!(cfg.variant, Variant::SingleFile);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_env_vars_override_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("SNIPPET_POOL_SIZE", "3");
        std::env::set_var("SNIPPET_POOL_DEFAULT_TIMEOUT_MS", "500");
        std::env::set_var("SNIPPET_POOL_MAX_QUEUE_SIZE", "16");
        std::env::set_var("SNIPPET_POOL_PRE_WARM", "yes");
        std::env::set_var("SNIPPET_POOL_VARIANT", "shared-fs");
        let cfg = load();
        assert_eq!(cfg.pool_size, 3);
        assert_eq!(cfg.default_timeout_ms, 500);
        assert_eq!(cfg.max_queue_size, 16);
        assert!(cfg.pre_warm);
        assert_eq!(cfg.variant, Variant::SharedFs);
        clear_env_vars();
    }

    #[test]
    fn test_invalid_env_falls_back_to_default() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("SNIPPET_POOL_SIZE", "lots");
        std::env::set_var("SNIPPET_POOL_PRE_WARM", "maybe");
        std::env::set_var("SNIPPET_POOL_DEFAULT_TIMEOUT_MS", "-5");
        let cfg = load();
        assert_eq!(cfg.pool_size, capabilities::default_pool_size());
        assert!(!cfg.pre_warm);
        assert_eq!(cfg.default_timeout_ms, 0);
        clear_env_vars();
    }

    #[test]
    fn test_pool_size_floor_and_stack_floor() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("SNIPPET_POOL_SIZE", "0");
        std::env::set_var("SNIPPET_POOL_THREAD_STACK_SIZE", "1024");
        let cfg = load();
        assert_eq!(cfg.pool_size, 1);
        assert_eq!(cfg.thread_stack_size, Some(MIN_STACK_SIZE));
        clear_env_vars();
    }

    #[test]
    fn test_conflicting_force_flags_resolved_from_env() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("SNIPPET_POOL_FORCE_SINGLE_THREADED", "1");
        std::env::set_var("SNIPPET_POOL_FORCE_MULTI_THREADED", "1");
        let cfg = load();
        assert!(cfg.force_single_threaded);
        assert!(!cfg.force_multi_threaded);
        clear_env_vars();
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let zero = PoolConfig { pool_size: 0, ..Default::default() };
        assert!(zero.validate().is_err());

        let both = PoolConfig {
            force_single_threaded: true,
            force_multi_threaded: true,
            ..Default::default()
        };
        assert!(both.validate().is_err());
    }

    #[test]
    fn test_effective_timeout_prefers_task_value() {
        let cfg = PoolConfig { default_timeout_ms: 100, ..Default::default() };
        assert_eq!(cfg.effective_timeout(None), Some(Duration::from_millis(100)));
        assert_eq!(cfg.effective_timeout(Some(20)), Some(Duration::from_millis(20)));
        assert_eq!(cfg.effective_timeout(Some(0)), None);

        let none = PoolConfig::default();
        assert_eq!(none.effective_timeout(None), None);
    }

    #[test]
    fn test_shared_fs_mount_defaults() {
        let cfg = PoolConfig { variant: Variant::SharedFs, ..Default::default() };
        assert_eq!(cfg.init_options().shared_fs_mount.as_deref(), Some(DEFAULT_SHARED_FS_MOUNT));

        let single = PoolConfig { shared_fs_mount: Some("/x".into()), ..Default::default() };
        assert_eq!(single.init_options().shared_fs_mount, None);
    }

    #[test]
    fn test_load_file_reads_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "pool_size = 2\ndefault_timeout_ms = 250\nvariant = \"shared-fs\"\n\
             bootstrap_source = \"globalThis.x = 1\"\n\n[context_options]\nmemoryLimit = 1024"
        )
        .unwrap();
        let cfg = load_file(file.path()).unwrap();
        assert_eq!(cfg.pool_size, 2);
        assert_eq!(cfg.default_timeout_ms, 250);
        assert_eq!(cfg.variant, Variant::SharedFs);
        assert_eq!(cfg.bootstrap_source.as_deref(), Some("globalThis.x = 1"));
        assert_eq!(cfg.context_options.0["memoryLimit"], 1024);
    }

    #[test]
    fn test_load_file_validates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "pool_size = 0").unwrap();
        assert!(matches!(load_file(file.path()), Err(ConfigError::Invalid(_))));
    }
}
