//! Runtime defaults and per-context scheduling configuration.
//!
//! # Configuration precedence
//!
//! [`RuntimeConfig`] values are resolved in this order (highest first):
//!
//! 1. **Programmatic**: fields set directly on the struct
//! 2. **Environment**: `TASKCTX_*` variables, see [`RuntimeConfig::apply_env_overrides`]
//! 3. **Config file**: a TOML file (requires the `config-file` feature)
//! 4. **Defaults**: [`RuntimeConfig::default()`]
//!
//! | Variable | Type | Field |
//! |----------|------|-------|
//! | `TASKCTX_WINDOW_SIZE` | `usize` | `initial_task_window_size` |
//! | `TASKCTX_WINDOW_HYSTERESIS` | `u32` | `initial_task_window_hysteresis` |
//! | `TASKCTX_MIN_TASKS_TO_SCHEDULE` | `usize` | `initial_tasks_to_schedule` |
//! | `TASKCTX_WORKER_THREADS` | `usize` | `worker_threads` |
//!
//! [`ContextConfiguration`] is what a mapper returns for one context. It is
//! seeded from the runtime defaults and validated by
//! [`ContextConfiguration::validate`].

use crate::types::AddressSpace;
use thiserror::Error;

/// Environment variable for the default window size.
pub const ENV_WINDOW_SIZE: &str = "TASKCTX_WINDOW_SIZE";
/// Environment variable for the default window hysteresis percentage.
pub const ENV_WINDOW_HYSTERESIS: &str = "TASKCTX_WINDOW_HYSTERESIS";
/// Environment variable for the default minimum tasks to schedule.
pub const ENV_MIN_TASKS_TO_SCHEDULE: &str = "TASKCTX_MIN_TASKS_TO_SCHEDULE";
/// Environment variable for the worker pool size.
pub const ENV_WORKER_THREADS: &str = "TASKCTX_WORKER_THREADS";

/// Error building a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A variable or file value could not be parsed.
    #[error("invalid value for {name}: {detail}")]
    InvalidValue {
        /// Variable or key name.
        name: String,
        /// What went wrong.
        detail: String,
    },
    /// The hysteresis percentage was above 100.
    #[error("window hysteresis must be at most 100 percent, got {0}")]
    HysteresisOutOfRange(u32),
    /// `local_space` is not below `total_spaces`.
    #[error("local address space {local} is outside a runtime of {total} spaces")]
    SpaceOutOfRange {
        /// Local space.
        local: u32,
        /// Total spaces.
        total: u32,
    },
    /// The config file could not be read or parsed.
    #[error("config file: {0}")]
    File(String),
}

/// Process-wide defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// The process this runtime instance runs on.
    pub local_space: AddressSpace,
    /// Number of processes in the runtime.
    pub total_spaces: u32,
    /// Default maximum number of outstanding children per context.
    pub initial_task_window_size: usize,
    /// Default percentage of the window the count must drain to before a
    /// blocked registration resumes.
    pub initial_task_window_hysteresis: u32,
    /// Default minimum number of pending tasks before a context stops being
    /// scheduled.
    pub initial_tasks_to_schedule: usize,
    /// Worker threads for the default meta-task pool.
    pub worker_threads: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            local_space: AddressSpace::new(0),
            total_spaces: 1,
            initial_task_window_size: 1024,
            initial_task_window_hysteresis: 25,
            initial_tasks_to_schedule: 1,
            worker_threads: 2,
        }
    }
}

impl RuntimeConfig {
    /// Defaults for process `local` in a runtime of `total` processes.
    #[must_use]
    pub fn for_space(local: u32, total: u32) -> Self {
        Self {
            local_space: AddressSpace::new(local),
            total_spaces: total,
            ..Self::default()
        }
    }

    /// Checks ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_task_window_hysteresis > 100 {
            return Err(ConfigError::HysteresisOutOfRange(
                self.initial_task_window_hysteresis,
            ));
        }
        if self.local_space.as_u32() >= self.total_spaces {
            return Err(ConfigError::SpaceOutOfRange {
                local: self.local_space.as_u32(),
                total: self.total_spaces,
            });
        }
        Ok(())
    }

    /// Applies `TASKCTX_*` environment overrides that are set.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(val) = read_env(ENV_WINDOW_SIZE) {
            self.initial_task_window_size = parse_usize(ENV_WINDOW_SIZE, &val)?;
        }
        if let Some(val) = read_env(ENV_WINDOW_HYSTERESIS) {
            self.initial_task_window_hysteresis = parse_u32(ENV_WINDOW_HYSTERESIS, &val)?;
        }
        if let Some(val) = read_env(ENV_MIN_TASKS_TO_SCHEDULE) {
            self.initial_tasks_to_schedule = parse_usize(ENV_MIN_TASKS_TO_SCHEDULE, &val)?;
        }
        if let Some(val) = read_env(ENV_WORKER_THREADS) {
            self.worker_threads = parse_usize(ENV_WORKER_THREADS, &val)?;
        }
        self.validate()
    }
}

fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn parse_usize(name: &str, val: &str) -> Result<usize, ConfigError> {
    val.trim()
        .parse::<usize>()
        .map_err(|e| ConfigError::InvalidValue {
            name: name.to_string(),
            detail: format!("expected unsigned integer, got {val:?} ({e})"),
        })
}

fn parse_u32(name: &str, val: &str) -> Result<u32, ConfigError> {
    val.trim()
        .parse::<u32>()
        .map_err(|e| ConfigError::InvalidValue {
            name: name.to_string(),
            detail: format!("expected u32, got {val:?} ({e})"),
        })
}

// =========================================================================
// TOML config file support (feature-gated)
// =========================================================================

/// TOML layout of [`RuntimeConfig`].
///
/// ```toml
/// [runtime]
/// local_space = 0
/// total_spaces = 4
/// worker_threads = 2
///
/// [window]
/// size = 512
/// hysteresis = 50
/// min_tasks_to_schedule = 2
/// ```
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
pub struct RuntimeTomlConfig {
    /// Process layout.
    #[serde(default)]
    pub runtime: RuntimeToml,
    /// Window defaults.
    #[serde(default)]
    pub window: WindowToml,
}

/// `[runtime]` table.
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
pub struct RuntimeToml {
    /// Local process.
    pub local_space: Option<u32>,
    /// Process count.
    pub total_spaces: Option<u32>,
    /// Worker threads.
    pub worker_threads: Option<usize>,
}

/// `[window]` table.
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
pub struct WindowToml {
    /// Window size.
    pub size: Option<usize>,
    /// Hysteresis percentage.
    pub hysteresis: Option<u32>,
    /// Minimum tasks to schedule.
    pub min_tasks_to_schedule: Option<usize>,
}

#[cfg(feature = "config-file")]
impl RuntimeConfig {
    /// Overrides fields present in `toml`.
    pub fn apply_toml(&mut self, toml: &RuntimeTomlConfig) {
        if let Some(v) = toml.runtime.local_space {
            self.local_space = AddressSpace::new(v);
        }
        if let Some(v) = toml.runtime.total_spaces {
            self.total_spaces = v;
        }
        if let Some(v) = toml.runtime.worker_threads {
            self.worker_threads = v;
        }
        if let Some(v) = toml.window.size {
            self.initial_task_window_size = v;
        }
        if let Some(v) = toml.window.hysteresis {
            self.initial_task_window_hysteresis = v;
        }
        if let Some(v) = toml.window.min_tasks_to_schedule {
            self.initial_tasks_to_schedule = v;
        }
    }

    /// Loads defaults, then the file at `path`, then the environment.
    pub fn from_toml_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::File(format!("failed to read {}: {e}", path.display())))?;
        let parsed: RuntimeTomlConfig =
            toml::from_str(&content).map_err(|e| ConfigError::File(e.to_string()))?;
        let mut config = Self::default();
        config.apply_toml(&parsed);
        config.apply_env_overrides()?;
        Ok(config)
    }
}

/// Scheduling configuration for one context, as chosen by its mapper.
///
/// Exactly one of `min_tasks_to_schedule` and `min_frames_to_schedule` is
/// nonzero after validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextConfiguration {
    /// Maximum outstanding children before registration blocks. Zero disables
    /// the window.
    pub max_window_size: usize,
    /// Percentage of the window to drain to before unblocking.
    pub hysteresis_percentage: u32,
    /// Maximum frames in flight. Zero disables frame pipelining.
    pub max_outstanding_frames: usize,
    /// Task-count scheduling threshold.
    pub min_tasks_to_schedule: usize,
    /// Frame-count scheduling threshold.
    pub min_frames_to_schedule: usize,
}

impl ContextConfiguration {
    /// Seeds a configuration from the runtime defaults.
    #[must_use]
    pub const fn from_runtime(config: &RuntimeConfig) -> Self {
        Self {
            max_window_size: config.initial_task_window_size,
            hysteresis_percentage: config.initial_task_window_hysteresis,
            max_outstanding_frames: 0,
            min_tasks_to_schedule: config.initial_tasks_to_schedule,
            min_frames_to_schedule: 0,
        }
    }

    /// Rejects both minimums zero; frames mode clears the task minimum.
    pub fn validate(mut self) -> Result<Self, crate::error::ContextError> {
        if self.min_tasks_to_schedule == 0 && self.min_frames_to_schedule == 0 {
            return Err(crate::error::ContextError::new(
                crate::error::ErrorKind::InvalidContextConfiguration,
                "mapper specified zero for both min_tasks_to_schedule and min_frames_to_schedule",
            ));
        }
        if self.min_frames_to_schedule > 0 {
            self.min_tasks_to_schedule = 0;
        }
        if self.hysteresis_percentage > 100 {
            self.hysteresis_percentage = 100;
        }
        Ok(self)
    }

    /// Count at or below which a blocked window registration resumes.
    #[must_use]
    pub const fn hysteresis_threshold(&self) -> usize {
        self.hysteresis_percentage as usize * self.max_window_size / 100
    }
}

impl Default for ContextConfiguration {
    fn default() -> Self {
        Self::from_runtime(&RuntimeConfig::default())
    }
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use parking_lot::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_validate() {
        assert!(RuntimeConfig::default().validate().is_ok());
        let cfg = ContextConfiguration::default();
        assert_eq!(cfg.max_window_size, 1024);
        assert_eq!(cfg.hysteresis_threshold(), 256);
    }

    #[test]
    fn both_minimums_zero_is_rejected() {
        let cfg = ContextConfiguration {
            min_tasks_to_schedule: 0,
            min_frames_to_schedule: 0,
            ..ContextConfiguration::default()
        };
        let err = cfg.validate().expect_err("must reject");
        assert_eq!(err.kind(), ErrorKind::InvalidContextConfiguration);
    }

    #[test]
    fn frames_mode_clears_task_minimum() {
        let cfg = ContextConfiguration {
            min_tasks_to_schedule: 4,
            min_frames_to_schedule: 2,
            ..ContextConfiguration::default()
        }
        .validate()
        .expect("valid");
        assert_eq!(cfg.min_tasks_to_schedule, 0);
        assert_eq!(cfg.min_frames_to_schedule, 2);
    }

    #[test]
    fn space_range_checked() {
        let cfg = RuntimeConfig::for_space(3, 2);
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::SpaceOutOfRange { local: 3, total: 2 })
        );
    }

    #[test]
    fn env_overrides_apply() {
        let _guard = ENV_LOCK.lock();
        // SAFETY: env mutation is serialized by ENV_LOCK within this test module.
        unsafe {
            std::env::set_var(ENV_WINDOW_SIZE, "64");
            std::env::set_var(ENV_WINDOW_HYSTERESIS, "50");
        }
        let mut cfg = RuntimeConfig::default();
        let result = cfg.apply_env_overrides();
        unsafe {
            std::env::remove_var(ENV_WINDOW_SIZE);
            std::env::remove_var(ENV_WINDOW_HYSTERESIS);
        }
        result.expect("overrides");
        assert_eq!(cfg.initial_task_window_size, 64);
        assert_eq!(cfg.initial_task_window_hysteresis, 50);
    }

    #[test]
    fn bad_env_value_reports_variable() {
        let _guard = ENV_LOCK.lock();
        unsafe {
            std::env::set_var(ENV_WORKER_THREADS, "many");
        }
        let mut cfg = RuntimeConfig::default();
        let result = cfg.apply_env_overrides();
        unsafe {
            std::env::remove_var(ENV_WORKER_THREADS);
        }
        match result {
            Err(ConfigError::InvalidValue { name, .. }) => assert_eq!(name, ENV_WORKER_THREADS),
            other => panic!("expected InvalidValue, got {other:?}"),
        }
    }

    #[cfg(feature = "config-file")]
    #[test]
    fn toml_file_then_environment() {
        use std::io::Write;

        let _guard = ENV_LOCK.lock();
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            "[runtime]\nlocal_space = 1\ntotal_spaces = 4\n\n[window]\nsize = 512\nhysteresis = 50"
        )
        .expect("write config");
        unsafe {
            std::env::set_var(ENV_WINDOW_SIZE, "128");
        }
        let result = RuntimeConfig::from_toml_file(file.path());
        unsafe {
            std::env::remove_var(ENV_WINDOW_SIZE);
        }
        let cfg = result.expect("config loads");
        assert_eq!(cfg.local_space, AddressSpace::new(1));
        assert_eq!(cfg.total_spaces, 4);
        assert_eq!(cfg.initial_task_window_hysteresis, 50);
        assert_eq!(cfg.initial_task_window_size, 128);
    }

    #[cfg(feature = "config-file")]
    #[test]
    fn unreadable_file_is_a_config_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        let missing = dir.path().join("absent.toml");
        assert!(matches!(
            RuntimeConfig::from_toml_file(&missing),
            Err(ConfigError::File(_))
        ));
    }
}
