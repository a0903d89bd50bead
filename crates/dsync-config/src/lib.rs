//! Configuration for the dsync daemon.
//!
//! A TOML file merged with `DSYNC_`-prefixed environment variables, and
//! translation to `dsync_core::EngineConfig`. Durations are written the
//! humantime way (`"2s"`, `"250ms"`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use dsync_core::EngineConfig;

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineSection,

    #[serde(default)]
    pub bus: BusSection,
}

/// `[engine]`: timing and sizing of the synchronization engine.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct EngineSection {
    #[serde(default = "default_event_timeout")]
    pub event_timeout: String,

    #[serde(default = "default_window")]
    pub scene_window: String,

    #[serde(default = "default_window")]
    pub button_window: String,

    #[serde(default = "default_meter_sync_interval")]
    pub meter_sync_interval: String,

    #[serde(default = "default_barrier_timeout")]
    pub barrier_timeout: String,

    #[serde(default = "default_task_workers")]
    pub task_workers: usize,

    #[serde(default = "default_task_retries")]
    pub task_retries: u32,

    #[serde(default = "default_window")]
    pub task_retry_delay: String,

    #[serde(default = "default_event_timeout")]
    pub save_delay: String,

    #[serde(default = "default_save_retry_delay")]
    pub save_retry_delay: String,

    /// Apartment snapshot file. Unset disables persistence.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_path: Option<PathBuf>,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            event_timeout: default_event_timeout(),
            scene_window: default_window(),
            button_window: default_window(),
            meter_sync_interval: default_meter_sync_interval(),
            barrier_timeout: default_barrier_timeout(),
            task_workers: default_task_workers(),
            task_retries: default_task_retries(),
            task_retry_delay: default_window(),
            save_delay: default_event_timeout(),
            save_retry_delay: default_save_retry_delay(),
            snapshot_path: None,
        }
    }
}

fn default_event_timeout() -> String {
    "1s".into()
}
fn default_window() -> String {
    "2s".into()
}
fn default_meter_sync_interval() -> String {
    "10s".into()
}
fn default_barrier_timeout() -> String {
    "60s".into()
}
fn default_task_workers() -> usize {
    4
}
fn default_task_retries() -> u32 {
    3
}
fn default_save_retry_delay() -> String {
    "10s".into()
}

/// `[bus]`: where the bus client comes from.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BusSection {
    /// JSON topology served by the in-memory bus.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topology: Option<PathBuf>,
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("org", "dsync", "dsync").map_or_else(
        || PathBuf::from(".").join("dsync.toml"),
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the config from the canonical path plus environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load the config from `path` plus environment. A missing file yields
/// the defaults. Nested keys use a double underscore:
/// `DSYNC_ENGINE__SCENE_WINDOW=500ms`.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("DSYNC_").split("__"));

    let config: Config = figment.extract()?;
    Ok(config)
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write it to `path`.
pub fn save_config(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

// ── Translation ─────────────────────────────────────────────────────

fn duration(field: &str, value: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(value).map_err(|e| ConfigError::Validation {
        field: format!("engine.{field}"),
        reason: format!("'{value}': {e}"),
    })
}

impl EngineSection {
    /// Build the engine's runtime configuration.
    pub fn to_engine_config(&self) -> Result<EngineConfig, ConfigError> {
        if self.task_workers == 0 {
            return Err(ConfigError::Validation {
                field: "engine.task_workers".into(),
                reason: "must be at least 1".into(),
            });
        }

        Ok(EngineConfig {
            event_timeout: duration("event_timeout", &self.event_timeout)?,
            scene_window: duration("scene_window", &self.scene_window)?,
            button_window: duration("button_window", &self.button_window)?,
            meter_sync_interval: duration("meter_sync_interval", &self.meter_sync_interval)?,
            barrier_timeout: duration("barrier_timeout", &self.barrier_timeout)?,
            task_workers: self.task_workers,
            task_retries: self.task_retries,
            task_retry_delay: duration("task_retry_delay", &self.task_retry_delay)?,
            save_delay: duration("save_delay", &self.save_delay)?,
            save_retry_delay: duration("save_retry_delay", &self.save_retry_delay)?,
            snapshot_path: self.snapshot_path.clone(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use figment::Jail;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_match_the_engine_defaults() {
        let engine = EngineSection::default().to_engine_config().unwrap();
        assert_eq!(engine, EngineConfig::default());
    }

    #[test]
    fn file_and_environment_are_merged() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "dsync.toml",
                r#"
                    [engine]
                    scene_window = "500ms"
                    task_workers = 2
                    snapshot_path = "/var/lib/dsync/apartment.json"

                    [bus]
                    topology = "bus.json"
                "#,
            )?;
            jail.set_env("DSYNC_ENGINE__TASK_WORKERS", "8");

            let config = load_config_from(Path::new("dsync.toml")).map_err(|e| e.to_string())?;
            let engine = config.engine.to_engine_config().map_err(|e| e.to_string())?;
            assert_eq!(engine.scene_window, Duration::from_millis(500));
            assert_eq!(engine.task_workers, 8);
            assert_eq!(engine.button_window, Duration::from_secs(2));
            assert_eq!(
                engine.snapshot_path,
                Some(PathBuf::from("/var/lib/dsync/apartment.json"))
            );
            assert_eq!(config.bus.topology, Some(PathBuf::from("bus.json")));
            Ok(())
        });
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.engine, EngineSection::default());
    }

    #[test]
    fn bad_durations_name_the_field() {
        let section = EngineSection {
            barrier_timeout: "soon".into(),
            ..EngineSection::default()
        };
        let err = section.to_engine_config().unwrap_err();
        assert!(err.to_string().contains("engine.barrier_timeout"));
    }

    #[test]
    fn saved_config_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");
        let mut cfg = Config::default();
        cfg.engine.meter_sync_interval = "30s".into();
        save_config(&cfg, &path).unwrap();

        let loaded = load_config_from(&path).unwrap();
        assert_eq!(loaded.engine.meter_sync_interval, "30s");
    }
}
