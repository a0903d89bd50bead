//! CLI error types with miette diagnostics.
//!
//! Maps `CoreError` and `ConfigError` into user-facing errors with
//! actionable help text.

use miette::Diagnostic;
use thiserror::Error;

use dsync_config::ConfigError;
use dsync_core::{BusError, CoreError};

pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const NOT_FOUND: i32 = 4;
    pub const PERMISSION: i32 = 5;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Bus ──────────────────────────────────────────────────────────

    #[error("No bus topology configured")]
    #[diagnostic(
        code(dsync::no_topology),
        help(
            "Pass one with --topology <file.json>\n\
             or set [bus].topology in {path}"
        )
    )]
    NoTopology { path: String },

    #[error("Could not read bus topology from {path}")]
    #[diagnostic(
        code(dsync::topology),
        help("The file must be a JSON object with a \"nodes\" array.")
    )]
    Topology {
        path: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Bus error: {0}")]
    #[diagnostic(code(dsync::bus))]
    Bus(BusError),

    // ── Engine ───────────────────────────────────────────────────────

    #[error("{entity_type} '{identifier}' not found")]
    #[diagnostic(code(dsync::not_found))]
    NotFound {
        entity_type: String,
        identifier: String,
    },

    #[error("Operation '{operation}' is not permitted")]
    #[diagnostic(code(dsync::permission_denied))]
    PermissionDenied { operation: String },

    #[error("Engine error: {message}")]
    #[diagnostic(code(dsync::engine))]
    Engine { message: String },

    #[error("Timed out after {seconds}s waiting for {what}")]
    #[diagnostic(
        code(dsync::timeout),
        help("Increase the limit with --timeout or check that every bus node answers.")
    )]
    Timeout { what: String, seconds: u64 },

    // ── Configuration ────────────────────────────────────────────────

    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(dsync::validation))]
    Validation { field: String, reason: String },

    #[error("Configuration file already exists: {path}")]
    #[diagnostic(code(dsync::config_exists), help("Use --force to overwrite it."))]
    ConfigExists { path: String },

    #[error(transparent)]
    #[diagnostic(code(dsync::config))]
    Config(ConfigError),

    // ── IO / Serialization ────────────────────────────────────────────

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Failed to encode output: {0}")]
    #[diagnostic(code(dsync::json))]
    Json(#[from] serde_json::Error),

    #[error("Failed to encode config: {0}")]
    #[diagnostic(code(dsync::toml))]
    Toml(#[from] toml::ser::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Bus(_) => exit_code::CONNECTION,
            Self::NotFound { .. } => exit_code::NOT_FOUND,
            Self::PermissionDenied { .. } => exit_code::PERMISSION,
            Self::Timeout { .. } => exit_code::TIMEOUT,
            Self::NoTopology { .. }
            | Self::Validation { .. }
            | Self::ConfigExists { .. }
            | Self::Config(_) => exit_code::USAGE,
            _ => exit_code::GENERAL,
        }
    }
}

// ── Conversions ──────────────────────────────────────────────────────

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Validation { field, reason } => Self::Validation { field, reason },
            ConfigError::Io(e) => Self::Io(e),
            other => Self::Config(other),
        }
    }
}

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Bus(e) => Self::Bus(e),
            CoreError::NotFound {
                entity_type,
                identifier,
            } => Self::NotFound {
                entity_type: entity_type.to_string(),
                identifier,
            },
            CoreError::PermissionDenied { operation } => Self::PermissionDenied { operation },
            CoreError::Config { message } => Self::Validation {
                field: "engine".into(),
                reason: message,
            },
            other => Self::Engine {
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_errors_keep_their_exit_codes() {
        let bus: CliError = CoreError::Bus(BusError::Timeout).into();
        assert_eq!(bus.exit_code(), exit_code::CONNECTION);

        let denied: CliError = CoreError::PermissionDenied {
            operation: "lock".into(),
        }
        .into();
        assert_eq!(denied.exit_code(), exit_code::PERMISSION);

        let internal: CliError = CoreError::Internal("boom".into()).into();
        assert_eq!(internal.exit_code(), exit_code::GENERAL);
    }
}
