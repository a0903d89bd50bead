// ── Core error types ──
//
// Errors surfaced by the engine. Bus transport failures arrive as
// `BusError` and are folded into `CoreError::Bus`; everything the
// dispatcher catches at its per-event boundary is a `CoreError`.

use thiserror::Error;

use crate::model::Dsuid;

/// Transport-level failure reported by a bus client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("bus request timed out")]
    Timeout,

    #[error("bus node {node} unreachable")]
    Unreachable { node: Dsuid },

    #[error("bus protocol error: {message}")]
    Protocol { message: String },

    #[error("bus request rejected: {message}")]
    Rejected { message: String },
}

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Bus errors ───────────────────────────────────────────────────
    #[error("transient bus fault: {0}")]
    Bus(#[from] BusError),

    // ── Data errors ──────────────────────────────────────────────────
    #[error("{entity_type} not found: {identifier}")]
    NotFound {
        entity_type: &'static str,
        identifier: String,
    },

    #[error("permission denied: {operation}")]
    PermissionDenied { operation: String },

    #[error("malformed {kind} event: {reason}")]
    MalformedEvent { kind: &'static str, reason: String },

    // ── Persistence errors ───────────────────────────────────────────
    #[error("persistence failed: {message}")]
    Persistence { message: String },

    // ── Configuration errors ─────────────────────────────────────────
    #[error("configuration error: {message}")]
    Config { message: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub(crate) fn not_found(entity_type: &'static str, identifier: impl ToString) -> Self {
        Self::NotFound {
            entity_type,
            identifier: identifier.to_string(),
        }
    }

    /// Whether the failure is expected to clear up on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Bus(_) | Self::Persistence { .. })
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Persistence {
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Persistence {
            message: err.to_string(),
        }
    }
}
