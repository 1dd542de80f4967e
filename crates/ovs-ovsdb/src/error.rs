//! Error types for the OVSDB client stack

use thiserror::Error;

use crate::handler::HandlerId;
use crate::operation::OperationKind;

/// Errors raised by schema handling, the wire codec, the mapper and the RPC client
#[derive(Error, Debug)]
pub enum OvsdbError {
    // ========================================================================
    // Schema Errors
    // ========================================================================
    #[error("Unknown table: {0}")]
    UnknownTable(String),

    #[error("Unknown column '{column}' in table '{table}'")]
    UnknownColumn { table: String, column: String },

    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("Model does not match server schema: {0}")]
    ModelMismatch(String),

    // ========================================================================
    // Codec / Mapper Errors
    // ========================================================================
    #[error("Invalid value for column '{column}': {message}")]
    InvalidValue { column: String, message: String },

    #[error("Invalid condition on column '{column}': {message}")]
    InvalidCondition { column: String, message: String },

    #[error("Invalid mutation on column '{column}': {message}")]
    InvalidMutation { column: String, message: String },

    #[error("No usable index on table '{0}': every index has a column with a default value")]
    NoValidIndex(String),

    // ========================================================================
    // Transport Errors
    // ========================================================================
    #[error("Invalid endpoint '{0}': expected unix:<path>, tcp:<host:port> or ssl:<host:port>")]
    InvalidEndpoint(String),

    #[error("Failed to connect to any OVSDB endpoint: {}", .0.join("; "))]
    ConnectFailed(Vec<String>),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Not connected to OVSDB")]
    NotConnected,

    #[error("OVSDB connection closed")]
    Disconnected,

    #[error("Timeout waiting for '{0}' response")]
    Timeout(String),

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    #[error("OVSDB '{method}' failed: {error}")]
    Rpc {
        method: String,
        error: serde_json::Value,
    },

    #[error("Database '{0}' not served by OVSDB server")]
    DatabaseNotFound(String),

    #[error("OVSDB returned {actual} results for {expected} operations")]
    ResultCountMismatch { expected: usize, actual: usize },

    #[error("Operation {index} ({op} on '{table}') failed: {error}{}", details_suffix(.details))]
    OperationFailed {
        index: usize,
        op: OperationKind,
        table: String,
        error: String,
        details: Option<String>,
    },

    #[error("Transaction commit failed: {error}{}", details_suffix(.details))]
    CommitFailed {
        error: String,
        details: Option<String>,
    },

    #[error("Unknown monitor: {0}")]
    UnknownMonitor(String),

    #[error("Handler {0} is not registered")]
    HandlerNotRegistered(HandlerId),
}

fn details_suffix(details: &Option<String>) -> String {
    match details {
        Some(d) if !d.is_empty() => format!(" ({})", d),
        _ => String::new(),
    }
}

impl OvsdbError {
    pub(crate) fn invalid_value(column: &str, message: impl Into<String>) -> Self {
        OvsdbError::InvalidValue {
            column: column.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn invalid_condition(column: &str, message: impl Into<String>) -> Self {
        OvsdbError::InvalidCondition {
            column: column.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn invalid_mutation(column: &str, message: impl Into<String>) -> Self {
        OvsdbError::InvalidMutation {
            column: column.to_string(),
            message: message.into(),
        }
    }

    /// Returns true if the error was raised locally before any wire traffic
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            OvsdbError::UnknownTable(_)
                | OvsdbError::UnknownColumn { .. }
                | OvsdbError::InvalidSchema(_)
                | OvsdbError::InvalidValue { .. }
                | OvsdbError::InvalidCondition { .. }
                | OvsdbError::InvalidMutation { .. }
                | OvsdbError::NoValidIndex(_)
                | OvsdbError::InvalidEndpoint(_)
        )
    }

    /// Returns true if the connection is gone and the client must reconnect
    pub fn is_disconnect(&self) -> bool {
        matches!(self, OvsdbError::NotConnected | OvsdbError::Disconnected)
    }
}

/// Result type alias using OvsdbError
pub type Result<T> = std::result::Result<T, OvsdbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_failed_lists_attempts() {
        let err = OvsdbError::ConnectFailed(vec![
            "unix:/nope: No such file".to_string(),
            "tcp:127.0.0.1:1: refused".to_string(),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("unix:/nope"));
        assert!(msg.contains("tcp:127.0.0.1:1"));
    }

    #[test]
    fn test_operation_failed_names_table() {
        let err = OvsdbError::OperationFailed {
            index: 1,
            op: OperationKind::Insert,
            table: "Port".to_string(),
            error: "constraint violation".to_string(),
            details: Some("duplicate name".to_string()),
        };
        let msg = err.to_string();
        assert!(msg.contains("insert on 'Port'"));
        assert!(msg.contains("(duplicate name)"));
    }

    #[test]
    fn test_error_classes() {
        assert!(OvsdbError::UnknownTable("x".into()).is_local());
        assert!(!OvsdbError::Disconnected.is_local());
        assert!(OvsdbError::NotConnected.is_disconnect());
    }
}
