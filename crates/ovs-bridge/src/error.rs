//! Driver error types
//!
//! Wraps client errors and adds the lookup and ownership failures the
//! bridge/port driver reports.

use ovs_ovsdb::OvsdbError;
use thiserror::Error;

/// Bridge/port driver errors
#[derive(Error, Debug)]
pub enum DriverError {
    #[error(transparent)]
    Ovsdb(#[from] OvsdbError),

    // ========================================================================
    // Lookup Errors
    // ========================================================================
    #[error("Bridge '{0}' not found")]
    BridgeNotFound(String),

    #[error("No {table} row matches {condition}")]
    NotFound { table: String, condition: String },

    #[error("{count} {table} rows match {condition}, expected exactly one")]
    Ambiguous {
        table: String,
        count: usize,
        condition: String,
    },

    // ========================================================================
    // Ownership Errors
    // ========================================================================
    #[error("Port '{port}' is owned by {}, not '{expected}'", owner_label(.owner))]
    NotOwner {
        port: String,
        owner: Option<String>,
        expected: String,
    },

    // ========================================================================
    // Request Errors
    // ========================================================================
    #[error("Invalid port request: {0}")]
    InvalidRequest(String),

    #[error("Invalid driver configuration: {0}")]
    Config(String),
}

fn owner_label(owner: &Option<String>) -> String {
    match owner {
        Some(o) => format!("'{}'", o),
        None => "nobody".to_string(),
    }
}

impl DriverError {
    /// Get a helpful suggestion for resolving this error
    pub fn suggestion(&self) -> &'static str {
        match self {
            DriverError::BridgeNotFound(_) => "Create the bridge first: ovs-vsctl add-br <name>",
            DriverError::NotOwner { .. } => {
                "The port was not created by this plugin; remove it with ovs-vsctl del-port"
            }
            DriverError::Ambiguous { .. } => "Inspect duplicates with ovs-vsctl list <table>",
            DriverError::Ovsdb(OvsdbError::ConnectFailed(_)) => {
                "Check that ovsdb-server is running and the endpoint is reachable"
            }
            DriverError::Ovsdb(OvsdbError::Tls(_)) => {
                "Check the CA certificate and client key pair configured for ssl: endpoints"
            }
            DriverError::Ovsdb(e) if e.is_disconnect() => "Reconnect to ovsdb-server and retry",
            _ => "Check ovsdb-server logs for more details",
        }
    }

    /// Returns true if zero rows matched
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            DriverError::NotFound { .. } | DriverError::BridgeNotFound(_)
        )
    }

    /// Returns true if the connection to ovsdb-server is gone
    pub fn is_disconnect(&self) -> bool {
        matches!(self, DriverError::Ovsdb(e) if e.is_disconnect())
    }
}

/// Result type alias using DriverError
pub type Result<T> = std::result::Result<T, DriverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        let err = DriverError::NotFound {
            table: "Port".to_string(),
            condition: "name == veth0".to_string(),
        };
        assert!(err.is_not_found());
        assert!(!err.is_disconnect());
        assert!(DriverError::from(OvsdbError::Disconnected).is_disconnect());
    }

    #[test]
    fn test_not_owner_message() {
        let err = DriverError::NotOwner {
            port: "veth0".to_string(),
            owner: None,
            expected: "ovs-cni.network.kubevirt.io".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Port 'veth0' is owned by nobody, not 'ovs-cni.network.kubevirt.io'"
        );
        assert!(err.suggestion().contains("del-port"));
    }
}
