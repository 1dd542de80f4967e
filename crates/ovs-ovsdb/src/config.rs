//! Client configuration

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{OvsdbError, Result};
use crate::mapper::Model;
use crate::schema::DatabaseSchema;

/// Default OVSDB endpoint
pub const DEFAULT_ENDPOINT: &str = "unix:/var/run/openvswitch/db.sock";

/// Database served by ovsdb-server for Open vSwitch configuration
pub const OPEN_VSWITCH_DB: &str = "Open_vSwitch";

/// Default timeout for connecting and for each RPC call
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection settings for [`crate::OvsdbClient`]
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Comma-separated `unix:`, `tcp:` or `ssl:` endpoints, tried in order
    pub endpoints: String,
    /// Database to operate on
    pub database: String,
    /// Bound on connecting and on every call
    pub timeout: Duration,
    /// Required for `ssl:` endpoints
    pub tls: Option<Arc<rustls::ClientConfig>>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoints: DEFAULT_ENDPOINT.to_string(),
            database: OPEN_VSWITCH_DB.to_string(),
            timeout: DEFAULT_TIMEOUT,
            tls: None,
        }
    }
}

impl ClientConfig {
    /// Create with a custom endpoint list
    pub fn with_endpoints(endpoints: impl Into<String>) -> Self {
        Self {
            endpoints: endpoints.into(),
            ..Self::default()
        }
    }

    /// Set the database name
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// Set timeout for connect and RPC calls
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the TLS configuration used by `ssl:` endpoints
    pub fn tls(mut self, tls: Arc<rustls::ClientConfig>) -> Self {
        self.tls = Some(tls);
        self
    }
}

/// Tables and columns a consumer maps, checked against the server schema at connect
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatabaseModel {
    tables: BTreeMap<String, Vec<String>>,
}

impl DatabaseModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a model's table and columns
    pub fn with_model<M: Model>(self) -> Self {
        self.table(M::TABLE, M::COLUMNS)
    }

    /// Add a table by name
    pub fn table(mut self, table: &str, columns: &[&str]) -> Self {
        let entry = self.tables.entry(table.to_string()).or_default();
        for column in columns {
            if !entry.iter().any(|c| c == column) {
                entry.push(column.to_string());
            }
        }
        self
    }

    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    pub fn columns(&self, table: &str) -> Option<&[String]> {
        self.tables.get(table).map(Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Every mapped table and column must exist in `schema`
    pub fn validate(&self, schema: &DatabaseSchema) -> Result<()> {
        let mut missing = Vec::new();
        for (table, columns) in &self.tables {
            let Some(table_schema) = schema.table(table) else {
                missing.push(format!("table '{}'", table));
                continue;
            };
            for column in columns {
                if table_schema.column(column).is_none() {
                    missing.push(format!("column '{}.{}'", table, column));
                }
            }
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(OvsdbError::ModelMismatch(format!(
                "schema '{}' lacks {}",
                schema.name,
                missing.join(", ")
            )))
        }
    }
}
