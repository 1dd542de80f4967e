//! ovs-ovsdb: RFC7047 OVSDB client
//!
//! This crate provides:
//! - Schema model with extended column types
//! - Wire codec for atoms, sets, maps and uuid references
//! - Model mapper for rows, conditions, mutations and monitor requests
//! - JSON-RPC client over Unix, TCP and TLS transports
//! - Notification handlers and a monitor-fed table cache

pub mod cache;
pub mod client;
pub mod codec;
pub mod config;
pub mod datum;
pub mod error;
pub mod handler;
pub mod mapper;
pub mod operation;
pub mod protocol;
pub mod schema;
pub mod tls;
pub mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use cache::TableCache;
pub use client::{ConnectionState, OvsdbClient};
pub use config::{ClientConfig, DatabaseModel, DEFAULT_ENDPOINT, DEFAULT_TIMEOUT, OPEN_VSWITCH_DB};
pub use datum::{from_column, Atom, Datum, FromDatum, IntoDatum, Row, UuidRef};
pub use error::{OvsdbError, Result};
pub use handler::{HandlerId, NotificationHandler};
pub use mapper::{Mapper, Model};
pub use operation::{
    Condition, ConditionFunction, MonitorRequest, MonitorSelect, Mutation, Mutator, Operation,
    OperationKind, OperationResult, RowUpdate, TableUpdates,
};
pub use schema::{AtomicType, ColumnSchema, DatabaseSchema, ExtendedType, TableSchema};
pub use transport::Endpoint;

/// Prelude for convenient imports
pub mod prelude {
    pub use super::client::OvsdbClient;
    pub use super::config::{ClientConfig, DatabaseModel};
    pub use super::datum::{from_column, Datum, IntoDatum, Row, UuidRef};
    pub use super::error::{OvsdbError, Result};
    pub use super::handler::NotificationHandler;
    pub use super::mapper::{Mapper, Model};
    pub use super::operation::{Condition, ConditionFunction, Mutator, Operation};
}
