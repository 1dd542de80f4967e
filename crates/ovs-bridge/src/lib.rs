//! ovs-bridge: container port management on Open vSwitch bridges
//!
//! Built on the `ovs-ovsdb` client. Ports created here carry an ownership
//! marker in `external_ids` so that a plugin only ever deletes its own ports.

pub mod config;
pub mod driver;
pub mod error;
pub mod model;

pub use config::{DriverConfig, TlsFiles, DEFAULT_OWNER};
pub use driver::{
    BridgeDriver, OvsDriver, PortRequest, CONT_IFACE_KEY, CONT_NETNS_KEY, IFACE_ID_KEY, OWNER_KEY,
};
pub use error::{DriverError, Result};
pub use model::{open_vswitch_model, Bridge, Interface, Port};

/// Prelude for convenient imports
pub mod prelude {
    pub use super::config::DriverConfig;
    pub use super::driver::{BridgeDriver, OvsDriver, PortRequest};
    pub use super::error::{DriverError, Result};
}
