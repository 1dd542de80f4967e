//! Bridge and port driver
//!
//! [`OvsDriver`] answers database-wide questions (bridge listing, interface
//! health, port lookup). [`BridgeDriver`] is bound to one bridge and owns the
//! port lifecycle: every create or delete is a single three-operation
//! transaction, so a half-built port is never visible.

use ovs_ovsdb::{
    Atom, Condition, ConditionFunction, Datum, Mapper, Model, Mutator, Operation, OvsdbClient,
    UuidRef,
};
use std::collections::BTreeMap;
use std::ops::Deref;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::DriverConfig;
use crate::error::{DriverError, Result};
use crate::model::{open_vswitch_model, Bridge, Interface, Port};

/// `external_ids` key holding the container network namespace path
pub const CONT_NETNS_KEY: &str = "contNetns";
/// `external_ids` key holding the interface name inside the container
pub const CONT_IFACE_KEY: &str = "contIface";
/// `external_ids` key holding the creator's identity
pub const OWNER_KEY: &str = "owner";
/// Interface `external_ids` key read by OVN to bind a logical port
pub const IFACE_ID_KEY: &str = "iface-id";

const NEW_INTERFACE: &str = "new_interface";
const NEW_PORT: &str = "new_port";

const VLAN_MODES: &[&str] = &[
    "access",
    "dot1q-tunnel",
    "native-tagged",
    "native-untagged",
    "trunk",
];
const MAX_VLAN: u16 = 4095;

/// Arguments for [`BridgeDriver::create_port`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortRequest {
    /// Host-side name shared by the Port and Interface rows
    pub intf_name: String,
    pub netns_path: String,
    pub cont_iface: String,
    /// OVN logical port, written as `iface-id`
    pub ovn_port_name: Option<String>,
    /// 0 means untagged
    pub vlan_tag: u16,
    pub trunks: Vec<u16>,
    /// Explicit `vlan_mode`
    pub port_type: Option<String>,
    /// Interface `type`, e.g. `dpdk` or `internal`
    pub interface_type: Option<String>,
    pub ofport_request: Option<u16>,
}

impl PortRequest {
    pub fn new(
        intf_name: impl Into<String>,
        netns_path: impl Into<String>,
        cont_iface: impl Into<String>,
    ) -> Self {
        Self {
            intf_name: intf_name.into(),
            netns_path: netns_path.into(),
            cont_iface: cont_iface.into(),
            ..Default::default()
        }
    }

    pub fn vlan_tag(mut self, tag: u16) -> Self {
        self.vlan_tag = tag;
        self
    }

    pub fn trunks(mut self, trunks: Vec<u16>) -> Self {
        self.trunks = trunks;
        self
    }

    pub fn port_type(mut self, mode: impl Into<String>) -> Self {
        self.port_type = Some(mode.into());
        self
    }

    pub fn ovn_port_name(mut self, name: impl Into<String>) -> Self {
        self.ovn_port_name = Some(name.into());
        self
    }

    pub fn interface_type(mut self, iface_type: impl Into<String>) -> Self {
        self.interface_type = Some(iface_type.into());
        self
    }

    pub fn ofport_request(mut self, ofport: u16) -> Self {
        self.ofport_request = Some(ofport);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.intf_name.is_empty() {
            return Err(DriverError::InvalidRequest("interface name is empty".to_string()));
        }
        if self.vlan_tag > MAX_VLAN {
            return Err(DriverError::InvalidRequest(format!(
                "vlan tag {} out of range 0-{}",
                self.vlan_tag, MAX_VLAN
            )));
        }
        if let Some(trunk) = self.trunks.iter().find(|t| **t > MAX_VLAN) {
            return Err(DriverError::InvalidRequest(format!(
                "trunk {} out of range 0-{}",
                trunk, MAX_VLAN
            )));
        }
        if let Some(mode) = self.port_type.as_deref().filter(|m| !m.is_empty()) {
            if !VLAN_MODES.contains(&mode) {
                return Err(DriverError::InvalidRequest(format!("unknown vlan mode '{}'", mode)));
            }
        }
        Ok(())
    }

    /// `vlan_mode` to write: the explicit mode, else `access` for a tag or
    /// `trunk` for a trunk list
    fn vlan_mode(&self) -> Option<String> {
        let explicit = self.port_type.clone().filter(|m| !m.is_empty());
        if self.vlan_tag != 0 {
            Some(explicit.unwrap_or_else(|| "access".to_string()))
        } else if !self.trunks.is_empty() {
            Some(explicit.unwrap_or_else(|| "trunk".to_string()))
        } else {
            explicit
        }
    }
}

fn owner_ids(netns_path: &str, cont_iface: &str, owner: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (CONT_NETNS_KEY.to_string(), netns_path.to_string()),
        (CONT_IFACE_KEY.to_string(), cont_iface.to_string()),
        (OWNER_KEY.to_string(), owner.to_string()),
    ])
}

/// Database-wide queries
pub struct OvsDriver {
    client: OvsdbClient,
    owner: String,
}

impl OvsDriver {
    /// Connect with the driver's model
    pub async fn connect(config: &DriverConfig) -> Result<Self> {
        let client = OvsdbClient::connect_with(config.client_config()?, open_vswitch_model()).await?;
        Ok(Self::from_client(client, config.owner.clone()))
    }

    /// Wrap an already connected client
    pub fn from_client(client: OvsdbClient, owner: impl Into<String>) -> Self {
        Self {
            client,
            owner: owner.into(),
        }
    }

    pub fn client(&self) -> &OvsdbClient {
        &self.client
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub async fn close(&self) {
        self.client.close().await;
    }

    fn mapper(&self) -> Result<Mapper> {
        Ok(self.client.mapper()?)
    }

    /// Select rows of `M`'s table. An empty `fields` selects every mapped column.
    pub async fn select<M: Model>(&self, conditions: Vec<Condition>, fields: &[&str]) -> Result<Vec<M>> {
        let mapper = self.mapper()?;
        let columns: Vec<String> = if fields.is_empty() {
            M::COLUMNS.iter().map(|c| c.to_string()).collect()
        } else {
            fields.iter().map(|c| c.to_string()).collect()
        };
        let results = self
            .client
            .transact(vec![Operation::select(M::TABLE, conditions).with_columns(columns)])
            .await?;
        let Some(result) = results.first() else {
            return Ok(Vec::new());
        };
        result
            .decoded_rows(mapper.schema(), M::TABLE)?
            .iter()
            .map(|row| mapper.decode::<M>(row).map_err(DriverError::from))
            .collect()
    }

    /// Select exactly one row; zero and several matches are distinct errors
    pub async fn select_one<M: Model>(
        &self,
        conditions: Vec<Condition>,
        fields: &[&str],
    ) -> Result<M> {
        let description = describe(&conditions);
        let mut rows = self.select::<M>(conditions, fields).await?;
        match rows.len() {
            0 => Err(DriverError::NotFound {
                table: M::TABLE.to_string(),
                condition: description,
            }),
            1 => Ok(rows.remove(0)),
            count => Err(DriverError::Ambiguous {
                table: M::TABLE.to_string(),
                count,
                condition: description,
            }),
        }
    }

    fn name_is<M: Model>(&self, name: &str) -> Result<Condition> {
        Ok(self
            .mapper()?
            .condition::<M>("name", ConditionFunction::Equal, Datum::string(name))?)
    }

    /// Names of every bridge
    pub async fn bridge_list(&self) -> Result<Vec<String>> {
        let bridges = self.select::<Bridge>(vec![], &["name"]).await?;
        Ok(bridges.into_iter().map(|b| b.name).collect())
    }

    /// Zero matching rows is `false`, not an error
    pub async fn is_bridge_present(&self, name: &str) -> Result<bool> {
        let condition = self.name_is::<Bridge>(name)?;
        Ok(!self.select::<Bridge>(vec![condition], &["name"]).await?.is_empty())
    }

    /// Interfaces whose `error` column holds a non-empty message
    pub async fn find_interfaces_with_error(&self) -> Result<Vec<String>> {
        let interfaces = self.select::<Interface>(vec![], &["name", "error"]).await?;
        Ok(interfaces
            .into_iter()
            .filter(|i| i.error.as_deref().is_some_and(|e| !e.is_empty()))
            .map(|i| i.name)
            .collect())
    }

    /// Port created by this owner for the given container interface.
    ///
    /// Matches `external_ids` exactly, so ports carrying extra keys are not found.
    pub async fn get_ovs_port_for_cont_iface(
        &self,
        cont_iface: &str,
        netns_path: &str,
    ) -> Result<Option<String>> {
        let ids = owner_ids(netns_path, cont_iface, &self.owner);
        let condition = self.mapper()?.condition::<Port>(
            "external_ids",
            ConditionFunction::Equal,
            Datum::string_map(ids.iter().map(|(k, v)| (k.as_str(), v.as_str()))),
        )?;
        match self.select_one::<Port>(vec![condition], &["name"]).await {
            Ok(port) => Ok(Some(port.name)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// `link_state` of the interface backing `port_name`; empty if unknown
    pub async fn get_of_port_op_state(&self, port_name: &str) -> Result<String> {
        let condition = self.name_is::<Interface>(port_name)?;
        let iface = self
            .select_one::<Interface>(vec![condition], &["name", "link_state"])
            .await?;
        Ok(iface.link_state.unwrap_or_default())
    }

    /// Port names attached to `bridge`, in the bridge's port order
    pub async fn list_bridge_ports(&self, bridge: &str) -> Result<Vec<String>> {
        let condition = self.name_is::<Bridge>(bridge)?;
        let bridge_row = match self
            .select_one::<Bridge>(vec![condition], &["name", "ports"])
            .await
        {
            Err(DriverError::NotFound { .. }) => {
                return Err(DriverError::BridgeNotFound(bridge.to_string()))
            }
            other => other?,
        };
        let names: BTreeMap<Uuid, String> = self
            .select::<Port>(vec![], &["_uuid", "name"])
            .await?
            .into_iter()
            .map(|p| (p.uuid, p.name))
            .collect();
        Ok(bridge_row
            .ports
            .iter()
            .filter_map(UuidRef::as_uuid)
            .filter_map(|u| names.get(&u).cloned())
            .collect())
    }
}

fn describe(conditions: &[Condition]) -> String {
    if conditions.is_empty() {
        return "all rows".to_string();
    }
    conditions
        .iter()
        .map(|c| {
            let function = serde_json::to_value(c.function).unwrap_or_default();
            format!(
                "{} {} {}",
                c.column,
                function.as_str().unwrap_or("?"),
                serde_json::to_string(&c.value).unwrap_or_default()
            )
        })
        .collect::<Vec<_>>()
        .join(" and ")
}

/// Driver bound to one bridge; dereferences to [`OvsDriver`]
pub struct BridgeDriver {
    driver: OvsDriver,
    bridge: String,
}

impl Deref for BridgeDriver {
    type Target = OvsDriver;

    fn deref(&self) -> &OvsDriver {
        &self.driver
    }
}

impl BridgeDriver {
    /// Connect and verify the bridge exists
    pub async fn connect(config: &DriverConfig, bridge: impl Into<String>) -> Result<Self> {
        Self::from_driver(OvsDriver::connect(config).await?, bridge).await
    }

    pub async fn from_driver(driver: OvsDriver, bridge: impl Into<String>) -> Result<Self> {
        let bridge = bridge.into();
        if !driver.is_bridge_present(&bridge).await? {
            driver.close().await;
            return Err(DriverError::BridgeNotFound(bridge));
        }
        Ok(Self { driver, bridge })
    }

    pub fn bridge_name(&self) -> &str {
        &self.bridge
    }

    /// Create the Interface and Port rows and attach the port to the bridge.
    /// Returns the new Port's UUID.
    pub async fn create_port(&self, request: &PortRequest) -> Result<Uuid> {
        request.validate()?;
        let mapper = self.mapper()?;

        let mut iface_ids = BTreeMap::new();
        if let Some(ovn_port) = request.ovn_port_name.as_ref().filter(|p| !p.is_empty()) {
            iface_ids.insert(IFACE_ID_KEY.to_string(), ovn_port.clone());
        }
        let iface = Interface {
            name: request.intf_name.clone(),
            iface_type: request.interface_type.clone().unwrap_or_default(),
            external_ids: iface_ids,
            ofport_request: request.ofport_request.map(i64::from),
            ..Default::default()
        };
        let port = Port {
            name: request.intf_name.clone(),
            interfaces: vec![UuidRef::named(NEW_INTERFACE)],
            external_ids: owner_ids(&request.netns_path, &request.cont_iface, self.owner()),
            tag: (request.vlan_tag != 0).then_some(i64::from(request.vlan_tag)),
            trunks: request.trunks.iter().copied().map(i64::from).collect(),
            vlan_mode: request.vlan_mode(),
            ..Default::default()
        };

        let attach = mapper.mutation::<Bridge>(
            "ports",
            Mutator::Insert,
            Datum::Set(vec![Atom::Uuid(UuidRef::named(NEW_PORT))]),
        )?;
        let operations = vec![
            Operation::insert(Interface::TABLE, mapper.row_from_model(&iface, &[])?)
                .with_uuid_name(NEW_INTERFACE),
            Operation::insert(Port::TABLE, mapper.row_from_model(&port, &[])?)
                .with_uuid_name(NEW_PORT),
            Operation::mutate(Bridge::TABLE, vec![self.name_is::<Bridge>(&self.bridge)?], vec![attach]),
        ];
        debug!("Creating port {} on bridge {}", request.intf_name, self.bridge);
        let results = self.client().transact(operations).await?;

        let port_uuid = results
            .get(1)
            .and_then(|r| r.inserted_uuid())
            .ok_or(ovs_ovsdb::OvsdbError::ResultCountMismatch {
                expected: 3,
                actual: results.len(),
            })?;
        info!(
            "Created port {} ({}) on bridge {} for {}:{}",
            request.intf_name, port_uuid, self.bridge, request.netns_path, request.cont_iface
        );
        Ok(port_uuid)
    }

    /// Remove a port this owner created, together with its interface
    pub async fn delete_port(&self, intf_name: &str) -> Result<()> {
        let mapper = self.mapper()?;
        let port = self
            .select_one::<Port>(
                vec![self.name_is::<Port>(intf_name)?],
                &["_uuid", "name", "external_ids"],
            )
            .await?;
        let owner = port.external_ids.get(OWNER_KEY);
        if owner.map(String::as_str) != Some(self.owner()) {
            return Err(DriverError::NotOwner {
                port: intf_name.to_string(),
                owner: owner.cloned(),
                expected: self.owner().to_string(),
            });
        }

        let detach = mapper.mutation::<Bridge>("ports", Mutator::Delete, Datum::uuid(port.uuid))?;
        let operations = vec![
            Operation::delete(Interface::TABLE, vec![self.name_is::<Interface>(intf_name)?]),
            Operation::delete(Port::TABLE, vec![self.name_is::<Port>(intf_name)?]),
            Operation::mutate(Bridge::TABLE, vec![self.name_is::<Bridge>(&self.bridge)?], vec![detach]),
        ];
        self.client().transact(operations).await?;
        info!("Deleted port {} ({}) from bridge {}", intf_name, port.uuid, self.bridge);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vlan_mode_rules() {
        let base = PortRequest::new("veth0", "/proc/1/ns/net", "eth0");
        assert_eq!(base.vlan_mode(), None);
        assert_eq!(base.clone().vlan_tag(100).vlan_mode().as_deref(), Some("access"));
        assert_eq!(base.clone().trunks(vec![10, 20]).vlan_mode().as_deref(), Some("trunk"));
        assert_eq!(
            base.clone().vlan_tag(100).port_type("native-untagged").vlan_mode().as_deref(),
            Some("native-untagged")
        );
        assert_eq!(base.port_type("").vlan_mode(), None);
    }

    #[test]
    fn test_request_validation() {
        let base = PortRequest::new("veth0", "/proc/1/ns/net", "eth0");
        assert!(base.validate().is_ok());
        assert!(PortRequest::new("", "", "").validate().is_err());
        assert!(base.clone().vlan_tag(4096).validate().is_err());
        assert!(base.clone().trunks(vec![1, 5000]).validate().is_err());
        assert!(base.port_type("hybrid").validate().is_err());
    }

    #[test]
    fn test_describe_conditions() {
        let conditions = vec![Condition::equal("name", Datum::string("br0"))];
        assert_eq!(describe(&conditions), "name == \"br0\"");
        assert_eq!(describe(&[]), "all rows");
    }
}
