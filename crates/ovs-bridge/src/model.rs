//! Typed rows of the Open_vSwitch tables the driver touches

use ovs_ovsdb::{from_column, DatabaseModel, Datum, IntoDatum, Model, UuidRef};
use std::collections::BTreeMap;
use uuid::Uuid;

/// `Bridge` table
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bridge {
    pub uuid: Uuid,
    pub name: String,
    pub ports: Vec<UuidRef>,
    pub external_ids: BTreeMap<String, String>,
    pub datapath_type: String,
}

impl Model for Bridge {
    const TABLE: &'static str = "Bridge";
    const COLUMNS: &'static [&'static str] =
        &["_uuid", "name", "ports", "external_ids", "datapath_type"];

    fn column(&self, column: &str) -> Option<Datum> {
        Some(match column {
            "_uuid" => self.uuid.into_datum(),
            "name" => self.name.clone().into_datum(),
            "ports" => self.ports.clone().into_datum(),
            "external_ids" => self.external_ids.clone().into_datum(),
            "datapath_type" => self.datapath_type.clone().into_datum(),
            _ => return None,
        })
    }

    fn set_column(&mut self, column: &str, value: Datum) -> ovs_ovsdb::Result<()> {
        match column {
            "_uuid" => self.uuid = from_column(column, value)?,
            "name" => self.name = from_column(column, value)?,
            "ports" => self.ports = from_column(column, value)?,
            "external_ids" => self.external_ids = from_column(column, value)?,
            "datapath_type" => self.datapath_type = from_column(column, value)?,
            _ => {}
        }
        Ok(())
    }
}

/// `Port` table
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Port {
    pub uuid: Uuid,
    pub name: String,
    pub interfaces: Vec<UuidRef>,
    pub external_ids: BTreeMap<String, String>,
    pub tag: Option<i64>,
    pub trunks: Vec<i64>,
    pub vlan_mode: Option<String>,
}

impl Model for Port {
    const TABLE: &'static str = "Port";
    const COLUMNS: &'static [&'static str] = &[
        "_uuid",
        "name",
        "interfaces",
        "external_ids",
        "tag",
        "trunks",
        "vlan_mode",
    ];

    fn column(&self, column: &str) -> Option<Datum> {
        Some(match column {
            "_uuid" => self.uuid.into_datum(),
            "name" => self.name.clone().into_datum(),
            "interfaces" => self.interfaces.clone().into_datum(),
            "external_ids" => self.external_ids.clone().into_datum(),
            "tag" => self.tag.into_datum(),
            "trunks" => self.trunks.clone().into_datum(),
            "vlan_mode" => self.vlan_mode.clone().into_datum(),
            _ => return None,
        })
    }

    fn set_column(&mut self, column: &str, value: Datum) -> ovs_ovsdb::Result<()> {
        match column {
            "_uuid" => self.uuid = from_column(column, value)?,
            "name" => self.name = from_column(column, value)?,
            "interfaces" => self.interfaces = from_column(column, value)?,
            "external_ids" => self.external_ids = from_column(column, value)?,
            "tag" => self.tag = from_column(column, value)?,
            "trunks" => self.trunks = from_column(column, value)?,
            "vlan_mode" => self.vlan_mode = from_column(column, value)?,
            _ => {}
        }
        Ok(())
    }
}

/// `Interface` table
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Interface {
    pub uuid: Uuid,
    pub name: String,
    /// The `type` column: empty for system interfaces, or `internal`, `dpdk`, ...
    pub iface_type: String,
    pub external_ids: BTreeMap<String, String>,
    pub error: Option<String>,
    pub ofport_request: Option<i64>,
    pub link_state: Option<String>,
}

impl Model for Interface {
    const TABLE: &'static str = "Interface";
    const COLUMNS: &'static [&'static str] = &[
        "_uuid",
        "name",
        "type",
        "external_ids",
        "error",
        "ofport_request",
        "link_state",
    ];

    fn column(&self, column: &str) -> Option<Datum> {
        Some(match column {
            "_uuid" => self.uuid.into_datum(),
            "name" => self.name.clone().into_datum(),
            "type" => self.iface_type.clone().into_datum(),
            "external_ids" => self.external_ids.clone().into_datum(),
            "error" => self.error.clone().into_datum(),
            "ofport_request" => self.ofport_request.into_datum(),
            "link_state" => self.link_state.clone().into_datum(),
            _ => return None,
        })
    }

    fn set_column(&mut self, column: &str, value: Datum) -> ovs_ovsdb::Result<()> {
        match column {
            "_uuid" => self.uuid = from_column(column, value)?,
            "name" => self.name = from_column(column, value)?,
            "type" => self.iface_type = from_column(column, value)?,
            "external_ids" => self.external_ids = from_column(column, value)?,
            "error" => self.error = from_column(column, value)?,
            "ofport_request" => self.ofport_request = from_column(column, value)?,
            "link_state" => self.link_state = from_column(column, value)?,
            _ => {}
        }
        Ok(())
    }
}

/// The tables and columns the drivers require from the server
pub fn open_vswitch_model() -> DatabaseModel {
    DatabaseModel::new()
        .with_model::<Bridge>()
        .with_model::<Port>()
        .with_model::<Interface>()
}
