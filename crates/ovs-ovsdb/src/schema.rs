//! OVSDB schema model
//!
//! Parses a `get_schema` reply into typed table and column descriptors and
//! resolves each column's extended type. Every table carries an implicit
//! `_uuid` column that is not part of its `columns` map.

use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use crate::datum::Atom;
use crate::error::{OvsdbError, Result};
use crate::operation::Operation;

/// Cardinality sentinel for `"max": "unlimited"`
pub const UNLIMITED: i64 = -1;

/// Columns accepted on every table even though no schema declares them
pub const META_COLUMNS: [&str; 2] = ["_uuid", "_version"];

/// Scalar types defined by RFC7047
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AtomicType {
    Integer,
    Real,
    Boolean,
    String,
    Uuid,
}

impl AtomicType {
    fn parse(name: &str) -> Result<Self> {
        match name {
            "integer" => Ok(AtomicType::Integer),
            "real" => Ok(AtomicType::Real),
            "boolean" => Ok(AtomicType::Boolean),
            "string" => Ok(AtomicType::String),
            "uuid" => Ok(AtomicType::Uuid),
            other => Err(OvsdbError::InvalidSchema(format!(
                "unknown atomic type '{}'",
                other
            ))),
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, AtomicType::Integer | AtomicType::Real)
    }
}

impl fmt::Display for AtomicType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AtomicType::Integer => "integer",
            AtomicType::Real => "real",
            AtomicType::Boolean => "boolean",
            AtomicType::String => "string",
            AtomicType::Uuid => "uuid",
        };
        f.write_str(name)
    }
}

/// Resolved classification of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendedType {
    Integer,
    Real,
    Boolean,
    String,
    Uuid,
    Enum,
    Set,
    Map,
}

impl From<AtomicType> for ExtendedType {
    fn from(t: AtomicType) -> Self {
        match t {
            AtomicType::Integer => ExtendedType::Integer,
            AtomicType::Real => ExtendedType::Real,
            AtomicType::Boolean => ExtendedType::Boolean,
            AtomicType::String => ExtendedType::String,
            AtomicType::Uuid => ExtendedType::Uuid,
        }
    }
}

/// Whether a uuid reference keeps the referenced row alive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefType {
    Strong,
    Weak,
}

/// Key or value type of a column, with its constraints
#[derive(Debug, Clone, PartialEq)]
pub struct BaseType {
    pub atomic: AtomicType,
    pub enum_values: Vec<Atom>,
    pub min_integer: Option<i64>,
    pub max_integer: Option<i64>,
    pub min_real: Option<f64>,
    pub max_real: Option<f64>,
    pub min_length: Option<u64>,
    pub max_length: Option<u64>,
    pub ref_table: Option<String>,
    pub ref_type: Option<RefType>,
}

impl BaseType {
    pub fn new(atomic: AtomicType) -> Self {
        Self {
            atomic,
            enum_values: Vec::new(),
            min_integer: None,
            max_integer: None,
            min_real: None,
            max_real: None,
            min_length: None,
            max_length: None,
            ref_table: None,
            ref_type: None,
        }
    }

    /// Accepts `"integer"` or `{"type": "integer", "enum": ..., ...}`
    fn from_json(value: &Value) -> Result<Self> {
        match value {
            Value::String(name) => Ok(Self::new(AtomicType::parse(name)?)),
            Value::Object(obj) => {
                let name = obj.get("type").and_then(Value::as_str).ok_or_else(|| {
                    OvsdbError::InvalidSchema(format!("base type without 'type': {}", value))
                })?;
                let mut base = Self::new(AtomicType::parse(name)?);
                if let Some(values) = obj.get("enum") {
                    base.enum_values = parse_enum(base.atomic, values)?;
                }
                base.min_integer = obj.get("minInteger").and_then(Value::as_i64);
                base.max_integer = obj.get("maxInteger").and_then(Value::as_i64);
                base.min_real = obj.get("minReal").and_then(Value::as_f64);
                base.max_real = obj.get("maxReal").and_then(Value::as_f64);
                base.min_length = obj.get("minLength").and_then(Value::as_u64);
                base.max_length = obj.get("maxLength").and_then(Value::as_u64);
                base.ref_table = obj.get("refTable").and_then(Value::as_str).map(String::from);
                base.ref_type = match obj.get("refType").and_then(Value::as_str) {
                    Some("weak") => Some(RefType::Weak),
                    Some("strong") => Some(RefType::Strong),
                    Some(other) => {
                        return Err(OvsdbError::InvalidSchema(format!(
                            "unknown refType '{}'",
                            other
                        )))
                    }
                    None if base.ref_table.is_some() => Some(RefType::Strong),
                    None => None,
                };
                Ok(base)
            }
            other => Err(OvsdbError::InvalidSchema(format!(
                "base type must be a string or object, got {}",
                other
            ))),
        }
    }
}

/// Enum values come as one scalar, a `["set", [...]]` list or a plain list
fn parse_enum(atomic: AtomicType, value: &Value) -> Result<Vec<Atom>> {
    let base = BaseType::new(atomic);
    let items: Vec<&Value> = match value {
        Value::Array(parts) if parts.len() == 2 && parts[0] == "set" => parts[1]
            .as_array()
            .ok_or_else(|| OvsdbError::InvalidSchema(format!("malformed enum set: {}", value)))?
            .iter()
            .collect(),
        // A bare uuid atom is also a two-element array
        Value::Array(parts) if atomic == AtomicType::Uuid && parts.len() == 2 && parts[0] == "uuid" => {
            vec![value]
        }
        Value::Array(parts) => parts.iter().collect(),
        scalar => vec![scalar],
    };
    items
        .into_iter()
        .map(|v| {
            base.decode_atom("enum", v)
                .map_err(|e| OvsdbError::InvalidSchema(e.to_string()))
        })
        .collect()
}

/// Full type description of a column
#[derive(Debug, Clone, PartialEq)]
pub struct TypeObject {
    pub key: BaseType,
    pub value: Option<BaseType>,
    pub min: i64,
    /// Upper bound, or [`UNLIMITED`]
    pub max: i64,
}

impl TypeObject {
    pub fn atomic(atomic: AtomicType) -> Self {
        Self {
            key: BaseType::new(atomic),
            value: None,
            min: 1,
            max: 1,
        }
    }

    /// Accepts the short form (`"integer"`) or the object form
    pub fn from_json(value: &Value) -> Result<Self> {
        match value {
            Value::String(_) => Ok(Self {
                key: BaseType::from_json(value)?,
                value: None,
                min: 1,
                max: 1,
            }),
            Value::Object(obj) => {
                let key = obj.get("key").ok_or_else(|| {
                    OvsdbError::InvalidSchema(format!("type object without 'key': {}", value))
                })?;
                let min = match obj.get("min") {
                    None => 1,
                    Some(v) => v.as_i64().filter(|m| *m == 0 || *m == 1).ok_or_else(|| {
                        OvsdbError::InvalidSchema(format!("invalid min {}", v))
                    })?,
                };
                let max = match obj.get("max") {
                    None => 1,
                    Some(Value::String(s)) if s == "unlimited" => UNLIMITED,
                    Some(v) => v.as_i64().filter(|m| *m >= 1).ok_or_else(|| {
                        OvsdbError::InvalidSchema(format!("invalid max {}", v))
                    })?,
                };
                Ok(Self {
                    key: BaseType::from_json(key)?,
                    value: obj.get("value").map(BaseType::from_json).transpose()?,
                    min,
                    max,
                })
            }
            other => Err(OvsdbError::InvalidSchema(format!(
                "column type must be a string or object, got {}",
                other
            ))),
        }
    }

    /// Map if a value type exists, set if the cardinality is not exactly one,
    /// enum if the key is enumerated, otherwise the key's atomic type
    pub fn extended_type(&self) -> ExtendedType {
        if self.value.is_some() {
            ExtendedType::Map
        } else if self.min != 1 || self.max != 1 {
            ExtendedType::Set
        } else if !self.key.enum_values.is_empty() {
            ExtendedType::Enum
        } else {
            self.key.atomic.into()
        }
    }

    pub fn allows(&self, len: usize) -> bool {
        let len = len as i64;
        len >= self.min && (self.max == UNLIMITED || len <= self.max)
    }
}

#[derive(Deserialize)]
struct RawColumn {
    #[serde(rename = "type")]
    type_json: Value,
    #[serde(default)]
    ephemeral: bool,
    #[serde(default = "default_true")]
    mutable: bool,
}

fn default_true() -> bool {
    true
}

/// One column of a table
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawColumn")]
pub struct ColumnSchema {
    pub extended_type: ExtendedType,
    pub type_obj: TypeObject,
    pub ephemeral: bool,
    pub mutable: bool,
}

impl TryFrom<RawColumn> for ColumnSchema {
    type Error = OvsdbError;

    fn try_from(raw: RawColumn) -> Result<Self> {
        let type_obj = TypeObject::from_json(&raw.type_json)?;
        Ok(Self {
            extended_type: type_obj.extended_type(),
            type_obj,
            ephemeral: raw.ephemeral,
            mutable: raw.mutable,
        })
    }
}

impl ColumnSchema {
    pub fn new(type_obj: TypeObject) -> Self {
        Self {
            extended_type: type_obj.extended_type(),
            type_obj,
            ephemeral: false,
            mutable: true,
        }
    }

    pub fn key(&self) -> &BaseType {
        &self.type_obj.key
    }
}

/// The implicit `_uuid` column shared by every table
pub fn uuid_column() -> &'static ColumnSchema {
    static UUID_COLUMN: OnceLock<ColumnSchema> = OnceLock::new();
    UUID_COLUMN.get_or_init(|| ColumnSchema {
        mutable: false,
        ..ColumnSchema::new(TypeObject::atomic(AtomicType::Uuid))
    })
}

/// One table of a database
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TableSchema {
    #[serde(default)]
    pub columns: BTreeMap<String, ColumnSchema>,
    /// Each index is a list of columns whose combined values are unique per row
    #[serde(default)]
    pub indexes: Vec<Vec<String>>,
    #[serde(rename = "isRoot", default)]
    pub is_root: bool,
    #[serde(rename = "maxRows", default)]
    pub max_rows: Option<u64>,
}

impl TableSchema {
    /// Column lookup; `_uuid` always resolves to the implicit uuid column
    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        if name == "_uuid" {
            return Some(uuid_column());
        }
        self.columns.get(name)
    }

    /// Like [`TableSchema::column`] but also accepts `_version`
    pub(crate) fn wire_column(&self, name: &str) -> Option<&ColumnSchema> {
        if name == "_version" {
            return Some(uuid_column());
        }
        self.column(name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        META_COLUMNS.contains(&name) || self.columns.contains_key(name)
    }
}

/// A database schema as returned by `get_schema`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DatabaseSchema {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub cksum: Option<String>,
    pub tables: BTreeMap<String, TableSchema>,
}

impl DatabaseSchema {
    pub fn from_json(value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| OvsdbError::InvalidSchema(e.to_string()))
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(name)
    }

    pub(crate) fn require_table(&self, name: &str) -> Result<&TableSchema> {
        self.table(name)
            .ok_or_else(|| OvsdbError::UnknownTable(name.to_string()))
    }

    /// Checks that every table and column named by `ops` exists.
    ///
    /// Covers row, rows, columns, where and mutations. The first violation
    /// fails the whole batch so nothing reaches the wire.
    pub fn validate_operations(&self, ops: &[Operation]) -> Result<()> {
        for op in ops {
            if !op.op.has_table() {
                continue;
            }
            let table = self.require_table(&op.table)?;
            for column in op.referenced_columns() {
                if !table.has_column(column) {
                    return Err(OvsdbError::UnknownColumn {
                        table: op.table.clone(),
                        column: column.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datum::{Datum, Row};
    use serde_json::json;

    fn column(type_json: Value) -> ColumnSchema {
        serde_json::from_value(json!({ "type": type_json })).unwrap()
    }

    fn sample_schema() -> DatabaseSchema {
        DatabaseSchema::from_json(json!({
            "name": "Open_vSwitch",
            "version": "8.3.0",
            "tables": {
                "Bridge": {
                    "columns": {
                        "name": {"type": "string", "mutable": false},
                        "ports": {"type": {"key": {"type": "uuid", "refTable": "Port"}, "min": 0, "max": "unlimited"}}
                    },
                    "indexes": [["name"]],
                    "isRoot": true
                },
                "Empty": {"columns": {}}
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_short_form_type() {
        let c = column(json!("integer"));
        assert_eq!(c.extended_type, ExtendedType::Integer);
        assert_eq!((c.type_obj.min, c.type_obj.max), (1, 1));
        assert!(c.mutable);
    }

    #[test]
    fn test_unlimited_set() {
        let c = column(json!({"key": "integer", "min": 0, "max": "unlimited"}));
        assert_eq!(c.extended_type, ExtendedType::Set);
        assert_eq!(c.type_obj.max, UNLIMITED);
    }

    #[test]
    fn test_enum_list() {
        let c = column(json!({"key": {"type": "string", "enum": ["set", ["a", "b"]]}}));
        assert_eq!(c.extended_type, ExtendedType::Enum);
        assert_eq!(c.key().enum_values, vec![Atom::string("a"), Atom::string("b")]);
    }

    #[test]
    fn test_enum_plain_list() {
        let c: ColumnSchema = serde_json::from_value(json!({
            "type": {"key": {"type": "string", "enum": ["a", "b"]}}
        }))
        .unwrap();
        assert_eq!(c.extended_type, ExtendedType::Enum);
        assert_eq!(c.key().enum_values, vec![Atom::string("a"), Atom::string("b")]);

        let c = column(json!({"key": {"type": "integer", "enum": [1, 2, 3]}}));
        assert_eq!(c.key().enum_values.len(), 3);
    }

    #[test]
    fn test_enum_scalar() {
        let c = column(json!({"key": {"type": "string", "enum": "only"}}));
        assert_eq!(c.extended_type, ExtendedType::Enum);
        assert_eq!(c.key().enum_values, vec![Atom::string("only")]);
    }

    #[test]
    fn test_map_type() {
        let c = column(json!({"key": "string", "value": "integer"}));
        assert_eq!(c.extended_type, ExtendedType::Map);
        assert_eq!(c.type_obj.value.as_ref().map(|v| v.atomic), Some(AtomicType::Integer));
    }

    #[test]
    fn test_optional_enum_is_set() {
        let c = column(json!({"key": {"type": "string", "enum": ["set", ["up", "down"]]}, "min": 0, "max": 1}));
        assert_eq!(c.extended_type, ExtendedType::Set);
    }

    #[test]
    fn test_ref_defaults_to_strong() {
        let c = column(json!({"key": {"type": "uuid", "refTable": "Port"}}));
        assert_eq!(c.key().ref_type, Some(RefType::Strong));
        assert_eq!(c.key().ref_table.as_deref(), Some("Port"));
    }

    #[test]
    fn test_malformed_type_rejected() {
        let result: std::result::Result<ColumnSchema, _> =
            serde_json::from_value(json!({"type": {"key": "blob"}}));
        assert!(result.is_err());

        let result: std::result::Result<ColumnSchema, _> =
            serde_json::from_value(json!({"type": {"key": "string", "max": 0}}));
        assert!(result.is_err());
    }

    #[test]
    fn test_uuid_column_on_every_table() {
        let schema = sample_schema();
        for table in schema.tables.values() {
            let c = table.column("_uuid").unwrap();
            assert_eq!(c.extended_type, ExtendedType::Uuid);
        }
        assert!(schema.table("Empty").unwrap().column("name").is_none());
    }

    #[test]
    fn test_missing_table_is_none() {
        let schema = sample_schema();
        assert!(schema.table("Port").is_none());
        assert!(schema.table("Bridge").is_some());
    }

    #[test]
    fn test_validate_operations() {
        let schema = sample_schema();

        let mut row = Row::new();
        row.insert("name".to_string(), Datum::string("br0"));
        row.insert("_uuid".to_string(), Datum::uuid(uuid::Uuid::new_v4()));
        let ok = Operation::insert("Bridge", row.clone());
        assert!(schema.validate_operations(&[ok]).is_ok());

        let select = Operation::select("Bridge", Vec::new())
            .with_columns(vec!["_uuid".into(), "_version".into(), "name".into()]);
        assert!(schema.validate_operations(&[select]).is_ok());

        row.insert("bogus".to_string(), Datum::string("x"));
        let bad = Operation::insert("Bridge", row);
        let err = schema.validate_operations(&[bad]).unwrap_err();
        assert!(matches!(err, OvsdbError::UnknownColumn { ref column, .. } if column == "bogus"));

        let err = schema
            .validate_operations(&[Operation::delete("Nope", Vec::new())])
            .unwrap_err();
        assert!(matches!(err, OvsdbError::UnknownTable(_)));
    }
}
