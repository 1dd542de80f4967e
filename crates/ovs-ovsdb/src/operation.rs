//! Transaction operations, conditions, mutations, results and monitor types

use serde::ser::{Serialize, SerializeTuple, Serializer};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::datum::{Datum, Row};
use crate::error::{OvsdbError, Result};
use crate::schema::DatabaseSchema;

/// The `op` member of a transaction operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Insert,
    Select,
    Update,
    Mutate,
    Delete,
    Wait,
    Commit,
    Abort,
    Comment,
    Assert,
}

impl OperationKind {
    /// Whether operations of this kind target a table
    pub fn has_table(self) -> bool {
        !matches!(
            self,
            OperationKind::Commit
                | OperationKind::Abort
                | OperationKind::Comment
                | OperationKind::Assert
        )
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Insert => "insert",
            OperationKind::Select => "select",
            OperationKind::Update => "update",
            OperationKind::Mutate => "mutate",
            OperationKind::Delete => "delete",
            OperationKind::Wait => "wait",
            OperationKind::Commit => "commit",
            OperationKind::Abort => "abort",
            OperationKind::Comment => "comment",
            OperationKind::Assert => "assert",
        };
        f.write_str(name)
    }
}

/// Comparison functions usable in a `where` clause
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ConditionFunction {
    #[serde(rename = "==")]
    Equal,
    #[serde(rename = "!=")]
    NotEqual,
    #[serde(rename = "<")]
    LessThan,
    #[serde(rename = "<=")]
    LessThanOrEqual,
    #[serde(rename = ">")]
    GreaterThan,
    #[serde(rename = ">=")]
    GreaterThanOrEqual,
    #[serde(rename = "includes")]
    Includes,
    #[serde(rename = "excludes")]
    Excludes,
}

impl ConditionFunction {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "==" => ConditionFunction::Equal,
            "!=" => ConditionFunction::NotEqual,
            "<" => ConditionFunction::LessThan,
            "<=" => ConditionFunction::LessThanOrEqual,
            ">" => ConditionFunction::GreaterThan,
            ">=" => ConditionFunction::GreaterThanOrEqual,
            "includes" => ConditionFunction::Includes,
            "excludes" => ConditionFunction::Excludes,
            _ => return None,
        })
    }

    pub fn is_ordering(self) -> bool {
        matches!(
            self,
            ConditionFunction::LessThan
                | ConditionFunction::LessThanOrEqual
                | ConditionFunction::GreaterThan
                | ConditionFunction::GreaterThanOrEqual
        )
    }
}

/// `[column, function, value]`
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub column: String,
    pub function: ConditionFunction,
    pub value: Datum,
}

impl Condition {
    pub fn new(column: impl Into<String>, function: ConditionFunction, value: Datum) -> Self {
        Self {
            column: column.into(),
            function,
            value,
        }
    }

    pub fn equal(column: impl Into<String>, value: Datum) -> Self {
        Self::new(column, ConditionFunction::Equal, value)
    }
}

impl Serialize for Condition {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(3)?;
        tuple.serialize_element(&self.column)?;
        tuple.serialize_element(&self.function)?;
        tuple.serialize_element(&self.value)?;
        tuple.end()
    }
}

/// Mutators usable in a `mutate` operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum Mutator {
    #[serde(rename = "+=")]
    Add,
    #[serde(rename = "-=")]
    Subtract,
    #[serde(rename = "*=")]
    Multiply,
    #[serde(rename = "/=")]
    Divide,
    #[serde(rename = "%=")]
    Modulo,
    #[serde(rename = "insert")]
    Insert,
    #[serde(rename = "delete")]
    Delete,
}

impl Mutator {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "+=" => Mutator::Add,
            "-=" => Mutator::Subtract,
            "*=" => Mutator::Multiply,
            "/=" => Mutator::Divide,
            "%=" => Mutator::Modulo,
            "insert" => Mutator::Insert,
            "delete" => Mutator::Delete,
            _ => return None,
        })
    }

    pub fn is_arithmetic(self) -> bool {
        !matches!(self, Mutator::Insert | Mutator::Delete)
    }
}

/// `[column, mutator, value]`
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub column: String,
    pub mutator: Mutator,
    pub value: Datum,
}

impl Mutation {
    pub fn new(column: impl Into<String>, mutator: Mutator, value: Datum) -> Self {
        Self {
            column: column.into(),
            mutator,
            value,
        }
    }
}

impl Serialize for Mutation {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(3)?;
        tuple.serialize_element(&self.column)?;
        tuple.serialize_element(&self.mutator)?;
        tuple.serialize_element(&self.value)?;
        tuple.end()
    }
}

/// Wait condition for a `wait` operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum WaitUntil {
    #[serde(rename = "==")]
    Equal,
    #[serde(rename = "!=")]
    NotEqual,
}

/// A single database statement
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Operation {
    pub op: OperationKind,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub table: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row: Option<Row>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<Row>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<String>>,
    #[serde(rename = "where", skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mutations: Option<Vec<Mutation>>,
    /// Transaction-scoped name other operations can reference before the
    /// real UUID exists
    #[serde(rename = "uuid-name", skip_serializing_if = "Option::is_none")]
    pub uuid_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<WaitUntil>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub durable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock: Option<String>,
}

impl Operation {
    fn empty(op: OperationKind, table: impl Into<String>) -> Self {
        Self {
            op,
            table: table.into(),
            row: None,
            rows: None,
            columns: None,
            conditions: None,
            mutations: None,
            uuid_name: None,
            timeout: None,
            until: None,
            durable: None,
            comment: None,
            lock: None,
        }
    }

    pub fn insert(table: impl Into<String>, row: Row) -> Self {
        Self {
            row: Some(row),
            ..Self::empty(OperationKind::Insert, table)
        }
    }

    pub fn select(table: impl Into<String>, conditions: Vec<Condition>) -> Self {
        Self {
            conditions: Some(conditions),
            ..Self::empty(OperationKind::Select, table)
        }
    }

    pub fn update(table: impl Into<String>, conditions: Vec<Condition>, row: Row) -> Self {
        Self {
            row: Some(row),
            conditions: Some(conditions),
            ..Self::empty(OperationKind::Update, table)
        }
    }

    pub fn mutate(
        table: impl Into<String>,
        conditions: Vec<Condition>,
        mutations: Vec<Mutation>,
    ) -> Self {
        Self {
            conditions: Some(conditions),
            mutations: Some(mutations),
            ..Self::empty(OperationKind::Mutate, table)
        }
    }

    pub fn delete(table: impl Into<String>, conditions: Vec<Condition>) -> Self {
        Self {
            conditions: Some(conditions),
            ..Self::empty(OperationKind::Delete, table)
        }
    }

    pub fn wait(
        table: impl Into<String>,
        conditions: Vec<Condition>,
        columns: Vec<String>,
        until: WaitUntil,
        rows: Vec<Row>,
    ) -> Self {
        Self {
            conditions: Some(conditions),
            columns: Some(columns),
            until: Some(until),
            rows: Some(rows),
            ..Self::empty(OperationKind::Wait, table)
        }
    }

    pub fn commit(durable: bool) -> Self {
        Self {
            durable: Some(durable),
            ..Self::empty(OperationKind::Commit, "")
        }
    }

    pub fn abort() -> Self {
        Self::empty(OperationKind::Abort, "")
    }

    pub fn comment(text: impl Into<String>) -> Self {
        Self {
            comment: Some(text.into()),
            ..Self::empty(OperationKind::Comment, "")
        }
    }

    pub fn assert(lock: impl Into<String>) -> Self {
        Self {
            lock: Some(lock.into()),
            ..Self::empty(OperationKind::Assert, "")
        }
    }

    pub fn with_uuid_name(mut self, name: impl Into<String>) -> Self {
        self.uuid_name = Some(name.into());
        self
    }

    pub fn with_columns(mut self, columns: Vec<String>) -> Self {
        self.columns = Some(columns);
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout = Some(timeout_ms);
        self
    }

    /// Every column name this operation mentions
    pub fn referenced_columns(&self) -> impl Iterator<Item = &str> {
        let row = self.row.iter().flat_map(|r| r.keys());
        let rows = self.rows.iter().flatten().flat_map(|r| r.keys());
        let columns = self.columns.iter().flatten();
        let conditions = self.conditions.iter().flatten().map(|c| &c.column);
        let mutations = self.mutations.iter().flatten().map(|m| &m.column);
        row.chain(rows)
            .chain(columns)
            .chain(conditions)
            .chain(mutations)
            .map(String::as_str)
    }
}

/// One element of a `transact` reply
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct OperationResult {
    #[serde(default)]
    pub count: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub details: Option<String>,
    #[serde(default)]
    pub uuid: Option<Value>,
    #[serde(default)]
    pub rows: Option<Vec<Map<String, Value>>>,
}

impl OperationResult {
    /// UUID assigned by an `insert`
    pub fn inserted_uuid(&self) -> Option<Uuid> {
        match self.uuid.as_ref()?.as_array()?.as_slice() {
            [tag, Value::String(id)] if tag == "uuid" => Uuid::parse_str(id).ok(),
            _ => None,
        }
    }

    /// Decode the selected rows with the table schema
    pub fn decoded_rows(&self, schema: &DatabaseSchema, table: &str) -> Result<Vec<Row>> {
        let table_schema = schema.require_table(table)?;
        self.rows
            .iter()
            .flatten()
            .map(|row| table_schema.decode_row(table, row))
            .collect()
    }
}

/// Which kinds of changes a monitor reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct MonitorSelect {
    pub initial: bool,
    pub insert: bool,
    pub delete: bool,
    pub modify: bool,
}

impl Default for MonitorSelect {
    fn default() -> Self {
        Self {
            initial: true,
            insert: true,
            delete: true,
            modify: true,
        }
    }
}

/// Per-table monitor request
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct MonitorRequest {
    pub columns: Vec<String>,
    pub select: MonitorSelect,
}

impl MonitorRequest {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            select: MonitorSelect::default(),
        }
    }
}

/// Old and new contents of one row in an update
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowUpdate {
    pub old: Option<Row>,
    pub new: Option<Row>,
}

/// table name -> row uuid -> change
pub type TableUpdates = BTreeMap<String, BTreeMap<Uuid, RowUpdate>>;

/// Decode a `monitor` reply or `update` payload with the schema
pub fn decode_table_updates(schema: &DatabaseSchema, value: &Value) -> Result<TableUpdates> {
    let tables = value.as_object().ok_or_else(|| {
        OvsdbError::invalid_value("<table-updates>", format!("expected object, got {}", value))
    })?;
    let mut updates = TableUpdates::new();
    for (table, rows) in tables {
        let table_schema = schema.require_table(table)?;
        let rows = rows.as_object().ok_or_else(|| {
            OvsdbError::invalid_value(table, format!("expected row updates object, got {}", rows))
        })?;
        let entry = updates.entry(table.clone()).or_default();
        for (id, change) in rows {
            let uuid = Uuid::parse_str(id)
                .map_err(|e| OvsdbError::invalid_value("_uuid", format!("bad uuid '{}': {}", id, e)))?;
            let decode = |key: &str| -> Result<Option<Row>> {
                match change.get(key) {
                    Some(Value::Object(row)) => table_schema.decode_row(table, row).map(Some),
                    Some(Value::Null) | None => Ok(None),
                    Some(other) => Err(OvsdbError::invalid_value(
                        table,
                        format!("expected row object for '{}', got {}", key, other),
                    )),
                }
            };
            entry.insert(
                uuid,
                RowUpdate {
                    old: decode("old")?,
                    new: decode("new")?,
                },
            );
        }
    }
    Ok(updates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_insert_serialization() {
        let mut row = Row::new();
        row.insert("name".to_string(), Datum::string("veth0"));
        let op = Operation::insert("Interface", row).with_uuid_name("new_interface");
        assert_eq!(
            serde_json::to_value(&op).unwrap(),
            json!({
                "op": "insert",
                "table": "Interface",
                "row": {"name": "veth0"},
                "uuid-name": "new_interface"
            })
        );
    }

    #[test]
    fn test_mutate_serialization() {
        let op = Operation::mutate(
            "Bridge",
            vec![Condition::equal("name", Datum::string("br0"))],
            vec![Mutation::new(
                "ports",
                Mutator::Insert,
                Datum::Set(vec![crate::datum::Atom::Uuid(crate::datum::UuidRef::named("new_port"))]),
            )],
        );
        assert_eq!(
            serde_json::to_value(&op).unwrap(),
            json!({
                "op": "mutate",
                "table": "Bridge",
                "where": [["name", "==", "br0"]],
                "mutations": [["ports", "insert", ["set", [["named-uuid", "new_port"]]]]]
            })
        );
    }

    #[test]
    fn test_commit_has_no_table() {
        assert_eq!(
            serde_json::to_value(Operation::commit(true)).unwrap(),
            json!({"op": "commit", "durable": true})
        );
        assert_eq!(
            serde_json::to_value(Operation::select("Bridge", vec![])).unwrap(),
            json!({"op": "select", "table": "Bridge", "where": []})
        );
    }

    #[test]
    fn test_result_uuid() {
        let id = Uuid::new_v4();
        let result: OperationResult =
            serde_json::from_value(json!({"uuid": ["uuid", id.to_string()]})).unwrap();
        assert_eq!(result.inserted_uuid(), Some(id));
        assert_eq!(OperationResult::default().inserted_uuid(), None);
    }

    #[test]
    fn test_referenced_columns() {
        let op = Operation::select("Port", vec![Condition::equal("name", Datum::string("p"))])
            .with_columns(vec!["_uuid".into(), "external_ids".into()]);
        let cols: Vec<&str> = op.referenced_columns().collect();
        assert_eq!(cols, vec!["_uuid", "external_ids", "name"]);
    }

    #[test]
    fn test_monitor_request_serialization() {
        let req = MonitorRequest::new(vec!["name".into()]);
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({"columns": ["name"], "select": {"initial": true, "insert": true, "delete": true, "modify": true}})
        );
    }
}
