//! In-process OVSDB server for tests
//!
//! Serves one database over a Unix socket in a temporary directory. Rows are
//! kept as decoded [`Row`]s and every transaction runs against a copy that
//! only replaces the live tables once all operations and index checks pass.
//! Monitor updates for a transaction are written to the issuing session
//! before its reply, so tests observe them deterministically.

use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::datum::{Atom, Datum, Row, UuidRef};
use crate::error::Result;
use crate::protocol::{self, MessageFramer};
use crate::schema::{uuid_column, ColumnSchema, DatabaseSchema, ExtendedType, TableSchema};

type Tables = BTreeMap<String, BTreeMap<Uuid, Row>>;

/// A subset of the Open_vSwitch schema covering bridges, ports and interfaces
pub fn open_vswitch_schema() -> Value {
    json!({
        "name": "Open_vSwitch",
        "version": "8.3.0",
        "cksum": "3781850481 26690",
        "tables": {
            "Open_vSwitch": {
                "columns": {
                    "bridges": {"type": {"key": {"type": "uuid", "refTable": "Bridge"}, "min": 0, "max": "unlimited"}},
                    "ovs_version": {"type": {"key": "string", "min": 0, "max": 1}}
                },
                "isRoot": true,
                "maxRows": 1
            },
            "Bridge": {
                "columns": {
                    "name": {"type": "string", "mutable": false},
                    "ports": {"type": {"key": {"type": "uuid", "refTable": "Port"}, "min": 0, "max": "unlimited"}},
                    "external_ids": {"type": {"key": "string", "value": "string", "min": 0, "max": "unlimited"}},
                    "datapath_type": {"type": "string"}
                },
                "indexes": [["name"]],
                "isRoot": true
            },
            "Port": {
                "columns": {
                    "name": {"type": "string", "mutable": false},
                    "interfaces": {"type": {"key": {"type": "uuid", "refTable": "Interface"}, "min": 1, "max": "unlimited"}},
                    "external_ids": {"type": {"key": "string", "value": "string", "min": 0, "max": "unlimited"}},
                    "tag": {"type": {"key": {"type": "integer", "minInteger": 0, "maxInteger": 4095}, "min": 0, "max": 1}},
                    "trunks": {"type": {"key": {"type": "integer", "minInteger": 0, "maxInteger": 4095}, "min": 0, "max": 4096}},
                    "vlan_mode": {"type": {"key": {"type": "string", "enum": ["set", ["access", "dot1q-tunnel", "native-tagged", "native-untagged", "trunk"]]}, "min": 0, "max": 1}}
                },
                "indexes": [["name"]]
            },
            "Interface": {
                "columns": {
                    "name": {"type": "string", "mutable": false},
                    "type": {"type": "string"},
                    "external_ids": {"type": {"key": "string", "value": "string", "min": 0, "max": "unlimited"}},
                    "options": {"type": {"key": "string", "value": "string", "min": 0, "max": "unlimited"}},
                    "error": {"type": {"key": "string", "min": 0, "max": 1}},
                    "ofport": {"type": {"key": "integer", "min": 0, "max": 1}},
                    "ofport_request": {"type": {"key": {"type": "integer", "minInteger": 1, "maxInteger": 65279}, "min": 0, "max": 1}},
                    "link_state": {"type": {"key": {"type": "string", "enum": ["set", ["down", "up"]]}, "min": 0, "max": 1}}
                },
                "indexes": [["name"]]
            }
        }
    })
}

enum Control {
    Send(Value),
    Close,
}

#[derive(Debug, Clone)]
struct TableMonitor {
    columns: Vec<String>,
    initial: bool,
    insert: bool,
    delete: bool,
    modify: bool,
}

#[derive(Debug, Clone)]
struct MonitorSpec {
    id: Value,
    tables: BTreeMap<String, TableMonitor>,
}

struct SessionHandle {
    tx: mpsc::UnboundedSender<Control>,
    monitors: BTreeMap<String, MonitorSpec>,
}

/// Failure of a single transaction operation
struct OpError {
    error: &'static str,
    details: String,
}

impl OpError {
    fn syntax(details: impl Into<String>) -> Self {
        Self {
            error: "syntax error",
            details: details.into(),
        }
    }

    fn constraint(details: impl Into<String>) -> Self {
        Self {
            error: "constraint violation",
            details: details.into(),
        }
    }
}

type OpResult<T> = std::result::Result<T, OpError>;

struct Condition {
    column: String,
    function: String,
    value: Datum,
}

struct MockState {
    schema_json: Value,
    schema: DatabaseSchema,
    db: Mutex<Tables>,
    sessions: Mutex<BTreeMap<u64, SessionHandle>>,
    next_session: AtomicU64,
    next_echo: AtomicU64,
    echo_waiters: Mutex<HashMap<String, oneshot::Sender<Value>>>,
    requests: Mutex<BTreeMap<String, usize>>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Sort and deduplicate set contents so equal sets compare equal
fn canonical(datum: Datum) -> Datum {
    match datum {
        Datum::Set(mut items) => {
            items.sort();
            items.dedup();
            Datum::Set(items)
        }
        other => other,
    }
}

fn resolve_atom(atom: Atom, named: &HashMap<String, Uuid>) -> OpResult<Atom> {
    match atom {
        Atom::Uuid(UuidRef::Named(name)) => named
            .get(&name)
            .map(|u| Atom::Uuid(UuidRef::Real(*u)))
            .ok_or_else(|| OpError::syntax(format!("unknown named-uuid {}", name))),
        other => Ok(other),
    }
}

/// Replace named-uuid references with the UUIDs assigned earlier in the transaction
fn resolve(datum: Datum, named: &HashMap<String, Uuid>) -> OpResult<Datum> {
    Ok(canonical(match datum {
        Datum::Atom(a) => Datum::Atom(resolve_atom(a, named)?),
        Datum::Set(items) => Datum::Set(
            items
                .into_iter()
                .map(|a| resolve_atom(a, named))
                .collect::<OpResult<_>>()?,
        ),
        Datum::Map(map) => Datum::Map(
            map.into_iter()
                .map(|(k, v)| Ok((resolve_atom(k, named)?, resolve_atom(v, named)?)))
                .collect::<OpResult<_>>()?,
        ),
    }))
}

fn lookup_column<'a>(table: &'a TableSchema, name: &str) -> OpResult<&'a ColumnSchema> {
    table
        .column(name)
        .ok_or_else(|| OpError::syntax(format!("unknown column {}", name)))
}

fn column_value(uuid: &Uuid, row: &Row, column: &str) -> Datum {
    if column == "_uuid" {
        return Datum::uuid(*uuid);
    }
    row.get(column).cloned().unwrap_or_else(Datum::empty_set)
}

fn includes(actual: &Datum, wanted: &Datum) -> bool {
    match (actual, wanted) {
        (Datum::Map(have), Datum::Map(want)) => want.iter().all(|(k, v)| have.get(k) == Some(v)),
        (Datum::Map(_), _) | (_, Datum::Map(_)) => false,
        _ => wanted.atoms().iter().all(|a| actual.atoms().contains(a)),
    }
}

fn excludes(actual: &Datum, unwanted: &Datum) -> bool {
    match (actual, unwanted) {
        (Datum::Map(have), Datum::Map(not)) => not.iter().all(|(k, v)| have.get(k) != Some(v)),
        (Datum::Map(_), _) | (_, Datum::Map(_)) => true,
        _ => unwanted.atoms().iter().all(|a| !actual.atoms().contains(a)),
    }
}

fn matches(uuid: &Uuid, row: &Row, conditions: &[Condition]) -> bool {
    conditions.iter().all(|c| {
        let actual = column_value(uuid, row, &c.column);
        match c.function.as_str() {
            "==" => actual == c.value,
            "!=" => actual != c.value,
            "includes" => includes(&actual, &c.value),
            "excludes" => excludes(&actual, &c.value),
            ordering => match (actual.as_atom(), c.value.as_atom()) {
                (Some(a), Some(b)) => match ordering {
                    "<" => a < b,
                    "<=" => a <= b,
                    ">" => a > b,
                    ">=" => a >= b,
                    _ => false,
                },
                _ => false,
            },
        }
    })
}

fn wire_row(uuid: &Uuid, row: &Row, columns: Option<&[String]>) -> Value {
    let mut out = Map::new();
    match columns {
        Some(columns) => {
            for column in columns {
                out.insert(column.clone(), json!(column_value(uuid, row, column)));
            }
        }
        None => {
            out.insert("_uuid".to_string(), json!(Datum::uuid(*uuid)));
            for (column, value) in row {
                out.insert(column.clone(), json!(value));
            }
        }
    }
    Value::Object(out)
}

fn arithmetic(column: &str, mutator: &str, current: &Atom, operand: &Atom) -> OpResult<Atom> {
    let domain = || OpError {
        error: "domain error",
        details: format!("{} {} on column {}", current_name(current), mutator, column),
    };
    match (current, operand) {
        (Atom::Integer(a), Atom::Integer(b)) => {
            let value = match mutator {
                "+=" => a.checked_add(*b),
                "-=" => a.checked_sub(*b),
                "*=" => a.checked_mul(*b),
                "/=" => a.checked_div(*b),
                "%=" => a.checked_rem(*b),
                _ => None,
            };
            value.map(Atom::Integer).ok_or_else(domain)
        }
        (Atom::Real(a), Atom::Real(_) | Atom::Integer(_)) => {
            let b = match operand {
                Atom::Real(b) => *b,
                Atom::Integer(b) => *b as f64,
                _ => return Err(domain()),
            };
            let value = match mutator {
                "+=" => a + b,
                "-=" => a - b,
                "*=" => a * b,
                "/=" if b != 0.0 => a / b,
                _ => return Err(domain()),
            };
            Ok(Atom::Real(value))
        }
        _ => Err(domain()),
    }
}

fn current_name(atom: &Atom) -> String {
    match atom {
        Atom::Integer(i) => i.to_string(),
        Atom::Real(r) => r.to_string(),
        other => format!("{:?}", other),
    }
}

impl MockState {
    fn table(&self, name: &str) -> OpResult<&TableSchema> {
        self.schema
            .table(name)
            .ok_or_else(|| OpError::syntax(format!("unknown table {}", name)))
    }

    /// Insert with schema defaults for omitted columns
    fn complete_row(table: &TableSchema, mut row: Row) -> Row {
        table
            .columns
            .iter()
            .map(|(name, column)| {
                let value = row.remove(name).unwrap_or_else(|| column.default_datum());
                (name.clone(), canonical(value))
            })
            .collect()
    }

    fn decode_row(
        table: &TableSchema,
        table_name: &str,
        value: Option<&Value>,
        named: &HashMap<String, Uuid>,
    ) -> OpResult<Row> {
        let Some(object) = value.and_then(Value::as_object) else {
            return Ok(Row::new());
        };
        let row = table
            .decode_row(table_name, object)
            .map_err(|e| OpError::constraint(e.to_string()))?;
        row.into_iter()
            .map(|(k, v)| Ok((k, resolve(v, named)?)))
            .collect()
    }

    fn decode_conditions(
        table: &TableSchema,
        value: Option<&Value>,
        named: &HashMap<String, Uuid>,
    ) -> OpResult<Vec<Condition>> {
        let Some(items) = value.and_then(Value::as_array) else {
            return Ok(Vec::new());
        };
        items
            .iter()
            .map(|item| match item.as_array().map(Vec::as_slice) {
                Some([Value::String(column), Value::String(function), value]) => {
                    let schema = if column == "_uuid" {
                        uuid_column()
                    } else {
                        lookup_column(table, column)?
                    };
                    let decoded = schema
                        .decode(column, value)
                        .map_err(|e| OpError::constraint(e.to_string()))?;
                    Ok(Condition {
                        column: column.clone(),
                        function: function.clone(),
                        value: resolve(decoded, named)?,
                    })
                }
                _ => Err(OpError::syntax(format!("malformed condition {}", item))),
            })
            .collect()
    }

    fn apply_mutation(
        table: &TableSchema,
        current: Datum,
        mutation: &Value,
        named: &HashMap<String, Uuid>,
    ) -> OpResult<Datum> {
        let Some([Value::String(column), Value::String(mutator), operand]) =
            mutation.as_array().map(Vec::as_slice)
        else {
            return Err(OpError::syntax(format!("malformed mutation {}", mutation)));
        };
        let schema = lookup_column(table, column)?;
        if column == "_uuid" || !schema.mutable {
            return Err(OpError::constraint(format!("column {} is not mutable", column)));
        }
        let key = schema.key();
        let mutated = match mutator.as_str() {
            "+=" | "-=" | "*=" | "/=" | "%=" => {
                let operand = key
                    .decode_atom(column, operand)
                    .map_err(|e| OpError::constraint(e.to_string()))?;
                match current {
                    Datum::Atom(a) => Datum::Atom(arithmetic(column, mutator, &a, &operand)?),
                    Datum::Set(items) => Datum::Set(
                        items
                            .iter()
                            .map(|a| arithmetic(column, mutator, a, &operand))
                            .collect::<OpResult<_>>()?,
                    ),
                    Datum::Map(_) => {
                        return Err(OpError::constraint("arithmetic on a map column"))
                    }
                }
            }
            "insert" => {
                let operand = schema
                    .decode(column, operand)
                    .map_err(|e| OpError::constraint(e.to_string()))?;
                match (current, resolve(operand, named)?) {
                    (Datum::Set(mut items), Datum::Set(extra)) => {
                        items.extend(extra);
                        Datum::Set(items)
                    }
                    (Datum::Map(mut map), Datum::Map(extra)) => {
                        for (k, v) in extra {
                            map.entry(k).or_insert(v);
                        }
                        Datum::Map(map)
                    }
                    _ => return Err(OpError::constraint(format!("cannot insert into {}", column))),
                }
            }
            "delete" => match current {
                Datum::Set(items) => {
                    let operand = resolve(
                        schema
                            .decode(column, operand)
                            .map_err(|e| OpError::constraint(e.to_string()))?,
                        named,
                    )?;
                    let remove = operand.atoms();
                    Datum::Set(items.into_iter().filter(|a| !remove.contains(&a)).collect())
                }
                Datum::Map(mut map) if schema.extended_type == ExtendedType::Map => {
                    let tag = operand.as_array().and_then(|p| p.first()).and_then(Value::as_str);
                    if tag == Some("map") {
                        let pairs = schema
                            .decode(column, operand)
                            .map_err(|e| OpError::constraint(e.to_string()))?;
                        if let Datum::Map(pairs) = pairs {
                            map.retain(|k, v| pairs.get(k) != Some(v));
                        }
                    } else {
                        let keys = match operand.as_array().map(Vec::as_slice) {
                            Some([Value::String(t), Value::Array(items)]) if t == "set" => items
                                .iter()
                                .map(|k| key.decode_atom(column, k))
                                .collect::<Result<Vec<_>>>(),
                            _ => key.decode_atom(column, operand).map(|k| vec![k]),
                        }
                        .map_err(|e| OpError::constraint(e.to_string()))?;
                        map.retain(|k, _| !keys.contains(k));
                    }
                    Datum::Map(map)
                }
                _ => return Err(OpError::constraint(format!("cannot delete from {}", column))),
            },
            other => return Err(OpError::syntax(format!("unknown mutator {}", other))),
        };
        let mutated = canonical(mutated);
        schema
            .validate(column, &mutated)
            .map_err(|e| OpError::constraint(e.to_string()))?;
        Ok(mutated)
    }

    fn execute(
        &self,
        tables: &mut Tables,
        named: &mut HashMap<String, Uuid>,
        op: &Value,
    ) -> OpResult<Value> {
        let kind = op.get("op").and_then(Value::as_str).unwrap_or_default();
        match kind {
            "comment" | "commit" | "assert" => return Ok(json!({})),
            "abort" => {
                return Err(OpError {
                    error: "aborted",
                    details: "aborted by request".to_string(),
                })
            }
            _ => {}
        }
        let table_name = op
            .get("table")
            .and_then(Value::as_str)
            .ok_or_else(|| OpError::syntax(format!("{} without table", kind)))?;
        let table = self.table(table_name)?;
        let conditions = Self::decode_conditions(table, op.get("where"), named)?;
        let rows = tables.entry(table_name.to_string()).or_default();

        match kind {
            "insert" => {
                let row = Self::decode_row(table, table_name, op.get("row"), named)?;
                let row = Self::complete_row(table, row);
                for (name, value) in &row {
                    if let Some(column) = table.columns.get(name) {
                        column
                            .validate(name, value)
                            .map_err(|e| OpError::constraint(e.to_string()))?;
                    }
                }
                let uuid = Uuid::new_v4();
                if let Some(name) = op.get("uuid-name").and_then(Value::as_str) {
                    named.insert(name.to_string(), uuid);
                }
                rows.insert(uuid, row);
                Ok(json!({"uuid": ["uuid", uuid.to_string()]}))
            }
            "select" => {
                let columns: Option<Vec<String>> = op
                    .get("columns")
                    .and_then(|c| serde_json::from_value(c.clone()).ok());
                let selected: Vec<Value> = rows
                    .iter()
                    .filter(|(uuid, row)| matches(uuid, row, &conditions))
                    .map(|(uuid, row)| wire_row(uuid, row, columns.as_deref()))
                    .collect();
                Ok(json!({ "rows": selected }))
            }
            "update" => {
                let update = Self::decode_row(table, table_name, op.get("row"), named)?;
                for name in update.keys() {
                    let column = lookup_column(table, name)?;
                    if name == "_uuid" || !column.mutable {
                        return Err(OpError::constraint(format!("column {} is not mutable", name)));
                    }
                }
                let mut count = 0;
                for (uuid, row) in rows.iter_mut() {
                    if matches(uuid, row, &conditions) {
                        row.extend(update.clone());
                        count += 1;
                    }
                }
                Ok(json!({ "count": count }))
            }
            "mutate" => {
                let mutations = op
                    .get("mutations")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                let mut count = 0;
                for (uuid, row) in rows.iter_mut() {
                    if !matches(uuid, row, &conditions) {
                        continue;
                    }
                    for mutation in &mutations {
                        let column = mutation
                            .get(0)
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string();
                        let current = column_value(uuid, row, &column);
                        let mutated = Self::apply_mutation(table, current, mutation, named)?;
                        row.insert(column, mutated);
                    }
                    count += 1;
                }
                Ok(json!({ "count": count }))
            }
            "delete" => {
                let before = rows.len();
                rows.retain(|uuid, row| !matches(uuid, row, &conditions));
                Ok(json!({ "count": before - rows.len() }))
            }
            "wait" => {
                let columns: Vec<String> = op
                    .get("columns")
                    .and_then(|c| serde_json::from_value(c.clone()).ok())
                    .unwrap_or_default();
                let mut expected = Vec::new();
                for row in op.get("rows").and_then(Value::as_array).into_iter().flatten() {
                    let decoded = Self::decode_row(table, table_name, Some(row), named)?;
                    expected.push(columns.iter().map(|c| decoded.get(c).cloned()).collect::<Vec<_>>());
                }
                let mut actual: Vec<Vec<Option<Datum>>> = rows
                    .iter()
                    .filter(|(uuid, row)| matches(uuid, row, &conditions))
                    .map(|(uuid, row)| {
                        columns
                            .iter()
                            .map(|c| Some(column_value(uuid, row, c)))
                            .collect()
                    })
                    .collect();
                expected.sort();
                actual.sort();
                let equal = expected == actual;
                let wanted = op.get("until").and_then(Value::as_str).unwrap_or("==");
                if (wanted == "==") == equal {
                    Ok(json!({}))
                } else {
                    Err(OpError {
                        error: "timed out",
                        details: format!("wait on {} not satisfied", table_name),
                    })
                }
            }
            other => Err(OpError::syntax(format!("unknown operation {}", other))),
        }
    }

    /// Every schema index must identify at most one row
    fn check_indexes(&self, tables: &Tables) -> std::result::Result<(), String> {
        for (name, table) in &self.schema.tables {
            let Some(rows) = tables.get(name) else {
                continue;
            };
            for index in &table.indexes {
                let mut seen: BTreeMap<Vec<Datum>, Uuid> = BTreeMap::new();
                for (uuid, row) in rows {
                    let key: Vec<Datum> = index.iter().map(|c| column_value(uuid, row, c)).collect();
                    if let Some(first) = seen.insert(key, *uuid) {
                        return Err(format!(
                            "Transaction causes multiple rows in \"{}\" table to have identical values for index on columns {:?} (rows {} and {})",
                            name, index, first, uuid
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    fn transact(&self, session: u64, params: &Value, out: &mut Vec<Value>) -> std::result::Result<Value, String> {
        let params = params.as_array().ok_or("transact params must be an array")?;
        let (db, ops) = params.split_first().ok_or("transact without database")?;
        if db.as_str() != Some(self.schema.name.as_str()) {
            return Err(format!("unknown database {}", db));
        }

        let mut live = lock(&self.db);
        let mut working = live.clone();
        let mut named = HashMap::new();
        let mut results = Vec::with_capacity(ops.len() + 1);
        let mut failed = false;
        for op in ops {
            if failed {
                results.push(Value::Null);
                continue;
            }
            match self.execute(&mut working, &mut named, op) {
                Ok(result) => results.push(result),
                Err(e) => {
                    results.push(json!({"error": e.error, "details": e.details}));
                    failed = true;
                }
            }
        }
        if !failed {
            match self.check_indexes(&working) {
                Ok(()) => {
                    let old = std::mem::replace(&mut *live, working);
                    self.publish(session, &old, &live, out);
                }
                Err(details) => {
                    results.push(json!({"error": "constraint violation", "details": details}))
                }
            }
        }
        Ok(Value::Array(results))
    }

    fn table_diff(old: &Tables, new: &Tables, table: &str, monitor: &TableMonitor) -> Map<String, Value> {
        let empty = BTreeMap::new();
        let before = old.get(table).unwrap_or(&empty);
        let after = new.get(table).unwrap_or(&empty);
        let columns = Some(monitor.columns.as_slice());
        let mut diff = Map::new();
        for (uuid, row) in after {
            match before.get(uuid) {
                None if monitor.insert => {
                    diff.insert(uuid.to_string(), json!({"new": wire_row(uuid, row, columns)}));
                }
                Some(prev) if monitor.modify => {
                    let changed: Vec<String> = monitor
                        .columns
                        .iter()
                        .filter(|c| prev.get(*c) != row.get(*c))
                        .cloned()
                        .collect();
                    if !changed.is_empty() {
                        diff.insert(
                            uuid.to_string(),
                            json!({
                                "old": wire_row(uuid, prev, Some(changed.as_slice())),
                                "new": wire_row(uuid, row, columns),
                            }),
                        );
                    }
                }
                _ => {}
            }
        }
        if monitor.delete {
            for (uuid, row) in before {
                if !after.contains_key(uuid) {
                    diff.insert(uuid.to_string(), json!({"old": wire_row(uuid, row, columns)}));
                }
            }
        }
        diff
    }

    fn publish(&self, session: u64, old: &Tables, new: &Tables, out: &mut Vec<Value>) {
        let sessions = lock(&self.sessions);
        for (id, handle) in sessions.iter() {
            for monitor in handle.monitors.values() {
                let mut updates = Map::new();
                for (table, spec) in &monitor.tables {
                    let diff = Self::table_diff(old, new, table, spec);
                    if !diff.is_empty() {
                        updates.insert(table.clone(), Value::Object(diff));
                    }
                }
                if updates.is_empty() {
                    continue;
                }
                let notification = json!({
                    "id": null,
                    "method": "update",
                    "params": [monitor.id, updates],
                });
                if *id == session {
                    out.push(notification);
                } else {
                    let _ = handle.tx.send(Control::Send(notification));
                }
            }
        }
    }

    fn monitor(&self, session: u64, params: &Value) -> std::result::Result<Value, String> {
        let Some([db, id, requests]) = params.as_array().map(Vec::as_slice) else {
            return Err("monitor expects [db, id, requests]".to_string());
        };
        if db.as_str() != Some(self.schema.name.as_str()) {
            return Err(format!("unknown database {}", db));
        }
        let requests = requests.as_object().ok_or("monitor requests must be an object")?;

        let mut tables = BTreeMap::new();
        for (table_name, request) in requests {
            let table = self
                .schema
                .table(table_name)
                .ok_or_else(|| format!("unknown table {}", table_name))?;
            let request = match request {
                Value::Array(items) => items.first().cloned().unwrap_or_default(),
                other => other.clone(),
            };
            let mut columns: Vec<String> = request
                .get("columns")
                .and_then(|c| serde_json::from_value(c.clone()).ok())
                .unwrap_or_default();
            if columns.is_empty() {
                columns = table.columns.keys().cloned().collect();
            }
            if let Some(bad) = columns.iter().find(|c| !table.has_column(c)) {
                return Err(format!("unknown column {} in table {}", bad, table_name));
            }
            let select = |flag: &str| {
                request
                    .get("select")
                    .and_then(|s| s.get(flag))
                    .and_then(Value::as_bool)
                    .unwrap_or(true)
            };
            tables.insert(
                table_name.clone(),
                TableMonitor {
                    columns,
                    initial: select("initial"),
                    insert: select("insert"),
                    delete: select("delete"),
                    modify: select("modify"),
                },
            );
        }

        let db = lock(&self.db);
        let mut initial = Map::new();
        for (table, spec) in &tables {
            if !spec.initial {
                continue;
            }
            let rows: Map<String, Value> = db
                .get(table)
                .into_iter()
                .flatten()
                .map(|(uuid, row)| {
                    (
                        uuid.to_string(),
                        json!({"new": wire_row(uuid, row, Some(spec.columns.as_slice()))}),
                    )
                })
                .collect();
            if !rows.is_empty() {
                initial.insert(table.clone(), Value::Object(rows));
            }
        }

        let mut sessions = lock(&self.sessions);
        let handle = sessions.get_mut(&session).ok_or("session closed")?;
        let key = id.to_string();
        if handle.monitors.contains_key(&key) {
            return Err(format!("duplicate monitor ID {}", key));
        }
        handle.monitors.insert(
            key,
            MonitorSpec {
                id: id.clone(),
                tables,
            },
        );
        Ok(Value::Object(initial))
    }

    fn monitor_cancel(&self, session: u64, params: &Value) -> std::result::Result<Value, String> {
        let Some([id]) = params.as_array().map(Vec::as_slice) else {
            return Err("monitor_cancel expects [id]".to_string());
        };
        let mut sessions = lock(&self.sessions);
        let handle = sessions.get_mut(&session).ok_or("session closed")?;
        handle
            .monitors
            .remove(&id.to_string())
            .map(|_| json!({}))
            .ok_or_else(|| "unknown monitor".to_string())
    }

    fn handle(&self, session: u64, message: Value) -> Vec<Value> {
        let Some(method) = message.get("method").and_then(Value::as_str) else {
            // Reply to a server-initiated echo
            if let Some(id) = message.get("id").and_then(Value::as_str) {
                if let Some(waiter) = lock(&self.echo_waiters).remove(id) {
                    let _ = waiter.send(message.get("result").cloned().unwrap_or_default());
                }
            }
            return Vec::new();
        };
        let id = message.get("id").cloned().unwrap_or_default();
        let params = message.get("params").cloned().unwrap_or_else(|| json!([]));
        *lock(&self.requests).entry(method.to_string()).or_default() += 1;
        debug!("mock ovsdb <- {} {}", method, params);

        let mut out = Vec::new();
        let result = match method {
            "list_dbs" => Ok(json!([self.schema.name])),
            "get_schema" => match params.get(0).and_then(Value::as_str) {
                Some(db) if db == self.schema.name => Ok(self.schema_json.clone()),
                other => Err(format!("unknown database {:?}", other)),
            },
            "echo" => Ok(params.clone()),
            "transact" => self.transact(session, &params, &mut out),
            "monitor" => self.monitor(session, &params),
            "monitor_cancel" => self.monitor_cancel(session, &params),
            other => Err(format!("unknown method {}", other)),
        };
        if !id.is_null() {
            out.push(match result {
                Ok(result) => json!({"id": id, "result": result, "error": null}),
                Err(error) => json!({"id": id, "result": null, "error": error}),
            });
        }
        out
    }
}

async fn write_all(writer: &mut OwnedWriteHalf, messages: &[Value]) -> std::io::Result<()> {
    for message in messages {
        let bytes = protocol::encode(message).map_err(std::io::Error::other)?;
        writer.write_all(&bytes).await?;
    }
    writer.flush().await
}

async fn serve(
    state: Arc<MockState>,
    session: u64,
    stream: UnixStream,
    mut control: mpsc::UnboundedReceiver<Control>,
) {
    let (mut reader, mut writer) = stream.into_split();
    let mut framer = MessageFramer::new();
    let mut buf = vec![0u8; 16 * 1024];
    'session: loop {
        tokio::select! {
            read = reader.read(&mut buf) => {
                let n = match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                framer.push(&buf[..n]);
                loop {
                    let message = match framer.next_message() {
                        Ok(Some(message)) => message,
                        Ok(None) => break,
                        Err(_) => break 'session,
                    };
                    let out = state.handle(session, message);
                    if write_all(&mut writer, &out).await.is_err() {
                        break 'session;
                    }
                }
            }
            ctl = control.recv() => match ctl {
                Some(Control::Send(message)) => {
                    if write_all(&mut writer, &[message]).await.is_err() {
                        break;
                    }
                }
                Some(Control::Close) | None => break,
            }
        }
    }
    lock(&state.sessions).remove(&session);
    debug!("mock ovsdb session {} closed", session);
}

/// Mock `ovsdb-server` listening on `unix:<tempdir>/db.sock`
pub struct MockServer {
    _dir: TempDir,
    path: PathBuf,
    state: Arc<MockState>,
    accept: JoinHandle<()>,
}

impl MockServer {
    /// Serve [`open_vswitch_schema`]
    pub async fn start() -> Result<Self> {
        Self::with_schema(open_vswitch_schema()).await
    }

    pub async fn with_schema(schema_json: Value) -> Result<Self> {
        let schema = DatabaseSchema::from_json(schema_json.clone())?;
        let dir = TempDir::new()?;
        let path = dir.path().join("db.sock");
        let listener = UnixListener::bind(&path)?;

        let mut db = Tables::new();
        for name in schema.tables.keys() {
            db.insert(name.clone(), BTreeMap::new());
        }
        let state = Arc::new(MockState {
            schema_json,
            schema,
            db: Mutex::new(db),
            sessions: Mutex::new(BTreeMap::new()),
            next_session: AtomicU64::new(1),
            next_echo: AtomicU64::new(1),
            echo_waiters: Mutex::new(HashMap::new()),
            requests: Mutex::new(BTreeMap::new()),
        });

        let accept_state = state.clone();
        let accept = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let session = accept_state.next_session.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = mpsc::unbounded_channel();
                lock(&accept_state.sessions).insert(
                    session,
                    SessionHandle {
                        tx,
                        monitors: BTreeMap::new(),
                    },
                );
                tokio::spawn(serve(accept_state.clone(), session, stream, rx));
            }
        });

        Ok(Self {
            _dir: dir,
            path,
            state,
            accept,
        })
    }

    /// Endpoint string for [`crate::ClientConfig`]
    pub fn endpoint(&self) -> String {
        format!("unix:{}", self.path.display())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn schema(&self) -> &DatabaseSchema {
        &self.state.schema
    }

    /// Seed a row directly. Columns left out get schema defaults; monitors
    /// are not notified.
    pub fn insert_row(&self, table: &str, row: Row) -> Uuid {
        let uuid = Uuid::new_v4();
        let row = match self.state.schema.table(table) {
            Some(schema) => MockState::complete_row(schema, row),
            None => row,
        };
        lock(&self.state.db)
            .entry(table.to_string())
            .or_default()
            .insert(uuid, row);
        uuid
    }

    /// Current committed contents of `table`
    pub fn rows(&self, table: &str) -> BTreeMap<Uuid, Row> {
        lock(&self.state.db).get(table).cloned().unwrap_or_default()
    }

    /// Rows of `table` whose string `column` equals `value`
    pub fn rows_named(&self, table: &str, value: &str) -> Vec<(Uuid, Row)> {
        self.rows(table)
            .into_iter()
            .filter(|(_, row)| row.get("name") == Some(&Datum::string(value)))
            .collect()
    }

    /// Number of requests received for `method` across all sessions
    pub fn request_count(&self, method: &str) -> usize {
        lock(&self.state.requests).get(method).copied().unwrap_or(0)
    }

    pub fn session_count(&self) -> usize {
        lock(&self.state.sessions).len()
    }

    /// Send an `echo` request to every session and collect the replies
    pub async fn send_echo(&self, params: Value) -> Vec<Value> {
        let mut waiters = Vec::new();
        {
            let sessions = lock(&self.state.sessions);
            for handle in sessions.values() {
                let id = format!("echo-{}", self.state.next_echo.fetch_add(1, Ordering::Relaxed));
                let (tx, rx) = oneshot::channel();
                lock(&self.state.echo_waiters).insert(id.clone(), tx);
                let request = json!({"method": "echo", "params": params, "id": id});
                if handle.tx.send(Control::Send(request)).is_ok() {
                    waiters.push(rx);
                }
            }
        }
        let mut replies = Vec::new();
        for rx in waiters {
            if let Ok(Ok(reply)) = tokio::time::timeout(Duration::from_secs(5), rx).await {
                replies.push(reply);
            }
        }
        replies
    }

    /// Drop every client connection
    pub fn disconnect_all(&self) {
        for (_, handle) in std::mem::take(&mut *lock(&self.state.sessions)) {
            let _ = handle.tx.send(Control::Close);
        }
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.accept.abort();
        self.disconnect_all();
    }
}
