//! Schema-aware wire decoding and value validation
//!
//! The same wire shape (`["x", [...]]`) means different things for different
//! columns, so decoding always starts from the column's resolved type.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::datum::{Atom, Datum, Row, UuidRef};
use crate::error::{OvsdbError, Result};
use crate::schema::{AtomicType, BaseType, ColumnSchema, ExtendedType, TableSchema};

impl BaseType {
    /// Decode one wire atom of this base type
    pub fn decode_atom(&self, column: &str, value: &Value) -> Result<Atom> {
        let atom = match (self.atomic, value) {
            (AtomicType::Integer, Value::Number(n)) => n
                .as_i64()
                .map(Atom::Integer)
                .ok_or_else(|| OvsdbError::invalid_value(column, format!("{} is not an integer", n)))?,
            (AtomicType::Real, Value::Number(n)) => n
                .as_f64()
                .map(Atom::Real)
                .ok_or_else(|| OvsdbError::invalid_value(column, format!("{} is not a real", n)))?,
            (AtomicType::Boolean, Value::Bool(b)) => Atom::Boolean(*b),
            (AtomicType::String, Value::String(s)) => Atom::String(s.clone()),
            (AtomicType::Uuid, Value::Array(parts)) => Atom::Uuid(decode_uuid(column, parts)?),
            (expected, other) => {
                return Err(OvsdbError::invalid_value(
                    column,
                    format!("expected {}, got {}", expected, other),
                ))
            }
        };
        Ok(atom)
    }

    /// Type, range, length and enum checks for one atom
    pub fn check(&self, column: &str, atom: &Atom) -> Result<()> {
        match (self.atomic, atom) {
            (AtomicType::Integer, Atom::Integer(i)) => {
                if self.min_integer.is_some_and(|min| *i < min)
                    || self.max_integer.is_some_and(|max| *i > max)
                {
                    return Err(OvsdbError::invalid_value(
                        column,
                        format!(
                            "{} outside [{}, {}]",
                            i,
                            self.min_integer.map_or("-inf".to_string(), |v| v.to_string()),
                            self.max_integer.map_or("inf".to_string(), |v| v.to_string())
                        ),
                    ));
                }
            }
            (AtomicType::Real, Atom::Real(r)) => {
                if self.min_real.is_some_and(|min| *r < min)
                    || self.max_real.is_some_and(|max| *r > max)
                {
                    return Err(OvsdbError::invalid_value(column, format!("{} out of range", r)));
                }
            }
            (AtomicType::Real, Atom::Integer(_)) => {}
            (AtomicType::Boolean, Atom::Boolean(_)) => {}
            (AtomicType::String, Atom::String(s)) => {
                let len = s.chars().count() as u64;
                if self.min_length.is_some_and(|min| len < min)
                    || self.max_length.is_some_and(|max| len > max)
                {
                    return Err(OvsdbError::invalid_value(
                        column,
                        format!("string length {} out of range", len),
                    ));
                }
            }
            (AtomicType::Uuid, Atom::Uuid(_)) => {}
            (expected, other) => {
                return Err(OvsdbError::invalid_value(
                    column,
                    format!("expected {}, got {}", expected, other.type_name()),
                ))
            }
        }
        if !self.enum_values.is_empty() && !self.enum_values.contains(atom) {
            return Err(OvsdbError::invalid_value(
                column,
                format!("{:?} is not one of the allowed values", atom),
            ));
        }
        Ok(())
    }

    fn default_atom(&self) -> Atom {
        if let Some(first) = self.enum_values.first() {
            return first.clone();
        }
        match self.atomic {
            AtomicType::Integer => Atom::Integer(0),
            AtomicType::Real => Atom::Real(0.0),
            AtomicType::Boolean => Atom::Boolean(false),
            AtomicType::String => Atom::String(String::new()),
            AtomicType::Uuid => Atom::Uuid(UuidRef::Real(Uuid::nil())),
        }
    }
}

fn decode_uuid(column: &str, parts: &[Value]) -> Result<UuidRef> {
    match parts {
        [Value::String(tag), Value::String(id)] if tag == "uuid" => Uuid::parse_str(id)
            .map(UuidRef::Real)
            .map_err(|e| OvsdbError::invalid_value(column, format!("bad uuid '{}': {}", id, e))),
        [Value::String(tag), Value::String(name)] if tag == "named-uuid" => {
            Ok(UuidRef::Named(name.clone()))
        }
        _ => Err(OvsdbError::invalid_value(
            column,
            format!("malformed uuid {}", Value::Array(parts.to_vec())),
        )),
    }
}

/// Splits `["<tag>", payload]` if the tag matches
fn tagged<'a>(value: &'a Value, tag: &str) -> Option<&'a Value> {
    match value {
        Value::Array(parts) if parts.len() == 2 && parts[0] == tag => Some(&parts[1]),
        _ => None,
    }
}

impl ColumnSchema {
    /// Decode a wire value according to this column's resolved type.
    ///
    /// Set columns accept both `["set", [...]]` and a bare atom.
    pub fn decode(&self, column: &str, value: &Value) -> Result<Datum> {
        let key = &self.type_obj.key;
        match self.extended_type {
            ExtendedType::Map => {
                let value_type = self.type_obj.value.as_ref().ok_or_else(|| {
                    OvsdbError::invalid_value(column, "map column without value type")
                })?;
                let pairs = tagged(value, "map")
                    .and_then(Value::as_array)
                    .ok_or_else(|| {
                        OvsdbError::invalid_value(column, format!("expected [\"map\", ...], got {}", value))
                    })?;
                let mut map = BTreeMap::new();
                for pair in pairs {
                    match pair.as_array().map(Vec::as_slice) {
                        Some([k, v]) => {
                            map.insert(key.decode_atom(column, k)?, value_type.decode_atom(column, v)?);
                        }
                        _ => {
                            return Err(OvsdbError::invalid_value(
                                column,
                                format!("malformed map pair {}", pair),
                            ))
                        }
                    }
                }
                Ok(Datum::Map(map))
            }
            ExtendedType::Set => match tagged(value, "set") {
                Some(Value::Array(items)) => items
                    .iter()
                    .map(|item| key.decode_atom(column, item))
                    .collect::<Result<Vec<_>>>()
                    .map(Datum::Set),
                Some(other) => Err(OvsdbError::invalid_value(
                    column,
                    format!("malformed set payload {}", other),
                )),
                None => Ok(Datum::Set(vec![key.decode_atom(column, value)?])),
            },
            _ => {
                let atom = key.decode_atom(column, value)?;
                key.check(column, &atom)?;
                Ok(Datum::Atom(atom))
            }
        }
    }

    /// Shape, cardinality and per-element checks
    pub fn validate(&self, column: &str, datum: &Datum) -> Result<()> {
        self.validate_with(column, datum, true)
    }

    /// Like [`ColumnSchema::validate`] without the cardinality bounds, for
    /// condition and mutation operands that are partial values
    pub fn validate_elements(&self, column: &str, datum: &Datum) -> Result<()> {
        self.validate_with(column, datum, false)
    }

    fn validate_with(&self, column: &str, datum: &Datum, cardinality: bool) -> Result<()> {
        let key = &self.type_obj.key;
        match (self.extended_type, datum) {
            (ExtendedType::Map, Datum::Map(map)) => {
                if cardinality && !self.type_obj.allows(map.len()) {
                    return Err(self.cardinality_error(column, map.len()));
                }
                let value_type = self.type_obj.value.as_ref().ok_or_else(|| {
                    OvsdbError::invalid_value(column, "map column without value type")
                })?;
                for (k, v) in map {
                    key.check(column, k)?;
                    value_type.check(column, v)?;
                }
                Ok(())
            }
            (ExtendedType::Set, Datum::Set(items)) => {
                if cardinality && !self.type_obj.allows(items.len()) {
                    return Err(self.cardinality_error(column, items.len()));
                }
                items.iter().try_for_each(|a| key.check(column, a))
            }
            (ExtendedType::Map | ExtendedType::Set, other) => Err(OvsdbError::invalid_value(
                column,
                format!(
                    "expected {}, got {}",
                    if self.extended_type == ExtendedType::Map { "map" } else { "set" },
                    other.shape_name()
                ),
            )),
            (_, Datum::Atom(atom)) => key.check(column, atom),
            (_, other) => Err(OvsdbError::invalid_value(
                column,
                format!("expected {}, got {}", key.atomic, other.shape_name()),
            )),
        }
    }

    fn cardinality_error(&self, column: &str, len: usize) -> OvsdbError {
        let max = if self.type_obj.max == crate::schema::UNLIMITED {
            "unlimited".to_string()
        } else {
            self.type_obj.max.to_string()
        };
        OvsdbError::invalid_value(
            column,
            format!("{} elements outside [{}, {}]", len, self.type_obj.min, max),
        )
    }

    /// Wrap a bare atom into a set, or unwrap a one-element set, to match
    /// the column shape
    pub fn normalize(&self, datum: Datum) -> Datum {
        match (self.extended_type, datum) {
            (ExtendedType::Set, Datum::Atom(a)) => Datum::Set(vec![a]),
            (ExtendedType::Map | ExtendedType::Set, d) => d,
            (_, Datum::Set(mut items)) if items.len() == 1 => match items.pop() {
                Some(a) => Datum::Atom(a),
                None => Datum::Set(items),
            },
            (_, d) => d,
        }
    }

    /// The value a freshly inserted row holds when the column is omitted
    pub fn default_datum(&self) -> Datum {
        match self.extended_type {
            ExtendedType::Map => Datum::Map(BTreeMap::new()),
            ExtendedType::Set if self.type_obj.min == 0 => Datum::Set(Vec::new()),
            ExtendedType::Set => Datum::Set(vec![self.type_obj.key.default_atom()]),
            _ => Datum::Atom(self.type_obj.key.default_atom()),
        }
    }
}

impl TableSchema {
    /// Decode a wire row; `_uuid` and `_version` are accepted on any table
    pub fn decode_row(&self, table: &str, row: &Map<String, Value>) -> Result<Row> {
        row.iter()
            .map(|(name, value)| {
                let column = self.wire_column(name).ok_or_else(|| OvsdbError::UnknownColumn {
                    table: table.to_string(),
                    column: name.clone(),
                })?;
                Ok((name.clone(), column.decode(name, value)?))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::TypeObject;
    use serde_json::json;

    fn column(type_json: Value) -> ColumnSchema {
        serde_json::from_value(json!({ "type": type_json })).unwrap()
    }

    fn round_trip(c: &ColumnSchema, d: Datum) {
        c.validate("c", &d).unwrap();
        let wire = serde_json::to_value(&d).unwrap();
        assert_eq!(c.decode("c", &wire).unwrap(), d, "wire form {}", wire);
    }

    #[test]
    fn test_round_trip_atomic() {
        round_trip(&column(json!("integer")), Datum::integer(-42));
        round_trip(&column(json!("string")), Datum::string("veth0"));
        round_trip(&column(json!("boolean")), Datum::Atom(Atom::Boolean(true)));
        round_trip(&column(json!("real")), Datum::Atom(Atom::Real(1.5)));
    }

    #[test]
    fn test_round_trip_uuid() {
        let c = column(json!({"key": {"type": "uuid", "refTable": "Port"}}));
        round_trip(&c, Datum::uuid(Uuid::new_v4()));
        round_trip(&c, Datum::named_uuid("new_port"));
    }

    #[test]
    fn test_round_trip_set() {
        let c = column(json!({"key": "integer", "min": 0, "max": "unlimited"}));
        round_trip(&c, Datum::Set(vec![]));
        round_trip(&c, Datum::Set(vec![Atom::Integer(1), Atom::Integer(20)]));
    }

    #[test]
    fn test_round_trip_map() {
        let c = column(json!({"key": "string", "value": "string", "min": 0, "max": "unlimited"}));
        round_trip(&c, Datum::string_map([("contIface", "eth0"), ("owner", "ovs-cni")]));
    }

    #[test]
    fn test_set_accepts_bare_atom() {
        let c = column(json!({"key": {"type": "uuid"}, "min": 0, "max": "unlimited"}));
        let id = Uuid::new_v4();
        let decoded = c.decode("ports", &json!(["uuid", id.to_string()])).unwrap();
        assert_eq!(decoded, Datum::Set(vec![Atom::Uuid(UuidRef::Real(id))]));
    }

    #[test]
    fn test_same_shape_disambiguated_by_type() {
        // A one-element string set whose only element is literally "set"
        let c = column(json!({"key": "string", "min": 0, "max": "unlimited"}));
        let decoded = c.decode("c", &json!(["set", ["set"]])).unwrap();
        assert_eq!(decoded, Datum::Set(vec![Atom::string("set")]));

        let atomic = column(json!("string"));
        assert!(atomic.decode("c", &json!(["set", ["a"]])).is_err());
    }

    #[test]
    fn test_enum_enforced() {
        let c = column(json!({"key": {"type": "string", "enum": ["set", ["access", "trunk"]]}, "min": 0, "max": 1}));
        assert!(c.validate("vlan_mode", &Datum::Set(vec![Atom::string("access")])).is_ok());
        assert!(c.validate("vlan_mode", &Datum::Set(vec![Atom::string("bogus")])).is_err());
        assert!(c.decode("vlan_mode", &json!("trunk")).is_ok());
    }

    #[test]
    fn test_cardinality_enforced() {
        let c = column(json!({"key": {"type": "integer", "minInteger": 0, "maxInteger": 4095}, "min": 0, "max": 1}));
        assert!(c.validate("tag", &Datum::Set(vec![Atom::Integer(100)])).is_ok());
        assert!(c
            .validate("tag", &Datum::Set(vec![Atom::Integer(1), Atom::Integer(2)]))
            .is_err());
        assert!(c.validate("tag", &Datum::Set(vec![Atom::Integer(5000)])).is_err());
        assert!(c.validate("tag", &Datum::integer(1)).is_err());
    }

    #[test]
    fn test_normalize() {
        let set = ColumnSchema::new(TypeObject {
            min: 0,
            max: 1,
            ..TypeObject::atomic(AtomicType::Integer)
        });
        assert_eq!(set.normalize(Datum::integer(3)), Datum::Set(vec![Atom::Integer(3)]));

        let atomic = column(json!("string"));
        assert_eq!(
            atomic.normalize(Datum::Set(vec![Atom::string("x")])),
            Datum::string("x")
        );
    }

    #[test]
    fn test_decode_row_tolerates_meta_columns() {
        let table: TableSchema = serde_json::from_value(json!({
            "columns": {"name": {"type": "string"}}
        }))
        .unwrap();
        let id = Uuid::new_v4().to_string();
        let wire = json!({"_uuid": ["uuid", id], "_version": ["uuid", id], "name": "br0"});
        let row = table.decode_row("Bridge", wire.as_object().unwrap()).unwrap();
        assert_eq!(row.get("name"), Some(&Datum::string("br0")));
        assert!(row.contains_key("_version"));

        let wire = json!({"nope": 1});
        assert!(table.decode_row("Bridge", wire.as_object().unwrap()).is_err());
    }
}
