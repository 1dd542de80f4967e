//! Mapping between typed models and schema-validated rows
//!
//! A [`Model`] is a plain struct with hand-written column visitors. The
//! [`Mapper`] pairs models with the live schema to build rows, conditions,
//! mutations and monitor requests, and to pick the index that identifies a row.

use std::sync::Arc;

use crate::datum::{Datum, Row};
use crate::error::{OvsdbError, Result};
use crate::operation::{Condition, ConditionFunction, MonitorRequest, Mutation, Mutator};
use crate::schema::{AtomicType, ColumnSchema, DatabaseSchema, ExtendedType, TableSchema};

/// A struct that maps onto rows of one table
pub trait Model: Default {
    /// Table this model maps to
    const TABLE: &'static str;

    /// Columns this model carries a field for, `_uuid` included if mapped
    const COLUMNS: &'static [&'static str];

    /// Current value of the field mapped to `column`
    fn column(&self, column: &str) -> Option<Datum>;

    /// Overwrite the field mapped to `column`
    fn set_column(&mut self, column: &str, value: Datum) -> Result<()>;
}

/// Schema-aware translator between models and wire structures
#[derive(Debug, Clone)]
pub struct Mapper {
    schema: Arc<DatabaseSchema>,
}

impl Mapper {
    pub fn new(schema: Arc<DatabaseSchema>) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &DatabaseSchema {
        &self.schema
    }

    fn table<M: Model>(&self) -> Result<&TableSchema> {
        self.schema.require_table(M::TABLE)
    }

    /// Resolve a model field to its schema column
    fn model_column<M: Model>(&self, column: &str) -> Result<&ColumnSchema> {
        if !M::COLUMNS.contains(&column) {
            return Err(OvsdbError::UnknownColumn {
                table: M::TABLE.to_string(),
                column: column.to_string(),
            });
        }
        self.table::<M>()?
            .column(column)
            .ok_or_else(|| OvsdbError::UnknownColumn {
                table: M::TABLE.to_string(),
                column: column.to_string(),
            })
    }

    /// Build a row from a model.
    ///
    /// With no `fields`, columns holding their default value are left out so
    /// an update does not clobber them. With `fields`, exactly those columns
    /// are included, defaults or not.
    pub fn row_from_model<M: Model>(&self, model: &M, fields: &[&str]) -> Result<Row> {
        let table = self.table::<M>()?;
        for field in fields {
            self.model_column::<M>(field)?;
        }
        let mut row = Row::new();
        for &name in M::COLUMNS {
            let Some(column) = table.columns.get(name) else {
                continue;
            };
            if !fields.is_empty() && !fields.contains(&name) {
                continue;
            }
            let Some(value) = model.column(name) else {
                continue;
            };
            if fields.is_empty() && value.is_default() {
                continue;
            }
            let value = column.normalize(value);
            column.validate(name, &value)?;
            row.insert(name.to_string(), value);
        }
        Ok(row)
    }

    /// Copy row values into a model; columns absent from the row are left alone
    pub fn model_from_row<M: Model>(&self, row: &Row, model: &mut M) -> Result<()> {
        let table = self.table::<M>()?;
        for &name in M::COLUMNS {
            if table.column(name).is_none() {
                continue;
            }
            if let Some(value) = row.get(name) {
                model.set_column(name, value.clone())?;
            }
        }
        Ok(())
    }

    /// Decode a row into a fresh model
    pub fn decode<M: Model>(&self, row: &Row) -> Result<M> {
        let mut model = M::default();
        self.model_from_row(row, &mut model)?;
        Ok(model)
    }

    /// Candidate indexes (`_uuid` first, then schema order) whose columns all
    /// hold non-default values on `model`
    pub fn valid_indexes<M: Model>(&self, model: &M) -> Result<Vec<Vec<String>>> {
        let table = self.table::<M>()?;
        let candidates =
            std::iter::once(vec!["_uuid".to_string()]).chain(table.indexes.iter().cloned());
        Ok(candidates
            .filter(|index| {
                index.iter().all(|column| {
                    M::COLUMNS.contains(&column.as_str())
                        && model
                            .column(column)
                            .is_some_and(|value| !value.is_default())
                })
            })
            .collect())
    }

    /// Equality conditions identifying `model`.
    ///
    /// Explicit `fields` produce one condition each. Otherwise the first
    /// satisfiable index is used; none satisfiable is an error.
    pub fn equality_conditions<M: Model>(&self, model: &M, fields: &[&str]) -> Result<Vec<Condition>> {
        let columns: Vec<String> = if fields.is_empty() {
            self.valid_indexes(model)?
                .into_iter()
                .next()
                .ok_or_else(|| OvsdbError::NoValidIndex(M::TABLE.to_string()))?
        } else {
            fields.iter().map(|f| f.to_string()).collect()
        };
        columns
            .iter()
            .map(|column| {
                let value = model.column(column).ok_or_else(|| OvsdbError::UnknownColumn {
                    table: M::TABLE.to_string(),
                    column: column.clone(),
                })?;
                self.condition::<M>(column, ConditionFunction::Equal, value)
            })
            .collect()
    }

    /// Two models denote the same row if `_uuid` matches or if every column
    /// of one of `a`'s usable indexes matches on `b`
    pub fn equal_models<M: Model>(&self, a: &M, b: &M, fields: &[&str]) -> Result<bool> {
        if !fields.is_empty() {
            for field in fields {
                self.model_column::<M>(field)?;
            }
            return Ok(fields.iter().all(|f| a.column(f) == b.column(f)));
        }
        Ok(self
            .valid_indexes(a)?
            .iter()
            .any(|index| index.iter().all(|c| a.column(c) == b.column(c))))
    }

    /// Build a validated condition on a model column
    pub fn condition<M: Model>(
        &self,
        column: &str,
        function: ConditionFunction,
        value: Datum,
    ) -> Result<Condition> {
        let schema = self.model_column::<M>(column)?;
        if function.is_ordering() && !is_numeric_scalar(schema) {
            return Err(OvsdbError::invalid_condition(
                column,
                format!("'{:?}' needs an integer or real column", function),
            ));
        }
        let value = schema.normalize(value);
        match function {
            ConditionFunction::Includes | ConditionFunction::Excludes => {
                schema.validate_elements(column, &value)
            }
            _ => schema.validate(column, &value),
        }
        .map_err(|e| OvsdbError::invalid_condition(column, e.to_string()))?;
        Ok(Condition::new(column, function, value))
    }

    /// Build a validated mutation on a model column
    pub fn mutation<M: Model>(&self, column: &str, mutator: Mutator, value: Datum) -> Result<Mutation> {
        let schema = self.model_column::<M>(column)?;
        if column == "_uuid" || !schema.mutable {
            return Err(OvsdbError::invalid_mutation(column, "column is immutable"));
        }
        let key = schema.key();
        let value = match (mutator, schema.extended_type) {
            (m, ExtendedType::Integer | ExtendedType::Real) if m.is_arithmetic() => {
                check_arithmetic(column, m, key.atomic)?;
                scalar_operand(column, schema, value)?
            }
            (m, ExtendedType::Set) if m.is_arithmetic() => {
                if !key.atomic.is_numeric() {
                    return Err(OvsdbError::invalid_mutation(
                        column,
                        "arithmetic needs a set of integers or reals",
                    ));
                }
                check_arithmetic(column, m, key.atomic)?;
                let operand = ColumnSchema::new(crate::schema::TypeObject {
                    key: crate::schema::BaseType::new(key.atomic),
                    value: None,
                    min: 1,
                    max: 1,
                });
                scalar_operand(column, &operand, value)?
            }
            (Mutator::Insert | Mutator::Delete, ExtendedType::Set) => {
                let value = schema.normalize(value);
                schema
                    .validate_elements(column, &value)
                    .map_err(|e| OvsdbError::invalid_mutation(column, e.to_string()))?;
                if let Datum::Set(items) = &value {
                    let max = schema.type_obj.max;
                    if mutator == Mutator::Insert && max != crate::schema::UNLIMITED && items.len() as i64 > max {
                        return Err(OvsdbError::invalid_mutation(
                            column,
                            format!("inserting {} elements exceeds max {}", items.len(), max),
                        ));
                    }
                }
                value
            }
            (Mutator::Insert, ExtendedType::Map) => {
                if !matches!(value, Datum::Map(_)) {
                    return Err(OvsdbError::invalid_mutation(column, "insert into a map needs a map"));
                }
                schema
                    .validate_elements(column, &value)
                    .map_err(|e| OvsdbError::invalid_mutation(column, e.to_string()))?;
                value
            }
            (Mutator::Delete, ExtendedType::Map) => match value {
                Datum::Map(_) => {
                    schema
                        .validate_elements(column, &value)
                        .map_err(|e| OvsdbError::invalid_mutation(column, e.to_string()))?;
                    value
                }
                Datum::Set(keys) => {
                    for k in &keys {
                        key.check(column, k)
                            .map_err(|e| OvsdbError::invalid_mutation(column, e.to_string()))?;
                    }
                    Datum::Set(keys)
                }
                Datum::Atom(_) => {
                    return Err(OvsdbError::invalid_mutation(
                        column,
                        "delete from a map needs a map or a set of keys",
                    ))
                }
            },
            (m, t) => {
                return Err(OvsdbError::invalid_mutation(
                    column,
                    format!("'{:?}' is not valid on a {:?} column", m, t),
                ))
            }
        };
        Ok(Mutation::new(column, mutator, value))
    }

    /// Monitor request for a model's table; no `fields` means every column
    pub fn monitor_request<M: Model>(&self, fields: &[&str]) -> Result<MonitorRequest> {
        let table = self.table::<M>()?;
        let columns = if fields.is_empty() {
            table.columns.keys().cloned().collect()
        } else {
            fields
                .iter()
                .map(|f| self.model_column::<M>(f).map(|_| f.to_string()))
                .collect::<Result<Vec<_>>>()?
        };
        Ok(MonitorRequest::new(columns))
    }
}

fn is_numeric_scalar(schema: &ColumnSchema) -> bool {
    matches!(schema.extended_type, ExtendedType::Integer | ExtendedType::Real)
}

fn check_arithmetic(column: &str, mutator: Mutator, atomic: AtomicType) -> Result<()> {
    if mutator == Mutator::Modulo && atomic != AtomicType::Integer {
        return Err(OvsdbError::invalid_mutation(column, "'%=' needs an integer column"));
    }
    Ok(())
}

fn scalar_operand(column: &str, schema: &ColumnSchema, value: Datum) -> Result<Datum> {
    let value = schema.normalize(value);
    match &value {
        Datum::Atom(atom) => {
            // Range bounds apply to the stored result, not the operand
            let unbounded = crate::schema::BaseType::new(schema.key().atomic);
            unbounded
                .check(column, atom)
                .map_err(|e| OvsdbError::invalid_mutation(column, e.to_string()))?;
            Ok(value)
        }
        other => Err(OvsdbError::invalid_mutation(
            column,
            format!("arithmetic operand must be a scalar, got {}", other.shape_name()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datum::{from_column, Atom, IntoDatum, UuidRef};
    use serde_json::json;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Port {
        uuid: Uuid,
        name: String,
        tag: Option<i64>,
        trunks: Vec<i64>,
        interfaces: Vec<UuidRef>,
        external_ids: BTreeMap<String, String>,
        ofport: i64,
    }

    impl Model for Port {
        const TABLE: &'static str = "Port";
        const COLUMNS: &'static [&'static str] =
            &["_uuid", "name", "tag", "trunks", "interfaces", "external_ids", "ofport"];

        fn column(&self, column: &str) -> Option<Datum> {
            Some(match column {
                "_uuid" => self.uuid.into_datum(),
                "name" => self.name.clone().into_datum(),
                "tag" => self.tag.into_datum(),
                "trunks" => self.trunks.clone().into_datum(),
                "interfaces" => self.interfaces.clone().into_datum(),
                "external_ids" => self.external_ids.clone().into_datum(),
                "ofport" => self.ofport.into_datum(),
                _ => return None,
            })
        }

        fn set_column(&mut self, column: &str, value: Datum) -> Result<()> {
            match column {
                "_uuid" => self.uuid = from_column(column, value)?,
                "name" => self.name = from_column(column, value)?,
                "tag" => self.tag = from_column(column, value)?,
                "trunks" => self.trunks = from_column(column, value)?,
                "interfaces" => self.interfaces = from_column(column, value)?,
                "external_ids" => self.external_ids = from_column(column, value)?,
                "ofport" => self.ofport = from_column(column, value)?,
                _ => {}
            }
            Ok(())
        }
    }

    fn mapper() -> Mapper {
        let schema = DatabaseSchema::from_json(json!({
            "name": "Open_vSwitch",
            "version": "8.3.0",
            "tables": {
                "Port": {
                    "columns": {
                        "name": {"type": "string", "mutable": false},
                        "tag": {"type": {"key": {"type": "integer", "minInteger": 0, "maxInteger": 4095}, "min": 0, "max": 1}},
                        "trunks": {"type": {"key": {"type": "integer", "minInteger": 0, "maxInteger": 4095}, "min": 0, "max": 4096}},
                        "interfaces": {"type": {"key": {"type": "uuid", "refTable": "Interface"}, "min": 1, "max": "unlimited"}},
                        "external_ids": {"type": {"key": "string", "value": "string", "min": 0, "max": "unlimited"}},
                        "ofport": {"type": "integer"}
                    },
                    "indexes": [["name"]]
                }
            }
        }))
        .unwrap();
        Mapper::new(Arc::new(schema))
    }

    fn port(name: &str) -> Port {
        Port {
            name: name.to_string(),
            tag: Some(100),
            interfaces: vec![UuidRef::named("new_interface")],
            ..Default::default()
        }
    }

    #[test]
    fn test_row_skips_defaults() {
        let row = mapper().row_from_model(&port("veth0"), &[]).unwrap();
        let keys: Vec<&str> = row.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["interfaces", "name", "tag"]);
        assert_eq!(row["tag"], Datum::Set(vec![Atom::Integer(100)]));
    }

    #[test]
    fn test_row_with_explicit_fields() {
        let row = mapper()
            .row_from_model(&port("veth0"), &["name", "trunks"])
            .unwrap();
        assert_eq!(row.len(), 2);
        assert_eq!(row["trunks"], Datum::Set(vec![]));
    }

    #[test]
    fn test_row_rejects_invalid_value() {
        let mut p = port("veth0");
        p.tag = Some(9999);
        assert!(mapper().row_from_model(&p, &[]).is_err());
    }

    #[test]
    fn test_model_from_row_leaves_missing_columns() {
        let m = mapper();
        let mut row = Row::new();
        row.insert("name".to_string(), Datum::string("veth1"));
        let mut p = port("veth0");
        m.model_from_row(&row, &mut p).unwrap();
        assert_eq!(p.name, "veth1");
        assert_eq!(p.tag, Some(100));
    }

    #[test]
    fn test_equality_conditions_prefers_uuid() {
        let m = mapper();
        let mut p = port("veth0");
        let by_name = m.equality_conditions(&p, &[]).unwrap();
        assert_eq!(by_name, vec![Condition::equal("name", Datum::string("veth0"))]);

        p.uuid = Uuid::new_v4();
        let by_uuid = m.equality_conditions(&p, &[]).unwrap();
        assert_eq!(by_uuid, vec![Condition::equal("_uuid", Datum::uuid(p.uuid))]);

        let explicit = m.equality_conditions(&p, &["tag"]).unwrap();
        assert_eq!(explicit[0].column, "tag");
    }

    #[test]
    fn test_equality_conditions_without_index_fails() {
        let err = mapper()
            .equality_conditions(&Port::default(), &[])
            .unwrap_err();
        assert!(matches!(err, OvsdbError::NoValidIndex(_)));
    }

    #[test]
    fn test_equal_models() {
        let m = mapper();
        let a = port("veth0");
        let mut b = port("veth0");
        b.tag = None;
        assert!(m.equal_models(&a, &b, &[]).unwrap());
        assert!(!m.equal_models(&a, &b, &["tag"]).unwrap());

        let id = Uuid::new_v4();
        let c = Port { uuid: id, ..port("x") };
        let d = Port { uuid: id, ..port("y") };
        assert!(m.equal_models(&c, &d, &[]).unwrap());
        assert!(!m.equal_models(&port("x"), &port("y"), &[]).unwrap());
    }

    #[test]
    fn test_condition_validation() {
        let m = mapper();
        assert!(m
            .condition::<Port>("ofport", ConditionFunction::GreaterThan, Datum::integer(1))
            .is_ok());
        assert!(m
            .condition::<Port>("name", ConditionFunction::LessThan, Datum::string("a"))
            .is_err());
        assert!(m
            .condition::<Port>("missing", ConditionFunction::Equal, Datum::string("a"))
            .is_err());
        let includes = m
            .condition::<Port>("trunks", ConditionFunction::Includes, Datum::integer(10))
            .unwrap();
        assert_eq!(includes.value, Datum::Set(vec![Atom::Integer(10)]));
    }

    #[test]
    fn test_mutation_validation() {
        let m = mapper();
        let ok = m
            .mutation::<Port>("trunks", Mutator::Insert, Datum::Set(vec![Atom::Integer(10)]))
            .unwrap();
        assert_eq!(ok.mutator, Mutator::Insert);

        // tag holds at most one element
        assert!(m
            .mutation::<Port>(
                "tag",
                Mutator::Insert,
                Datum::Set(vec![Atom::Integer(1), Atom::Integer(2)])
            )
            .is_err());

        // map delete takes a map or a set of keys, never a bare atom
        assert!(m
            .mutation::<Port>("external_ids", Mutator::Delete, Datum::Set(vec![Atom::string("owner")]))
            .is_ok());
        assert!(m
            .mutation::<Port>("external_ids", Mutator::Delete, Datum::string("owner"))
            .is_err());
        assert!(m
            .mutation::<Port>("external_ids", Mutator::Insert, Datum::Set(vec![]))
            .is_err());

        assert!(m
            .mutation::<Port>("name", Mutator::Insert, Datum::string("x"))
            .is_err());
        assert!(m.mutation::<Port>("ofport", Mutator::Add, Datum::integer(1)).is_ok());
        assert!(m.mutation::<Port>("ofport", Mutator::Insert, Datum::integer(1)).is_err());
    }

    #[test]
    fn test_monitor_request_defaults_to_all_columns() {
        let m = mapper();
        let all = m.monitor_request::<Port>(&[]).unwrap();
        assert_eq!(all.columns.len(), 6);
        let some = m.monitor_request::<Port>(&["name"]).unwrap();
        assert_eq!(some.columns, vec!["name".to_string()]);
    }
}
