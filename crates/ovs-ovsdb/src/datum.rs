//! Native OVSDB values
//!
//! An [`Atom`] is a single scalar, a [`Datum`] is the full value of one column
//! (a scalar, a set, or a map). Serialization produces the RFC7047 wire form;
//! decoding needs the column schema and lives in [`crate::codec`].

use serde::ser::{Serialize, Serializer};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::{OvsdbError, Result};

/// A decoded row: column name to value
pub type Row = BTreeMap<String, Datum>;

/// Reference to a row, either committed or named within the current transaction
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UuidRef {
    Real(Uuid),
    Named(String),
}

impl UuidRef {
    pub fn named(name: impl Into<String>) -> Self {
        UuidRef::Named(name.into())
    }

    /// The committed UUID, if this is not a named reference
    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            UuidRef::Real(u) => Some(*u),
            UuidRef::Named(_) => None,
        }
    }
}

impl From<Uuid> for UuidRef {
    fn from(u: Uuid) -> Self {
        UuidRef::Real(u)
    }
}

impl Serialize for UuidRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            UuidRef::Real(u) => ("uuid", u.to_string()).serialize(serializer),
            UuidRef::Named(n) => ("named-uuid", n).serialize(serializer),
        }
    }
}

/// A single OVSDB scalar
#[derive(Debug, Clone)]
pub enum Atom {
    Integer(i64),
    Real(f64),
    Boolean(bool),
    String(String),
    Uuid(UuidRef),
}

impl Atom {
    fn rank(&self) -> u8 {
        match self {
            Atom::Integer(_) => 0,
            Atom::Real(_) => 1,
            Atom::Boolean(_) => 2,
            Atom::String(_) => 3,
            Atom::Uuid(_) => 4,
        }
    }

    pub fn string(s: impl Into<String>) -> Self {
        Atom::String(s.into())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Atom::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Atom::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<&UuidRef> {
        match self {
            Atom::Uuid(u) => Some(u),
            _ => None,
        }
    }

    /// Zero value for the atom's type
    pub fn is_default(&self) -> bool {
        match self {
            Atom::Integer(i) => *i == 0,
            Atom::Real(r) => *r == 0.0,
            Atom::Boolean(b) => !*b,
            Atom::String(s) => s.is_empty(),
            Atom::Uuid(UuidRef::Real(u)) => u.is_nil(),
            Atom::Uuid(UuidRef::Named(n)) => n.is_empty(),
        }
    }

    pub(crate) fn type_name(&self) -> &'static str {
        match self {
            Atom::Integer(_) => "integer",
            Atom::Real(_) => "real",
            Atom::Boolean(_) => "boolean",
            Atom::String(_) => "string",
            Atom::Uuid(_) => "uuid",
        }
    }
}

impl Ord for Atom {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Atom::Integer(a), Atom::Integer(b)) => a.cmp(b),
            (Atom::Real(a), Atom::Real(b)) => a.total_cmp(b),
            (Atom::Boolean(a), Atom::Boolean(b)) => a.cmp(b),
            (Atom::String(a), Atom::String(b)) => a.cmp(b),
            (Atom::Uuid(a), Atom::Uuid(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Atom {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Atom {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Atom {}

impl Serialize for Atom {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Atom::Integer(i) => serializer.serialize_i64(*i),
            Atom::Real(r) => serializer.serialize_f64(*r),
            Atom::Boolean(b) => serializer.serialize_bool(*b),
            Atom::String(s) => serializer.serialize_str(s),
            Atom::Uuid(u) => u.serialize(serializer),
        }
    }
}

/// The value held by one column
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Datum {
    Atom(Atom),
    Set(Vec<Atom>),
    Map(BTreeMap<Atom, Atom>),
}

impl Datum {
    pub fn string(s: impl Into<String>) -> Self {
        Datum::Atom(Atom::String(s.into()))
    }

    pub fn integer(i: i64) -> Self {
        Datum::Atom(Atom::Integer(i))
    }

    pub fn uuid(u: Uuid) -> Self {
        Datum::Atom(Atom::Uuid(UuidRef::Real(u)))
    }

    pub fn named_uuid(name: impl Into<String>) -> Self {
        Datum::Atom(Atom::Uuid(UuidRef::Named(name.into())))
    }

    pub fn empty_set() -> Self {
        Datum::Set(Vec::new())
    }

    /// A string-to-string map, the shape of every `external_ids` column
    pub fn string_map<'a, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        Datum::Map(
            pairs
                .into_iter()
                .map(|(k, v)| (Atom::string(k), Atom::string(v)))
                .collect(),
        )
    }

    /// True when the value equals the zero value of its shape
    pub fn is_default(&self) -> bool {
        match self {
            Datum::Atom(a) => a.is_default(),
            Datum::Set(items) => items.is_empty(),
            Datum::Map(map) => map.is_empty(),
        }
    }

    /// Elements of a set, or the single atom
    pub fn atoms(&self) -> Vec<&Atom> {
        match self {
            Datum::Atom(a) => vec![a],
            Datum::Set(items) => items.iter().collect(),
            Datum::Map(map) => map.keys().collect(),
        }
    }

    pub fn as_atom(&self) -> Option<&Atom> {
        match self {
            Datum::Atom(a) => Some(a),
            Datum::Set(items) if items.len() == 1 => items.first(),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<Atom, Atom>> {
        match self {
            Datum::Map(map) => Some(map),
            _ => None,
        }
    }

    pub(crate) fn shape_name(&self) -> &'static str {
        match self {
            Datum::Atom(a) => a.type_name(),
            Datum::Set(_) => "set",
            Datum::Map(_) => "map",
        }
    }
}

impl Serialize for Datum {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Datum::Atom(a) => a.serialize(serializer),
            Datum::Set(items) => ("set", items).serialize(serializer),
            Datum::Map(map) => {
                let pairs: Vec<(&Atom, &Atom)> = map.iter().collect();
                ("map", pairs).serialize(serializer)
            }
        }
    }
}

impl From<Atom> for Datum {
    fn from(a: Atom) -> Self {
        Datum::Atom(a)
    }
}

// ============================================================================
// Native field conversions
// ============================================================================

/// Scalar Rust types that map onto a single atom
pub trait AtomValue: Sized {
    fn into_atom(self) -> Atom;
    fn from_atom(atom: Atom) -> Option<Self>;
}

/// Conversion of a model field into a column value
pub trait IntoDatum {
    fn into_datum(self) -> Datum;
}

/// Conversion of a column value back into a model field
pub trait FromDatum: Sized {
    fn from_datum(datum: Datum) -> Option<Self>;
}

macro_rules! atom_value {
    ($ty:ty, $variant:ident) => {
        impl AtomValue for $ty {
            fn into_atom(self) -> Atom {
                Atom::$variant(self.into())
            }

            fn from_atom(atom: Atom) -> Option<Self> {
                match atom {
                    Atom::$variant(v) => Some(v.into()),
                    _ => None,
                }
            }
        }

        impl IntoDatum for $ty {
            fn into_datum(self) -> Datum {
                Datum::Atom(self.into_atom())
            }
        }

        impl FromDatum for $ty {
            fn from_datum(datum: Datum) -> Option<Self> {
                single_atom(datum).and_then(<$ty>::from_atom)
            }
        }
    };
}

atom_value!(i64, Integer);
atom_value!(f64, Real);
atom_value!(bool, Boolean);
atom_value!(String, String);
atom_value!(UuidRef, Uuid);

impl AtomValue for Uuid {
    fn into_atom(self) -> Atom {
        Atom::Uuid(UuidRef::Real(self))
    }

    fn from_atom(atom: Atom) -> Option<Self> {
        match atom {
            Atom::Uuid(UuidRef::Real(u)) => Some(u),
            _ => None,
        }
    }
}

impl IntoDatum for Uuid {
    fn into_datum(self) -> Datum {
        Datum::Atom(self.into_atom())
    }
}

impl FromDatum for Uuid {
    fn from_datum(datum: Datum) -> Option<Self> {
        single_atom(datum).and_then(Uuid::from_atom)
    }
}

fn single_atom(datum: Datum) -> Option<Atom> {
    match datum {
        Datum::Atom(a) => Some(a),
        Datum::Set(mut items) if items.len() == 1 => items.pop(),
        _ => None,
    }
}

impl<T: AtomValue> IntoDatum for Option<T> {
    fn into_datum(self) -> Datum {
        Datum::Set(self.into_iter().map(AtomValue::into_atom).collect())
    }
}

impl<T: AtomValue> FromDatum for Option<T> {
    fn from_datum(datum: Datum) -> Option<Self> {
        match datum {
            Datum::Atom(a) => T::from_atom(a).map(Some),
            Datum::Set(items) if items.is_empty() => Some(None),
            Datum::Set(mut items) if items.len() == 1 => items.pop().and_then(T::from_atom).map(Some),
            _ => None,
        }
    }
}

impl<T: AtomValue> IntoDatum for Vec<T> {
    fn into_datum(self) -> Datum {
        Datum::Set(self.into_iter().map(AtomValue::into_atom).collect())
    }
}

impl<T: AtomValue> FromDatum for Vec<T> {
    fn from_datum(datum: Datum) -> Option<Self> {
        match datum {
            Datum::Atom(a) => T::from_atom(a).map(|v| vec![v]),
            Datum::Set(items) => items.into_iter().map(T::from_atom).collect(),
            Datum::Map(_) => None,
        }
    }
}

impl<K: AtomValue + Ord, V: AtomValue> IntoDatum for BTreeMap<K, V> {
    fn into_datum(self) -> Datum {
        Datum::Map(
            self.into_iter()
                .map(|(k, v)| (k.into_atom(), v.into_atom()))
                .collect(),
        )
    }
}

impl<K: AtomValue + Ord, V: AtomValue> FromDatum for BTreeMap<K, V> {
    fn from_datum(datum: Datum) -> Option<Self> {
        match datum {
            Datum::Map(map) => map
                .into_iter()
                .map(|(k, v)| Some((K::from_atom(k)?, V::from_atom(v)?)))
                .collect(),
            Datum::Set(items) if items.is_empty() => Some(BTreeMap::new()),
            _ => None,
        }
    }
}

/// Convert a column value into a model field, naming the column on mismatch
pub fn from_column<T: FromDatum>(column: &str, datum: Datum) -> Result<T> {
    let shape = datum.shape_name();
    T::from_datum(datum).ok_or_else(|| {
        OvsdbError::invalid_value(column, format!("a {} value does not fit this field", shape))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_encoding() {
        let id = Uuid::new_v4();
        assert_eq!(serde_json::to_value(Datum::integer(7)).unwrap(), json!(7));
        assert_eq!(
            serde_json::to_value(Datum::uuid(id)).unwrap(),
            json!(["uuid", id.to_string()])
        );
        assert_eq!(
            serde_json::to_value(Datum::named_uuid("new_port")).unwrap(),
            json!(["named-uuid", "new_port"])
        );
        assert_eq!(
            serde_json::to_value(Datum::Set(vec![Atom::Integer(1), Atom::Integer(2)])).unwrap(),
            json!(["set", [1, 2]])
        );
        assert_eq!(
            serde_json::to_value(Datum::string_map([("owner", "me")])).unwrap(),
            json!(["map", [["owner", "me"]]])
        );
    }

    #[test]
    fn test_defaults() {
        assert!(Datum::string("").is_default());
        assert!(Datum::uuid(Uuid::nil()).is_default());
        assert!(Datum::empty_set().is_default());
        assert!(!Datum::integer(100).is_default());
        assert!(!Datum::Atom(Atom::Boolean(true)).is_default());
    }

    #[test]
    fn test_field_conversions() {
        let tag: Option<i64> = from_column("tag", Datum::Set(vec![Atom::Integer(100)])).unwrap();
        assert_eq!(tag, Some(100));

        let none: Option<i64> = from_column("tag", Datum::empty_set()).unwrap();
        assert_eq!(none, None);

        let trunks: Vec<i64> = from_column("trunks", Datum::integer(10)).unwrap();
        assert_eq!(trunks, vec![10]);

        let ids: BTreeMap<String, String> =
            from_column("external_ids", Datum::string_map([("a", "b")])).unwrap();
        assert_eq!(ids.get("a").map(String::as_str), Some("b"));

        let err = from_column::<String>("name", Datum::integer(1)).unwrap_err();
        assert!(matches!(err, OvsdbError::InvalidValue { .. }));
    }

    #[test]
    fn test_atom_ordering_is_total() {
        let mut atoms = vec![Atom::string("b"), Atom::Integer(3), Atom::string("a")];
        atoms.sort();
        assert_eq!(atoms, vec![Atom::Integer(3), Atom::string("a"), Atom::string("b")]);
        assert_eq!(Atom::Real(f64::NAN), Atom::Real(f64::NAN));
    }
}
