//! In-memory replica of monitored tables

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::datum::{Datum, Row};
use crate::error::Result;
use crate::handler::NotificationHandler;
use crate::mapper::{Mapper, Model};
use crate::operation::TableUpdates;

/// Rows received through `monitor` replies and `update` notifications.
///
/// `new` always carries every monitored column, so it replaces the cached row.
#[derive(Debug, Default)]
pub struct TableCache {
    tables: RwLock<BTreeMap<String, BTreeMap<Uuid, Row>>>,
}

impl TableCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a set of table updates
    pub fn apply(&self, updates: &TableUpdates) {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        for (table, rows) in updates {
            let cached = tables.entry(table.clone()).or_default();
            for (uuid, change) in rows {
                match &change.new {
                    Some(new) => {
                        cached.insert(*uuid, with_uuid(*uuid, new.clone()));
                    }
                    None => {
                        if cached.remove(uuid).is_none() {
                            warn!("Delete for unknown {} row {}", table, uuid);
                        }
                    }
                }
            }
            debug!("Cache table {} now has {} rows", table, cached.len());
        }
    }

    /// Drop everything, used when a connection is re-established
    pub fn clear(&self) {
        self.tables
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Snapshot of one table
    pub fn rows(&self, table: &str) -> BTreeMap<Uuid, Row> {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn row(&self, table: &str, uuid: &Uuid) -> Option<Row> {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(table)?
            .get(uuid)
            .cloned()
    }

    /// Number of rows cached for `table`
    pub fn len(&self, table: &str) -> usize {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(table)
            .map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .all(BTreeMap::is_empty)
    }

    /// Names of tables that have received at least one update
    pub fn tables(&self) -> Vec<String> {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Decode every cached row of the model's table
    pub fn models<M: Model>(&self, mapper: &Mapper) -> Result<Vec<M>> {
        self.rows(M::TABLE)
            .values()
            .map(|row| mapper.decode::<M>(row))
            .collect()
    }
}

fn with_uuid(uuid: Uuid, mut row: Row) -> Row {
    row.insert("_uuid".to_string(), Datum::uuid(uuid));
    row
}

impl NotificationHandler for TableCache {
    fn update(&self, _context: &Value, updates: &TableUpdates) {
        self.apply(updates);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::RowUpdate;

    fn row(pairs: &[(&str, Datum)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn updates(table: &str, uuid: Uuid, old: Option<Row>, new: Option<Row>) -> TableUpdates {
        let mut rows = BTreeMap::new();
        rows.insert(uuid, RowUpdate { old, new });
        let mut updates = TableUpdates::new();
        updates.insert(table.to_string(), rows);
        updates
    }

    #[test]
    fn test_insert_modify_delete() {
        let cache = TableCache::new();
        let id = Uuid::new_v4();

        cache.apply(&updates(
            "Bridge",
            id,
            None,
            Some(row(&[("name", Datum::string("br0")), ("datapath_type", Datum::string("system"))])),
        ));
        assert_eq!(cache.len("Bridge"), 1);
        assert_eq!(cache.row("Bridge", &id).unwrap()["_uuid"], Datum::uuid(id));

        cache.apply(&updates(
            "Bridge",
            id,
            Some(row(&[("datapath_type", Datum::string("system"))])),
            Some(row(&[("name", Datum::string("br0")), ("datapath_type", Datum::string("netdev"))])),
        ));
        let cached = cache.row("Bridge", &id).unwrap();
        assert_eq!(cached["name"], Datum::string("br0"));
        assert_eq!(cached["datapath_type"], Datum::string("netdev"));

        cache.apply(&updates("Bridge", id, Some(cached), None));
        assert_eq!(cache.len("Bridge"), 0);
        assert!(cache.is_empty());
        assert_eq!(cache.tables(), vec!["Bridge".to_string()]);
    }

    #[test]
    fn test_clear() {
        let cache = TableCache::new();
        cache.apply(&updates("Port", Uuid::new_v4(), None, Some(Row::new())));
        assert!(!cache.is_empty());
        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.rows("Port").is_empty());
    }
}
