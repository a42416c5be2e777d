use crate::database::{BackendError, BackendResult, Database, Record, project};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

type Table = BTreeMap<String, Record>;

/// In-process reference backend: one ordered map per table.
#[derive(Default)]
pub struct MemBTree {
    tables: RwLock<HashMap<String, Table>>,
}

impl Database for MemBTree {
    fn name(&self) -> &'static str {
        "membtree"
    }

    fn open(&self) -> BackendResult<()> {
        Ok(())
    }

    fn close(&self) -> BackendResult<()> {
        Ok(())
    }

    fn insert(&self, table: &str, key: &str, record: &Record) -> BackendResult<()> {
        self.tables
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(table.to_owned())
            .or_default()
            .insert(key.to_owned(), record.clone());
        Ok(())
    }

    fn read(&self, table: &str, key: &str, fields: Option<&[String]>) -> BackendResult<Record> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        let record = tables
            .get(table)
            .and_then(|t| t.get(key))
            .ok_or_else(|| BackendError::not_found(table, key))?;
        Ok(project(record.clone(), fields))
    }

    fn update(&self, table: &str, key: &str, values: &Record) -> BackendResult<()> {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        let record = tables
            .get_mut(table)
            .and_then(|t| t.get_mut(key))
            .ok_or_else(|| BackendError::not_found(table, key))?;
        record.extend(values.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    fn delete(&self, table: &str, key: &str) -> BackendResult<()> {
        self.tables
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(table)
            .and_then(|t| t.remove(key))
            .map(|_| ())
            .ok_or_else(|| BackendError::not_found(table, key))
    }

    fn scan(
        &self,
        table: &str,
        start_key: &str,
        count: usize,
        fields: Option<&[String]>,
    ) -> BackendResult<Vec<(String, Record)>> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        let Some(t) = tables.get(table) else {
            return Ok(Vec::new());
        };
        Ok(t.range(start_key.to_owned()..)
            .take(count)
            .map(|(k, r)| (k.clone(), project(r.clone(), fields)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::contract;
    use std::sync::Arc;

    #[test]
    fn satisfies_contract() {
        contract::all(Arc::new(MemBTree::default()));
    }

    #[test]
    fn scan_bounds() {
        contract::scan(&MemBTree::default());
    }

    #[test]
    fn concurrent_inserts() {
        contract::concurrent_writers(Arc::new(MemBTree::default()));
    }

    #[test]
    fn tables_are_independent() {
        let db = MemBTree::default();
        db.insert("a", "k", &contract::record(1, 1)).unwrap();
        assert!(db.read("b", "k", None).unwrap_err().is_not_found());
    }
}
