mod mem_btree;
mod pool;
mod redb;
mod sled;

pub use crate::database::mem_btree::MemBTree;
pub use crate::database::pool::ConnectionPool;
pub use crate::database::redb::Redb;
pub use crate::database::sled::Sled;

use crate::config::{ConfigError, Properties};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Field name to value, ordered by field name.
pub type Record = BTreeMap<String, Vec<u8>>;

pub type BackendResult<T> = Result<T, BackendError>;

#[derive(Debug, Error)]
pub enum BackendError {
    /// No record at the key. Not a fault.
    #[error("no record `{key}` in table `{table}`")]
    NotFound { table: String, key: String },

    /// An operation was issued without a matching `open`.
    #[error("{backend} backend is not open")]
    NotOpen { backend: &'static str },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything the underlying store reports: connectivity, encoding,
    /// timeouts, conflicts.
    #[error("{backend} error: {context}")]
    Storage {
        backend: &'static str,
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl BackendError {
    pub fn not_found(table: &str, key: &str) -> Self {
        BackendError::NotFound {
            table: table.to_owned(),
            key: key.to_owned(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound { .. })
    }
}

/// CRUD contract every storage binding implements.
///
/// One instance is shared by all workers, so every method may be called
/// concurrently. `open` is called by each worker before its first operation
/// and `close` once it is done; bindings holding a shared connection count
/// these calls and tear the connection down on the last `close`.
pub trait Database: Send + Sync {
    fn name(&self) -> &'static str;

    fn open(&self) -> BackendResult<()>;
    fn close(&self) -> BackendResult<()>;

    /// Creates or overwrites the record at `key`.
    fn insert(&self, table: &str, key: &str, record: &Record) -> BackendResult<()>;

    /// The whole record when `fields` is `None`, otherwise only those fields.
    fn read(&self, table: &str, key: &str, fields: Option<&[String]>) -> BackendResult<Record>;

    /// Merges `values` into an existing record.
    fn update(&self, table: &str, key: &str, values: &Record) -> BackendResult<()>;

    fn delete(&self, table: &str, key: &str) -> BackendResult<()>;

    /// Up to `count` records with key >= `start_key`, ascending by key.
    fn scan(
        &self,
        table: &str,
        start_key: &str,
        count: usize,
        fields: Option<&[String]>,
    ) -> BackendResult<Vec<(String, Record)>>;
}

/// Keeps only the requested fields.
pub fn project(record: Record, fields: Option<&[String]>) -> Record {
    match fields {
        None => record,
        Some(fields) => record
            .into_iter()
            .filter(|(name, _)| fields.contains(name))
            .collect(),
    }
}

pub type Factory = fn(&Properties) -> BackendResult<Arc<dyn Database>>;

/// Backend ids to factories, resolved once at startup.
pub struct Registry {
    factories: BTreeMap<&'static str, Factory>,
}

impl Registry {
    pub fn empty() -> Self {
        Registry {
            factories: BTreeMap::new(),
        }
    }

    // Update here when adding a new backend
    pub fn builtin() -> Self {
        let mut registry = Registry::empty();
        registry.register("membtree", |_| Ok(Arc::new(MemBTree::default())));
        registry.register("redb", |props| Ok(Arc::new(Redb::new(props)?)));
        registry.register("sled", |props| Ok(Arc::new(Sled::new(props)?)));
        registry
    }

    pub fn register(&mut self, name: &'static str, factory: Factory) {
        self.factories.insert(name, factory);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }

    pub fn resolve(&self, name: &str) -> Result<Factory, ConfigError> {
        self.factories
            .get(name)
            .copied()
            .ok_or_else(|| ConfigError::UnknownBackend {
                name: name.to_owned(),
                known: self.names().join(", "),
            })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_keeps_requested_fields() {
        let rec = contract::record(3, 0);
        assert_eq!(project(rec.clone(), None), rec);
        let fields = vec!["field1".to_owned(), "absent".to_owned()];
        let projected = project(rec, Some(&fields));
        assert_eq!(projected.keys().collect::<Vec<_>>(), vec!["field1"]);
    }

    #[test]
    fn registry_resolves_builtin_backends() {
        let registry = Registry::builtin();
        assert_eq!(registry.names(), vec!["membtree", "redb", "sled"]);
        let db = registry.resolve("membtree").unwrap()(&Properties::new()).unwrap();
        assert_eq!(db.name(), "membtree");
    }

    #[test]
    fn registry_rejects_unknown_backend() {
        let err = Registry::builtin().resolve("mongodb").err().unwrap();
        assert!(matches!(err, ConfigError::UnknownBackend { ref name, .. } if name == "mongodb"));
    }
}
