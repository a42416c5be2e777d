use crate::config::Properties;
use crate::database::{BackendError, BackendResult, ConnectionPool, Record, project};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, TableError};
use std::path::PathBuf;
use tempfile::NamedTempFile;
use tracing::info;

pub const PATH: &str = "redb.path";

/// `(record key, field name)`; a record is the run of rows sharing a key.
type FieldKey = (&'static str, &'static str);

fn table_def(name: &str) -> TableDefinition<'_, FieldKey, &'static [u8]> {
    TableDefinition::new(name)
}

pub struct Redb {
    path: PathBuf,
    _f: Option<NamedTempFile>,
    pool: ConnectionPool<Database>,
}

impl Redb {
    /// Uses `redb.path` when set, otherwise a temp file that lives as long as `self`.
    pub fn new(props: &Properties) -> BackendResult<Self> {
        let (path, f) = match props.get(PATH) {
            Some(p) => (PathBuf::from(p), None),
            None => {
                let f = NamedTempFile::new()?;
                (f.path().to_owned(), Some(f))
            }
        };
        Ok(Redb {
            path,
            _f: f,
            pool: ConnectionPool::new("redb"),
        })
    }
}

trait OrStorage<T> {
    fn storage(self, context: &str) -> BackendResult<T>;
}

impl<T, E: Into<redb::Error>> OrStorage<T> for Result<T, E> {
    fn storage(self, context: &str) -> BackendResult<T> {
        self.map_err(|e| BackendError::Storage {
            backend: "redb",
            context: context.to_owned(),
            source: Box::new(e.into()),
        })
    }
}

fn load_record<T>(table: &T, key: &str) -> BackendResult<Option<Record>>
where
    T: ReadableTable<FieldKey, &'static [u8]>,
{
    let mut record = Record::new();
    for entry in table.range((key, "")..).storage("range")? {
        let (k, v) = entry.storage("range")?;
        let (row_key, field) = k.value();
        if row_key != key {
            break;
        }
        record.insert(field.to_owned(), v.value().to_vec());
    }
    Ok((!record.is_empty()).then_some(record))
}

fn field_names<T>(table: &T, key: &str) -> BackendResult<Vec<String>>
where
    T: ReadableTable<FieldKey, &'static [u8]>,
{
    Ok(load_record(table, key)?
        .map(|r| r.into_keys().collect())
        .unwrap_or_default())
}

impl crate::database::Database for Redb {
    fn name(&self) -> &'static str {
        "redb"
    }

    fn open(&self) -> BackendResult<()> {
        self.pool.acquire(|| {
            info!(path = %self.path.display(), "opening redb database");
            Database::create(&self.path).storage("create database")
        })
    }

    fn close(&self) -> BackendResult<()> {
        // Dropping the last handle closes the file.
        self.pool.release().map(drop)
    }

    fn insert(&self, table: &str, key: &str, record: &Record) -> BackendResult<()> {
        let db = self.pool.get()?;
        let tx = db.begin_write().storage("begin write")?;
        {
            let mut t = tx.open_table(table_def(table)).storage("open table")?;
            for stale in field_names(&t, key)? {
                t.remove((key, stale.as_str())).storage("remove")?;
            }
            for (field, value) in record {
                t.insert((key, field.as_str()), value.as_slice())
                    .storage("insert")?;
            }
        }
        tx.commit().storage("commit")
    }

    fn read(&self, table: &str, key: &str, fields: Option<&[String]>) -> BackendResult<Record> {
        let db = self.pool.get()?;
        let tx = db.begin_read().storage("begin read")?;
        let t = match tx.open_table(table_def(table)) {
            Ok(t) => t,
            Err(TableError::TableDoesNotExist(_)) => {
                return Err(BackendError::not_found(table, key));
            }
            Err(e) => return Err(e).storage("open table"),
        };
        load_record(&t, key)?
            .map(|r| project(r, fields))
            .ok_or_else(|| BackendError::not_found(table, key))
    }

    fn update(&self, table: &str, key: &str, values: &Record) -> BackendResult<()> {
        let db = self.pool.get()?;
        let tx = db.begin_write().storage("begin write")?;
        {
            let mut t = tx.open_table(table_def(table)).storage("open table")?;
            if load_record(&t, key)?.is_none() {
                return Err(BackendError::not_found(table, key));
            }
            for (field, value) in values {
                t.insert((key, field.as_str()), value.as_slice())
                    .storage("insert")?;
            }
        }
        tx.commit().storage("commit")
    }

    fn delete(&self, table: &str, key: &str) -> BackendResult<()> {
        let db = self.pool.get()?;
        let tx = db.begin_write().storage("begin write")?;
        {
            let mut t = tx.open_table(table_def(table)).storage("open table")?;
            let fields = field_names(&t, key)?;
            if fields.is_empty() {
                return Err(BackendError::not_found(table, key));
            }
            for field in fields {
                t.remove((key, field.as_str())).storage("remove")?;
            }
        }
        tx.commit().storage("commit")
    }

    fn scan(
        &self,
        table: &str,
        start_key: &str,
        count: usize,
        fields: Option<&[String]>,
    ) -> BackendResult<Vec<(String, Record)>> {
        let db = self.pool.get()?;
        let tx = db.begin_read().storage("begin read")?;
        let t = match tx.open_table(table_def(table)) {
            Ok(t) => t,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e).storage("open table"),
        };

        let mut rows: Vec<(String, Record)> = Vec::new();
        for entry in t.range((start_key, "")..).storage("range")? {
            let (k, v) = entry.storage("range")?;
            let (row_key, field) = k.value();
            if !rows.last().is_some_and(|(last, _)| last == row_key) {
                if rows.len() == count {
                    break;
                }
                rows.push((row_key.to_owned(), Record::new()));
            }
            if let Some((_, record)) = rows.last_mut() {
                record.insert(field.to_owned(), v.value().to_vec());
            }
        }
        Ok(rows
            .into_iter()
            .map(|(k, r)| (k, project(r, fields)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{Database as _, contract};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn open_db() -> Redb {
        let db = Redb::new(&Properties::new()).unwrap();
        db.open().unwrap();
        db
    }

    #[test]
    fn satisfies_contract() {
        contract::all(Arc::new(open_db()));
    }

    #[test]
    fn scan_bounds() {
        contract::scan(&open_db());
    }

    #[test]
    fn concurrent_inserts() {
        contract::concurrent_writers(Arc::new(open_db()));
    }

    #[test]
    fn operations_require_open() {
        let db = Redb::new(&Properties::new()).unwrap();
        let err = db.read("t", "k", None).unwrap_err();
        assert!(matches!(err, BackendError::NotOpen { .. }));
        assert!(db.close().is_err());
    }

    #[test]
    fn data_survives_reopen_at_path() {
        let dir = TempDir::new().unwrap();
        let mut props = Properties::new();
        props.set(PATH, dir.path().join("bench.redb").display().to_string());

        let db = Redb::new(&props).unwrap();
        db.open().unwrap();
        db.open().unwrap();
        db.insert("t", "k1", &contract::record(2, 4)).unwrap();
        db.close().unwrap();
        // one worker still holds it open
        assert!(db.read("t", "k1", None).is_ok());
        db.close().unwrap();
        assert!(matches!(
            db.read("t", "k1", None),
            Err(BackendError::NotOpen { .. })
        ));

        db.open().unwrap();
        assert_eq!(db.read("t", "k1", None).unwrap(), contract::record(2, 4));
        db.close().unwrap();
    }
}
