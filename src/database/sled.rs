use crate::config::Properties;
use crate::database::{BackendError, BackendResult, ConnectionPool, Database, Record, project};
use sled::transaction::{
    ConflictableTransactionResult, TransactionError, TransactionalTree, abort,
};
use std::path::PathBuf;
use tempfile::TempDir;
use tracing::info;

pub const PATH: &str = "sled.path";

const SEP: u8 = 0;

/// One sled tree per table. A record is a marker entry under `key` listing
/// its field names, plus one entry per field under `key\0field`. Writes to a
/// record run in a single sled transaction.
pub struct Sled {
    path: PathBuf,
    _f: Option<TempDir>,
    pool: ConnectionPool<sled::Db>,
}

impl Sled {
    pub fn new(props: &Properties) -> BackendResult<Self> {
        let (path, f) = match props.get(PATH) {
            Some(p) => (PathBuf::from(p), None),
            None => {
                let f = TempDir::new()?;
                (f.path().to_owned(), Some(f))
            }
        };
        Ok(Sled {
            path,
            _f: f,
            pool: ConnectionPool::new("sled"),
        })
    }

    fn tree(&self, table: &str) -> BackendResult<sled::Tree> {
        self.pool.get()?.open_tree(table).storage("open tree")
    }
}

trait OrStorage<T> {
    fn storage(self, context: &str) -> BackendResult<T>;
}

impl<T> OrStorage<T> for sled::Result<T> {
    fn storage(self, context: &str) -> BackendResult<T> {
        self.map_err(|e| BackendError::Storage {
            backend: "sled",
            context: context.to_owned(),
            source: Box::new(e),
        })
    }
}

fn prefix(key: &str) -> Vec<u8> {
    let mut p = Vec::with_capacity(key.len() + 1);
    p.extend_from_slice(key.as_bytes());
    p.push(SEP);
    p
}

fn field_key(key: &str, field: &str) -> Vec<u8> {
    let mut k = prefix(key);
    k.extend_from_slice(field.as_bytes());
    k
}

/// Splits `key\0field`.
fn split(entry: &[u8]) -> Option<(String, String)> {
    let at = entry.iter().position(|b| *b == SEP)?;
    Some((
        String::from_utf8_lossy(&entry[..at]).into_owned(),
        String::from_utf8_lossy(&entry[at + 1..]).into_owned(),
    ))
}

/// Field names, each followed by `SEP`.
fn encode_fields<'a>(names: impl IntoIterator<Item = &'a String>) -> Vec<u8> {
    let mut out = Vec::new();
    for name in names {
        out.extend_from_slice(name.as_bytes());
        out.push(SEP);
    }
    out
}

fn decode_fields(marker: &[u8]) -> Vec<String> {
    let mut names: Vec<String> = marker
        .split(|b| *b == SEP)
        .map(|n| String::from_utf8_lossy(n).into_owned())
        .collect();
    // trailing terminator
    names.pop();
    names
}

fn in_txn<T>(
    tree: &sled::Tree,
    f: impl Fn(&TransactionalTree) -> ConflictableTransactionResult<T, BackendError>,
) -> BackendResult<T> {
    tree.transaction(f).map_err(|e| match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => BackendError::Storage {
            backend: "sled",
            context: "transaction".to_owned(),
            source: Box::new(e),
        },
    })
}

impl Database for Sled {
    fn name(&self) -> &'static str {
        "sled"
    }

    fn open(&self) -> BackendResult<()> {
        self.pool.acquire(|| {
            info!(path = %self.path.display(), "opening sled database");
            sled::open(&self.path).storage("open database")
        })
    }

    fn close(&self) -> BackendResult<()> {
        if let Some(db) = self.pool.release()? {
            db.flush().storage("flush")?;
        }
        Ok(())
    }

    fn insert(&self, table: &str, key: &str, record: &Record) -> BackendResult<()> {
        in_txn(&self.tree(table)?, |tx| {
            if let Some(marker) = tx.get(key.as_bytes())? {
                for stale in decode_fields(&marker) {
                    tx.remove(field_key(key, &stale))?;
                }
            }
            for (field, value) in record {
                tx.insert(field_key(key, field), value.as_slice())?;
            }
            tx.insert(key.as_bytes(), encode_fields(record.keys()))?;
            Ok(())
        })
    }

    fn read(&self, table: &str, key: &str, fields: Option<&[String]>) -> BackendResult<Record> {
        let record = in_txn(&self.tree(table)?, |tx| {
            let Some(marker) = tx.get(key.as_bytes())? else {
                return abort(BackendError::not_found(table, key));
            };
            let mut record = Record::new();
            for field in decode_fields(&marker) {
                if let Some(value) = tx.get(field_key(key, &field))? {
                    record.insert(field, value.to_vec());
                }
            }
            Ok(record)
        })?;
        Ok(project(record, fields))
    }

    fn update(&self, table: &str, key: &str, values: &Record) -> BackendResult<()> {
        in_txn(&self.tree(table)?, |tx| {
            let Some(marker) = tx.get(key.as_bytes())? else {
                return abort(BackendError::not_found(table, key));
            };
            let mut names = decode_fields(&marker);
            for (field, value) in values {
                tx.insert(field_key(key, field), value.as_slice())?;
                if !names.contains(field) {
                    names.push(field.clone());
                }
            }
            names.sort();
            tx.insert(key.as_bytes(), encode_fields(&names))?;
            Ok(())
        })
    }

    fn delete(&self, table: &str, key: &str) -> BackendResult<()> {
        in_txn(&self.tree(table)?, |tx| {
            let Some(marker) = tx.remove(key.as_bytes())? else {
                return abort(BackendError::not_found(table, key));
            };
            for field in decode_fields(&marker) {
                tx.remove(field_key(key, &field))?;
            }
            Ok(())
        })
    }

    fn scan(
        &self,
        table: &str,
        start_key: &str,
        count: usize,
        fields: Option<&[String]>,
    ) -> BackendResult<Vec<(String, Record)>> {
        let tree = self.tree(table)?;
        let mut rows: Vec<(String, Record)> = Vec::new();
        for entry in tree.range(start_key.as_bytes()..) {
            let (k, v) = entry.storage("range")?;
            match split(&k) {
                // a marker starts the next row
                None => {
                    if rows.len() == count {
                        break;
                    }
                    rows.push((String::from_utf8_lossy(&k).into_owned(), Record::new()));
                }
                Some((row_key, field)) => {
                    if let Some((last, record)) = rows.last_mut() {
                        if *last == row_key {
                            record.insert(field, v.to_vec());
                        }
                    }
                }
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
    use crate::database::contract;
    use std::sync::Arc;

    fn open_db() -> Sled {
        let db = Sled::new(&Properties::new()).unwrap();
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
    fn split_composite_key() {
        assert_eq!(
            split(&field_key("user1", "field3")),
            Some(("user1".to_owned(), "field3".to_owned()))
        );
        assert_eq!(split(b"nosep"), None);
    }

    #[test]
    fn key_prefixes_do_not_collide() {
        let db = open_db();
        db.insert("t", "user1", &contract::record(1, 1)).unwrap();
        db.insert("t", "user10", &contract::record(1, 2)).unwrap();
        assert_eq!(db.read("t", "user1", None).unwrap(), contract::record(1, 1));
        db.delete("t", "user1").unwrap();
        assert_eq!(db.read("t", "user10", None).unwrap(), contract::record(1, 2));
    }

    #[test]
    fn field_list_round_trip() {
        let names = vec!["field0".to_owned(), String::new(), "field2".to_owned()];
        assert_eq!(decode_fields(&encode_fields(&names)), names);
        assert!(decode_fields(&encode_fields(&Vec::new())).is_empty());
    }

    #[test]
    fn empty_record_is_visible() {
        let db = open_db();
        db.insert("t", "k", &Record::new()).unwrap();
        assert!(db.read("t", "k", None).unwrap().is_empty());
        assert_eq!(db.scan("t", "", 10, None).unwrap().len(), 1);
        db.delete("t", "k").unwrap();
        assert!(db.read("t", "k", None).unwrap_err().is_not_found());
    }

    #[test]
    fn overlapping_inserts_never_merge_field_sets() {
        let db = open_db();
        let (short, long) = (contract::record(2, 1), contract::record(4, 9));
        std::thread::scope(|s| {
            for rec in [&short, &long] {
                let db = &db;
                s.spawn(move || {
                    for _ in 0..200 {
                        db.insert("t", "k", rec).unwrap();
                    }
                });
            }
            s.spawn(|| {
                for _ in 0..200 {
                    if let Ok(seen) = db.read("t", "k", None) {
                        assert!(seen == short || seen == long, "torn record {seen:?}");
                    }
                }
            });
        });
        let last = db.read("t", "k", None).unwrap();
        assert!(last == short || last == long);
    }

    #[test]
    fn update_never_recreates_a_deleted_record() {
        let db = open_db();
        std::thread::scope(|s| {
            s.spawn(|| {
                for _ in 0..200 {
                    db.insert("t", "k", &contract::record(3, 1)).unwrap();
                    db.delete("t", "k").unwrap();
                }
            });
            s.spawn(|| {
                for _ in 0..200 {
                    let _ = db.update("t", "k", &contract::record(1, 7));
                }
            });
        });
        assert!(db.read("t", "k", None).unwrap_err().is_not_found());
        assert!(db.scan("t", "", 10, None).unwrap().is_empty());
        assert_eq!(db.tree("t").unwrap().len(), 0);
    }

    #[test]
    fn shared_pool_torn_down_once() {
        let db = open_db();
        db.open().unwrap();
        db.insert("t", "k", &contract::record(1, 1)).unwrap();

        db.close().unwrap();
        assert!(db.read("t", "k", None).is_ok());
        db.close().unwrap();
        assert!(matches!(
            db.read("t", "k", None),
            Err(BackendError::NotOpen { .. })
        ));
        assert!(db.close().is_err());
    }
}
