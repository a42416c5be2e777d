use crate::config::{ConfigError, WorkloadConfig};
use crate::database::{BackendResult, Database, Record};
use crate::generator::{KeyCounter, KeyGenerator, key_name, random_value, seeded_rng};
use crate::workload::operation::{Operation, OperationKind, OperationSelector};
use crate::workload::{Phase, Transaction, Workload};
use rand::rngs::SmallRng;
use rand::{Rng, RngCore};
use std::sync::Arc;

/// Proportion-driven workload: a fixed mix of operations over a key space
/// drawn from the configured request distribution.
#[derive(Debug)]
pub struct CoreWorkload {
    config: Arc<WorkloadConfig>,
    selector: OperationSelector,
    keys: Arc<KeyCounter>,
    field_names: Vec<String>,
}

/// Generation state owned by a single worker.
#[derive(Debug)]
pub struct WorkerState {
    keygen: KeyGenerator,
    rng: SmallRng,
}

impl CoreWorkload {
    /// Validates everything up front so workers can only fail on backend calls.
    pub fn new(config: WorkloadConfig, phase: Phase) -> Result<Self, ConfigError> {
        let selector = OperationSelector::new(&config.proportions)?;
        let first_key = match phase {
            Phase::Load => config.insert_start,
            Phase::Run => config.insert_start + config.record_count,
        };
        let workload = CoreWorkload {
            selector,
            keys: Arc::new(KeyCounter::new(first_key)),
            field_names: config.field_names(),
            config: Arc::new(config),
        };
        workload.key_generator(None)?;
        Ok(workload)
    }

    #[cfg(test)]
    pub fn key_counter(&self) -> &Arc<KeyCounter> {
        &self.keys
    }

    fn key_generator(&self, seed: Option<u64>) -> Result<KeyGenerator, ConfigError> {
        KeyGenerator::for_distribution(
            self.config.request_distribution,
            self.config.insert_start,
            self.config.record_count,
            self.config.zipfian_constant,
            Arc::clone(&self.keys),
            seed,
        )
    }

    fn random_field(&self, rng: &mut SmallRng) -> String {
        self.field_names[rng.random_range(0..self.field_names.len())].clone()
    }

    fn full_record(&self, rng: &mut SmallRng) -> Record {
        self.field_names
            .iter()
            .map(|name| (name.clone(), random_value(rng, self.config.field_length)))
            .collect()
    }

    fn read_fields(&self, rng: &mut SmallRng) -> Option<Vec<String>> {
        if self.config.read_all_fields {
            None
        } else {
            Some(vec![self.random_field(rng)])
        }
    }

    fn write_values(&self, rng: &mut SmallRng) -> Record {
        if self.config.write_all_fields {
            self.full_record(rng)
        } else {
            let mut values = Record::new();
            values.insert(
                self.random_field(rng),
                random_value(rng, self.config.field_length),
            );
            values
        }
    }

    /// Builds the operation for `kind` against an existing key. An insert
    /// mints a fresh id instead, so it must be handed to `execute`.
    fn build_operation(&self, kind: OperationKind, state: &mut WorkerState) -> Operation {
        let WorkerState { keygen, rng } = state;
        match kind {
            OperationKind::Read => Operation::Read {
                key: key_name(keygen.next_id()),
                fields: self.read_fields(rng),
            },
            OperationKind::Update => Operation::Update {
                key: key_name(keygen.next_id()),
                values: self.write_values(rng),
            },
            OperationKind::Insert => Operation::Insert {
                id: self.keys.next_id(),
                values: self.full_record(rng),
            },
            OperationKind::Scan => Operation::Scan {
                start_key: key_name(keygen.next_id()),
                count: rng.random_range(1..=self.config.max_scan_length),
                fields: self.read_fields(rng),
            },
            OperationKind::ReadModifyWrite => Operation::ReadModifyWrite {
                key: key_name(keygen.next_id()),
                fields: self.read_fields(rng),
                values: self.write_values(rng),
            },
        }
    }

    /// Issues `op`. A read-modify-write stops at a failed read. A written
    /// insert is published to the `latest` distribution.
    fn execute(&self, db: &dyn Database, op: &Operation) -> BackendResult<()> {
        let table = self.config.table.as_str();
        match op {
            Operation::Read { key, fields } => db.read(table, key, fields.as_deref()).map(drop),
            Operation::Update { key, values } => db.update(table, key, values),
            Operation::Insert { id, values } => {
                db.insert(table, &key_name(*id), values)?;
                self.keys.acknowledge(*id);
                Ok(())
            }
            Operation::Scan {
                start_key,
                count,
                fields,
            } => db
                .scan(table, start_key, *count, fields.as_deref())
                .map(drop),
            Operation::ReadModifyWrite {
                key,
                fields,
                values,
            } => {
                db.read(table, key, fields.as_deref())?;
                db.update(table, key, values)
            }
        }
    }
}

impl Workload for CoreWorkload {
    type State = WorkerState;

    fn init_thread(&self, thread_id: usize) -> Result<WorkerState, ConfigError> {
        let mut rng = seeded_rng(self.config.seed.map(|s| s.wrapping_add(thread_id as u64)));
        let keygen_seed = self.config.seed.map(|_| rng.next_u64());
        Ok(WorkerState {
            keygen: self.key_generator(keygen_seed)?,
            rng,
        })
    }

    fn do_insert(&self, db: &dyn Database, state: &mut WorkerState) -> BackendResult<()> {
        let op = self.build_operation(OperationKind::Insert, state);
        self.execute(db, &op)
    }

    fn do_transaction(&self, db: &dyn Database, state: &mut WorkerState) -> Transaction {
        let kind = self.selector.select(&mut state.rng);
        let op = self.build_operation(kind, state);
        Transaction {
            kind: op.kind(),
            result: self.execute(db, &op),
            more: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Properties, RequestDistribution};
    use crate::database::{BackendError, MemBTree};
    use std::collections::HashSet;

    fn config(pairs: &[(&str, &str)]) -> WorkloadConfig {
        let mut props = Properties::new();
        props.set("recordcount", "100");
        props.set("seed", "9");
        for (k, v) in pairs {
            props.set(*k, *v);
        }
        WorkloadConfig::from_properties(&props).unwrap()
    }

    fn loaded(config: WorkloadConfig) -> (MemBTree, CoreWorkload) {
        let db = MemBTree::default();
        let loader = CoreWorkload::new(config.clone(), Phase::Load).unwrap();
        let mut state = loader.init_thread(0).unwrap();
        for _ in 0..config.record_count {
            loader.do_insert(&db, &mut state).unwrap();
        }
        (db, CoreWorkload::new(config, Phase::Run).unwrap())
    }

    #[test]
    fn load_writes_full_records_sequentially() {
        let cfg = config(&[("fieldcount", "5"), ("fieldlength", "16"), ("insertstart", "7")]);
        let db = MemBTree::default();
        let workload = CoreWorkload::new(cfg, Phase::Load).unwrap();
        let mut state = workload.init_thread(0).unwrap();
        for _ in 0..3 {
            workload.do_insert(&db, &mut state).unwrap();
        }

        let rows = db.scan("usertable", "", 10, None).unwrap();
        let keys: Vec<_> = rows.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec![key_name(7), key_name(8), key_name(9)]);
        for (_, record) in rows {
            assert_eq!(record.len(), 5);
            assert!(record.values().all(|v| v.len() == 16));
        }
        assert_eq!(workload.key_counter().latest(), 9);
    }

    #[test]
    fn concurrent_loaders_never_share_a_key() {
        let cfg = config(&[("fieldcount", "1"), ("fieldlength", "4")]);
        let db = MemBTree::default();
        let workload = CoreWorkload::new(cfg, Phase::Load).unwrap();
        std::thread::scope(|s| {
            for t in 0..4 {
                let (db, workload) = (&db, &workload);
                s.spawn(move || {
                    let mut state = workload.init_thread(t).unwrap();
                    for _ in 0..250 {
                        workload.do_insert(db, &mut state).unwrap();
                    }
                });
            }
        });
        let rows = db.scan("usertable", "", 2000, None).unwrap();
        let unique: HashSet<_> = rows.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(rows.len(), 1000);
        assert_eq!(unique.len(), 1000);
    }

    #[test]
    fn run_keys_stay_in_loaded_space() {
        for dist in ["uniform", "zipfian", "latest", "sequential"] {
            let cfg = config(&[("requestdistribution", dist), ("fieldcount", "2")]);
            let (db, workload) = loaded(cfg);
            let mut state = workload.init_thread(0).unwrap();
            for _ in 0..500 {
                let tx = workload.do_transaction(&db, &mut state);
                assert!(tx.more);
                assert!(tx.result.is_ok(), "{dist}: {:?}", tx.result);
            }
        }
    }

    #[test]
    fn read_field_subset_follows_flag() {
        let all = CoreWorkload::new(config(&[]), Phase::Run).unwrap();
        let mut state = all.init_thread(0).unwrap();
        assert!(matches!(
            all.build_operation(OperationKind::Read, &mut state),
            Operation::Read { fields: None, .. }
        ));

        let one = CoreWorkload::new(config(&[("readallfields", "false")]), Phase::Run).unwrap();
        let mut state = one.init_thread(0).unwrap();
        match one.build_operation(OperationKind::Read, &mut state) {
            Operation::Read { fields: Some(f), .. } => {
                assert_eq!(f.len(), 1);
                assert!(f[0].starts_with("field"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn update_values_follow_flag() {
        let one = CoreWorkload::new(config(&[("fieldcount", "4")]), Phase::Run).unwrap();
        let mut state = one.init_thread(0).unwrap();
        match one.build_operation(OperationKind::Update, &mut state) {
            Operation::Update { values, .. } => assert_eq!(values.len(), 1),
            other => panic!("unexpected {other:?}"),
        }

        let all = CoreWorkload::new(
            config(&[("fieldcount", "4"), ("writeallfields", "true")]),
            Phase::Run,
        )
        .unwrap();
        let mut state = all.init_thread(0).unwrap();
        match all.build_operation(OperationKind::ReadModifyWrite, &mut state) {
            Operation::ReadModifyWrite { values, .. } => assert_eq!(values.len(), 4),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn scan_length_bounded() {
        let workload = CoreWorkload::new(config(&[("maxscanlength", "5")]), Phase::Run).unwrap();
        let mut state = workload.init_thread(0).unwrap();
        for _ in 0..200 {
            match workload.build_operation(OperationKind::Scan, &mut state) {
                Operation::Scan { count, .. } => assert!((1..=5).contains(&count)),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn run_inserts_continue_after_loaded_keys() {
        let cfg = config(&[
            ("readproportion", "0"),
            ("updateproportion", "0"),
            ("insertproportion", "1"),
        ]);
        let (db, workload) = loaded(cfg);
        let mut state = workload.init_thread(0).unwrap();
        for _ in 0..10 {
            let tx = workload.do_transaction(&db, &mut state);
            assert_eq!(tx.kind, OperationKind::Insert);
            tx.result.unwrap();
        }
        assert_eq!(db.scan("usertable", "", 1000, None).unwrap().len(), 110);
        assert_eq!(workload.key_counter().latest(), 109);
    }

    #[test]
    fn read_modify_write_on_missing_key_does_not_update() {
        let workload = CoreWorkload::new(config(&[]), Phase::Run).unwrap();
        let db = MemBTree::default();
        let mut values = Record::new();
        values.insert("field0".to_owned(), b"x".to_vec());
        let op = Operation::ReadModifyWrite {
            key: key_name(3),
            fields: None,
            values,
        };
        let err = workload.execute(&db, &op).unwrap_err();
        assert!(matches!(err, BackendError::NotFound { .. }));
        assert!(db.read("usertable", &key_name(3), None).is_err());
    }

    #[test]
    fn read_modify_write_updates_existing_record() {
        let cfg = config(&[("fieldcount", "3")]);
        let (db, workload) = loaded(cfg);
        let before = db.read("usertable", &key_name(4), None).unwrap();
        let mut values = Record::new();
        values.insert("field1".to_owned(), b"new".to_vec());
        let op = Operation::ReadModifyWrite {
            key: key_name(4),
            fields: None,
            values,
        };
        workload.execute(&db, &op).unwrap();
        let after = db.read("usertable", &key_name(4), None).unwrap();
        assert_eq!(after["field1"], b"new".to_vec());
        assert_eq!(after["field0"], before["field0"]);
        assert_eq!(after["field2"], before["field2"]);
    }

    #[test]
    fn seeded_workers_are_reproducible() {
        let cfg = config(&[("requestdistribution", "zipfian")]);
        let a = CoreWorkload::new(cfg.clone(), Phase::Run).unwrap();
        let b = CoreWorkload::new(cfg, Phase::Run).unwrap();
        let (mut sa, mut sb) = (a.init_thread(1).unwrap(), b.init_thread(1).unwrap());
        for _ in 0..50 {
            assert_eq!(
                a.build_operation(OperationKind::Read, &mut sa),
                b.build_operation(OperationKind::Read, &mut sb)
            );
        }
    }

    #[test]
    fn insert_is_published_only_after_it_is_written() {
        let workload =
            CoreWorkload::new(config(&[("requestdistribution", "latest")]), Phase::Run).unwrap();
        assert_eq!(workload.config.request_distribution, RequestDistribution::Latest);
        let db = MemBTree::default();
        let mut state = workload.init_thread(0).unwrap();

        let op = workload.build_operation(OperationKind::Insert, &mut state);
        assert!(matches!(op, Operation::Insert { id: 100, .. }));
        assert_eq!(workload.keys.latest(), 99);
        workload.execute(&db, &op).unwrap();
        assert_eq!(workload.keys.latest(), 100);
        assert!(db.read("usertable", &key_name(100), None).is_ok());
    }
}
