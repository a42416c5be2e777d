pub mod engine;
pub mod operation;
pub mod presets;

use crate::config::ConfigError;
use crate::database::{BackendResult, Database};
use crate::workload::operation::OperationKind;
use anyhow::{Result, anyhow};
use hdrhistogram::Histogram;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thousands::Separable;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Bulk insert populating the key space.
    Load,
    /// Steady-state transaction mix.
    Run,
}

/// Result of one `do_transaction` call.
#[derive(Debug)]
pub struct Transaction {
    pub kind: OperationKind,
    pub result: BackendResult<()>,
    /// `false` once this worker has nothing left to do.
    pub more: bool,
}

/// Per-operation contract driven by the worker loop.
///
/// Both calls run concurrently from every worker and must not block each
/// other; per-worker mutable state lives in `State`.
pub trait Workload: Sync {
    type State;

    fn init_thread(&self, thread_id: usize) -> Result<Self::State, ConfigError>;
    fn do_insert(&self, db: &dyn Database, state: &mut Self::State) -> BackendResult<()>;
    fn do_transaction(&self, db: &dyn Database, state: &mut Self::State) -> Transaction;
}

#[derive(Debug, Clone)]
pub struct RunPlan {
    pub threads: usize,
    /// Total across all threads.
    pub operations: u64,
    /// Workers stop between operations once this elapses.
    pub max_execution_time: Option<Duration>,
}

impl RunPlan {
    /// Operations assigned to `thread`; the remainder goes to the first threads.
    fn share(&self, thread: usize) -> u64 {
        let threads = self.threads as u64;
        self.operations / threads + u64::from((thread as u64) < self.operations % threads)
    }
}

#[derive(Debug)]
pub struct OpStats {
    ok: u64,
    not_found: u64,
    failed: u64,
    time: Duration,
    hist_micro_sec: Histogram<u64>,
}

impl OpStats {
    pub fn new() -> Result<Self> {
        Ok(OpStats {
            ok: 0,
            not_found: 0,
            failed: 0,
            time: Duration::ZERO,
            hist_micro_sec: Histogram::new_with_bounds(1, 10_000_000, 3)?,
        })
    }

    fn record(&mut self, result: &BackendResult<()>, elapsed: Duration) {
        match result {
            Ok(()) => self.ok += 1,
            Err(e) if e.is_not_found() => self.not_found += 1,
            Err(_) => self.failed += 1,
        }
        self.time += elapsed;
        self.hist_micro_sec
            .saturating_record(elapsed.as_micros().min(u128::from(u64::MAX)) as u64);
    }

    fn merge(&mut self, other: &OpStats) -> Result<()> {
        self.ok += other.ok;
        self.not_found += other.not_found;
        self.failed += other.failed;
        self.time += other.time;
        self.hist_micro_sec.add(&other.hist_micro_sec)?;
        Ok(())
    }

    pub fn ok(&self) -> u64 {
        self.ok
    }

    pub fn not_found(&self) -> u64 {
        self.not_found
    }

    pub fn failed(&self) -> u64 {
        self.failed
    }

    pub fn total(&self) -> u64 {
        self.ok + self.not_found + self.failed
    }

    pub fn mean_micro_sec(&self) -> u64 {
        match self.total() {
            0 => 0,
            n => (self.time.as_micros() / u128::from(n)) as u64,
        }
    }
}

#[derive(Debug)]
pub struct PhaseStats {
    pub wall_time: Duration,
    pub ops: BTreeMap<OperationKind, OpStats>,
}

impl PhaseStats {
    fn empty() -> Self {
        PhaseStats {
            wall_time: Duration::ZERO,
            ops: BTreeMap::new(),
        }
    }

    fn entry(&mut self, kind: OperationKind) -> Result<&mut OpStats> {
        if !self.ops.contains_key(&kind) {
            self.ops.insert(kind, OpStats::new()?);
        }
        self.ops
            .get_mut(&kind)
            .ok_or_else(|| anyhow!("missing stats for {kind}"))
    }

    fn merge(&mut self, other: PhaseStats) -> Result<()> {
        for (kind, stats) in other.ops {
            self.entry(kind)?.merge(&stats)?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn get(&self, kind: OperationKind) -> Option<&OpStats> {
        self.ops.get(&kind)
    }

    pub fn total(&self) -> u64 {
        self.ops.values().map(OpStats::total).sum()
    }

    pub fn errors(&self) -> u64 {
        self.ops.values().map(OpStats::failed).sum()
    }
}

#[derive(Debug, Default)]
pub struct WorkloadStats {
    pub load: Option<PhaseStats>,
    pub run: Option<PhaseStats>,
}

impl Display for WorkloadStats {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let throughput = |ops: u64, d: Duration| -> f64 {
            if ops == 0 || d.is_zero() {
                0.0
            } else {
                ops as f64 / d.as_secs_f64()
            }
        };
        let percentile = |h: &Histogram<u64>, q: f64| -> String {
            if h.is_empty() {
                "-".into()
            } else {
                h.value_at_quantile(q).separate_with_underscores()
            }
        };

        for (title, phase) in [("LOAD", &self.load), ("RUN", &self.run)] {
            let Some(phase) = phase else { continue };
            writeln!(f, "=== {title} ===")?;
            writeln!(
                f,
                "ops: {} | time: {:.1?} | throughput: {} ops/s",
                phase.total().separate_with_underscores(),
                phase.wall_time,
                (throughput(phase.total(), phase.wall_time) as u64).separate_with_underscores()
            )?;
            for (kind, s) in &phase.ops {
                let h = &s.hist_micro_sec;
                writeln!(
                    f,
                    "[{kind}] ok: {} | not found: {} | failed: {} | avg: {} µs | p50: {} µs | p95: {} µs | p99: {} µs | p99.9: {} µs",
                    s.ok().separate_with_underscores(),
                    s.not_found().separate_with_underscores(),
                    s.failed().separate_with_underscores(),
                    s.mean_micro_sec().separate_with_underscores(),
                    percentile(h, 0.50),
                    percentile(h, 0.95),
                    percentile(h, 0.99),
                    percentile(h, 0.999)
                )?;
            }
        }
        Ok(())
    }
}

/// Inserts `plan.operations` records, split across `plan.threads` workers.
pub fn exec_load<W: Workload>(
    workload: &W,
    db: &Arc<dyn Database>,
    plan: &RunPlan,
) -> Result<PhaseStats> {
    info!(records = plan.operations, threads = plan.threads, "starting load phase");
    let stats = exec(workload, db, plan, Phase::Load)?;
    info!(elapsed = ?stats.wall_time, errors = stats.errors(), "load phase done");
    Ok(stats)
}

/// Issues `plan.operations` transactions, split across `plan.threads` workers.
pub fn exec_run<W: Workload>(
    workload: &W,
    db: &Arc<dyn Database>,
    plan: &RunPlan,
) -> Result<PhaseStats> {
    info!(operations = plan.operations, threads = plan.threads, "starting run phase");
    let stats = exec(workload, db, plan, Phase::Run)?;
    info!(elapsed = ?stats.wall_time, errors = stats.errors(), "run phase done");
    Ok(stats)
}

fn exec<W: Workload>(
    workload: &W,
    db: &Arc<dyn Database>,
    plan: &RunPlan,
    phase: Phase,
) -> Result<PhaseStats> {
    if plan.threads == 0 {
        return Err(anyhow!("thread count must be positive"));
    }
    let mut total = PhaseStats::empty();
    let start_time = Instant::now();
    let deadline = plan.max_execution_time.map(|d| start_time + d);

    std::thread::scope(|s| -> Result<()> {
        let mut handles = vec![];
        for thread_id in 0..plan.threads {
            let budget = plan.share(thread_id);
            let db = db.as_ref();
            let h = s.spawn(move || worker(workload, db, thread_id, budget, deadline, phase));
            handles.push(h);
        }

        for h in handles {
            let stats = h
                .join()
                .map_err(|_| anyhow!("worker thread panicked"))??;
            total.merge(stats)?;
        }
        Ok(())
    })?;
    total.wall_time = start_time.elapsed();

    if total.errors() > 0 {
        warn!(phase = ?phase, errors = total.errors(), "operations failed");
    }
    Ok(total)
}

/// One worker: `open`, loop until the budget, the workload or the deadline
/// says stop, then `close`.
fn worker<W: Workload>(
    workload: &W,
    db: &dyn Database,
    thread_id: usize,
    budget: u64,
    deadline: Option<Instant>,
    phase: Phase,
) -> Result<PhaseStats> {
    db.open()?;
    let outcome = worker_loop(workload, db, thread_id, budget, deadline, phase);
    let closed = db.close();
    let stats = outcome?;
    closed?;
    Ok(stats)
}

fn worker_loop<W: Workload>(
    workload: &W,
    db: &dyn Database,
    thread_id: usize,
    budget: u64,
    deadline: Option<Instant>,
    phase: Phase,
) -> Result<PhaseStats> {
    let mut state = workload.init_thread(thread_id)?;
    let mut stats = PhaseStats::empty();
    debug!(thread_id, budget, "worker started");

    for _ in 0..budget {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            debug!(thread_id, "execution time exhausted");
            break;
        }
        let start = Instant::now();
        let (kind, result, more) = match phase {
            Phase::Load => (
                OperationKind::Insert,
                workload.do_insert(db, &mut state),
                true,
            ),
            Phase::Run => {
                let tx = workload.do_transaction(db, &mut state);
                (tx.kind, tx.result, tx.more)
            }
        };
        let elapsed = start.elapsed();
        if let Err(e) = &result {
            debug!(thread_id, %kind, error = %e, "operation failed");
        }
        stats.entry(kind)?.record(&result, elapsed);
        if !more {
            break;
        }
    }

    debug!(thread_id, ops = stats.total(), "worker finished");
    Ok(stats)
}
