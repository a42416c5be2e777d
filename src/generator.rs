use crate::config::{ConfigError, RequestDistribution, ZIPFIAN_CONSTANT};
use rand::distr::Distribution;
use rand::rngs::SmallRng;
use rand::{Rng, RngCore, SeedableRng};
use rand_distr::Zipf;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Maps a numeric key id to its record key. Zero padding keeps string order
/// equal to numeric order.
pub fn key_name(id: u64) -> String {
    format!("user{id:012}")
}

pub fn seeded_rng(seed: Option<u64>) -> SmallRng {
    match seed {
        Some(s) => SmallRng::seed_from_u64(s),
        None => SmallRng::from_os_rng(),
    }
}

/// Shared key minting state for inserts.
///
/// `next_id` hands out every id exactly once. `latest` trails it with the
/// highest id below which every insert was acknowledged, which is what the
/// `latest` distribution skews towards. An id that is never acknowledged
/// holds `latest` back for good.
#[derive(Debug)]
pub struct KeyCounter {
    next: AtomicU64,
    latest: AtomicU64,
    acks: Mutex<AckWindow>,
}

/// Acknowledged ids that arrived ahead of a gap.
#[derive(Debug)]
struct AckWindow {
    expected: u64,
    ahead: BTreeSet<u64>,
}

impl KeyCounter {
    pub fn new(start: u64) -> Self {
        KeyCounter {
            next: AtomicU64::new(start),
            latest: AtomicU64::new(start.saturating_sub(1)),
            acks: Mutex::new(AckWindow {
                expected: start,
                ahead: BTreeSet::new(),
            }),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    pub fn acknowledge(&self, id: u64) {
        let mut guard = self.acks.lock().unwrap_or_else(|e| e.into_inner());
        let window = &mut *guard;
        if id < window.expected {
            return;
        }
        window.ahead.insert(id);
        let before = window.expected;
        while window.ahead.remove(&window.expected) {
            window.expected += 1;
        }
        if window.expected > before {
            self.latest.store(window.expected - 1, Ordering::Release);
        }
    }

    pub fn latest(&self) -> u64 {
        self.latest.load(Ordering::Acquire)
    }
}

/// Picks key ids for run-phase requests. Each worker owns one.
#[derive(Debug)]
pub enum KeyGenerator {
    /// Cycles `start..start + count`.
    Sequential { start: u64, count: u64, current: u64 },
    Uniform { start: u64, count: u64, rng: SmallRng },
    Zipfian { start: u64, zipf: Zipf<f64>, rng: SmallRng },
    /// Zipfian ranks counted backwards from the most recent insert.
    Latest {
        start: u64,
        zipf: Zipf<f64>,
        rng: SmallRng,
        counter: Arc<KeyCounter>,
    },
}

impl KeyGenerator {
    pub fn sequential(start: u64, count: u64) -> Result<Self, ConfigError> {
        check_key_space(count)?;
        Ok(KeyGenerator::Sequential { start, count, current: 0 })
    }

    pub fn uniform(start: u64, count: u64, seed: Option<u64>) -> Result<Self, ConfigError> {
        check_key_space(count)?;
        Ok(KeyGenerator::Uniform { start, count, rng: seeded_rng(seed) })
    }

    pub fn zipfian(start: u64, count: u64, theta: f64, seed: Option<u64>) -> Result<Self, ConfigError> {
        let zipf = zipf(count, theta)?;
        Ok(KeyGenerator::Zipfian { start, zipf, rng: seeded_rng(seed) })
    }

    pub fn latest(
        start: u64,
        count: u64,
        theta: f64,
        counter: Arc<KeyCounter>,
        seed: Option<u64>,
    ) -> Result<Self, ConfigError> {
        let zipf = zipf(count, theta)?;
        Ok(KeyGenerator::Latest { start, zipf, rng: seeded_rng(seed), counter })
    }

    pub fn for_distribution(
        kind: RequestDistribution,
        start: u64,
        count: u64,
        theta: f64,
        counter: Arc<KeyCounter>,
        seed: Option<u64>,
    ) -> Result<Self, ConfigError> {
        match kind {
            RequestDistribution::Sequential => Self::sequential(start, count),
            RequestDistribution::Uniform => Self::uniform(start, count, seed),
            RequestDistribution::Zipfian => Self::zipfian(start, count, theta, seed),
            RequestDistribution::Latest => Self::latest(start, count, theta, counter, seed),
        }
    }

    pub fn next_id(&mut self) -> u64 {
        match self {
            KeyGenerator::Sequential { start, count, current } => {
                let id = *start + *current;
                *current = (*current + 1) % *count;
                id
            }
            KeyGenerator::Uniform { start, count, rng } => *start + rng.random_range(0..*count),
            KeyGenerator::Zipfian { start, zipf, rng } => *start + rank(zipf, rng),
            KeyGenerator::Latest { start, zipf, rng, counter } => {
                let latest = counter.latest().max(*start);
                let span = latest - *start + 1;
                latest - rank(zipf, rng) % span
            }
        }
    }
}

fn check_key_space(count: u64) -> Result<(), ConfigError> {
    if count == 0 {
        return Err(ConfigError::EmptyKeySpace);
    }
    Ok(())
}

fn zipf(count: u64, theta: f64) -> Result<Zipf<f64>, ConfigError> {
    check_key_space(count)?;
    if theta == 1.0 {
        return Err(ConfigError::InvalidValue {
            key: ZIPFIAN_CONSTANT.to_owned(),
            value: theta.to_string(),
            reason: "must not be 1".to_owned(),
        });
    }
    Zipf::new(count as f64, theta).map_err(|e| ConfigError::InvalidValue {
        key: ZIPFIAN_CONSTANT.to_owned(),
        value: theta.to_string(),
        reason: e.to_string(),
    })
}

/// 0-based rank; zipf samples start at 1.
fn rank(zipf: &Zipf<f64>, rng: &mut SmallRng) -> u64 {
    (zipf.sample(rng) as u64).saturating_sub(1)
}

pub fn random_value(rng: &mut impl RngCore, len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    rng.fill_bytes(&mut bytes[..]);
    bytes
}
