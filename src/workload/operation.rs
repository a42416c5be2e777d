use crate::config::{ConfigError, Proportions};
use crate::database::Record;
use rand::Rng;
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OperationKind {
    Read,
    Update,
    Insert,
    Scan,
    ReadModifyWrite,
}

impl OperationKind {
    /// Selection order of the cumulative mix.
    pub const ALL: [OperationKind; 5] = [
        OperationKind::Read,
        OperationKind::Update,
        OperationKind::Insert,
        OperationKind::Scan,
        OperationKind::ReadModifyWrite,
    ];
}

impl Display for OperationKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OperationKind::Read => "READ",
            OperationKind::Update => "UPDATE",
            OperationKind::Insert => "INSERT",
            OperationKind::Scan => "SCAN",
            OperationKind::ReadModifyWrite => "READ-MODIFY-WRITE",
        };
        f.write_str(name)
    }
}

/// One unit of work, built fresh by the issuing worker.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Read {
        key: String,
        fields: Option<Vec<String>>,
    },
    Update {
        key: String,
        values: Record,
    },
    /// `id` is freshly minted; the key is derived from it.
    Insert {
        id: u64,
        values: Record,
    },
    Scan {
        start_key: String,
        count: usize,
        fields: Option<Vec<String>>,
    },
    ReadModifyWrite {
        key: String,
        fields: Option<Vec<String>>,
        values: Record,
    },
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Read { .. } => OperationKind::Read,
            Operation::Update { .. } => OperationKind::Update,
            Operation::Insert { .. } => OperationKind::Insert,
            Operation::Scan { .. } => OperationKind::Scan,
            Operation::ReadModifyWrite { .. } => OperationKind::ReadModifyWrite,
        }
    }
}

/// Picks the next operation kind from a cumulative partition of `[0, 1)`.
///
/// Intervals are half-open, so a draw landing exactly on a boundary belongs
/// to the following kind. Empty intervals are never selected.
#[derive(Debug, Clone)]
pub struct OperationSelector {
    upper: [f64; 5],
    /// Index of the last non-empty interval.
    last: usize,
}

impl OperationSelector {
    pub fn new(proportions: &Proportions) -> Result<Self, ConfigError> {
        proportions.validate()?;
        let weights = proportions.as_array();
        let mut upper = [0.0; 5];
        let mut acc = 0.0;
        for (bound, weight) in upper.iter_mut().zip(weights) {
            acc += weight;
            *bound = acc;
        }
        // validate() guarantees a positive weight
        let last = weights
            .iter()
            .rposition(|w| *w > 0.0)
            .ok_or_else(|| ConfigError::InvalidProportions("all proportions are zero".to_owned()))?;
        // Absorb float rounding so every draw in [0, 1) lands somewhere.
        for bound in &mut upper[last..] {
            *bound = 1.0;
        }
        Ok(OperationSelector { upper, last })
    }

    pub fn select(&self, rng: &mut impl Rng) -> OperationKind {
        self.select_at(rng.random::<f64>())
    }

    /// `draw` must be in `[0, 1)`.
    pub fn select_at(&self, draw: f64) -> OperationKind {
        let idx = self
            .upper
            .iter()
            .position(|hi| draw < *hi)
            .unwrap_or(self.last);
        OperationKind::ALL[idx]
    }
}
