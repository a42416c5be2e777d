use std::collections::HashMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;

pub const TABLE: &str = "table";
pub const FIELD_COUNT: &str = "fieldcount";
pub const FIELD_LENGTH: &str = "fieldlength";
pub const READ_ALL_FIELDS: &str = "readallfields";
pub const WRITE_ALL_FIELDS: &str = "writeallfields";
pub const READ_PROPORTION: &str = "readproportion";
pub const UPDATE_PROPORTION: &str = "updateproportion";
pub const INSERT_PROPORTION: &str = "insertproportion";
pub const SCAN_PROPORTION: &str = "scanproportion";
pub const READ_MODIFY_WRITE_PROPORTION: &str = "readmodifywriteproportion";
pub const REQUEST_DISTRIBUTION: &str = "requestdistribution";
pub const RECORD_COUNT: &str = "recordcount";
pub const OPERATION_COUNT: &str = "operationcount";
pub const INSERT_START: &str = "insertstart";
pub const MAX_SCAN_LENGTH: &str = "maxscanlength";
pub const ZIPFIAN_CONSTANT: &str = "zipfianconstant";
pub const MAX_EXECUTION_TIME: &str = "maxexecutiontime";
pub const SEED: &str = "seed";

/// Allowed drift of the proportion sum away from 1.0 (float representation only).
const PROPORTION_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required property `{key}`")]
    Missing { key: String },

    #[error("invalid value `{value}` for `{key}`: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("invalid operation proportions: {0}")]
    InvalidProportions(String),

    #[error("unknown request distribution `{0}` (expected uniform, zipfian, latest or sequential)")]
    UnknownDistribution(String),

    #[error("key space is empty, recordcount must be positive")]
    EmptyKeySpace,

    #[error("unknown backend `{name}` (known: {known})")]
    UnknownBackend { name: String, known: String },

    #[error("cannot read properties file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    fn invalid(key: &str, value: &str, reason: impl Display) -> Self {
        ConfigError::InvalidValue {
            key: key.to_owned(),
            value: value.to_owned(),
            reason: reason.to_string(),
        }
    }
}

/// Flat option map. Later `set`/`merge` calls win over earlier ones.
#[derive(Debug, Clone, Default)]
pub struct Properties {
    values: HashMap<String, String>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Parses `key=value` lines; `#` and `!` start comment lines.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut props = Properties::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            props.set_pair(line)?;
        }
        Ok(props)
    }

    /// Applies a single `key=value` override.
    pub fn set_pair(&mut self, pair: &str) -> Result<(), ConfigError> {
        let Some((key, value)) = pair.split_once('=') else {
            return Err(ConfigError::invalid(pair, "", "expected key=value"));
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(ConfigError::invalid(pair, value, "empty key"));
        }
        self.set(key, value.trim());
        Ok(())
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn merge(&mut self, other: Properties) {
        self.values.extend(other.values);
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    pub fn parse_or<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.get(key) {
            Some(raw) => parse_value(key, raw),
            None => Ok(default),
        }
    }

    pub fn parse_opt<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.get(key).map(|raw| parse_value(key, raw)).transpose()
    }

    pub fn parse_required<T>(&self, key: &str) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        let raw = self.get(key).ok_or_else(|| ConfigError::Missing {
            key: key.to_owned(),
        })?;
        parse_value(key, raw)
    }

    pub fn parse_bool_or(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.get(key) {
            Some(raw) => raw
                .to_ascii_lowercase()
                .parse::<bool>()
                .map_err(|e| ConfigError::invalid(key, raw, e)),
            None => Ok(default),
        }
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    raw.parse::<T>().map_err(|e| ConfigError::invalid(key, raw, e))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestDistribution {
    Uniform,
    Zipfian,
    Latest,
    Sequential,
}

impl FromStr for RequestDistribution {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uniform" => Ok(RequestDistribution::Uniform),
            "zipfian" => Ok(RequestDistribution::Zipfian),
            "latest" => Ok(RequestDistribution::Latest),
            "sequential" => Ok(RequestDistribution::Sequential),
            other => Err(ConfigError::UnknownDistribution(other.to_owned())),
        }
    }
}

/// Operation mix, in selection order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Proportions {
    pub read: f64,
    pub update: f64,
    pub insert: f64,
    pub scan: f64,
    pub read_modify_write: f64,
}

impl Proportions {
    pub fn as_array(&self) -> [f64; 5] {
        [
            self.read,
            self.update,
            self.insert,
            self.scan,
            self.read_modify_write,
        ]
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let values = self.as_array();
        if let Some(bad) = values
            .iter()
            .find(|p| !p.is_finite() || **p < 0.0 || **p > 1.0)
        {
            return Err(ConfigError::InvalidProportions(format!(
                "each proportion must be within [0, 1], got {bad}"
            )));
        }
        let sum: f64 = values.iter().sum();
        if sum == 0.0 {
            return Err(ConfigError::InvalidProportions(
                "all proportions are zero".to_owned(),
            ));
        }
        if sum > 1.0 + PROPORTION_TOLERANCE {
            return Err(ConfigError::InvalidProportions(format!(
                "proportions sum to {sum}, above 1.0"
            )));
        }
        if sum < 1.0 - PROPORTION_TOLERANCE {
            return Err(ConfigError::InvalidProportions(format!(
                "proportions sum to {sum}, leaving {} of the mix unassigned",
                1.0 - sum
            )));
        }
        Ok(())
    }
}

impl Default for Proportions {
    fn default() -> Self {
        Proportions {
            read: 0.95,
            update: 0.05,
            insert: 0.0,
            scan: 0.0,
            read_modify_write: 0.0,
        }
    }
}

/// Immutable workload snapshot, shared read-only by every worker.
#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    pub table: String,
    pub field_count: usize,
    pub field_length: usize,
    pub read_all_fields: bool,
    pub write_all_fields: bool,
    pub proportions: Proportions,
    pub request_distribution: RequestDistribution,
    pub record_count: u64,
    pub insert_start: u64,
    pub max_scan_length: usize,
    pub zipfian_constant: f64,
    pub seed: Option<u64>,
}

impl WorkloadConfig {
    pub fn from_properties(props: &Properties) -> Result<Self, ConfigError> {
        let defaults = Proportions::default();
        let proportions = Proportions {
            read: props.parse_or(READ_PROPORTION, defaults.read)?,
            update: props.parse_or(UPDATE_PROPORTION, defaults.update)?,
            insert: props.parse_or(INSERT_PROPORTION, defaults.insert)?,
            scan: props.parse_or(SCAN_PROPORTION, defaults.scan)?,
            read_modify_write: props
                .parse_or(READ_MODIFY_WRITE_PROPORTION, defaults.read_modify_write)?,
        };
        proportions.validate()?;

        // Parsed as signed so that negative counts report as an empty key space.
        let record_count: i64 = props.parse_required(RECORD_COUNT)?;
        if record_count <= 0 {
            return Err(ConfigError::EmptyKeySpace);
        }

        let config = WorkloadConfig {
            table: props.get_or(TABLE, "usertable").to_owned(),
            field_count: props.parse_or(FIELD_COUNT, 10)?,
            field_length: props.parse_or(FIELD_LENGTH, 100)?,
            read_all_fields: props.parse_bool_or(READ_ALL_FIELDS, true)?,
            write_all_fields: props.parse_bool_or(WRITE_ALL_FIELDS, false)?,
            proportions,
            request_distribution: props.get_or(REQUEST_DISTRIBUTION, "uniform").parse()?,
            record_count: record_count as u64,
            insert_start: props.parse_or(INSERT_START, 0)?,
            max_scan_length: props.parse_or(MAX_SCAN_LENGTH, 1000)?,
            zipfian_constant: props.parse_or(ZIPFIAN_CONSTANT, 0.99)?,
            seed: props.parse_opt(SEED)?,
        };

        if config.table.is_empty() {
            return Err(ConfigError::invalid(TABLE, "", "table name is empty"));
        }
        if config.field_count == 0 {
            return Err(ConfigError::invalid(FIELD_COUNT, "0", "need at least one field"));
        }
        if config.max_scan_length == 0 {
            return Err(ConfigError::invalid(MAX_SCAN_LENGTH, "0", "must be positive"));
        }
        let theta = config.zipfian_constant;
        if !theta.is_finite() || theta < 0.0 || theta == 1.0 {
            return Err(ConfigError::invalid(
                ZIPFIAN_CONSTANT,
                &theta.to_string(),
                "must be >= 0 and != 1",
            ));
        }
        Ok(config)
    }

    /// Names of all fields of a record, in order.
    pub fn field_names(&self) -> Vec<String> {
        (0..self.field_count).map(field_name).collect()
    }
}

pub fn field_name(index: usize) -> String {
    format!("field{index}")
}
