use crate::config::{self, Properties};
use clap::ValueEnum;

/// The standard A-F workload mixes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum Preset {
    /// 50% read, 50% update. Session store.
    A,
    /// 95% read, 5% update. Photo tagging.
    B,
    /// Read only. Profile cache.
    C,
    /// 95% read, 5% insert, reads skewed to the newest keys.
    D,
    /// 95% short scans, 5% insert.
    E,
    /// 50% read, 50% read-modify-write.
    F,
}

impl Preset {
    pub fn properties(self) -> Properties {
        let (read, update, insert, scan, rmw, dist) = match self {
            Preset::A => ("0.5", "0.5", "0", "0", "0", "zipfian"),
            Preset::B => ("0.95", "0.05", "0", "0", "0", "zipfian"),
            Preset::C => ("1", "0", "0", "0", "0", "zipfian"),
            Preset::D => ("0.95", "0", "0.05", "0", "0", "latest"),
            Preset::E => ("0", "0", "0.05", "0.95", "0", "zipfian"),
            Preset::F => ("0.5", "0", "0", "0", "0.5", "zipfian"),
        };

        let mut props = Properties::new();
        props.set(config::RECORD_COUNT, "1000");
        props.set(config::OPERATION_COUNT, "1000");
        props.set(config::READ_PROPORTION, read);
        props.set(config::UPDATE_PROPORTION, update);
        props.set(config::INSERT_PROPORTION, insert);
        props.set(config::SCAN_PROPORTION, scan);
        props.set(config::READ_MODIFY_WRITE_PROPORTION, rmw);
        props.set(config::REQUEST_DISTRIBUTION, dist);
        if self == Preset::E {
            props.set(config::MAX_SCAN_LENGTH, "100");
        }
        props
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkloadConfig;

    #[test]
    fn every_preset_is_valid() {
        for preset in Preset::value_variants() {
            let config = WorkloadConfig::from_properties(&preset.properties());
            assert!(config.is_ok(), "{preset:?}: {:?}", config.err());
        }
    }

    #[test]
    fn overrides_win_over_preset() {
        let mut props = Preset::A.properties();
        props.merge(Properties::parse("recordcount=42").unwrap());
        let config = WorkloadConfig::from_properties(&props).unwrap();
        assert_eq!(config.record_count, 42);
        assert_eq!(config.proportions.update, 0.5);
    }
}
