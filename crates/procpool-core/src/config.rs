use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Sizing parameters of a process pool.
///
/// The pool keeps between `min_size` and `max_size` worker processes
/// alive, tries to hold `reserve_size` of them idle and warm, and retires
/// idle workers above the minimum once they have been unused for
/// `keep_alive_ms`. `keep_alive_ms == 0` disables idle expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub min_size: usize,
    pub max_size: usize,
    pub reserve_size: usize,
    pub keep_alive_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 0,
            max_size: 8,
            reserve_size: 0,
            keep_alive_ms: 60_000,
        }
    }
}

impl PoolConfig {
    /// A fixed-size pool: `min == max`, no reserve, no idle expiry.
    pub fn fixed(size: usize) -> Self {
        Self {
            min_size: size,
            max_size: size,
            reserve_size: 0,
            keep_alive_ms: 0,
        }
    }

    pub fn keep_alive(&self) -> Option<Duration> {
        (self.keep_alive_ms > 0).then(|| Duration::from_millis(self.keep_alive_ms))
    }

    /// Number of workers started during warmup.
    pub fn initial_size(&self) -> usize {
        self.min_size.max(self.reserve_size)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_size == 0 {
            return Err(ConfigError::InvalidArgument {
                field: "max_size",
                value: 0,
                reason: "must be at least 1",
            });
        }
        if self.max_size < self.min_size {
            return Err(ConfigError::InvalidArgument {
                field: "max_size",
                value: self.max_size as u64,
                reason: "must be at least min_size",
            });
        }
        if self.reserve_size > self.max_size {
            return Err(ConfigError::InvalidArgument {
                field: "reserve_size",
                value: self.reserve_size as u64,
                reason: "must not exceed max_size",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        PoolConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_max_is_rejected() {
        let config = PoolConfig {
            max_size: 0,
            ..PoolConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn max_below_min_is_rejected() {
        let config = PoolConfig {
            min_size: 4,
            max_size: 2,
            ..PoolConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn reserve_above_max_is_rejected() {
        let config = PoolConfig {
            max_size: 2,
            reserve_size: 3,
            ..PoolConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn initial_size_is_max_of_min_and_reserve() {
        let config = PoolConfig {
            min_size: 2,
            max_size: 8,
            reserve_size: 3,
            keep_alive_ms: 0,
        };
        assert_eq!(config.initial_size(), 3);
        assert_eq!(PoolConfig::fixed(2).initial_size(), 2);
    }

    #[test]
    fn zero_keep_alive_means_no_expiry() {
        assert_eq!(PoolConfig::fixed(1).keep_alive(), None);
        assert_eq!(
            PoolConfig::default().keep_alive(),
            Some(Duration::from_secs(60))
        );
    }

    #[test]
    fn config_round_trips_through_serde() {
        let config = PoolConfig {
            min_size: 1,
            max_size: 4,
            reserve_size: 2,
            keep_alive_ms: 500,
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: PoolConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config: PoolConfig = serde_json::from_str("{\"max_size\": 3}").unwrap();
        assert_eq!(config.max_size, 3);
        assert_eq!(config.min_size, 0);
    }
}
