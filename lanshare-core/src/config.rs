//! Engine settings exposed to the settings screen, plus protocol tuning.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

pub const CHUNK_SIZE_MB_RANGE: (u32, u32) = (1, 32);
pub const MAX_CONCURRENT_RANGE: (usize, usize) = (1, 10);
pub const WORKERS_RANGE: (usize, usize) = (1, 10);

/// Engine configuration. Deserializable so hosts can embed it in their config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Chunk size in MiB (1–32, default 1).
    #[serde(default = "default_chunk_size_mb")]
    pub chunk_size_mb: u32,
    /// Sessions allowed to hold a transfer slot at once (1–10, default 3).
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_sessions: usize,
    /// Chunk workers per sending session (1–10, default 4).
    #[serde(default = "default_workers")]
    pub workers_per_session: usize,
    /// Directory incoming files are written to. Opaque to the engine beyond joining a file name.
    #[serde(default)]
    pub save_path: PathBuf,
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    /// Total attempts per chunk before the session fails.
    #[serde(default = "default_max_chunk_attempts")]
    pub max_chunk_attempts: u32,
    /// First retry delay; doubled per attempt.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// How long `create_session` waits for a free slot.
    #[serde(default = "default_admission_window_ms")]
    pub admission_window_ms: u64,
    /// Silence after which an online peer is marked offline.
    #[serde(default = "default_absence_threshold_secs")]
    pub absence_threshold_secs: u64,
    /// Time offline after which a peer is evicted.
    #[serde(default = "default_eviction_threshold_secs")]
    pub eviction_threshold_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_chunk_size_mb() -> u32 {
    1
}
fn default_max_concurrent() -> usize {
    3
}
fn default_workers() -> usize {
    4
}
fn default_ack_timeout_ms() -> u64 {
    10_000
}
fn default_max_chunk_attempts() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    200
}
fn default_admission_window_ms() -> u64 {
    500
}
fn default_absence_threshold_secs() -> u64 {
    16
}
fn default_eviction_threshold_secs() -> u64 {
    120
}
fn default_sweep_interval_secs() -> u64 {
    4
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size_mb: default_chunk_size_mb(),
            max_concurrent_sessions: default_max_concurrent(),
            workers_per_session: default_workers(),
            save_path: PathBuf::new(),
            ack_timeout_ms: default_ack_timeout_ms(),
            max_chunk_attempts: default_max_chunk_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            admission_window_ms: default_admission_window_ms(),
            absence_threshold_secs: default_absence_threshold_secs(),
            eviction_threshold_secs: default_eviction_threshold_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        field: &'static str,
        min: u64,
        max: u64,
        value: u64,
    },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range(
            "chunk_size_mb",
            u64::from(self.chunk_size_mb),
            CHUNK_SIZE_MB_RANGE.0.into(),
            CHUNK_SIZE_MB_RANGE.1.into(),
        )?;
        check_range(
            "max_concurrent_sessions",
            self.max_concurrent_sessions as u64,
            MAX_CONCURRENT_RANGE.0 as u64,
            MAX_CONCURRENT_RANGE.1 as u64,
        )?;
        check_range(
            "workers_per_session",
            self.workers_per_session as u64,
            WORKERS_RANGE.0 as u64,
            WORKERS_RANGE.1 as u64,
        )?;
        if self.max_chunk_attempts == 0 {
            return Err(ConfigError::Zero("max_chunk_attempts"));
        }
        if self.ack_timeout_ms == 0 {
            return Err(ConfigError::Zero("ack_timeout_ms"));
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::Zero("sweep_interval_secs"));
        }
        Ok(())
    }

    pub fn chunk_size_bytes(&self) -> u32 {
        self.chunk_size_mb * 1024 * 1024
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn admission_window(&self) -> Duration {
        Duration::from_millis(self.admission_window_ms)
    }

    pub fn absence_threshold(&self) -> Duration {
        Duration::from_secs(self.absence_threshold_secs)
    }

    pub fn eviction_threshold(&self) -> Duration {
        Duration::from_secs(self.eviction_threshold_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn check_range(field: &'static str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::OutOfRange {
            field,
            min,
            max,
            value,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let c = EngineConfig::default();
        c.validate().unwrap();
        assert_eq!(c.chunk_size_bytes(), 1024 * 1024);
        assert_eq!(c.max_chunk_attempts, 3);
    }

    #[test]
    fn chunk_size_out_of_range() {
        let c = EngineConfig {
            chunk_size_mb: 33,
            ..EngineConfig::default()
        };
        assert!(matches!(
            c.validate(),
            Err(ConfigError::OutOfRange {
                field: "chunk_size_mb",
                ..
            })
        ));
    }

    #[test]
    fn max_concurrent_out_of_range() {
        let c = EngineConfig {
            max_concurrent_sessions: 0,
            ..EngineConfig::default()
        };
        assert!(c.validate().is_err());
        let c = EngineConfig {
            max_concurrent_sessions: 11,
            ..EngineConfig::default()
        };
        assert!(c.validate().is_err());
    }

    #[test]
    fn zero_attempts_rejected() {
        let c = EngineConfig {
            max_chunk_attempts: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(
            c.validate(),
            Err(ConfigError::Zero("max_chunk_attempts"))
        ));
    }
}
