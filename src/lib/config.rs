//! # Stream Configuration
//!
//! Tunables for one connection to the remote renderer. Values can come from
//! code, from a JSON document, or from the environment:
//!
//! - `VNSTREAM_CONFIG`: path to a JSON file holding a (partial) `StreamConfig`
//! - `VN_DEBUG`: comma separated debug flags (`init`, `result`, `all`)

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Environment variable naming an optional JSON config file.
pub const CONFIG_ENV: &str = "VNSTREAM_CONFIG";
/// Environment variable holding debug flags.
pub const DEBUG_ENV: &str = "VN_DEBUG";

/// How a thread waits on a counter published by the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum WaitPolicy {
    /// Busy-poll with a CPU spin hint. Lowest latency, burns a core.
    Spin,
    /// Yield a few times, then sleep with exponentially growing intervals.
    #[default]
    Relax,
}

/// Diagnostics toggles, normally taken from `VN_DEBUG`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DebugFlags {
    /// Log connection bring-up details at info level.
    pub init: bool,
    /// Log every error result handed back to API callers.
    pub result: bool,
}

impl DebugFlags {
    /// Parse a comma separated flag list. Unknown flags are ignored.
    pub fn parse(s: &str) -> Self {
        let mut flags = DebugFlags::default();
        for flag in s.split(',').map(str::trim) {
            match flag {
                "init" => flags.init = true,
                "result" => flags.result = true,
                "all" => {
                    flags.init = true;
                    flags.result = true;
                }
                "" => {}
                other => tracing::debug!("ignoring unknown debug flag {:?}", other),
            }
        }
        flags
    }
}

/// Per-connection tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Size of the ring's circular buffer in bytes (power of two).
    pub ring_buffer_size: u32,
    /// How long the remote may poll an empty ring before going idle.
    #[serde(with = "duration_ms")]
    pub ring_idle_timeout: Duration,
    /// Largest command that is copied inline into the ring.
    pub direct_threshold: usize,
    /// Minimum size of a shared buffer used for indirect uploads.
    pub upload_min_size: usize,
    /// Minimum size of the reply buffer.
    pub reply_min_size: usize,
    pub wait_policy: WaitPolicy,
    pub debug: DebugFlags,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            ring_buffer_size: 64 * 1024,
            ring_idle_timeout: Duration::from_millis(50),
            direct_threshold: 256,
            upload_min_size: 1024 * 1024,
            reply_min_size: 1024 * 1024,
            wait_policy: WaitPolicy::Relax,
            debug: DebugFlags::default(),
        }
    }
}

impl StreamConfig {
    /// Parse a JSON document. Missing fields keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: StreamConfig = serde_json::from_str(json)
            .map_err(|e| Error::InitializationFailed(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::InitializationFailed(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&text)
    }

    /// Defaults, overridden by `VNSTREAM_CONFIG` and then by `VN_DEBUG`.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        if let Ok(flags) = std::env::var(DEBUG_ENV) {
            config.debug = DebugFlags::parse(&flags);
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.ring_buffer_size.is_power_of_two() || self.ring_buffer_size < 4096 {
            return Err(Error::InitializationFailed(format!(
                "ring buffer size {} must be a power of two >= 4096",
                self.ring_buffer_size
            )));
        }
        if self.direct_threshold == 0 || self.direct_threshold > self.ring_buffer_size as usize {
            return Err(Error::InitializationFailed(format!(
                "direct threshold {} out of range",
                self.direct_threshold
            )));
        }
        if self.upload_min_size == 0 || self.reply_min_size == 0 {
            return Err(Error::InitializationFailed(
                "buffer minimum sizes must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = StreamConfig::default();
        config.validate().unwrap();
        assert_eq!(config.ring_buffer_size, 64 * 1024);
        assert_eq!(config.direct_threshold, 256);
    }

    #[test]
    fn test_partial_json() {
        let config =
            StreamConfig::from_json_str(r#"{"ring_buffer_size": 8192, "wait_policy": "spin"}"#)
                .unwrap();
        assert_eq!(config.ring_buffer_size, 8192);
        assert_eq!(config.wait_policy, WaitPolicy::Spin);
        assert_eq!(config.reply_min_size, 1024 * 1024);
    }

    #[test]
    fn test_idle_timeout_in_ms() {
        let config = StreamConfig::from_json_str(r#"{"ring_idle_timeout": 5}"#).unwrap();
        assert_eq!(config.ring_idle_timeout, Duration::from_millis(5));
    }

    #[test]
    fn test_rejects_bad_ring_size() {
        assert!(StreamConfig::from_json_str(r#"{"ring_buffer_size": 5000}"#).is_err());
        assert!(StreamConfig::from_json_str(r#"{"ring_buffer_size": 1024}"#).is_err());
    }

    #[test]
    fn test_debug_flags() {
        assert_eq!(
            DebugFlags::parse("init"),
            DebugFlags {
                init: true,
                result: false
            }
        );
        assert_eq!(
            DebugFlags::parse("all"),
            DebugFlags {
                init: true,
                result: true
            }
        );
        assert_eq!(
            DebugFlags::parse("bogus, result"),
            DebugFlags {
                init: false,
                result: true
            }
        );
    }
}
