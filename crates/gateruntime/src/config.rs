use gatecore::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for the broker and its partitions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub partition_count: u32,
    /// Client requests queued per partition.
    pub request_channel_capacity: usize,
    /// Subscription commands queued per partition before senders see `false`.
    pub transport_channel_capacity: usize,
    pub record_buffer_size: usize,
    /// How often timers, message deadlines and pending subscription
    /// commands are checked.
    pub sweep_interval_ms: u64,
    /// Time after which an unacknowledged subscription command is sent again.
    pub subscription_resend_timeout_ms: u64,
    /// Directory for file-backed partition logs; in-memory logs when unset.
    pub data_dir: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            partition_count: 3,
            request_channel_capacity: 256,
            transport_channel_capacity: 1024,
            record_buffer_size: 4096,
            sweep_interval_ms: 100,
            subscription_resend_timeout_ms: 10_000,
            data_dir: None,
        }
    }
}

impl RuntimeConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    pub fn with_partition_count(mut self, partition_count: u32) -> Self {
        self.partition_count = partition_count.max(1);
        self
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(data_dir.into());
        self
    }

    pub fn with_sweep_interval_ms(mut self, sweep_interval_ms: u64) -> Self {
        self.sweep_interval_ms = sweep_interval_ms;
        self
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config: RuntimeConfig =
            serde_json::from_str(r#"{ "partition_count": 5, "sweep_interval_ms": 20 }"#).unwrap();

        assert_eq!(config.partition_count, 5);
        assert_eq!(config.sweep_interval(), Duration::from_millis(20));
        assert_eq!(config.subscription_resend_timeout_ms, 10_000);
        assert!(config.data_dir.is_none());
    }
}
