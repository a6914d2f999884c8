//! Infrastructure configuration - things that cannot change at runtime.

use serde::{Deserialize, Serialize};

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// `tracing-subscriber` env-filter directive (e.g. "info", "murmur=debug").
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}

/// Realtime thread and message queue settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// Slots in each source's control -> realtime message ring.
    /// Default: 128
    #[serde(default = "RealtimeConfig::default_queue_capacity")]
    pub queue_capacity: usize,

    /// Upper bound on how long the realtime loop parks between cycles.
    /// Default: 10
    #[serde(default = "RealtimeConfig::default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// OS thread name for the realtime loop.
    /// Default: murmur-rt
    #[serde(default = "RealtimeConfig::default_thread_name")]
    pub thread_name: String,
}

impl RealtimeConfig {
    fn default_queue_capacity() -> usize {
        128
    }

    fn default_poll_interval_ms() -> u64 {
        10
    }

    fn default_thread_name() -> String {
        "murmur-rt".to_string()
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            queue_capacity: Self::default_queue_capacity(),
            poll_interval_ms: Self::default_poll_interval_ms(),
            thread_name: Self::default_thread_name(),
        }
    }
}

/// Shared memory pool policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShmConfig {
    /// Create named (cross-process) segments instead of private ones.
    /// Default: true
    #[serde(default = "ShmConfig::default_shared")]
    pub shared: bool,

    /// Size in bytes of the pool segment backing recorded audio.
    /// Default: 1 MiB
    #[serde(default = "ShmConfig::default_pool_size")]
    pub pool_size: usize,

    /// Permission bits requested for named segments. Only owner bits survive.
    /// Default: 0o600
    #[serde(default = "ShmConfig::default_mode")]
    pub mode: u32,
}

impl ShmConfig {
    fn default_shared() -> bool {
        true
    }

    fn default_pool_size() -> usize {
        1024 * 1024
    }

    fn default_mode() -> u32 {
        0o600
    }
}

impl Default for ShmConfig {
    fn default() -> Self {
        Self {
            shared: Self::default_shared(),
            pool_size: Self::default_pool_size(),
            mode: Self::default_mode(),
        }
    }
}
