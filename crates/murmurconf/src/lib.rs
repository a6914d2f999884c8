//! Minimal configuration loading for murmur.
//!
//! Kept dependency-light so the daemon, tests and small tools can all import
//! it without dragging in the realtime stack.
//!
//! # Sections
//!
//! - **Infrastructure** (`[telemetry]`, `[realtime]`, `[shm]`): fixed for the
//!   lifetime of the process - log filter, message queue sizing, shared memory
//!   policy.
//! - **Source defaults** (`[source]`): the sample spec and name used when a
//!   capture source is created without explicit parameters.
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/murmur/config.toml` (system)
//! 2. `~/.config/murmur/config.toml` (user)
//! 3. `./murmur.toml` (local override, replaced by `--config` when given)
//! 4. Environment variables (`MURMUR_*`)
//!
//! # Example Config
//!
//! ```toml
//! [telemetry]
//! log_level = "murmur=debug,info"
//!
//! [realtime]
//! queue_capacity = 256
//! poll_interval_ms = 5
//!
//! [shm]
//! shared = true
//! pool_size = 1048576
//!
//! [source]
//! name = "mic"
//! sample_rate = 48000
//! channels = 2
//! format = "s16le"
//! ```

pub mod defaults;
pub mod infra;
pub mod loader;

pub use defaults::SourceDefaults;
pub use infra::{RealtimeConfig, ShmConfig, TelemetryConfig};
pub use loader::{discover_config_files_with_override, ConfigSources};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Complete murmur configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MurmurConfig {
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    #[serde(default)]
    pub realtime: RealtimeConfig,

    #[serde(default)]
    pub shm: ShmConfig,

    #[serde(default)]
    pub source: SourceDefaults,
}

impl MurmurConfig {
    /// Load configuration from all standard sources.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration, letting `config_path` replace the local
    /// `./murmur.toml` override. System and user files still load first.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration and report which files and env vars contributed.
    pub fn load_with_sources_from(
        config_path: Option<&Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut merged = toml::Table::new();

        for path in loader::discover_config_files_with_override(config_path) {
            let table = loader::read_table(&path)?;
            loader::merge_tables(&mut merged, table);
            sources.files.push(path);
        }

        let mut config = loader::from_table(merged, sources.files.last().map(PathBuf::as_path))?;
        loader::apply_env_overrides(&mut config, &mut sources);

        Ok((config, sources))
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> String {
        let mut output = String::new();

        output.push_str("# murmur configuration\n\n");

        output.push_str("[telemetry]\n");
        output.push_str(&format!("log_level = \"{}\"\n", self.telemetry.log_level));

        output.push_str("\n[realtime]\n");
        output.push_str(&format!("queue_capacity = {}\n", self.realtime.queue_capacity));
        output.push_str(&format!("poll_interval_ms = {}\n", self.realtime.poll_interval_ms));
        output.push_str(&format!("thread_name = \"{}\"\n", self.realtime.thread_name));

        output.push_str("\n[shm]\n");
        output.push_str(&format!("shared = {}\n", self.shm.shared));
        output.push_str(&format!("pool_size = {}\n", self.shm.pool_size));
        output.push_str(&format!("mode = {}\n", self.shm.mode));

        output.push_str("\n[source]\n");
        output.push_str(&format!("name = \"{}\"\n", self.source.name));
        output.push_str(&format!("sample_rate = {}\n", self.source.sample_rate));
        output.push_str(&format!("channels = {}\n", self.source.channels));
        output.push_str(&format!("format = \"{}\"\n", self.source.format));

        output
    }
}
