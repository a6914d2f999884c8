//! Config file discovery, table merging, and environment variable overlay.

use crate::{ConfigError, MurmurConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local). Only existing files.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/murmur/config.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("murmur/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("murmur.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Read a TOML file into a raw table.
pub fn read_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    contents
        .parse::<toml::Table>()
        .map_err(|e: toml::de::Error| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// Load a single config file (no discovery, no env overlay).
pub fn load_from_file(path: &Path) -> Result<MurmurConfig, ConfigError> {
    let table = read_table(path)?;
    from_table(table, Some(path))
}

/// Merge `overlay` into `base`. Nested tables merge key by key; any other
/// value in `overlay` replaces the one in `base`.
pub fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Deserialize a merged table. Missing keys fall back to compiled defaults.
pub fn from_table(table: toml::Table, origin: Option<&Path>) -> Result<MurmurConfig, ConfigError> {
    toml::Value::Table(table)
        .try_into()
        .map_err(|e: toml::de::Error| ConfigError::Parse {
            path: origin
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("<merged>")),
            message: e.to_string(),
        })
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut MurmurConfig, sources: &mut ConfigSources) {
    if let Ok(v) = env::var("MURMUR_LOG_LEVEL") {
        config.telemetry.log_level = v;
        sources.env_overrides.push("MURMUR_LOG_LEVEL".to_string());
    }
    if let Ok(v) = env::var("RUST_LOG") {
        config.telemetry.log_level = v;
        sources.env_overrides.push("RUST_LOG".to_string());
    }

    if let Ok(v) = env::var("MURMUR_QUEUE_CAPACITY") {
        if let Ok(n) = v.parse() {
            config.realtime.queue_capacity = n;
            sources.env_overrides.push("MURMUR_QUEUE_CAPACITY".to_string());
        }
    }
    if let Ok(v) = env::var("MURMUR_POLL_INTERVAL_MS") {
        if let Ok(n) = v.parse() {
            config.realtime.poll_interval_ms = n;
            sources.env_overrides.push("MURMUR_POLL_INTERVAL_MS".to_string());
        }
    }

    if let Ok(v) = env::var("MURMUR_SHM_SHARED") {
        if let Some(shared) = parse_bool(&v) {
            config.shm.shared = shared;
            sources.env_overrides.push("MURMUR_SHM_SHARED".to_string());
        }
    }
    if let Ok(v) = env::var("MURMUR_SHM_POOL_SIZE") {
        if let Ok(n) = v.parse() {
            config.shm.pool_size = n;
            sources.env_overrides.push("MURMUR_SHM_POOL_SIZE".to_string());
        }
    }

    if let Ok(v) = env::var("MURMUR_SAMPLE_RATE") {
        if let Ok(n) = v.parse() {
            config.source.sample_rate = n;
            sources.env_overrides.push("MURMUR_SAMPLE_RATE".to_string());
        }
    }
    if let Ok(v) = env::var("MURMUR_CHANNELS") {
        if let Ok(n) = v.parse() {
            config.source.channels = n;
            sources.env_overrides.push("MURMUR_CHANNELS".to_string());
        }
    }
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let file = write_config(
            r#"
[realtime]
queue_capacity = 32

[source]
channels = 1
"#,
        );

        let config = load_from_file(file.path()).unwrap();
        assert_eq!(config.realtime.queue_capacity, 32);
        assert_eq!(config.realtime.poll_interval_ms, 10);
        assert_eq!(config.source.channels, 1);
        assert_eq!(config.source.sample_rate, 44100);
    }

    #[test]
    fn test_merge_later_wins_per_key() {
        let mut base: toml::Table = r#"
[shm]
shared = true
pool_size = 4096
"#
        .parse()
        .unwrap();
        let overlay: toml::Table = r#"
[shm]
shared = false
"#
        .parse()
        .unwrap();

        merge_tables(&mut base, overlay);
        let config = from_table(base, None).unwrap();
        assert!(!config.shm.shared);
        assert_eq!(config.shm.pool_size, 4096);
    }

    #[test]
    fn test_parse_error_names_file() {
        let file = write_config("[realtime\nqueue_capacity = ");
        let err = load_from_file(file.path()).unwrap_err();
        match err {
            ConfigError::Parse { path, .. } => assert_eq!(path, file.path()),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_wrong_type_is_parse_error() {
        let file = write_config("[realtime]\nqueue_capacity = \"lots\"\n");
        assert!(matches!(
            load_from_file(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        env::set_var("MURMUR_QUEUE_CAPACITY", "512");
        env::set_var("MURMUR_SHM_SHARED", "off");
        env::set_var("MURMUR_CHANNELS", "not-a-number");

        let mut config = MurmurConfig::default();
        let mut sources = ConfigSources::default();
        apply_env_overrides(&mut config, &mut sources);

        env::remove_var("MURMUR_QUEUE_CAPACITY");
        env::remove_var("MURMUR_SHM_SHARED");
        env::remove_var("MURMUR_CHANNELS");

        assert_eq!(config.realtime.queue_capacity, 512);
        assert!(!config.shm.shared);
        assert_eq!(config.source.channels, 2);
        assert!(sources
            .env_overrides
            .contains(&"MURMUR_QUEUE_CAPACITY".to_string()));
        assert!(!sources.env_overrides.contains(&"MURMUR_CHANNELS".to_string()));
    }

    #[test]
    #[serial]
    fn test_cli_path_replaces_local_override() {
        let file = write_config("[telemetry]\nlog_level = \"debug\"\n");
        let files = discover_config_files_with_override(Some(file.path()));
        assert_eq!(files.last().map(PathBuf::as_path), Some(file.path()));
    }
}
