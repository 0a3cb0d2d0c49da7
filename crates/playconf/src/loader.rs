//! Config file discovery, loading, and environment variable overlay.

use crate::{ConfigError, PlaydConfig};
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

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
/// Returns paths in load order (system, user, local/cli).
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/playd/config.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("playd/config.toml");
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

    let local = PathBuf::from("playd.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Read one config file as a raw TOML table.
pub fn read_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    contents.parse().map_err(|e: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Merge `overlay` into `base` key by key. Nested tables merge recursively,
/// everything else is replaced.
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

/// Build a config from a merged table; absent keys take their defaults.
pub fn from_table(table: toml::Table, origin: &Path) -> Result<PlaydConfig, ConfigError> {
    let mut config: PlaydConfig =
        toml::Value::Table(table)
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::Parse {
                path: origin.to_path_buf(),
                message: e.to_string(),
            })?;

    config.audio.wav_path = expand_path(&config.audio.wav_path.to_string_lossy());
    config.audio.dot_dir = config
        .audio
        .dot_dir
        .take()
        .map(|dir| expand_path(&dir.to_string_lossy()));

    Ok(config)
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut PlaydConfig, sources: &mut ConfigSources) {
    apply_overrides_from(config, sources, |key| env::var(key).ok());
}

/// Apply overrides from any variable lookup. Unparseable values are skipped.
pub fn apply_overrides_from<F>(config: &mut PlaydConfig, sources: &mut ConfigSources, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(port) = lookup("PLAYD_PORT").and_then(|v| v.parse().ok()) {
        config.bind.base_port = port;
        sources.env_overrides.push("PLAYD_PORT".to_string());
    }
    if let Some(v) = lookup("PLAYD_HOST") {
        config.bind.connect_host = v;
        sources.env_overrides.push("PLAYD_HOST".to_string());
    }

    if let Some(ms) = lookup("PLAYD_TICK_MS").and_then(|v| v.parse().ok()) {
        config.daemon.tick_ms = ms;
        sources.env_overrides.push("PLAYD_TICK_MS".to_string());
    }
    if let Some(ms) = lookup("PLAYD_TAGS_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
        config.daemon.tags_timeout_ms = ms;
        sources.env_overrides.push("PLAYD_TAGS_TIMEOUT_MS".to_string());
    }

    if let Some(kind) = lookup("PLAYD_BACKEND").and_then(|v| v.parse().ok()) {
        config.audio.backend = kind;
        sources.env_overrides.push("PLAYD_BACKEND".to_string());
    }
    if let Some(kind) = lookup("PLAYD_SINK").and_then(|v| v.parse().ok()) {
        config.audio.sink = kind;
        sources.env_overrides.push("PLAYD_SINK".to_string());
    }

    if let Some(v) = lookup("PLAYD_LOG_LEVEL") {
        config.telemetry.log_level = v;
        sources.env_overrides.push("PLAYD_LOG_LEVEL".to_string());
    }
    // RUST_LOG wins over PLAYD_LOG_LEVEL
    if let Some(v) = lookup("RUST_LOG") {
        config.telemetry.log_level = v;
        sources.env_overrides.push("RUST_LOG".to_string());
    }
}

/// Expand ~ and environment variables in a path.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        match directories::BaseDirs::new() {
            Some(dirs) => dirs.home_dir().join(stripped),
            None => PathBuf::from(path),
        }
    } else if let Some(stripped) = path.strip_prefix('$') {
        let (var_name, rest) = match stripped.find('/') {
            Some(pos) => (&stripped[..pos], Some(&stripped[pos + 1..])),
            None => (stripped, None),
        };
        match (env::var(var_name), rest) {
            (Ok(value), Some(rest)) => PathBuf::from(value).join(rest),
            (Ok(value), None) => PathBuf::from(value),
            (Err(_), _) => PathBuf::from(path),
        }
    } else {
        PathBuf::from(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BackendKind, SinkKind};
    use std::collections::HashMap;
    use std::io::Write;

    fn table(s: &str) -> toml::Table {
        s.parse().unwrap()
    }

    #[test]
    fn test_expand_path_tilde() {
        let expanded = expand_path("~/music/mix.wav");
        assert!(!expanded.to_string_lossy().starts_with('~'));
        assert!(expanded.to_string_lossy().ends_with("music/mix.wav"));
    }

    #[test]
    fn test_expand_path_unknown_var_is_literal() {
        let expanded = expand_path("$PLAYD_SURELY_UNSET_VAR/x");
        assert_eq!(expanded, PathBuf::from("$PLAYD_SURELY_UNSET_VAR/x"));
    }

    #[test]
    fn test_merge_is_per_key() {
        let mut base = table("[bind]\nbase_port = 9000\nhost = \"0.0.0.0\"\n");
        merge_tables(&mut base, table("[bind]\nbase_port = 9100\n[daemon]\ntick_ms = 10\n"));

        let config = from_table(base, Path::new("merged")).unwrap();
        assert_eq!(config.bind.base_port, 9100);
        assert_eq!(config.bind.host, "0.0.0.0");
        assert_eq!(config.daemon.tick_ms, 10);
    }

    #[test]
    fn test_cli_path_replaces_local_and_loads() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[audio]\nbackend = \"memory\"\nsink = \"wav\"").unwrap();

        let files = discover_config_files_with_override(Some(file.path()));
        assert_eq!(files.last().map(PathBuf::as_path), Some(file.path()));

        let config = from_table(read_table(file.path()).unwrap(), file.path()).unwrap();
        assert_eq!(config.audio.backend, BackendKind::Memory);
        assert_eq!(config.audio.sink, SinkKind::Wav);
    }

    #[test]
    fn test_unreadable_file_is_read_error() {
        let err = read_table(Path::new("/nonexistent/playd.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileRead { .. }));
    }

    #[test]
    fn test_zero_tick_from_env_fails_validation() {
        let mut config = PlaydConfig::default();
        let mut sources = ConfigSources::default();
        apply_overrides_from(&mut config, &mut sources, |k| {
            (k == "PLAYD_TICK_MS").then(|| "0".to_string())
        });

        assert_eq!(config.daemon.tick_ms, 0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                key: "daemon.tick_ms",
                ..
            })
        ));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("PLAYD_PORT", "9000"),
            ("PLAYD_TICK_MS", "not-a-number"),
            ("PLAYD_BACKEND", "memory"),
            ("PLAYD_LOG_LEVEL", "warn"),
            ("RUST_LOG", "playd=trace"),
        ]
        .into_iter()
        .collect();

        let mut config = PlaydConfig::default();
        let mut sources = ConfigSources::default();
        apply_overrides_from(&mut config, &mut sources, |k| {
            vars.get(k).map(|v| v.to_string())
        });

        assert_eq!(config.bind.base_port, 9000);
        assert_eq!(config.daemon.tick_ms, 250);
        assert_eq!(config.audio.backend, BackendKind::Memory);
        assert_eq!(config.telemetry.log_level, "playd=trace");
        assert_eq!(
            sources.env_overrides,
            vec!["PLAYD_PORT", "PLAYD_BACKEND", "PLAYD_LOG_LEVEL", "RUST_LOG"]
        );
    }
}
