//! Minimal configuration loading for playd.
//!
//! Every playd crate imports this, so it stays light: serde, toml and
//! directories, nothing async.
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/playd/config.toml` (system)
//! 2. `~/.config/playd/config.toml` (user)
//! 3. `./playd.toml` (local override), or the `--config` path
//! 4. Environment variables (`PLAYD_*`, `RUST_LOG`)
//!
//! # Example Config
//!
//! ```toml
//! [bind]
//! base_port = 8000
//! publish_host = "127.0.0.1"
//!
//! [daemon]
//! tick_ms = 250
//! tags_timeout_ms = 10000
//!
//! [audio]
//! backend = "native"
//! sink = "wav"
//! wav_path = "~/playd-mix.wav"
//!
//! [telemetry]
//! log_level = "info"
//! ```

pub mod audio;
pub mod infra;
pub mod loader;

pub use audio::{AudioConfig, BackendKind, SinkKind};
pub use infra::{
    BindConfig, DaemonConfig, TelemetryConfig, PUBLISH_PORT_OFFSET, REPLY_PORT_OFFSET,
};
pub use loader::{discover_config_files_with_override, expand_path, ConfigSources};

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

    #[error("Invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

/// Complete playd configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PlaydConfig {
    #[serde(default)]
    pub bind: BindConfig,

    #[serde(default)]
    pub daemon: DaemonConfig,

    #[serde(default)]
    pub audio: AudioConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl PlaydConfig {
    /// Load configuration from all sources.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration with an explicit file taking the place of `./playd.toml`.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration from optional path and return information about sources.
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

        let origin = sources
            .files
            .last()
            .cloned()
            .unwrap_or_else(|| PathBuf::from("<defaults>"));
        let mut config = loader::from_table(merged, &origin)?;

        loader::apply_env_overrides(&mut config, &mut sources);
        config.validate()?;

        Ok((config, sources))
    }

    /// Parse a single TOML document on top of the compiled defaults.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let origin = Path::new("<string>");
        let table: toml::Table = contents.parse().map_err(|e: toml::de::Error| ConfigError::Parse {
            path: origin.to_path_buf(),
            message: e.to_string(),
        })?;
        let config = loader::from_table(table, origin)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that parse but cannot run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.daemon.tick_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "daemon.tick_ms",
                message: "must be at least 1".to_string(),
            });
        }
        if self.audio.sample_rate == 0 {
            return Err(ConfigError::Invalid {
                key: "audio.sample_rate",
                message: "must be at least 1".to_string(),
            });
        }
        if self.audio.channels == 0 {
            return Err(ConfigError::Invalid {
                key: "audio.channels",
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> String {
        let mut output = String::new();

        output.push_str("# playd configuration\n\n");

        output.push_str("[bind]\n");
        output.push_str(&format!("base_port = {}\n", self.bind.base_port));
        output.push_str(&format!("host = \"{}\"\n", self.bind.host));
        output.push_str(&format!("publish_host = \"{}\"\n", self.bind.publish_host));
        output.push_str(&format!("connect_host = \"{}\"\n", self.bind.connect_host));
        output.push_str(&format!("reply_linger_ms = {}\n", self.bind.reply_linger_ms));
        output.push_str(&format!(
            "publish_linger_ms = {}\n",
            self.bind.publish_linger_ms
        ));

        output.push_str("\n[daemon]\n");
        output.push_str(&format!("tick_ms = {}\n", self.daemon.tick_ms));
        output.push_str(&format!(
            "tags_timeout_ms = {}\n",
            self.daemon.tags_timeout_ms
        ));
        output.push_str(&format!(
            "client_timeout_ms = {}\n",
            self.daemon.client_timeout_ms
        ));

        output.push_str("\n[audio]\n");
        output.push_str(&format!("backend = \"{}\"\n", self.audio.backend));
        output.push_str(&format!("sink = \"{}\"\n", self.audio.sink));
        output.push_str(&format!("sample_rate = {}\n", self.audio.sample_rate));
        output.push_str(&format!("channels = {}\n", self.audio.channels));
        output.push_str(&format!(
            "wav_path = \"{}\"\n",
            self.audio.wav_path.display()
        ));
        match &self.audio.dot_dir {
            Some(dir) => output.push_str(&format!("dot_dir = \"{}\"\n", dir.display())),
            None => output.push_str("# dot_dir = \"/tmp/playd\"\n"),
        }

        output.push_str("\n[telemetry]\n");
        output.push_str(&format!(
            "log_level = \"{}\"\n",
            self.telemetry.log_level
        ));

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PlaydConfig::default();
        assert_eq!(config.bind.base_port, 8000);
        assert_eq!(config.daemon.tick_ms, 250);
        assert_eq!(config.audio.sample_rate, 48_000);
        assert_eq!(config.audio.backend, BackendKind::Native);
        assert_eq!(config.telemetry.log_level, "info");
    }

    #[test]
    fn test_to_toml_parses_back() {
        let mut config = PlaydConfig::default();
        config.bind.base_port = 9100;
        config.audio.sink = SinkKind::Wav;
        config.audio.dot_dir = Some(PathBuf::from("/tmp/graphs"));

        let parsed = PlaydConfig::from_toml_str(&config.to_toml()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_sections_keep_defaults() {
        let config = PlaydConfig::from_toml_str("[daemon]\ntick_ms = 50\n").unwrap();
        assert_eq!(config.daemon.tick_ms, 50);
        assert_eq!(config.daemon.tags_timeout_ms, 10_000);
        assert_eq!(config.bind, BindConfig::default());
    }

    #[test]
    fn test_zero_tick_or_rate_is_rejected() {
        let err = PlaydConfig::from_toml_str("[daemon]\ntick_ms = 0\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "daemon.tick_ms",
                ..
            }
        ));

        let err = PlaydConfig::from_toml_str("[audio]\nsample_rate = 0\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "audio.sample_rate",
                ..
            }
        ));

        let err = PlaydConfig::from_toml_str("[audio]\nchannels = 0\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "audio.channels",
                ..
            }
        ));
    }

    #[test]
    fn test_bad_value_is_parse_error() {
        let err = PlaydConfig::from_toml_str("[audio]\nsink = \"alsa\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
