//! Audio backend and output selection.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Which media backend drives the mixing graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Decode with symphonia, mix in-process, render to `sink`.
    #[default]
    Native,
    /// Records the graph without touching audio; for dry runs.
    Memory,
}

/// Where the native backend renders the mix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    /// Paced at real time, output discarded.
    #[default]
    Null,
    /// Mix written to `wav_path`.
    Wav,
    /// PipeWire playback stream (needs the `pipewire` feature of playd).
    Pipewire,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "native" => Ok(Self::Native),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown backend: {}", other)),
        }
    }
}

impl FromStr for SinkKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "null" => Ok(Self::Null),
            "wav" => Ok(Self::Wav),
            "pipewire" => Ok(Self::Pipewire),
            other => Err(format!("unknown sink: {}", other)),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native => write!(f, "native"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Wav => write!(f, "wav"),
            Self::Pipewire => write!(f, "pipewire"),
        }
    }
}

/// Mixing graph configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioConfig {
    #[serde(default)]
    pub backend: BackendKind,

    #[serde(default)]
    pub sink: SinkKind,

    /// Output sample rate; every source is converted to it.
    /// Default: 48000
    #[serde(default = "AudioConfig::default_sample_rate")]
    pub sample_rate: u32,

    /// Output channel count.
    /// Default: 2
    #[serde(default = "AudioConfig::default_channels")]
    pub channels: u16,

    /// File written by the `wav` sink.
    /// Default: playd-mix.wav
    #[serde(default = "AudioConfig::default_wav_path")]
    pub wav_path: PathBuf,

    /// Directory for relative `DUMPGRAPH` paths.
    /// Default: $PLAYD_DOT_DIR when set
    #[serde(default = "AudioConfig::default_dot_dir")]
    pub dot_dir: Option<PathBuf>,
}

impl AudioConfig {
    fn default_sample_rate() -> u32 {
        48_000
    }

    fn default_channels() -> u16 {
        2
    }

    fn default_wav_path() -> PathBuf {
        PathBuf::from("playd-mix.wav")
    }

    fn default_dot_dir() -> Option<PathBuf> {
        std::env::var_os("PLAYD_DOT_DIR").map(PathBuf::from)
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            sink: SinkKind::default(),
            sample_rate: Self::default_sample_rate(),
            channels: Self::default_channels(),
            wav_path: Self::default_wav_path(),
            dot_dir: Self::default_dot_dir(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parsing_is_case_insensitive() {
        assert_eq!("Memory".parse::<BackendKind>(), Ok(BackendKind::Memory));
        assert_eq!("WAV".parse::<SinkKind>(), Ok(SinkKind::Wav));
        assert!("alsa".parse::<SinkKind>().is_err());
    }

    #[test]
    fn test_kind_display_roundtrips() {
        for sink in [SinkKind::Null, SinkKind::Wav, SinkKind::Pipewire] {
            assert_eq!(sink.to_string().parse::<SinkKind>(), Ok(sink));
        }
    }
}
