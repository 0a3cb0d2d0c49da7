//! Media backend contract.
//!
//! The playback session drives a pipeline engine through [`MediaBackend`]:
//! it creates decode and convert stages, wires them into a shared mixer, and
//! moves stages or the whole graph between states. The engine reports back
//! asynchronously with [`BackendEvent`]s on the channel it was built with.
//!
//! Two implementations:
//! - [`native::NativeBackend`] decodes with symphonia and mixes in-process
//! - [`memory::MemoryBackend`] records the graph only, for tests and dry runs

pub mod memory;
pub mod native;

use std::fmt;
use std::path::Path;
use std::time::Duration;

use playconf::{AudioConfig, BackendKind};
use playproto::TagList;
use thiserror::Error;
use tokio::sync::mpsc;

pub use memory::MemoryBackend;
pub use native::NativeBackend;

/// Identifies one stage in the graph. Never reused by a backend instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageId(pub u64);

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage{}", self.0)
    }
}

/// A numbered mixer input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub u32);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sink_{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Decoder,
    Converter,
    Mixer,
    Sink,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decoder => write!(f, "decoder"),
            Self::Converter => write!(f, "converter"),
            Self::Mixer => write!(f, "mixer"),
            Self::Sink => write!(f, "sink"),
        }
    }
}

/// Run state of a stage or of the whole graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StageState {
    Null,
    Paused,
    Playing,
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Paused => write!(f, "paused"),
            Self::Playing => write!(f, "playing"),
        }
    }
}

/// Severity of a backend status message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageLevel {
    Error,
    Warning,
    Info,
}

impl MessageLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warning => "WARNING",
            Self::Info => "INFO",
        }
    }
}

impl fmt::Display for MessageLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Asynchronous notification from the live graph.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    /// A decoder knows its output format and can be linked downstream.
    PadAdded { stage: StageId },
    /// Status message for listeners.
    Message { level: MessageLevel, text: String },
}

pub type EventSender = mpsc::UnboundedSender<BackendEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<BackendEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// One message from a metadata probe.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeMessage {
    Tags(TagList),
    Error(String),
    /// The probe decoded enough to know the stream; no more tags will come.
    PrerollDone,
}

/// A throwaway decode-only pipeline. Dropping it tears it down.
pub trait Probe: Send {
    /// Wait up to `timeout` (forever when `None`) for the next message.
    /// `None` means the wait timed out or the probe has nothing more to say.
    fn next_message(&mut self, timeout: Option<Duration>) -> Option<ProbeMessage>;
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("unsupported uri: {0}")]
    UnsupportedUri(String),

    #[error("cannot open {uri}: {reason}")]
    Open { uri: String, reason: String },

    #[error("no such stage: {0}")]
    UnknownStage(StageId),

    #[error("cannot link {from} to {to}: {reason}")]
    Link {
        from: String,
        to: String,
        reason: String,
    },

    #[error("{0} is not linked")]
    NotLinked(String),

    #[error("no such mixer slot: {0}")]
    UnknownSlot(SlotId),

    #[error("state change to {state} refused: {reason}")]
    StateChange { state: StageState, reason: String },

    #[error("output sink failed: {0}")]
    Sink(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// The pipeline engine behind a playback session.
///
/// Stages are created unlinked and in the `Null` state. A decoder announces
/// its output with [`BackendEvent::PadAdded`] some time after it is started;
/// only then can it be linked to a converter.
pub trait MediaBackend: Send {
    fn make_decoder(&mut self, uri: &str) -> Result<StageId, BackendError>;

    fn make_converter(&mut self) -> Result<StageId, BackendError>;

    /// Link `upstream`'s output to `downstream`'s input.
    fn link(&mut self, upstream: StageId, downstream: StageId) -> Result<(), BackendError>;

    /// Link a converter to a newly requested mixer slot.
    fn link_to_mixer(&mut self, converter: StageId) -> Result<SlotId, BackendError>;

    /// The mixer slot a converter currently feeds.
    fn mixer_peer(&self, converter: StageId) -> Option<SlotId>;

    fn unlink(&mut self, upstream: StageId, downstream: StageId) -> Result<(), BackendError>;

    /// Unlink a converter from its mixer slot. The slot stays allocated.
    fn unlink_from_mixer(&mut self, converter: StageId) -> Result<(), BackendError>;

    /// Return a mixer slot to the pool. Only valid once nothing feeds it.
    fn release_slot(&mut self, slot: SlotId) -> Result<(), BackendError>;

    /// Remove a stage from the graph, stopping it first.
    fn remove(&mut self, stage: StageId) -> Result<(), BackendError>;

    fn set_stage_state(&mut self, stage: StageId, state: StageState) -> Result<(), BackendError>;

    fn set_graph_state(&mut self, state: StageState) -> Result<(), BackendError>;

    /// Current graph state and the state it is moving to, if any.
    fn graph_state(&self) -> (StageState, Option<StageState>);

    /// Write a Graphviz snapshot of the graph.
    fn dump_graph(&self, path: &Path) -> Result<(), BackendError>;

    /// Start a metadata probe for `uri`, independent of the live graph.
    fn probe(&mut self, uri: &str) -> Result<Box<dyn Probe>, BackendError>;
}

/// Build the backend selected in config.
pub fn from_config(
    audio: &AudioConfig,
    events: EventSender,
) -> Result<Box<dyn MediaBackend>, BackendError> {
    match audio.backend {
        BackendKind::Native => Ok(Box::new(NativeBackend::new(audio, events)?)),
        BackendKind::Memory => Ok(Box::new(MemoryBackend::new(events))),
    }
}

/// Resolve a `file://` URI or plain path to a filesystem path.
pub(crate) fn uri_to_path(uri: &str) -> Result<std::path::PathBuf, BackendError> {
    if let Some(path) = uri.strip_prefix("file://") {
        return Ok(std::path::PathBuf::from(path));
    }
    if uri.contains("://") {
        return Err(BackendError::UnsupportedUri(uri.to_string()));
    }
    Ok(std::path::PathBuf::from(uri))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uri_to_path() {
        assert_eq!(
            uri_to_path("file:///music/a.ogg").unwrap(),
            std::path::PathBuf::from("/music/a.ogg")
        );
        assert_eq!(
            uri_to_path("relative/b.flac").unwrap(),
            std::path::PathBuf::from("relative/b.flac")
        );
        assert!(matches!(
            uri_to_path("http://example.com/stream.mp3"),
            Err(BackendError::UnsupportedUri(_))
        ));
    }

    #[test]
    fn test_message_levels() {
        assert_eq!(MessageLevel::Warning.to_string(), "WARNING");
        assert_eq!(format!("{}: {}", MessageLevel::Error, "boom"), "ERROR: boom");
    }
}
