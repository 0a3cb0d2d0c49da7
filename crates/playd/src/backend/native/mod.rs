//! In-process pipeline engine.
//!
//! ```text
//!  decoder thread ──ring──► converter ─┐
//!  decoder thread ──ring──► converter ─┼─► mixer ─► output sink
//!  decoder thread ──ring──► converter ─┘
//! ```
//!
//! Decoders run on their own threads. Converters, the mixer and its slots
//! live in a [`MixCore`] shared with the output under one mutex; the control
//! side only holds it for the duration of a graph edit.

pub mod convert;
pub mod decode;
pub mod graph;
pub mod mixer;
pub mod probe;
pub mod sink;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use playconf::AudioConfig;
use tracing::{debug, info};

use self::convert::{Converter, StreamSpec};
use self::decode::Decoder;
use self::graph::{Link, Topology};
use self::mixer::MixCore;
use self::probe::NativeProbe;
use self::sink::Output;
use super::{
    uri_to_path, BackendError, EventSender, MediaBackend, Probe, SlotId, StageId, StageKind,
    StageState,
};

pub struct NativeBackend {
    topology: Topology,
    decoders: HashMap<StageId, Decoder>,
    core: Arc<Mutex<MixCore>>,
    output: Output,
    events: EventSender,
    state: StageState,
}

impl NativeBackend {
    pub fn new(audio: &AudioConfig, events: EventSender) -> Result<Self, BackendError> {
        if audio.sample_rate == 0 || audio.channels == 0 {
            return Err(BackendError::Sink(format!(
                "cannot render {} Hz with {} channels",
                audio.sample_rate, audio.channels
            )));
        }
        let format = StreamSpec {
            sample_rate: audio.sample_rate,
            channels: audio.channels as usize,
        };
        let core = Arc::new(Mutex::new(MixCore::new(format).with_events(events.clone())));
        let output = sink::start(audio, Arc::clone(&core))?;
        info!(
            "native backend ready: {} Hz, {} channels, {} output",
            format.sample_rate, format.channels, audio.sink
        );

        Ok(Self {
            topology: Topology::new(&audio.sink.to_string()),
            decoders: HashMap::new(),
            core,
            output,
            events,
            state: StageState::Null,
        })
    }

    fn core(&self) -> MutexGuard<'_, MixCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn expect_kind(&self, stage: StageId, kind: StageKind) -> Result<(), BackendError> {
        match self.topology.kind(stage) {
            Some(k) if k == kind => Ok(()),
            Some(k) => Err(BackendError::Link {
                from: stage.to_string(),
                to: kind.to_string(),
                reason: format!("stage is a {}", k),
            }),
            None => Err(BackendError::UnknownStage(stage)),
        }
    }

    fn link_error(from: StageId, to: StageId, reason: &str) -> BackendError {
        BackendError::Link {
            from: from.to_string(),
            to: to.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl MediaBackend for NativeBackend {
    fn make_decoder(&mut self, uri: &str) -> Result<StageId, BackendError> {
        let path = uri_to_path(uri)?;
        if !path.is_file() {
            return Err(BackendError::Open {
                uri: uri.to_string(),
                reason: "no such file".to_string(),
            });
        }
        let stage = self.topology.add(StageKind::Decoder, uri);
        self.decoders
            .insert(stage, Decoder::new(stage, uri, path, self.events.clone()));
        debug!("{} decodes {}", stage, uri);
        Ok(stage)
    }

    fn make_converter(&mut self) -> Result<StageId, BackendError> {
        let stage = self.topology.add(StageKind::Converter, "");
        let format = self.core().format;
        self.core().converters.insert(stage, Converter::new(format));
        Ok(stage)
    }

    fn link(&mut self, upstream: StageId, downstream: StageId) -> Result<(), BackendError> {
        self.expect_kind(upstream, StageKind::Decoder)?;
        self.expect_kind(downstream, StageKind::Converter)?;
        if self.topology.has_upstream(downstream) {
            return Err(Self::link_error(upstream, downstream, "converter already has an input"));
        }

        let decoder = self
            .decoders
            .get_mut(&upstream)
            .ok_or(BackendError::UnknownStage(upstream))?;
        let Some(input) = decoder.take_output() else {
            return Err(Self::link_error(upstream, downstream, "decoder has no output yet"));
        };
        let spec = input.spec;

        let mut core = self.core.lock().unwrap_or_else(PoisonError::into_inner);
        match core.converters.get_mut(&downstream) {
            Some(converter) => converter.attach_input(input),
            None => {
                drop(core);
                decoder.return_output(input);
                return Err(BackendError::UnknownStage(downstream));
            }
        }
        drop(core);

        self.topology.connect(upstream, downstream, Link::Stream);
        debug!(
            "linked {} -> {} ({} Hz, {} ch)",
            upstream, downstream, spec.sample_rate, spec.channels
        );
        Ok(())
    }

    fn link_to_mixer(&mut self, converter: StageId) -> Result<SlotId, BackendError> {
        self.expect_kind(converter, StageKind::Converter)?;
        let mixer = self.topology.mixer();
        if self.topology.has_downstream(converter) {
            return Err(Self::link_error(converter, mixer, "converter already feeds the mixer"));
        }
        let slot = self.core().mixer.request_slot(converter);
        self.topology.connect(converter, mixer, Link::Slot(slot));
        debug!("linked {} -> mixer {}", converter, slot);
        Ok(slot)
    }

    fn mixer_peer(&self, converter: StageId) -> Option<SlotId> {
        self.core().mixer.peer(converter)
    }

    fn unlink(&mut self, upstream: StageId, downstream: StageId) -> Result<(), BackendError> {
        if !self.topology.is_linked(upstream, downstream) {
            return Err(BackendError::NotLinked(format!("{} -> {}", upstream, downstream)));
        }
        let detached = self
            .core()
            .converters
            .get_mut(&downstream)
            .and_then(|c| c.detach_input());
        if let (Some(input), Some(decoder)) = (detached, self.decoders.get_mut(&upstream)) {
            decoder.return_output(input);
        }
        self.topology.disconnect(upstream, downstream);
        Ok(())
    }

    fn unlink_from_mixer(&mut self, converter: StageId) -> Result<(), BackendError> {
        let mixer = self.topology.mixer();
        if self.core().mixer.detach(converter).is_none() {
            return Err(BackendError::NotLinked(format!("{} -> mixer", converter)));
        }
        self.topology.disconnect(converter, mixer);
        Ok(())
    }

    fn release_slot(&mut self, slot: SlotId) -> Result<(), BackendError> {
        self.core().mixer.release(slot)?;
        debug!("released mixer {}", slot);
        Ok(())
    }

    fn remove(&mut self, stage: StageId) -> Result<(), BackendError> {
        match self.topology.kind(stage) {
            None => return Err(BackendError::UnknownStage(stage)),
            Some(StageKind::Mixer) | Some(StageKind::Sink) => {
                return Err(BackendError::StateChange {
                    state: StageState::Null,
                    reason: format!("{} is part of the output graph", stage),
                })
            }
            Some(StageKind::Decoder) => {
                // joins the decode thread
                self.decoders.remove(&stage);
            }
            Some(StageKind::Converter) => {
                let mut core = self.core();
                core.mixer.detach(stage);
                core.converters.remove(&stage);
            }
        }
        self.topology.remove(stage);
        debug!("removed {}", stage);
        Ok(())
    }

    fn set_stage_state(&mut self, stage: StageId, state: StageState) -> Result<(), BackendError> {
        match self.topology.kind(stage) {
            None => return Err(BackendError::UnknownStage(stage)),
            Some(StageKind::Decoder) => {
                if let Some(decoder) = self.decoders.get_mut(&stage) {
                    decoder.set_state(state)?;
                }
            }
            Some(StageKind::Converter) => {
                if let Some(converter) = self.core().converters.get_mut(&stage) {
                    converter.set_state(state);
                }
            }
            Some(StageKind::Mixer) | Some(StageKind::Sink) => {}
        }
        self.topology.set_state(stage, state);
        Ok(())
    }

    fn set_graph_state(&mut self, state: StageState) -> Result<(), BackendError> {
        if state != StageState::Null && !self.output.is_running() {
            return Err(BackendError::StateChange {
                state,
                reason: format!("{} output has stopped", self.output.kind()),
            });
        }

        for (stage, decoder) in self.decoders.iter_mut() {
            decoder.set_state(state)?;
            self.topology.set_state(*stage, state);
        }
        {
            let mut core = self.core.lock().unwrap_or_else(PoisonError::into_inner);
            for (stage, converter) in core.converters.iter_mut() {
                converter.set_state(state);
                self.topology.set_state(*stage, state);
            }
            core.playing = state == StageState::Playing;
        }
        self.topology.set_state(self.topology.mixer(), state);
        self.topology.set_state(self.topology.sink(), state);

        self.state = state;
        info!("graph is {}", state);
        Ok(())
    }

    fn graph_state(&self) -> (StageState, Option<StageState>) {
        // state changes complete synchronously
        (self.state, None)
    }

    fn dump_graph(&self, path: &Path) -> Result<(), BackendError> {
        std::fs::write(path, self.topology.to_dot())?;
        Ok(())
    }

    fn probe(&mut self, uri: &str) -> Result<Box<dyn Probe>, BackendError> {
        let path = uri_to_path(uri)?;
        Ok(Box::new(NativeProbe::spawn(uri, path)?))
    }
}

impl Drop for NativeBackend {
    fn drop(&mut self) {
        self.output.stop();
        self.decoders.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{event_channel, BackendEvent};
    use playconf::SinkKind;
    use std::time::{Duration, Instant};

    fn backend() -> (NativeBackend, crate::backend::EventReceiver) {
        let (tx, rx) = event_channel();
        let audio = AudioConfig {
            sink: SinkKind::Null,
            ..AudioConfig::default()
        };
        (NativeBackend::new(&audio, tx).unwrap(), rx)
    }

    fn write_wav(path: &Path, frames: usize) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 44_100,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for i in 0..frames {
            writer.write_sample((i % 200) as i16).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_missing_file_is_a_construction_error() {
        let (mut backend, _rx) = backend();
        assert!(matches!(
            backend.make_decoder("file:///nonexistent/a.ogg"),
            Err(BackendError::Open { .. })
        ));
        assert!(matches!(
            backend.make_decoder("http://example.com/a.ogg"),
            Err(BackendError::UnsupportedUri(_))
        ));
    }

    #[test]
    fn test_decoder_links_after_pad_and_unlinks_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        write_wav(&path, 44_100);
        let uri = format!("file://{}", path.display());

        let (mut backend, mut rx) = backend();
        let dec = backend.make_decoder(&uri).unwrap();
        let conv = backend.make_converter().unwrap();
        let slot = backend.link_to_mixer(conv).unwrap();
        assert_eq!(slot, SlotId(0));
        assert_eq!(backend.mixer_peer(conv), Some(slot));

        // no output until the decoder has opened the file
        assert!(backend.link(dec, conv).is_err());

        backend.set_graph_state(StageState::Playing).unwrap();
        assert_eq!(
            rx.blocking_recv().unwrap(),
            BackendEvent::PadAdded { stage: dec }
        );
        backend.link(dec, conv).unwrap();

        backend.set_stage_state(dec, StageState::Paused).unwrap();
        backend.unlink(dec, conv).unwrap();
        backend.unlink_from_mixer(conv).unwrap();
        assert_eq!(backend.mixer_peer(conv), None);
        backend.release_slot(slot).unwrap();
        backend.remove(dec).unwrap();
        backend.remove(conv).unwrap();

        assert_eq!(backend.topology.node_count(), 2);
        assert!(backend.core().mixer.allocated().is_empty());
    }

    #[test]
    fn test_end_of_stream_waits_for_the_mix_to_play_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.wav");
        // 0.3 s
        write_wav(&path, 13_230);
        let uri = format!("file://{}", path.display());

        let (mut backend, mut rx) = backend();
        let dec = backend.make_decoder(&uri).unwrap();
        let conv = backend.make_converter().unwrap();
        backend.link_to_mixer(conv).unwrap();

        let started = Instant::now();
        backend.set_graph_state(StageState::Playing).unwrap();
        assert_eq!(
            rx.blocking_recv().unwrap(),
            BackendEvent::PadAdded { stage: dec }
        );
        backend.link(dec, conv).unwrap();

        let deadline = started + Duration::from_secs(5);
        let text = loop {
            match rx.try_recv() {
                Ok(BackendEvent::Message { text, .. }) => break text,
                Ok(_) => {}
                Err(_) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(5))
                }
                Err(_) => panic!("no end of stream after 5 s"),
            }
        };
        assert_eq!(text, format!("End of stream: {}", uri));
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[test]
    fn test_release_before_unlink_is_refused() {
        let (mut backend, _rx) = backend();
        let conv = backend.make_converter().unwrap();
        let slot = backend.link_to_mixer(conv).unwrap();
        assert!(backend.release_slot(slot).is_err());
        assert!(backend.link_to_mixer(conv).is_err());
    }

    #[test]
    fn test_zero_output_format_is_refused() {
        for (sample_rate, channels) in [(0, 2), (48_000, 0)] {
            let (tx, _rx) = event_channel();
            let audio = AudioConfig {
                sink: SinkKind::Null,
                sample_rate,
                channels,
                ..AudioConfig::default()
            };
            assert!(matches!(
                NativeBackend::new(&audio, tx),
                Err(BackendError::Sink(_))
            ));
        }
    }

    #[test]
    fn test_output_graph_cannot_be_removed() {
        let (mut backend, _rx) = backend();
        let mixer = backend.topology.mixer();
        assert!(backend.remove(mixer).is_err());
    }

    #[test]
    fn test_dump_graph_writes_dot() {
        let (mut backend, _rx) = backend();
        let conv = backend.make_converter().unwrap();
        backend.link_to_mixer(conv).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("playd.dot");
        backend.dump_graph(&path).unwrap();
        let dot = std::fs::read_to_string(&path).unwrap();
        assert!(dot.contains("mixer"));
        assert!(dot.contains("sink_0"));
    }
}
