//! Decoder stages
//!
//! Each decoder runs on its own thread once it leaves `Null`. The thread
//! opens the media with symphonia, publishes the stream layout, announces
//! its output with `PadAdded`, and then pushes interleaved f32 samples into
//! an SPSC ring that the linked converter drains on the render side. The end
//! of the file only raises a flag; the converter reports end of stream once
//! the ring has been played out.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rtrb::{Consumer, Producer, RingBuffer};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder as CodecDecoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::{Hint, ProbedMetadata};
use tracing::{debug, warn};

use super::convert::{StreamInput, StreamSpec};
use crate::backend::{BackendEvent, EventSender, MessageLevel, StageId, StageState};

/// Samples buffered between a decoder and its converter (~1.4 s of 48 kHz stereo).
const RING_CAPACITY: usize = 1 << 17;

/// How long an idle or backed-up decoder sleeps before looking again.
const IDLE_WAIT: Duration = Duration::from_millis(5);

const STOPPED: u8 = 0;
const PAUSED: u8 = 1;
const PLAYING: u8 = 2;

/// An opened media file, ready to decode.
pub struct Media {
    pub format: Box<dyn FormatReader>,
    pub decoder: Box<dyn CodecDecoder>,
    pub track_id: u32,
    pub spec: StreamSpec,
    /// Metadata found while probing, ahead of the container.
    pub probed: ProbedMetadata,
}

impl Media {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .context("failed to probe audio format")?;

        let format = probed.format;
        let track = format
            .default_track()
            .ok_or_else(|| anyhow!("no audio track found"))?;

        let sample_rate = track
            .codec_params
            .sample_rate
            .ok_or_else(|| anyhow!("no sample rate"))?;
        let channels = track
            .codec_params
            .channels
            .map(|c| c.count())
            .unwrap_or(2);

        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .context("failed to create decoder")?;
        let track_id = track.id;

        Ok(Self {
            format,
            decoder,
            track_id,
            spec: StreamSpec {
                sample_rate,
                channels,
            },
            probed: probed.metadata,
        })
    }

    /// Decode the next packet of the selected track. `None` at end of stream.
    pub fn next_samples(&mut self) -> Result<Option<Vec<f32>>> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(None);
                }
                Err(e) => return Err(e).context("failed to read packet"),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    let spec = *decoded.spec();
                    let duration = decoded.capacity();
                    let mut sample_buf = SampleBuffer::<f32>::new(duration as u64, spec);
                    sample_buf.copy_interleaved_ref(decoded);
                    return Ok(Some(sample_buf.samples().to_vec()));
                }
                // a corrupt packet is skipped, not fatal
                Err(SymphoniaError::DecodeError(e)) => {
                    debug!("skipping undecodable packet: {}", e);
                }
                Err(e) => return Err(e).context("failed to decode packet"),
            }
        }
    }
}

struct Control {
    state: AtomicU8,
}

impl Control {
    fn load(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    fn store(&self, state: u8) {
        self.state.store(state, Ordering::Release);
    }
}

/// A decoder stage owned by the backend.
pub struct Decoder {
    stage: StageId,
    uri: String,
    path: PathBuf,
    control: Arc<Control>,
    spec: Arc<Mutex<Option<StreamSpec>>>,
    ended: Arc<AtomicBool>,
    producer: Option<Producer<f32>>,
    consumer: Option<Consumer<f32>>,
    thread: Option<JoinHandle<()>>,
    events: EventSender,
}

impl Decoder {
    pub fn new(stage: StageId, uri: &str, path: PathBuf, events: EventSender) -> Self {
        let (producer, consumer) = RingBuffer::new(RING_CAPACITY);
        Self {
            stage,
            uri: uri.to_string(),
            path,
            control: Arc::new(Control {
                state: AtomicU8::new(PAUSED),
            }),
            spec: Arc::new(Mutex::new(None)),
            ended: Arc::new(AtomicBool::new(false)),
            producer: Some(producer),
            consumer: Some(consumer),
            thread: None,
            events,
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Output layout, known once the thread has opened the media.
    pub fn spec(&self) -> Option<StreamSpec> {
        *self.spec.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the whole file has been pushed into the ring.
    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    /// Hand the ring's read side to a converter.
    pub fn take_output(&mut self) -> Option<StreamInput> {
        let spec = self.spec()?;
        let consumer = self.consumer.take()?;
        Some(StreamInput::from_source(
            consumer,
            spec,
            &self.uri,
            Arc::clone(&self.ended),
        ))
    }

    /// Take the ring's read side back after unlinking.
    pub fn return_output(&mut self, input: StreamInput) {
        self.consumer = Some(input.consumer);
    }

    pub fn set_state(&mut self, state: StageState) -> std::io::Result<()> {
        match state {
            StageState::Null => {
                self.stop();
                Ok(())
            }
            StageState::Paused => {
                self.control.store(PAUSED);
                self.start()
            }
            StageState::Playing => {
                self.control.store(PLAYING);
                self.start()
            }
        }
    }

    fn start(&mut self) -> std::io::Result<()> {
        if self.thread.is_some() {
            return Ok(());
        }
        let Some(producer) = self.producer.take() else {
            // already ran to completion once
            return Ok(());
        };

        let worker = Worker {
            stage: self.stage,
            uri: self.uri.clone(),
            path: self.path.clone(),
            control: Arc::clone(&self.control),
            spec: Arc::clone(&self.spec),
            ended: Arc::clone(&self.ended),
            producer,
            events: self.events.clone(),
        };
        let handle = thread::Builder::new()
            .name(format!("decode-{}", self.stage))
            .spawn(move || worker.run())?;
        self.thread = Some(handle);
        Ok(())
    }

    fn stop(&mut self) {
        self.control.store(STOPPED);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!("decoder thread for {} panicked", self.uri);
            }
        }
    }
}

impl Drop for Decoder {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    stage: StageId,
    uri: String,
    path: PathBuf,
    control: Arc<Control>,
    spec: Arc<Mutex<Option<StreamSpec>>>,
    ended: Arc<AtomicBool>,
    producer: Producer<f32>,
    events: EventSender,
}

impl Worker {
    fn message(&self, level: MessageLevel, text: String) {
        let _ = self.events.send(BackendEvent::Message { level, text });
    }

    fn run(mut self) {
        let mut media = match Media::open(&self.path) {
            Ok(media) => media,
            Err(e) => {
                self.message(
                    MessageLevel::Error,
                    format!("Could not open {}: {:#}", self.uri, e),
                );
                return;
            }
        };

        debug!(
            "{} opened {}: {} Hz, {} channels",
            self.stage, self.uri, media.spec.sample_rate, media.spec.channels
        );
        *self.spec.lock().unwrap_or_else(PoisonError::into_inner) = Some(media.spec);
        let _ = self
            .events
            .send(BackendEvent::PadAdded { stage: self.stage });

        let mut pending: Vec<f32> = Vec::new();
        let mut offset = 0;

        loop {
            match self.control.load() {
                STOPPED => return,
                PAUSED => {
                    thread::sleep(IDLE_WAIT);
                    continue;
                }
                _ => {}
            }

            if offset < pending.len() {
                while offset < pending.len() {
                    if self.producer.push(pending[offset]).is_err() {
                        break;
                    }
                    offset += 1;
                }
                if offset < pending.len() {
                    if self.producer.is_abandoned() {
                        return;
                    }
                    thread::sleep(IDLE_WAIT);
                }
                continue;
            }

            match media.next_samples() {
                Ok(Some(samples)) => {
                    pending = samples;
                    offset = 0;
                }
                Ok(None) => {
                    debug!("{} finished decoding {}", self.stage, self.uri);
                    self.ended.store(true, Ordering::Release);
                    return;
                }
                Err(e) => {
                    self.message(
                        MessageLevel::Error,
                        format!("Error decoding {}: {:#}", self.uri, e),
                    );
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::event_channel;

    fn write_wav(path: &Path, sample_rate: u32, channels: u16, frames: usize) {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for i in 0..frames * channels as usize {
            writer.write_sample(((i % 100) as i16) * 100).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_media_open_reads_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        write_wav(&path, 22_050, 1, 2048);

        let mut media = Media::open(&path).unwrap();
        assert_eq!(
            media.spec,
            StreamSpec {
                sample_rate: 22_050,
                channels: 1
            }
        );
        let first = media.next_samples().unwrap().unwrap();
        assert!(!first.is_empty());
    }

    #[test]
    fn test_media_open_missing_file_fails() {
        assert!(Media::open(Path::new("/nonexistent/nothing.wav")).is_err());
    }

    #[test]
    fn test_decoder_announces_pad_then_marks_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.wav");
        write_wav(&path, 48_000, 2, 256);

        let (tx, mut rx) = event_channel();
        let mut decoder = Decoder::new(StageId(7), "short.wav", path, tx);
        assert!(decoder.take_output().is_none());

        decoder.set_state(StageState::Playing).unwrap();
        let first = rx.blocking_recv().unwrap();
        assert_eq!(first, BackendEvent::PadAdded { stage: StageId(7) });

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !decoder.is_ended() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(decoder.is_ended());
        // nothing has been played yet, so nothing is announced
        assert!(rx.try_recv().is_err());

        let input = decoder.take_output().unwrap();
        assert_eq!(input.spec.channels, 2);
        assert_eq!(input.source(), "short.wav");
        assert!(input.is_ended());
        assert_eq!(input.consumer.slots(), 512);
    }

    #[test]
    fn test_decoder_reports_open_failure() {
        let (tx, mut rx) = event_channel();
        let mut decoder = Decoder::new(
            StageId(1),
            "file:///missing.ogg",
            PathBuf::from("/missing.ogg"),
            tx,
        );
        decoder.set_state(StageState::Paused).unwrap();
        match rx.blocking_recv().unwrap() {
            BackendEvent::Message { level, text } => {
                assert_eq!(level, MessageLevel::Error);
                assert!(text.starts_with("Could not open file:///missing.ogg"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
