//! Output sinks
//!
//! The mixer output goes to one of:
//! - `null`: rendered in real time and discarded
//! - `wav`: rendered in real time into a 32-bit float WAV file (hound)
//! - `pipewire`: pulled by a PipeWire playback stream (feature `pipewire`)
//!
//! The first two share a render thread that paces itself against the wall
//! clock; PipeWire drives its own callback.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use playconf::{AudioConfig, SinkKind};
use tracing::{debug, error, info, warn};

use super::convert::StreamSpec;
use super::mixer::MixCore;
use crate::backend::BackendError;

/// Frames rendered per block on the render thread.
const BLOCK_FRAMES: usize = 1024;

/// Where rendered blocks go.
pub trait OutputSink: Send {
    fn write(&mut self, block: &[f32]) -> Result<(), BackendError>;

    fn finish(&mut self) -> Result<(), BackendError> {
        Ok(())
    }
}

pub struct NullSink;

impl OutputSink for NullSink {
    fn write(&mut self, _block: &[f32]) -> Result<(), BackendError> {
        Ok(())
    }
}

pub struct WavSink {
    writer: Option<hound::WavWriter<BufWriter<File>>>,
}

impl WavSink {
    pub fn create(path: &Path, format: StreamSpec) -> Result<Self, BackendError> {
        let spec = hound::WavSpec {
            channels: format.channels as u16,
            sample_rate: format.sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let writer = hound::WavWriter::create(path, spec)
            .map_err(|e| BackendError::Sink(format!("cannot create {}: {}", path.display(), e)))?;
        info!("writing mix to {}", path.display());
        Ok(Self {
            writer: Some(writer),
        })
    }
}

impl OutputSink for WavSink {
    fn write(&mut self, block: &[f32]) -> Result<(), BackendError> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };
        for sample in block {
            writer
                .write_sample(*sample)
                .map_err(|e| BackendError::Sink(e.to_string()))?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), BackendError> {
        match self.writer.take() {
            Some(writer) => writer
                .finalize()
                .map_err(|e| BackendError::Sink(e.to_string())),
            None => Ok(()),
        }
    }
}

/// A running output. Dropping it stops the output thread and waits for it.
pub struct Output {
    kind: SinkKind,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Output {
    pub fn kind(&self) -> SinkKind {
        self.kind
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                error!("{} output thread panicked", self.kind);
            }
        }
    }
}

impl Drop for Output {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Start the output selected in config, pulling from `core`.
pub fn start(audio: &AudioConfig, core: Arc<Mutex<MixCore>>) -> Result<Output, BackendError> {
    let format = core.lock().unwrap_or_else(PoisonError::into_inner).format;
    let running = Arc::new(AtomicBool::new(true));

    let thread = match audio.sink {
        SinkKind::Null => spawn_render(Box::new(NullSink), core, format, Arc::clone(&running))?,
        SinkKind::Wav => {
            let sink = WavSink::create(&audio.wav_path, format)?;
            spawn_render(Box::new(sink), core, format, Arc::clone(&running))?
        }
        #[cfg(feature = "pipewire")]
        SinkKind::Pipewire => pw_output::spawn(core, format, Arc::clone(&running))?,
        #[cfg(not(feature = "pipewire"))]
        SinkKind::Pipewire => {
            return Err(BackendError::Sink(
                "PipeWire output needs playd built with the `pipewire` feature".to_string(),
            ))
        }
    };

    Ok(Output {
        kind: audio.sink,
        running,
        thread: Some(thread),
    })
}

fn spawn_render(
    sink: Box<dyn OutputSink>,
    core: Arc<Mutex<MixCore>>,
    format: StreamSpec,
    running: Arc<AtomicBool>,
) -> Result<JoinHandle<()>, BackendError> {
    thread::Builder::new()
        .name("playd-render".to_string())
        .spawn(move || render_loop(sink, core, format, running))
        .map_err(BackendError::Io)
}

fn render_loop(
    mut sink: Box<dyn OutputSink>,
    core: Arc<Mutex<MixCore>>,
    format: StreamSpec,
    running: Arc<AtomicBool>,
) {
    let _stopped = ClearOnExit(Arc::clone(&running));
    let block_time = Duration::from_secs_f64(BLOCK_FRAMES as f64 / format.sample_rate as f64);
    let mut block = vec![0.0f32; BLOCK_FRAMES * format.channels];
    let mut deadline = Instant::now();

    debug!(
        "render thread started: {} Hz, {} channels",
        format.sample_rate, format.channels
    );

    while running.load(Ordering::Acquire) {
        let playing = core
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .render(&mut block);

        if playing {
            if let Err(e) = sink.write(&block) {
                error!("output sink failed, stopping render: {}", e);
                running.store(false, Ordering::Release);
                break;
            }
            deadline += block_time;
        } else {
            // nothing to pace against while stopped
            deadline = Instant::now() + block_time;
        }

        let now = Instant::now();
        if deadline > now {
            thread::sleep(deadline - now);
        } else if now - deadline > block_time * 8 {
            warn!("render thread fell behind, resetting clock");
            deadline = now;
        }
    }

    if let Err(e) = sink.finish() {
        error!("failed to finish output: {}", e);
    }
    debug!("render thread stopped");
}

/// Marks the output stopped when the render thread exits, panics included.
struct ClearOnExit(Arc<AtomicBool>);

impl Drop for ClearOnExit {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(feature = "pipewire")]
mod pw_output {
    //! PipeWire playback stream
    //!
    //! The process callback runs on PipeWire's RT thread. It only try-locks
    //! the mix core and writes silence when the control side holds it.

    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread::{self, JoinHandle};

    use tracing::{debug, error, info};

    use super::super::convert::StreamSpec;
    use super::super::mixer::MixCore;
    use crate::backend::BackendError;

    /// Frames per callback we ask for, ~5.3 ms at 48 kHz.
    const LATENCY_FRAMES: usize = 256;

    pub fn spawn(
        core: Arc<Mutex<MixCore>>,
        format: StreamSpec,
        running: Arc<AtomicBool>,
    ) -> Result<JoinHandle<()>, BackendError> {
        pipewire::init();
        thread::Builder::new()
            .name("pipewire-output".to_string())
            .spawn(move || {
                if let Err(e) = run_loop(core, format, running) {
                    error!("PipeWire output thread failed: {}", e);
                }
            })
            .map_err(BackendError::Io)
    }

    fn run_loop(
        core: Arc<Mutex<MixCore>>,
        format: StreamSpec,
        running: Arc<AtomicBool>,
    ) -> Result<(), BackendError> {
        use pipewire as pw;
        use pw::spa::pod::Pod;
        use pw::{properties::properties, spa};

        let init = |what: &str, e: &dyn std::fmt::Display| {
            BackendError::Sink(format!("PipeWire: failed to {}: {}", what, e))
        };

        let mainloop =
            pw::main_loop::MainLoopRc::new(None).map_err(|e| init("create main loop", &e))?;
        let context =
            pw::context::ContextRc::new(&mainloop, None).map_err(|e| init("create context", &e))?;
        let pw_core = context.connect_rc(None).map_err(|e| init("connect", &e))?;

        let mut props = properties! {
            *pw::keys::MEDIA_TYPE => "Audio",
            *pw::keys::MEDIA_ROLE => "Music",
            *pw::keys::MEDIA_CATEGORY => "Playback",
            *pw::keys::AUDIO_CHANNELS => format.channels.to_string(),
        };
        let latency = format!("{}/{}", LATENCY_FRAMES, format.sample_rate);
        props.insert("node.latency", latency.as_str());

        let stream = pw::stream::StreamBox::new(&pw_core, "playd", props)
            .map_err(|e| init("create stream", &e))?;

        let channels = format.channels;
        let sample_size = std::mem::size_of::<f32>();
        let stride = sample_size * channels;
        let mix = vec![0.0f32; 8192 * channels];

        let _listener = stream
            .add_local_listener_with_user_data((core, mix))
            .process(move |stream, (core, ref mut mix)| {
                let Some(mut buffer) = stream.dequeue_buffer() else {
                    return;
                };
                let requested = buffer.requested() as usize;
                let datas = buffer.datas_mut();
                let Some(data) = datas.first_mut() else {
                    return;
                };
                let Some(slice) = data.data() else {
                    return;
                };

                let max_frames = (slice.len() / stride).min(mix.len() / channels);
                let n_frames = if requested > 0 {
                    LATENCY_FRAMES.min(requested).min(max_frames)
                } else {
                    LATENCY_FRAMES.min(max_frames)
                };
                let block = &mut mix[..n_frames * channels];

                match core.try_lock() {
                    Ok(mut core) => {
                        core.render(block);
                    }
                    Err(_) => block.fill(0.0),
                }

                for (i, sample) in block.iter().enumerate() {
                    let start = i * sample_size;
                    slice[start..start + sample_size].copy_from_slice(&sample.to_le_bytes());
                }

                let chunk = data.chunk_mut();
                *chunk.offset_mut() = 0;
                *chunk.stride_mut() = stride as i32;
                *chunk.size_mut() = (stride * n_frames) as u32;
            })
            .register()
            .map_err(|e| init("register listener", &e))?;

        let mut audio_info = spa::param::audio::AudioInfoRaw::new();
        audio_info.set_format(spa::param::audio::AudioFormat::F32LE);
        audio_info.set_rate(format.sample_rate);
        audio_info.set_channels(format.channels as u32);
        let mut position = [0u32; spa::param::audio::MAX_CHANNELS];
        if format.channels >= 1 {
            position[0] = pw::spa::sys::SPA_AUDIO_CHANNEL_FL;
        }
        if format.channels >= 2 {
            position[1] = pw::spa::sys::SPA_AUDIO_CHANNEL_FR;
        }
        audio_info.set_position(position);

        let values: Vec<u8> = pw::spa::pod::serialize::PodSerializer::serialize(
            std::io::Cursor::new(Vec::new()),
            &pw::spa::pod::Value::Object(pw::spa::pod::Object {
                type_: pw::spa::sys::SPA_TYPE_OBJECT_Format,
                id: pw::spa::sys::SPA_PARAM_EnumFormat,
                properties: audio_info.into(),
            }),
        )
        .map_err(|e| init("serialize format", &e))?
        .0
        .into_inner();

        let mut params = [Pod::from_bytes(&values)
            .ok_or_else(|| BackendError::Sink("PipeWire: bad format pod".to_string()))?];

        stream
            .connect(
                spa::utils::Direction::Output,
                None,
                pw::stream::StreamFlags::AUTOCONNECT
                    | pw::stream::StreamFlags::MAP_BUFFERS
                    | pw::stream::StreamFlags::RT_PROCESS,
                &mut params,
            )
            .map_err(|e| init("connect stream", &e))?;

        info!(
            "PipeWire stream connected: {} Hz, {} channels",
            format.sample_rate, format.channels
        );

        let mainloop_weak = mainloop.downgrade();
        let timer = mainloop.loop_().add_timer(move |_| {
            if !running.load(Ordering::Acquire) {
                if let Some(ml) = mainloop_weak.upgrade() {
                    ml.quit();
                }
            }
        });
        timer
            .update_timer(
                Some(std::time::Duration::from_millis(100)),
                Some(std::time::Duration::from_millis(100)),
            )
            .into_result()
            .map_err(|e| init("set timer", &e))?;

        mainloop.run();
        debug!("PipeWire main loop exited");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::native::convert::{Converter, StreamInput};
    use crate::backend::{StageId, StageState};
    use rtrb::RingBuffer;

    #[test]
    fn test_wav_sink_writes_float_samples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mix.wav");
        let format = StreamSpec {
            sample_rate: 8_000,
            channels: 2,
        };
        let mut sink = WavSink::create(&path, format).unwrap();
        sink.write(&[0.5, -0.5, 0.25, -0.25]).unwrap();
        sink.finish().unwrap();

        let mut reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().channels, 2);
        assert_eq!(reader.spec().sample_format, hound::SampleFormat::Float);
        let samples: Vec<f32> = reader.samples::<f32>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![0.5, -0.5, 0.25, -0.25]);
    }

    #[test]
    fn test_render_thread_writes_mix_to_wav() {
        let dir = tempfile::tempdir().unwrap();
        let audio = AudioConfig {
            sink: SinkKind::Wav,
            sample_rate: 48_000,
            channels: 2,
            wav_path: dir.path().join("out.wav"),
            ..AudioConfig::default()
        };
        let format = StreamSpec {
            sample_rate: 48_000,
            channels: 2,
        };

        let (mut tx, rx) = RingBuffer::new(4096);
        for _ in 0..2048 {
            tx.push(0.25).unwrap();
        }
        let mut converter = Converter::new(format);
        converter.attach_input(StreamInput::new(rx, format));
        converter.set_state(StageState::Playing);

        let mut core = MixCore::new(format);
        core.converters.insert(StageId(1), converter);
        core.mixer.request_slot(StageId(1));
        core.playing = true;
        let core = Arc::new(Mutex::new(core));

        let mut output = start(&audio, Arc::clone(&core)).unwrap();
        thread::sleep(Duration::from_millis(100));
        output.stop();

        let mut reader = hound::WavReader::open(&audio.wav_path).unwrap();
        let samples: Vec<f32> = reader.samples::<f32>().map(|s| s.unwrap()).collect();
        assert!(samples.len() >= BLOCK_FRAMES * 2);
        assert_eq!(samples[0], 0.25);
    }

    struct PanickingSink;

    impl OutputSink for PanickingSink {
        fn write(&mut self, _block: &[f32]) -> Result<(), BackendError> {
            panic!("sink blew up");
        }
    }

    #[test]
    fn test_render_panic_marks_output_stopped() {
        let format = StreamSpec {
            sample_rate: 48_000,
            channels: 2,
        };
        let mut core = MixCore::new(format);
        core.playing = true;
        let running = Arc::new(AtomicBool::new(true));

        let handle = spawn_render(
            Box::new(PanickingSink),
            Arc::new(Mutex::new(core)),
            format,
            Arc::clone(&running),
        )
        .unwrap();
        assert!(handle.join().is_err());
        assert!(!running.load(Ordering::Acquire));
    }

    #[cfg(not(feature = "pipewire"))]
    #[test]
    fn test_pipewire_needs_feature() {
        let audio = AudioConfig {
            sink: SinkKind::Pipewire,
            ..AudioConfig::default()
        };
        let core = Arc::new(Mutex::new(MixCore::new(StreamSpec {
            sample_rate: 48_000,
            channels: 2,
        })));
        assert!(matches!(start(&audio, core), Err(BackendError::Sink(_))));
    }
}
