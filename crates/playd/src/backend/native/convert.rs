//! Format converter: channel mapping plus linear sample-rate conversion.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rtrb::Consumer;

use crate::backend::StageState;

/// Interleaved f32 stream layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSpec {
    pub sample_rate: u32,
    pub channels: usize,
}

/// The read side of a decoder ring, as handed to a converter.
pub struct StreamInput {
    pub consumer: Consumer<f32>,
    pub spec: StreamSpec,
    source: String,
    ended: Arc<AtomicBool>,
}

impl StreamInput {
    pub fn new(consumer: Consumer<f32>, spec: StreamSpec) -> Self {
        Self::from_source(consumer, spec, "", Arc::new(AtomicBool::new(false)))
    }

    /// `ended` is raised by the producer once it has pushed its last sample.
    pub fn from_source(
        consumer: Consumer<f32>,
        spec: StreamSpec,
        source: &str,
        ended: Arc<AtomicBool>,
    ) -> Self {
        Self {
            consumer,
            spec,
            source: source.to_string(),
            ended,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }
}

/// Pulls decoded frames from a decoder ring and renders them in the output
/// format. Runs on the render thread.
pub struct Converter {
    output: StreamSpec,
    input: Option<StreamInput>,
    state: StageState,
    drained: bool,
    /// Input frames advanced per output frame
    step: f64,
    /// Position between `prev` and `next`, in [0, 1)
    frac: f64,
    prev: Vec<f32>,
    next: Vec<f32>,
    primed: bool,
    interpolated: Vec<f32>,
    frame: Vec<f32>,
}

impl Converter {
    pub fn new(output: StreamSpec) -> Self {
        Self {
            output,
            input: None,
            state: StageState::Null,
            drained: false,
            step: 1.0,
            frac: 0.0,
            prev: Vec::new(),
            next: Vec::new(),
            primed: false,
            interpolated: Vec::new(),
            frame: vec![0.0; output.channels],
        }
    }

    pub fn state(&self) -> StageState {
        self.state
    }

    pub fn set_state(&mut self, state: StageState) {
        self.state = state;
    }

    pub fn has_input(&self) -> bool {
        self.input.is_some()
    }

    pub fn attach_input(&mut self, input: StreamInput) {
        let spec = input.spec;
        self.step = spec.sample_rate as f64 / self.output.sample_rate as f64;
        self.frac = 0.0;
        self.prev = vec![0.0; spec.channels];
        self.next = vec![0.0; spec.channels];
        self.interpolated = vec![0.0; spec.channels];
        self.primed = false;
        self.drained = false;
        self.input = Some(input);
    }

    pub fn detach_input(&mut self) -> Option<StreamInput> {
        self.primed = false;
        self.input.take()
    }

    /// The source name, once: after the upstream has ended and every whole
    /// frame it produced has been rendered.
    pub fn take_drained(&mut self) -> Option<&str> {
        if self.drained || self.state != StageState::Playing {
            return None;
        }
        let input = self.input.as_ref()?;
        if !input.is_ended() {
            return None;
        }
        let frames_left = input.consumer.slots() / input.spec.channels.max(1);
        let needed = if self.primed { 1 } else { 2 };
        if frames_left >= needed {
            return None;
        }
        self.drained = true;
        Some(input.source())
    }

    /// Add up to `out.len() / channels` converted frames into `out`.
    ///
    /// Returns the number of frames written; fewer than requested means the
    /// decoder has not kept up.
    pub fn render_add(&mut self, out: &mut [f32]) -> usize {
        if self.state != StageState::Playing {
            return 0;
        }
        let Some(input) = self.input.as_mut() else {
            return 0;
        };

        let in_channels = input.spec.channels;
        // interpolation needs the current frame and the one after it
        if !self.primed {
            if input.consumer.slots() < 2 * in_channels {
                return 0;
            }
            read_frame(&mut input.consumer, &mut self.prev);
            read_frame(&mut input.consumer, &mut self.next);
            self.frac = 0.0;
            self.primed = true;
        }

        let out_channels = self.output.channels;
        let frames = out.len() / out_channels;

        for i in 0..frames {
            while self.frac >= 1.0 {
                std::mem::swap(&mut self.prev, &mut self.next);
                if !read_frame(&mut input.consumer, &mut self.next) {
                    // keep position so the next call resumes here
                    std::mem::swap(&mut self.prev, &mut self.next);
                    return i;
                }
                self.frac -= 1.0;
            }

            let t = self.frac as f32;
            for (c, sample) in self.interpolated.iter_mut().enumerate() {
                *sample = self.prev[c] + (self.next[c] - self.prev[c]) * t;
            }
            map_channels(&self.interpolated, &mut self.frame);

            let dst = &mut out[i * out_channels..(i + 1) * out_channels];
            for (d, s) in dst.iter_mut().zip(&self.frame) {
                *d += *s;
            }
            self.frac += self.step;
        }

        frames
    }
}

fn read_frame(consumer: &mut Consumer<f32>, frame: &mut [f32]) -> bool {
    if consumer.slots() < frame.len() {
        return false;
    }
    for sample in frame.iter_mut() {
        match consumer.pop() {
            Ok(v) => *sample = v,
            Err(_) => return false,
        }
    }
    true
}

/// Map one frame between channel counts.
///
/// Mono is copied to every output channel. With fewer inputs than outputs the
/// inputs repeat cyclically; with more, extra inputs are folded into output
/// `index % out` and each output is averaged over what it received.
pub fn map_channels(input: &[f32], output: &mut [f32]) {
    let (n_in, n_out) = (input.len(), output.len());
    if n_in == 0 || n_out == 0 {
        output.fill(0.0);
        return;
    }

    if n_in <= n_out {
        for (c, sample) in output.iter_mut().enumerate() {
            *sample = input[c % n_in];
        }
        return;
    }

    output.fill(0.0);
    let mut counts = [0u32; 32];
    for (c, sample) in input.iter().enumerate() {
        let dst = c % n_out;
        output[dst] += *sample;
        if dst < counts.len() {
            counts[dst] += 1;
        }
    }
    for (c, sample) in output.iter_mut().enumerate() {
        let n = counts.get(c).copied().unwrap_or(1).max(1);
        *sample /= n as f32;
    }
}
