//! Mixer inputs and the render core shared with the output thread.

use std::collections::{BTreeMap, HashMap};

use super::convert::{Converter, StreamSpec};
use crate::backend::{BackendError, BackendEvent, EventSender, MessageLevel, SlotId, StageId};

/// Numbered mixer inputs.
///
/// A slot is allocated by [`Mixer::request_slot`] and stays allocated after
/// its feeder is detached, until [`Mixer::release`] returns it to the pool.
#[derive(Debug, Default)]
pub struct Mixer {
    slots: BTreeMap<u32, Option<StageId>>,
}

impl Mixer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the lowest free slot number and attach `feeder` to it.
    pub fn request_slot(&mut self, feeder: StageId) -> SlotId {
        let number = (0..)
            .find(|n| !self.slots.contains_key(n))
            .unwrap_or_default();
        self.slots.insert(number, Some(feeder));
        SlotId(number)
    }

    pub fn peer(&self, feeder: StageId) -> Option<SlotId> {
        self.slots
            .iter()
            .find(|(_, f)| **f == Some(feeder))
            .map(|(n, _)| SlotId(*n))
    }

    /// Detach `feeder` from its slot, leaving the slot allocated.
    pub fn detach(&mut self, feeder: StageId) -> Option<SlotId> {
        let slot = self.peer(feeder)?;
        self.slots.insert(slot.0, None);
        Some(slot)
    }

    pub fn release(&mut self, slot: SlotId) -> Result<(), BackendError> {
        match self.slots.get(&slot.0) {
            None => Err(BackendError::UnknownSlot(slot)),
            Some(Some(feeder)) => Err(BackendError::Link {
                from: feeder.to_string(),
                to: slot.to_string(),
                reason: "slot is still fed".to_string(),
            }),
            Some(None) => {
                self.slots.remove(&slot.0);
                Ok(())
            }
        }
    }

    pub fn allocated(&self) -> Vec<SlotId> {
        self.slots.keys().map(|n| SlotId(*n)).collect()
    }

    pub fn feeders(&self) -> impl Iterator<Item = StageId> + '_ {
        self.slots.values().filter_map(|f| *f)
    }
}

/// Everything the render side touches, behind one lock.
pub struct MixCore {
    pub format: StreamSpec,
    pub mixer: Mixer,
    pub converters: HashMap<StageId, Converter>,
    pub playing: bool,
    events: Option<EventSender>,
}

impl MixCore {
    pub fn new(format: StreamSpec) -> Self {
        Self {
            format,
            mixer: Mixer::new(),
            converters: HashMap::new(),
            playing: false,
            events: None,
        }
    }

    /// Report played-out sources on `events`.
    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    /// Render one block of interleaved output. Returns false while the graph
    /// is not playing; `out` is silence then.
    pub fn render(&mut self, out: &mut [f32]) -> bool {
        out.fill(0.0);
        if !self.playing {
            return false;
        }
        for feeder in self.mixer.feeders() {
            if let Some(converter) = self.converters.get_mut(&feeder) {
                converter.render_add(out);
                if let (Some(source), Some(events)) = (converter.take_drained(), &self.events) {
                    let _ = events.send(BackendEvent::Message {
                        level: MessageLevel::Info,
                        text: format!("End of stream: {}", source),
                    });
                }
            }
        }
        for sample in out.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }
        true
    }
}
