//! In-process backend that records the graph without producing audio.
//!
//! Decoders announce their output as soon as they are started. Failures can
//! be scripted by URI prefix, and `TAGS` probes replay scripted messages.
//! A [`MemoryHandle`] taken before the backend is boxed lets tests inspect
//! the graph and the order of operations.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt::Write as _;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::debug;

use super::{
    BackendError, BackendEvent, EventSender, MediaBackend, MessageLevel, Probe, ProbeMessage,
    SlotId, StageId, StageKind, StageState,
};

#[derive(Debug, Clone)]
struct MemoryStage {
    kind: StageKind,
    uri: Option<String>,
    state: StageState,
    announced: bool,
}

#[derive(Debug, Default)]
struct Script {
    fail_uri_prefix: Option<String>,
    fail_link_prefix: Option<String>,
    fail_state_prefix: Option<String>,
    error_uri_prefix: Option<String>,
    fail_mixer_link: bool,
    probes: HashMap<String, ScriptedProbe>,
}

#[derive(Debug, Clone, Default)]
struct ScriptedProbe {
    /// Silence before the first message.
    stall: Option<Duration>,
    messages: Vec<ProbeMessage>,
}

#[derive(Debug)]
struct MemoryGraph {
    next_stage: u64,
    stages: BTreeMap<StageId, MemoryStage>,
    links: BTreeSet<(StageId, StageId)>,
    mixer_links: BTreeMap<StageId, SlotId>,
    slots: BTreeSet<u32>,
    state: StageState,
    journal: Vec<String>,
    script: Script,
}

impl MemoryGraph {
    fn stage(&self, id: StageId) -> Result<&MemoryStage, BackendError> {
        self.stages.get(&id).ok_or(BackendError::UnknownStage(id))
    }

    fn uri_matches(&self, id: StageId, prefix: &Option<String>) -> bool {
        match (prefix, self.stages.get(&id).and_then(|s| s.uri.as_deref())) {
            (Some(prefix), Some(uri)) => uri.starts_with(prefix.as_str()),
            _ => false,
        }
    }

    fn record(&mut self, entry: String) {
        debug!("memory backend: {}", entry);
        self.journal.push(entry);
    }
}

/// Shared view of a [`MemoryBackend`] for scripting and inspection.
#[derive(Clone)]
pub struct MemoryHandle(Arc<Mutex<MemoryGraph>>);

impl MemoryHandle {
    fn lock(&self) -> MutexGuard<'_, MemoryGraph> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `make_decoder` fails for URIs with this prefix.
    pub fn fail_uri_prefix(&self, prefix: &str) {
        self.lock().script.fail_uri_prefix = Some(prefix.to_string());
    }

    /// Linking a decoder whose URI has this prefix fails.
    pub fn fail_link_prefix(&self, prefix: &str) {
        self.lock().script.fail_link_prefix = Some(prefix.to_string());
    }

    /// Starting a decoder whose URI has this prefix is refused.
    pub fn fail_state_prefix(&self, prefix: &str) {
        self.lock().script.fail_state_prefix = Some(prefix.to_string());
    }

    /// Decoders with this URI prefix start, then report an error instead of a pad.
    pub fn error_uri_prefix(&self, prefix: &str) {
        self.lock().script.error_uri_prefix = Some(prefix.to_string());
    }

    /// Every `link_to_mixer` fails.
    pub fn fail_mixer_link(&self, fail: bool) {
        self.lock().script.fail_mixer_link = fail;
    }

    /// Messages a probe of `uri` will yield, in order. An empty script
    /// behaves like a probe that never finishes.
    pub fn script_probe(&self, uri: &str, messages: Vec<ProbeMessage>) {
        self.lock().script.probes.insert(
            uri.to_string(),
            ScriptedProbe {
                stall: None,
                messages,
            },
        );
    }

    /// Like [`script_probe`](Self::script_probe), but the probe stays silent
    /// for `stall` before yielding anything.
    pub fn script_stalled_probe(&self, uri: &str, stall: Duration, messages: Vec<ProbeMessage>) {
        self.lock().script.probes.insert(
            uri.to_string(),
            ScriptedProbe {
                stall: Some(stall),
                messages,
            },
        );
    }

    pub fn stage_count(&self) -> usize {
        self.lock().stages.len()
    }

    pub fn stages_of(&self, kind: StageKind) -> Vec<StageId> {
        self.lock()
            .stages
            .iter()
            .filter(|(_, s)| s.kind == kind)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn stage_state(&self, stage: StageId) -> Option<StageState> {
        self.lock().stages.get(&stage).map(|s| s.state)
    }

    pub fn is_linked(&self, upstream: StageId, downstream: StageId) -> bool {
        self.lock().links.contains(&(upstream, downstream))
    }

    pub fn allocated_slots(&self) -> Vec<SlotId> {
        self.lock().slots.iter().map(|n| SlotId(*n)).collect()
    }

    pub fn mixer_links(&self) -> usize {
        self.lock().mixer_links.len()
    }

    pub fn graph_state(&self) -> StageState {
        self.lock().state
    }

    /// Every graph operation so far, e.g. `release_slot sink_0`.
    pub fn journal(&self) -> Vec<String> {
        self.lock().journal.clone()
    }
}

pub struct MemoryBackend {
    graph: MemoryHandle,
    events: EventSender,
}

impl MemoryBackend {
    pub fn new(events: EventSender) -> Self {
        let graph = MemoryGraph {
            next_stage: 1,
            stages: BTreeMap::new(),
            links: BTreeSet::new(),
            mixer_links: BTreeMap::new(),
            slots: BTreeSet::new(),
            state: StageState::Null,
            journal: Vec::new(),
            script: Script::default(),
        };
        Self {
            graph: MemoryHandle(Arc::new(Mutex::new(graph))),
            events,
        }
    }

    pub fn handle(&self) -> MemoryHandle {
        self.graph.clone()
    }

    fn add_stage(&mut self, kind: StageKind, uri: Option<&str>) -> StageId {
        let mut graph = self.graph.lock();
        let id = StageId(graph.next_stage);
        graph.next_stage += 1;
        graph.stages.insert(
            id,
            MemoryStage {
                kind,
                uri: uri.map(str::to_string),
                state: StageState::Null,
                announced: false,
            },
        );
        graph.record(format!("add {} {}", kind, id));
        id
    }

    /// Move a stage to `state`, announcing decoders the first time they run.
    fn apply_state(&self, graph: &mut MemoryGraph, stage: StageId, state: StageState) {
        let scripted_error = graph.uri_matches(stage, &graph.script.error_uri_prefix);
        let Some(entry) = graph.stages.get_mut(&stage) else {
            return;
        };
        entry.state = state;

        if entry.kind != StageKind::Decoder || entry.announced || state == StageState::Null {
            return;
        }
        entry.announced = true;

        let event = if scripted_error {
            BackendEvent::Message {
                level: MessageLevel::Error,
                text: format!(
                    "Could not open {}",
                    entry.uri.as_deref().unwrap_or_default()
                ),
            }
        } else {
            BackendEvent::PadAdded { stage }
        };
        // receiver gone means the daemon is shutting down
        let _ = self.events.send(event);
    }
}

impl MediaBackend for MemoryBackend {
    fn make_decoder(&mut self, uri: &str) -> Result<StageId, BackendError> {
        let refused = {
            let graph = self.graph.lock();
            matches!(&graph.script.fail_uri_prefix, Some(p) if uri.starts_with(p.as_str()))
        };
        if refused {
            return Err(BackendError::Open {
                uri: uri.to_string(),
                reason: "scripted failure".to_string(),
            });
        }
        Ok(self.add_stage(StageKind::Decoder, Some(uri)))
    }

    fn make_converter(&mut self) -> Result<StageId, BackendError> {
        Ok(self.add_stage(StageKind::Converter, None))
    }

    fn link(&mut self, upstream: StageId, downstream: StageId) -> Result<(), BackendError> {
        let mut graph = self.graph.lock();
        graph.stage(upstream)?;
        graph.stage(downstream)?;
        if graph.uri_matches(upstream, &graph.script.fail_link_prefix) {
            return Err(BackendError::Link {
                from: upstream.to_string(),
                to: downstream.to_string(),
                reason: "scripted failure".to_string(),
            });
        }
        graph.links.insert((upstream, downstream));
        graph.record(format!("link {} {}", upstream, downstream));
        Ok(())
    }

    fn link_to_mixer(&mut self, converter: StageId) -> Result<SlotId, BackendError> {
        let mut graph = self.graph.lock();
        graph.stage(converter)?;
        if graph.script.fail_mixer_link {
            return Err(BackendError::Link {
                from: converter.to_string(),
                to: "mixer".to_string(),
                reason: "scripted failure".to_string(),
            });
        }
        let slot = (0..).find(|n| !graph.slots.contains(n)).unwrap_or_default();
        graph.slots.insert(slot);
        graph.mixer_links.insert(converter, SlotId(slot));
        graph.record(format!("link_to_mixer {} {}", converter, SlotId(slot)));
        Ok(SlotId(slot))
    }

    fn mixer_peer(&self, converter: StageId) -> Option<SlotId> {
        self.graph.lock().mixer_links.get(&converter).copied()
    }

    fn unlink(&mut self, upstream: StageId, downstream: StageId) -> Result<(), BackendError> {
        let mut graph = self.graph.lock();
        if !graph.links.remove(&(upstream, downstream)) {
            return Err(BackendError::NotLinked(format!("{} -> {}", upstream, downstream)));
        }
        graph.record(format!("unlink {} {}", upstream, downstream));
        Ok(())
    }

    fn unlink_from_mixer(&mut self, converter: StageId) -> Result<(), BackendError> {
        let mut graph = self.graph.lock();
        if graph.mixer_links.remove(&converter).is_none() {
            return Err(BackendError::NotLinked(format!("{} -> mixer", converter)));
        }
        graph.record(format!("unlink_from_mixer {}", converter));
        Ok(())
    }

    fn release_slot(&mut self, slot: SlotId) -> Result<(), BackendError> {
        let mut graph = self.graph.lock();
        if graph.mixer_links.values().any(|s| *s == slot) {
            return Err(BackendError::Link {
                from: slot.to_string(),
                to: "pool".to_string(),
                reason: "slot is still fed".to_string(),
            });
        }
        if !graph.slots.remove(&slot.0) {
            return Err(BackendError::UnknownSlot(slot));
        }
        graph.record(format!("release_slot {}", slot));
        Ok(())
    }

    fn remove(&mut self, stage: StageId) -> Result<(), BackendError> {
        let mut graph = self.graph.lock();
        graph
            .stages
            .remove(&stage)
            .ok_or(BackendError::UnknownStage(stage))?;
        graph.links.retain(|(a, b)| *a != stage && *b != stage);
        graph.mixer_links.remove(&stage);
        graph.record(format!("remove {}", stage));
        Ok(())
    }

    fn set_stage_state(&mut self, stage: StageId, state: StageState) -> Result<(), BackendError> {
        let mut graph = self.graph.lock();
        graph.stage(stage)?;
        if state != StageState::Null && graph.uri_matches(stage, &graph.script.fail_state_prefix) {
            return Err(BackendError::StateChange {
                state,
                reason: "scripted failure".to_string(),
            });
        }
        self.apply_state(&mut graph, stage, state);
        graph.record(format!("state {} {}", stage, state));
        Ok(())
    }

    fn set_graph_state(&mut self, state: StageState) -> Result<(), BackendError> {
        let mut graph = self.graph.lock();
        graph.state = state;
        let stages: Vec<StageId> = graph.stages.keys().copied().collect();
        for stage in stages {
            self.apply_state(&mut graph, stage, state);
        }
        graph.record(format!("graph {}", state));
        Ok(())
    }

    fn graph_state(&self) -> (StageState, Option<StageState>) {
        (self.graph.lock().state, None)
    }

    fn dump_graph(&self, path: &Path) -> Result<(), BackendError> {
        let graph = self.graph.lock();
        let mut dot = String::from("digraph playd {\n");
        for (id, stage) in &graph.stages {
            let _ = writeln!(dot, "    \"{}\" [label=\"{} {}\"];", id, stage.kind, stage.state);
        }
        for (a, b) in &graph.links {
            let _ = writeln!(dot, "    \"{}\" -> \"{}\";", a, b);
        }
        for (converter, slot) in &graph.mixer_links {
            let _ = writeln!(dot, "    \"{}\" -> \"mixer\" [label=\"{}\"];", converter, slot);
        }
        dot.push_str("}\n");
        std::fs::write(path, dot)?;
        Ok(())
    }

    fn probe(&mut self, uri: &str) -> Result<Box<dyn Probe>, BackendError> {
        let graph = self.graph.lock();
        if matches!(&graph.script.fail_uri_prefix, Some(p) if uri.starts_with(p.as_str())) {
            return Err(BackendError::Open {
                uri: uri.to_string(),
                reason: "scripted failure".to_string(),
            });
        }
        let scripted = graph
            .script
            .probes
            .get(uri)
            .cloned()
            .unwrap_or_else(|| ScriptedProbe {
                stall: None,
                messages: vec![ProbeMessage::PrerollDone],
            });
        Ok(Box::new(MemoryProbe {
            stall: scripted.stall,
            messages: scripted.messages.into(),
        }))
    }
}

/// Replays a script on the caller's thread, blocking for stalls the way a
/// real probe blocks on a slow decode.
struct MemoryProbe {
    stall: Option<Duration>,
    messages: VecDeque<ProbeMessage>,
}

impl Probe for MemoryProbe {
    fn next_message(&mut self, timeout: Option<Duration>) -> Option<ProbeMessage> {
        if let Some(stall) = self.stall.take() {
            match timeout {
                Some(timeout) if timeout < stall => {
                    thread::sleep(timeout);
                    self.stall = Some(stall - timeout);
                    return None;
                }
                _ => thread::sleep(stall),
            }
        }

        let message = self.messages.pop_front();
        if message.is_none() {
            // an exhausted script never finishes; only a bounded wait returns
            if let Some(timeout) = timeout {
                thread::sleep(timeout);
            }
        }
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::event_channel;
    use std::time::Instant;

    #[test]
    fn test_stalled_probe_honours_the_wait_bound() {
        let (tx, _rx) = event_channel();
        let mut backend = MemoryBackend::new(tx);
        backend.handle().script_stalled_probe(
            "file:///slow.ogg",
            Duration::from_millis(80),
            vec![ProbeMessage::PrerollDone],
        );

        let mut probe = backend.probe("file:///slow.ogg").unwrap();
        let started = Instant::now();
        assert_eq!(probe.next_message(Some(Duration::from_millis(30))), None);
        assert!(started.elapsed() >= Duration::from_millis(30));

        // the rest of the stall, then the script
        assert_eq!(probe.next_message(None), Some(ProbeMessage::PrerollDone));
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    #[test]
    fn test_lowest_free_slot_is_reused_only_after_release() {
        let (tx, _rx) = event_channel();
        let mut backend = MemoryBackend::new(tx);
        let a = backend.make_converter().unwrap();
        let b = backend.make_converter().unwrap();

        assert_eq!(backend.link_to_mixer(a).unwrap(), SlotId(0));
        backend.unlink_from_mixer(a).unwrap();
        // unlinked but not released: still taken
        assert_eq!(backend.link_to_mixer(b).unwrap(), SlotId(1));

        backend.release_slot(SlotId(0)).unwrap();
        let c = backend.make_converter().unwrap();
        assert_eq!(backend.link_to_mixer(c).unwrap(), SlotId(0));
    }

    #[test]
    fn test_release_of_fed_slot_is_refused() {
        let (tx, _rx) = event_channel();
        let mut backend = MemoryBackend::new(tx);
        let conv = backend.make_converter().unwrap();
        let slot = backend.link_to_mixer(conv).unwrap();
        assert!(backend.release_slot(slot).is_err());
    }

    #[test]
    fn test_decoder_announces_once_when_started() {
        let (tx, mut rx) = event_channel();
        let mut backend = MemoryBackend::new(tx);
        let dec = backend.make_decoder("file:///a.ogg").unwrap();
        assert!(rx.try_recv().is_err());

        backend.set_stage_state(dec, StageState::Playing).unwrap();
        backend.set_graph_state(StageState::Playing).unwrap();
        assert_eq!(rx.try_recv().unwrap(), BackendEvent::PadAdded { stage: dec });
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_scripted_open_error_is_reported_as_message() {
        let (tx, mut rx) = event_channel();
        let mut backend = MemoryBackend::new(tx);
        backend.handle().error_uri_prefix("file:///broken");
        let dec = backend.make_decoder("file:///broken.ogg").unwrap();
        backend.set_stage_state(dec, StageState::Paused).unwrap();

        match rx.try_recv().unwrap() {
            BackendEvent::Message { level, text } => {
                assert_eq!(level, MessageLevel::Error);
                assert!(text.contains("broken.ogg"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_dump_graph_writes_dot() {
        let (tx, _rx) = event_channel();
        let mut backend = MemoryBackend::new(tx);
        let dec = backend.make_decoder("a.ogg").unwrap();
        let conv = backend.make_converter().unwrap();
        backend.link(dec, conv).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.dot");
        backend.dump_graph(&path).unwrap();
        let dot = std::fs::read_to_string(&path).unwrap();
        assert!(dot.starts_with("digraph"));
        assert!(dot.contains("\"stage1\" -> \"stage2\""));
    }
}
