//! Playback session
//!
//! One live mixing graph for the life of the daemon. Each `PLAY` attaches a
//! source sub-graph (decoder -> converter -> mixer slot) while the rest of the
//! graph keeps playing; each `STOP` detaches one again.
//!
//! The decoder's output only becomes linkable some time after it starts, so
//! a new source sits in `Linking` until the backend reports its pad. Backend
//! events are applied on the same task as commands, so a `STOP` can never
//! observe a half-linked source.
//!
//! Detaching follows one order: pause, note the mixer slot, unlink, release
//! the slot, remove the stages. Releasing before unlinking would let the
//! mixer hand the slot to another source while this one still feeds it.

use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use playconf::PlaydConfig;
use playproto::{Reply, TagTable};
use tracing::{debug, info, warn};

use crate::backend::{
    BackendError, BackendEvent, MediaBackend, ProbeMessage, SlotId, StageId, StageState,
};
use crate::publisher::Publisher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(pub u64);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    /// Waiting for the decoder to expose its output
    Linking,
    Playing,
    /// Being torn down; never visible between commands
    Unlinking,
}

impl fmt::Display for SourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linking => write!(f, "linking"),
            Self::Playing => write!(f, "playing"),
            Self::Unlinking => write!(f, "unlinking"),
        }
    }
}

#[derive(Debug)]
struct Source {
    id: SourceId,
    uri: String,
    created_at: DateTime<Utc>,
    decoder: StageId,
    converter: StageId,
    state: SourceState,
}

#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Upper bound on a `TAGS` probe; `None` waits forever.
    pub tags_timeout: Option<Duration>,
    /// Where relative `DUMPGRAPH` paths land.
    pub dot_dir: Option<PathBuf>,
}

impl SessionConfig {
    pub fn from_config(config: &PlaydConfig) -> Self {
        let ms = config.daemon.tags_timeout_ms;
        Self {
            tags_timeout: (ms > 0).then(|| Duration::from_millis(ms)),
            dot_dir: config.audio.dot_dir.clone(),
        }
    }
}

fn log_step(step: &str, result: Result<(), BackendError>) {
    if let Err(e) = result {
        warn!("{} failed: {}", step, e);
    }
}

/// Stages built so far by a `PLAY` that has not finished.
#[derive(Default)]
struct Partial {
    decoder: Option<StageId>,
    converter: Option<StageId>,
    slot: Option<SlotId>,
}

pub struct PlaybackSession {
    backend: Box<dyn MediaBackend>,
    sources: Vec<Source>,
    next_id: u64,
    publisher: Publisher,
    config: SessionConfig,
}

impl PlaybackSession {
    pub fn new(backend: Box<dyn MediaBackend>, publisher: Publisher, config: SessionConfig) -> Self {
        Self {
            backend,
            sources: Vec::new(),
            next_id: 1,
            publisher,
            config,
        }
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    pub fn source_ids(&self) -> Vec<SourceId> {
        self.sources.iter().map(|s| s.id).collect()
    }

    pub fn source_state(&self, id: SourceId) -> Option<SourceState> {
        self.sources.iter().find(|s| s.id == id).map(|s| s.state)
    }

    /// `PLAY <uri>`
    pub fn play(&mut self, uri: &str) -> Reply {
        let mut partial = Partial::default();
        match self.attach(uri, &mut partial) {
            Ok(id) => {
                info!("source {} playing {}", id, uri);
                Reply::ok_with(format!("player id: {}", id))
            }
            Err(e) => {
                warn!("cannot load {}: {}", uri, e);
                self.sources.retain(|s| Some(s.decoder) != partial.decoder);
                self.rollback(partial);
                Reply::fail(format!("Can't load source: {}", uri))
            }
        }
    }

    fn attach(&mut self, uri: &str, partial: &mut Partial) -> Result<SourceId, BackendError> {
        let decoder = self.backend.make_decoder(uri)?;
        partial.decoder = Some(decoder);
        let converter = self.backend.make_converter()?;
        partial.converter = Some(converter);
        partial.slot = Some(self.backend.link_to_mixer(converter)?);

        let id = SourceId(self.next_id);
        self.next_id += 1;
        // registered before starting so the pad notification finds it
        self.sources.push(Source {
            id,
            uri: uri.to_string(),
            created_at: Utc::now(),
            decoder,
            converter,
            state: SourceState::Linking,
        });

        let (current, pending) = self.backend.graph_state();
        if current == StageState::Playing || pending == Some(StageState::Playing) {
            self.backend.set_stage_state(converter, StageState::Playing)?;
            self.backend.set_stage_state(decoder, StageState::Playing)?;
        } else {
            self.backend.set_graph_state(StageState::Playing)?;
        }
        Ok(id)
    }

    /// Undo a failed `PLAY`, newest step first. Never touches other sources.
    fn rollback(&mut self, partial: Partial) {
        if let (Some(converter), Some(slot)) = (partial.converter, partial.slot) {
            log_step("unlink from mixer", self.backend.unlink_from_mixer(converter));
            log_step("release slot", self.backend.release_slot(slot));
        }
        if let Some(converter) = partial.converter {
            log_step("remove converter", self.backend.remove(converter));
        }
        if let Some(decoder) = partial.decoder {
            log_step("remove decoder", self.backend.remove(decoder));
        }
    }

    /// `STOP <id>`
    pub fn stop(&mut self, argument: &str) -> Reply {
        let Ok(id) = argument.trim().parse::<u64>().map(SourceId) else {
            return Reply::fail("id is invalid");
        };
        let Some(index) = self.sources.iter().position(|s| s.id == id) else {
            return Reply::fail("id is invalid");
        };

        let source = self.sources.remove(index);
        self.detach(source);
        Reply::ok_with(format!("player id: {}", id))
    }

    fn detach(&mut self, mut source: Source) {
        let was_linked = source.state == SourceState::Playing;
        source.state = SourceState::Unlinking;
        debug!("source {} {}", source.id, source.state);

        log_step(
            "pause decoder",
            self.backend.set_stage_state(source.decoder, StageState::Paused),
        );
        log_step(
            "pause converter",
            self.backend.set_stage_state(source.converter, StageState::Paused),
        );

        let slot = self.backend.mixer_peer(source.converter);
        if was_linked {
            log_step("unlink decoder", self.backend.unlink(source.decoder, source.converter));
        }
        if let Some(slot) = slot {
            log_step("unlink from mixer", self.backend.unlink_from_mixer(source.converter));
            log_step("release slot", self.backend.release_slot(slot));
        }
        log_step("remove converter", self.backend.remove(source.converter));
        log_step("remove decoder", self.backend.remove(source.decoder));

        let age = Utc::now().signed_duration_since(source.created_at);
        info!(
            "source {} stopped after {}s: {}",
            source.id,
            age.num_seconds(),
            source.uri
        );
    }

    /// `TAGS <uri>`: probe a file on a throwaway pipeline.
    pub fn tags(&mut self, uri: &str) -> Reply {
        let mut probe = match self.backend.probe(uri) {
            Ok(probe) => probe,
            Err(e) => return Reply::fail(e.to_string()),
        };

        let deadline = self.config.tags_timeout.map(|t| Instant::now() + t);
        let mut table = TagTable::new();

        loop {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            match probe.next_message(remaining) {
                Some(ProbeMessage::Tags(tags)) => table.insert_list(&tags),
                Some(ProbeMessage::Error(message)) => return Reply::fail(message),
                Some(ProbeMessage::PrerollDone) => break,
                None => return Reply::fail(format!("Timed out reading tags from {}", uri)),
            }
        }

        debug!("{} tags from {}", table.len(), uri);
        Reply::Lines(table.to_lines())
    }

    /// `DUMPGRAPH <path>`: always OK; failures only reach the log.
    pub fn dump_graph(&self, argument: &str) -> Reply {
        let path = self.dot_path(argument);
        match self.backend.dump_graph(&path) {
            Ok(()) => info!("graph written to {}", path.display()),
            Err(e) => warn!("cannot write graph to {}: {}", path.display(), e),
        }
        Reply::ok()
    }

    fn dot_path(&self, argument: &str) -> PathBuf {
        let name = if argument.is_empty() { "playd" } else { argument };
        let mut path = PathBuf::from(name);
        if path.extension().is_none() {
            path.set_extension("dot");
        }
        match &self.config.dot_dir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path,
        }
    }

    /// `LIST`: one `<id> <state> <uri>` line per source.
    pub fn list(&self) -> Reply {
        Reply::Lines(
            self.sources
                .iter()
                .map(|s| format!("{} {} {}", s.id, s.state, s.uri))
                .collect(),
        )
    }

    pub fn handle_event(&mut self, event: &BackendEvent) {
        match event {
            BackendEvent::PadAdded { stage } => self.link_pending(*stage),
            BackendEvent::Message { level, text } => {
                self.publisher.publish(format!("{}: {}", level, text));
            }
        }
    }

    fn link_pending(&mut self, decoder: StageId) {
        let Some(index) = self
            .sources
            .iter()
            .position(|s| s.decoder == decoder && s.state == SourceState::Linking)
        else {
            debug!("pad from {} has no pending source", decoder);
            return;
        };

        let (id, converter) = (self.sources[index].id, self.sources[index].converter);
        match self.backend.link(decoder, converter) {
            Ok(()) => {
                self.sources[index].state = SourceState::Playing;
                debug!("source {} linked", id);
            }
            Err(e) => {
                warn!("source {} cannot link: {}", id, e);
                self.publisher.publish(format!("ERROR: {}", e));
            }
        }
    }

    /// Stop every source, then the graph.
    pub fn teardown(&mut self) {
        for source in std::mem::take(&mut self.sources) {
            self.detach(source);
        }
        if let Err(e) = self.backend.set_graph_state(StageState::Null) {
            warn!("failed to stop graph: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryHandle;
    use crate::backend::{event_channel, EventReceiver, MemoryBackend, MessageLevel, StageKind};
    use playproto::TagValue;
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Harness {
        session: PlaybackSession,
        graph: MemoryHandle,
        events: EventReceiver,
        published: UnboundedReceiver<String>,
    }

    impl Harness {
        fn new(config: SessionConfig) -> Self {
            let (tx, events) = event_channel();
            let backend = MemoryBackend::new(tx);
            let graph = backend.handle();
            let (publisher, published) = Publisher::detached("tcp://127.0.0.1:18001");
            Self {
                session: PlaybackSession::new(Box::new(backend), publisher, config),
                graph,
                events,
                published,
            }
        }

        /// Apply queued backend events, as the server loop would.
        fn pump(&mut self) {
            while let Ok(event) = self.events.try_recv() {
                self.session.handle_event(&event);
            }
        }

        fn play(&mut self, uri: &str) -> String {
            let reply = self.session.play(uri).to_string();
            self.pump();
            reply
        }
    }

    fn harness() -> Harness {
        Harness::new(SessionConfig::default())
    }

    #[test]
    fn test_play_links_source_and_starts_graph() {
        let mut h = harness();
        assert_eq!(h.play("file:///a.ogg"), "OK player id: 1");

        assert_eq!(h.session.source_state(SourceId(1)), Some(SourceState::Playing));
        assert_eq!(h.graph.graph_state(), StageState::Playing);
        let dec = h.graph.stages_of(StageKind::Decoder)[0];
        let conv = h.graph.stages_of(StageKind::Converter)[0];
        assert!(h.graph.is_linked(dec, conv));
        assert_eq!(h.graph.allocated_slots(), vec![SlotId(0)]);
    }

    #[test]
    fn test_second_play_starts_only_its_own_stages() {
        let mut h = harness();
        h.play("file:///a.ogg");
        assert_eq!(h.play("file:///b.ogg"), "OK player id: 2");

        let journal = h.graph.journal();
        assert_eq!(journal.iter().filter(|e| *e == "graph playing").count(), 1);
        assert!(journal.contains(&"state stage3 playing".to_string()));
        assert!(journal.contains(&"state stage4 playing".to_string()));
    }

    #[test]
    fn test_play_stop_in_any_order_empties_session() {
        for reverse in [false, true] {
            let mut h = harness();
            h.play("file:///a.ogg");
            h.play("file:///b.ogg");

            let order = if reverse { ["2", "1"] } else { ["1", "2"] };
            for id in order {
                assert_eq!(h.session.stop(id).to_string(), format!("OK player id: {}", id));
            }
            assert_eq!(h.session.source_count(), 0);
            assert_eq!(h.graph.stage_count(), 0);
            assert!(h.graph.allocated_slots().is_empty());
        }
    }

    #[test]
    fn test_stop_twice_fails_the_second_time() {
        let mut h = harness();
        h.play("file:///a.ogg");
        assert_eq!(h.session.stop("1").to_string(), "OK player id: 1");
        assert_eq!(h.session.stop("1").to_string(), "FAIL id is invalid");
    }

    #[test]
    fn test_stop_rejects_unknown_and_garbage_ids() {
        let mut h = harness();
        h.play("file:///a.ogg");
        for arg in ["7", "", "one", "-1"] {
            assert_eq!(h.session.stop(arg).to_string(), "FAIL id is invalid");
        }
        assert_eq!(h.session.source_count(), 1);
    }

    #[test]
    fn test_stop_releases_slot_only_after_unlink() {
        let mut h = harness();
        h.play("file:///a.ogg");
        h.session.stop("1");

        let journal = h.graph.journal();
        let pos = |entry: &str| {
            journal
                .iter()
                .position(|e| e == entry)
                .unwrap_or_else(|| panic!("{} missing from {:?}", entry, journal))
        };
        assert!(pos("state stage1 paused") < pos("unlink stage1 stage2"));
        assert!(pos("unlink stage1 stage2") < pos("unlink_from_mixer stage2"));
        assert!(pos("unlink_from_mixer stage2") < pos("release_slot sink_0"));
        assert!(pos("release_slot sink_0") < pos("remove stage2"));
        assert!(pos("release_slot sink_0") < pos("remove stage1"));
    }

    #[test]
    fn test_ids_are_never_reused() {
        let mut h = harness();
        h.play("file:///a.ogg");
        h.session.stop("1");
        assert_eq!(h.play("file:///a.ogg"), "OK player id: 2");
        // the freed slot is handed out again
        assert_eq!(h.graph.allocated_slots(), vec![SlotId(0)]);
    }

    #[test]
    fn test_construction_failure_leaves_nothing_behind() {
        let mut h = harness();
        h.graph.fail_uri_prefix("file:///bad");
        assert_eq!(
            h.play("file:///bad.ogg"),
            "FAIL Can't load source: file:///bad.ogg"
        );
        assert_eq!(h.session.source_count(), 0);
        assert_eq!(h.graph.stage_count(), 0);
    }

    #[test]
    fn test_mixer_link_failure_rolls_back() {
        let mut h = harness();
        h.graph.fail_mixer_link(true);
        assert!(h.play("file:///a.ogg").starts_with("FAIL"));
        assert_eq!(h.graph.stage_count(), 0);
        assert!(h.graph.allocated_slots().is_empty());
    }

    #[test]
    fn test_state_failure_rolls_back_only_the_new_source() {
        let mut h = harness();
        h.play("file:///good.ogg");
        h.graph.fail_state_prefix("file:///stuck");

        assert_eq!(
            h.play("file:///stuck.ogg"),
            "FAIL Can't load source: file:///stuck.ogg"
        );
        assert_eq!(h.session.source_ids(), vec![SourceId(1)]);
        assert_eq!(h.graph.stage_count(), 2);
        assert_eq!(h.graph.allocated_slots(), vec![SlotId(0)]);
        assert_eq!(h.graph.mixer_links(), 1);
    }

    #[test]
    fn test_link_failure_is_published_and_source_stays_stoppable() {
        let mut h = harness();
        h.graph.fail_link_prefix("file:///odd");
        assert_eq!(h.play("file:///odd.ogg"), "OK player id: 1");

        assert_eq!(h.session.source_state(SourceId(1)), Some(SourceState::Linking));
        let published = h.published.try_recv().unwrap();
        assert!(published.starts_with("ERROR: cannot link stage1 to stage2"));

        assert_eq!(h.session.stop("1").to_string(), "OK player id: 1");
        assert_eq!(h.graph.stage_count(), 0);
        assert!(h.graph.allocated_slots().is_empty());
    }

    #[test]
    fn test_backend_messages_are_published_with_level() {
        let mut h = harness();
        h.session.handle_event(&BackendEvent::Message {
            level: MessageLevel::Warning,
            text: "clock skew".to_string(),
        });
        assert_eq!(h.published.try_recv().unwrap(), "WARNING: clock skew");
    }

    #[test]
    fn test_pad_for_stopped_source_is_ignored() {
        let mut h = harness();
        h.session.play("file:///a.ogg");
        // stop before the pad notification is applied
        h.session.stop("1");
        h.pump();
        assert_eq!(h.graph.stage_count(), 0);
        assert!(h.published.try_recv().is_err());
    }

    #[test]
    fn test_tags_collects_until_preroll() {
        let mut h = harness();
        h.graph.script_probe(
            "file:///song.flac",
            vec![
                ProbeMessage::Tags(vec![
                    ("title".to_string(), vec![TagValue::Str("Song".to_string())]),
                    (
                        "artist".to_string(),
                        vec![TagValue::Str("A".to_string()), TagValue::Str("B".to_string())],
                    ),
                ]),
                ProbeMessage::Tags(vec![("bitrate".to_string(), vec![TagValue::UInt(320)])]),
                ProbeMessage::PrerollDone,
            ],
        );

        let reply = h.session.tags("file:///song.flac").to_string();
        assert_eq!(
            reply,
            "OK\ntitle_0\nSong\nartist_0\nA\nartist_1\nB\nbitrate_0\n320"
        );
        assert_eq!(reply.lines().skip(1).count() % 2, 0);
    }

    #[test]
    fn test_tags_error_fails() {
        let mut h = harness();
        h.graph.script_probe(
            "file:///broken.ogg",
            vec![
                ProbeMessage::Tags(vec![("title".to_string(), vec![TagValue::Str("x".to_string())])]),
                ProbeMessage::Error("Could not demultiplex stream.".to_string()),
            ],
        );
        assert_eq!(
            h.session.tags("file:///broken.ogg").to_string(),
            "FAIL Could not demultiplex stream."
        );
    }

    #[test]
    fn test_tags_stall_times_out() {
        let mut h = Harness::new(SessionConfig {
            tags_timeout: Some(Duration::from_millis(50)),
            dot_dir: None,
        });
        h.graph.script_stalled_probe(
            "file:///slow.ogg",
            Duration::from_secs(30),
            vec![ProbeMessage::PrerollDone],
        );

        let started = Instant::now();
        assert_eq!(
            h.session.tags("file:///slow.ogg").to_string(),
            "FAIL Timed out reading tags from file:///slow.ogg"
        );
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(50), "returned after {:?}", waited);
        assert!(waited < Duration::from_secs(5), "waited {:?}", waited);
        assert_eq!(h.session.source_count(), 0);
    }

    #[test]
    fn test_tags_deadline_spans_the_whole_probe() {
        let mut h = Harness::new(SessionConfig {
            tags_timeout: Some(Duration::from_millis(100)),
            dot_dir: None,
        });
        // tags arrive after 60 ms, then the probe never finishes
        h.graph.script_stalled_probe(
            "file:///slow.ogg",
            Duration::from_millis(60),
            vec![ProbeMessage::Tags(vec![(
                "title".to_string(),
                vec![TagValue::Str("Late".to_string())],
            )])],
        );

        let started = Instant::now();
        assert_eq!(
            h.session.tags("file:///slow.ogg").to_string(),
            "FAIL Timed out reading tags from file:///slow.ogg"
        );
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(100), "returned after {:?}", waited);
        assert!(waited < Duration::from_millis(1000), "waited {:?}", waited);
    }

    #[test]
    fn test_unbounded_tags_wait_out_a_stall() {
        let mut config = PlaydConfig::default();
        config.daemon.tags_timeout_ms = 0;
        let mut h = Harness::new(SessionConfig::from_config(&config));
        assert_eq!(h.session.config.tags_timeout, None);

        h.graph.script_stalled_probe(
            "file:///slow.ogg",
            Duration::from_millis(80),
            vec![
                ProbeMessage::Tags(vec![(
                    "title".to_string(),
                    vec![TagValue::Str("Late".to_string())],
                )]),
                ProbeMessage::PrerollDone,
            ],
        );

        let started = Instant::now();
        assert_eq!(
            h.session.tags("file:///slow.ogg").to_string(),
            "OK\ntitle_0\nLate"
        );
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    #[test]
    fn test_dump_graph_always_ok() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = Harness::new(SessionConfig {
            tags_timeout: None,
            dot_dir: Some(dir.path().to_path_buf()),
        });
        h.play("file:///a.ogg");

        assert_eq!(h.session.dump_graph("").to_string(), "OK");
        assert!(dir.path().join("playd.dot").exists());

        assert_eq!(h.session.dump_graph("snap").to_string(), "OK");
        assert!(dir.path().join("snap.dot").exists());

        assert_eq!(
            h.session.dump_graph("/nonexistent/dir/x.dot").to_string(),
            "OK"
        );
    }

    #[test]
    fn test_list_shows_sources_in_id_order() {
        let mut h = harness();
        assert_eq!(h.session.list().to_string(), "OK");
        h.play("file:///a.ogg");
        h.play("file:///b.ogg");
        assert_eq!(
            h.session.list().to_string(),
            "OK\n1 playing file:///a.ogg\n2 playing file:///b.ogg"
        );
    }

    #[test]
    fn test_teardown_stops_everything() {
        let mut h = harness();
        h.play("file:///a.ogg");
        h.play("file:///b.ogg");
        h.session.teardown();

        assert_eq!(h.session.source_count(), 0);
        assert_eq!(h.graph.stage_count(), 0);
        assert!(h.graph.allocated_slots().is_empty());
        assert_eq!(h.graph.graph_state(), StageState::Null);
    }
}
