//! Playback verbs: `PLAY`, `STOP`, `TAGS`, `DUMPGRAPH`, `LIST`.
//!
//! The plugin is half-built when its session could not be constructed
//! (no backend); it then refuses to register.

use playproto::Reply;
use tracing::{debug, info};

use crate::backend::BackendEvent;
use crate::dispatch::{Plugin, RegisterError};
use crate::session::PlaybackSession;

const VERBS: &[&str] = &["PLAY", "STOP", "TAGS", "DUMPGRAPH", "LIST"];

pub struct Playback {
    session: Option<PlaybackSession>,
}

impl Playback {
    pub fn new(session: Option<PlaybackSession>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> Option<&PlaybackSession> {
        self.session.as_ref()
    }
}

impl Plugin for Playback {
    fn name(&self) -> &'static str {
        "playback"
    }

    fn register(&self) -> Result<&'static [&'static str], RegisterError> {
        match self.session {
            Some(_) => Ok(VERBS),
            None => Err(RegisterError::NotReady("playback")),
        }
    }

    fn handle(&mut self, verb: &str, argument: Option<&str>) -> String {
        let Some(session) = self.session.as_mut() else {
            return Reply::invalid().to_string();
        };
        let argument = argument.unwrap_or_default();

        let reply = match verb {
            "PLAY" => session.play(argument),
            "STOP" => session.stop(argument),
            "TAGS" => session.tags(argument),
            "DUMPGRAPH" => session.dump_graph(argument),
            "LIST" => session.list(),
            _ => Reply::invalid(),
        };
        reply.to_string()
    }

    fn on_backend_event(&mut self, event: &BackendEvent) {
        match self.session.as_mut() {
            Some(session) => session.handle_event(event),
            None => debug!("no session for {:?}", event),
        }
    }

    fn destroy(&mut self) {
        if let Some(mut session) = self.session.take() {
            info!("tearing down playback session");
            session.teardown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{event_channel, MemoryBackend};
    use crate::publisher::Publisher;
    use crate::session::SessionConfig;

    #[test]
    fn test_half_built_plugin_refuses_registration() {
        let playback = Playback::new(None);
        assert!(matches!(
            playback.register(),
            Err(RegisterError::NotReady("playback"))
        ));
    }

    #[test]
    fn test_destroy_tears_session_down_once() {
        let (tx, _rx) = event_channel();
        let backend = MemoryBackend::new(tx);
        let graph = backend.handle();
        let (publisher, _published) = Publisher::detached("tcp://127.0.0.1:18001");
        let session = PlaybackSession::new(Box::new(backend), publisher, SessionConfig::default());

        let mut playback = Playback::new(Some(session));
        assert!(playback.handle("PLAY", Some("file:///a.ogg")).starts_with("OK player id: "));
        assert_eq!(graph.stage_count(), 2);

        playback.destroy();
        assert_eq!(graph.stage_count(), 0);
        assert!(playback.session().is_none());
        playback.destroy();
    }
}
