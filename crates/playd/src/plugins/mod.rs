//! Built-in verb families.

pub mod control;
pub mod ping;
pub mod playback;

pub use control::Control;
pub use ping::Ping;
pub use playback::Playback;

use crate::backend::BackendEvent;
use crate::dispatch::{Plugin, RegisterError};

/// The closed set of plugins the daemon registers.
pub enum Builtin {
    Ping(Ping),
    Control(Control),
    Playback(Playback),
}

impl Builtin {
    fn inner(&self) -> &dyn Plugin {
        match self {
            Self::Ping(p) => p,
            Self::Control(p) => p,
            Self::Playback(p) => p,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn Plugin {
        match self {
            Self::Ping(p) => p,
            Self::Control(p) => p,
            Self::Playback(p) => p,
        }
    }
}

impl Plugin for Builtin {
    fn name(&self) -> &'static str {
        self.inner().name()
    }

    fn register(&self) -> Result<&'static [&'static str], RegisterError> {
        self.inner().register()
    }

    fn handle(&mut self, verb: &str, argument: Option<&str>) -> String {
        self.inner_mut().handle(verb, argument)
    }

    fn on_backend_event(&mut self, event: &BackendEvent) {
        self.inner_mut().on_backend_event(event)
    }

    fn destroy(&mut self) {
        self.inner_mut().destroy()
    }
}
