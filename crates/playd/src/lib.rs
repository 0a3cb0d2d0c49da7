//! playd - a small audio mixing daemon driven over ZMQ
//!
//! Clients send one-line text commands on a request/reply socket and get one
//! reply each. Every `PLAY` adds a source (decoder and converter) feeding its
//! own slot on a shared mixer; `STOP` takes it out again without disturbing
//! the others. Asynchronous notices go out on a publish socket.
//!
//! ```text
//!  REP socket ──► ServerLoop ──► Dispatcher ──► Ping / Control / Playback
//!                     ▲                                        │
//!                     └──── BackendEvent ◄──── MediaBackend ◄──┘
//!                                                   │
//!  PUB socket ◄── PublisherServer ◄── Publisher ◄───┘ (messages)
//! ```
//!
//! The native backend decodes with symphonia on one thread per source, mixes
//! in-process and renders to a null, WAV or PipeWire sink. The memory backend
//! records the graph without touching audio and backs the tests.

pub mod backend;
pub mod commands;
pub mod daemon;
pub mod dispatch;
pub mod plugins;
pub mod publisher;
pub mod server;
pub mod session;

pub use backend::{BackendError, BackendEvent, MediaBackend, MemoryBackend, NativeBackend};
pub use daemon::{build_dispatcher, Daemon};
pub use dispatch::{Dispatcher, Plugin, RegisterError, Services};
pub use plugins::Builtin;
pub use publisher::Publisher;
pub use server::{ReplyTransport, ServerLoop, TransportError, ZmqReplySocket};
pub use session::{PlaybackSession, SessionConfig, SourceId, SourceState};
