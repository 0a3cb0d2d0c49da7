//! playproto - wire protocol for the playd control and event sockets
//!
//! playd speaks plain text. A client sends one line per request on a
//! request/reply socket and gets exactly one line of text back:
//!
//! ```text
//! -> PLAY file:///music/one.ogg
//! <- OK player id: 1
//! -> STOP 7
//! <- FAIL id is invalid
//! ```
//!
//! Requests are `VERB` or `VERB argument` where the verb is uppercase ASCII.
//! Replies start with `OK` or `FAIL`. Anything that is not a valid request
//! gets `FAIL Message is Invalid`.
//!
//! A second, publish/subscribe socket carries asynchronous notices from the
//! daemon (`ERROR: ...`, `WARNING: ...`, `INFO: ...`, ping echoes). Both
//! addresses derive from one base port; see [`Endpoints`].
//!
//! The `peer` feature (on by default) adds ZMQ socket helpers, a one-shot
//! client and a listener.

pub mod command;
pub mod endpoints;
pub mod reply;
pub mod tags;

#[cfg(feature = "peer")]
pub mod client;
#[cfg(feature = "peer")]
pub mod socket_config;

pub use command::Command;
pub use endpoints::{connectable, Endpoints};
pub use reply::{Reply, INVALID_MESSAGE};
pub use tags::{parse_tag_reply, TagList, TagTable, TagValue};

#[cfg(feature = "peer")]
pub use client::{send_line, Listener};

use thiserror::Error;

/// Errors from parsing requests or deriving addresses.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("empty message")]
    Empty,

    #[error("message does not start with an uppercase verb")]
    InvalidVerb,

    #[error("verb followed by a space but no argument")]
    MissingArgument,

    #[error("message is not valid UTF-8")]
    Utf8,

    #[error("base port {0} leaves no room for the derived socket ports")]
    PortOutOfRange(u16),
}
