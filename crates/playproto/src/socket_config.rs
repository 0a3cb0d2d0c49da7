//! Centralized ZMQ socket configuration for playd and its clients.
//!
//! All socket setup goes through these helpers so every peer gets the same
//! linger and reconnect behaviour.
//!
//! The daemon's request/reply socket is a raw `zmq` REP socket: the server
//! loop drains it with `zmq::DONTWAIT` once per tick. The publish, subscribe
//! and request sides are `tmq` sockets driven by tokio.

use anyhow::{Context, Result};
use futures::{Sink, Stream};
use tracing::warn;

pub use tmq::{Context as ZmqContext, Multipart, TmqError};

/// Linger on the daemon's request/reply socket at close, in milliseconds
pub const DEFAULT_REPLY_LINGER_MS: i32 = 5_000;

/// Linger on the daemon's publish socket at close, in milliseconds
pub const DEFAULT_PUBLISH_LINGER_MS: i32 = 15_000;

/// Linger on client sockets; a one-shot client should not hang on exit
pub const DEFAULT_CLIENT_LINGER_MS: i32 = 0;

/// Default reconnect interval in milliseconds
pub const DEFAULT_RECONNECT_IVL_MS: i32 = 1000;

/// Maximum reconnect interval in milliseconds (60 seconds)
/// Caps exponential backoff to prevent hours-long delays
pub const DEFAULT_RECONNECT_IVL_MAX_MS: i32 = 60_000;

/// Build a single-frame message from text.
pub fn text_to_multipart(text: &str) -> Multipart {
    vec![text.as_bytes().to_vec()].into()
}

/// Join every frame of a message into text, lossily.
pub fn multipart_to_text(mp: Multipart) -> String {
    let bytes: Vec<u8> = mp.into_iter().flat_map(|m| m.to_vec()).collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Create a REP socket and bind it.
///
/// Receives are expected to use `zmq::DONTWAIT`; the socket itself never blocks
/// the caller except on close, for at most `linger_ms`.
pub fn create_reply_and_bind(
    ctx: &ZmqContext,
    endpoint: &str,
    linger_ms: i32,
    name: &str,
) -> Result<zmq::Socket> {
    let socket = ctx
        .socket(zmq::REP)
        .with_context(|| format!("Failed to create {} REP socket", name))?;

    if let Err(e) = socket.set_linger(linger_ms) {
        warn!("{}: Failed to set LINGER: {}", name, e);
    }

    socket
        .bind(endpoint)
        .with_context(|| format!("Failed to bind {} socket to {}", name, endpoint))?;

    Ok(socket)
}

/// Create a PUB socket and bind it.
pub fn create_publisher_and_bind(
    ctx: &ZmqContext,
    endpoint: &str,
    linger_ms: i32,
    name: &str,
) -> Result<impl Sink<Multipart, Error = TmqError> + Unpin + Send> {
    tmq::publish(ctx)
        .set_linger(linger_ms)
        .bind(endpoint)
        .with_context(|| format!("Failed to bind {} PUB socket to {}", name, endpoint))
}

/// Create a SUB socket subscribed to every message, then connect it.
pub fn create_subscriber_and_connect(
    ctx: &ZmqContext,
    endpoint: &str,
    name: &str,
) -> Result<impl Stream<Item = Result<Multipart, TmqError>> + Unpin + Send> {
    tmq::subscribe(ctx)
        .set_linger(DEFAULT_CLIENT_LINGER_MS)
        .set_reconnect_ivl(DEFAULT_RECONNECT_IVL_MS)
        .set_reconnect_ivl_max(DEFAULT_RECONNECT_IVL_MAX_MS)
        .connect(endpoint)
        .with_context(|| format!("Failed to connect {} SUB socket to {}", name, endpoint))?
        // empty prefix: receive everything
        .subscribe(b"")
        .with_context(|| format!("Failed to subscribe {} socket", name))
}

/// Send one text request on a fresh REQ socket and wait for its reply.
pub async fn request_once(ctx: &ZmqContext, endpoint: &str, text: &str, name: &str) -> Result<Multipart> {
    let sender = tmq::request(ctx)
        .set_linger(DEFAULT_CLIENT_LINGER_MS)
        .connect(endpoint)
        .with_context(|| format!("Failed to connect {} REQ socket to {}", name, endpoint))?;

    let receiver = sender
        .send(text_to_multipart(text))
        .await
        .with_context(|| format!("{}: failed to send request", name))?;

    let (reply, _sender) = receiver
        .recv()
        .await
        .with_context(|| format!("{}: failed to receive reply", name))?;

    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lingers() {
        assert_eq!(DEFAULT_REPLY_LINGER_MS, 5_000);
        assert_eq!(DEFAULT_PUBLISH_LINGER_MS, 15_000);
        assert!(DEFAULT_RECONNECT_IVL_MAX_MS > DEFAULT_RECONNECT_IVL_MS);
    }

    #[test]
    fn test_text_multipart_roundtrip() {
        let mp = text_to_multipart("INFO: stream started");
        assert_eq!(multipart_to_text(mp), "INFO: stream started");
    }
}
