//! One-shot control client and publish-channel listener.

use std::pin::Pin;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures::{Stream, StreamExt};
use tracing::debug;

use crate::socket_config::{
    create_subscriber_and_connect, multipart_to_text, request_once, Multipart, TmqError,
    ZmqContext,
};

/// Send one line to the daemon and return its reply text.
///
/// The request protocol allows one outstanding request per socket, so each
/// call uses its own REQ socket and closes it afterwards.
pub async fn send_line(endpoint: &str, line: &str, timeout: Duration) -> Result<String> {
    let ctx = ZmqContext::new();
    debug!("sending {:?} to {}", line, endpoint);

    let reply = tokio::time::timeout(timeout, request_once(&ctx, endpoint, line, "client"))
        .await
        .map_err(|_| anyhow!("no reply from {} within {:?}", endpoint, timeout))??;

    Ok(multipart_to_text(reply))
}

type BoxedStream = Pin<Box<dyn Stream<Item = Result<Multipart, TmqError>> + Send>>;

/// Passive subscriber to the daemon's publish socket.
pub struct Listener {
    #[allow(dead_code)]
    context: ZmqContext,
    endpoint: String,
    sub: BoxedStream,
}

impl Listener {
    /// Subscribe to every message published at `endpoint`.
    ///
    /// Connecting is lazy; messages published before the connection completes
    /// are missed.
    pub fn connect(endpoint: &str) -> Result<Self> {
        let context = ZmqContext::new();
        let sub = create_subscriber_and_connect(&context, endpoint, "listener")?;
        Ok(Self {
            context,
            endpoint: endpoint.to_string(),
            sub: Box::pin(sub),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Wait for the next published line.
    pub async fn recv(&mut self) -> Result<String> {
        let mp = self
            .sub
            .next()
            .await
            .ok_or_else(|| anyhow!("subscription to {} ended", self.endpoint))?
            .context("Failed to receive")?;
        Ok(multipart_to_text(mp))
    }
}
