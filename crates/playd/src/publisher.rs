//! Event publisher
//!
//! Fire-and-forget broadcast of text lines to passive listeners. Handles are
//! cheap clones of an unbounded channel; a single task owns the PUB socket
//! and drains the channel into it. Slow or absent subscribers just miss
//! messages.

use anyhow::Result;
use futures::{Sink, SinkExt};
use playproto::socket_config::{create_publisher_and_bind, text_to_multipart, Multipart, TmqError, ZmqContext};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Handle for publishing lines.
#[derive(Clone)]
pub struct Publisher {
    tx: mpsc::UnboundedSender<String>,
    address: String,
}

impl Publisher {
    /// A publisher with no socket behind it, plus the receiving end.
    pub fn detached(address: &str) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                address: address.to_string(),
            },
            rx,
        )
    }

    /// Connectable address of the publish socket.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Queue `text` for broadcast. Never blocks.
    pub fn publish(&self, text: impl Into<String>) {
        if let Err(e) = self.tx.send(text.into()) {
            debug!("publisher is gone, dropping: {}", e.0);
        }
    }
}

/// Owns the PUB socket.
pub struct PublisherServer<S> {
    socket: S,
    endpoint: String,
    rx: mpsc::UnboundedReceiver<String>,
}

/// Bind the PUB socket at `endpoint` and return the server plus the first
/// handle. `address` is what handles report to clients.
pub fn bind(
    ctx: &ZmqContext,
    endpoint: &str,
    address: &str,
    linger_ms: i32,
) -> Result<(
    PublisherServer<impl Sink<Multipart, Error = TmqError> + Unpin + Send>,
    Publisher,
)> {
    let socket = create_publisher_and_bind(ctx, endpoint, linger_ms, "publisher")?;
    let (publisher, rx) = Publisher::detached(address);
    info!("publishing events on {} (clients use {})", endpoint, address);
    Ok((
        PublisherServer {
            socket,
            endpoint: endpoint.to_string(),
            rx,
        },
        publisher,
    ))
}

impl<S> PublisherServer<S>
where
    S: Sink<Multipart, Error = TmqError> + Unpin + Send,
{
    /// Run until every [`Publisher`] handle is dropped.
    pub async fn run(mut self) {
        while let Some(text) = self.rx.recv().await {
            debug!("publish: {}", text);
            if let Err(e) = self.socket.send(text_to_multipart(&text)).await {
                warn!("failed to publish on {}: {}", self.endpoint, e);
            }
        }
        info!("publisher on {} shutting down", self.endpoint);
    }
}
