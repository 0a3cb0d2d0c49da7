//! Request/reply server loop
//!
//! Once per tick the loop drains every queued request: receive, dispatch,
//! reply, until the transport would block. Backend events are applied on the
//! same task between ticks, so command handling and graph notifications never
//! race. The shutdown token is checked once per tick.

use std::time::Duration;

use playproto::socket_config::{create_reply_and_bind, ZmqContext};
use playproto::Reply;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::EventReceiver;
use crate::dispatch::{Dispatcher, Plugin};
use crate::plugins::Builtin;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("receive failed: {0}")]
    Recv(String),

    #[error("send failed: {0}")]
    Send(String),
}

/// The request/reply side of the transport.
pub trait ReplyTransport {
    /// Next queued request, or `None` when receiving would block.
    fn try_recv(&mut self) -> Result<Option<Vec<u8>>, TransportError>;

    fn send(&mut self, reply: &str) -> Result<(), TransportError>;

    /// Close, lingering for unsent replies.
    fn close(self);
}

/// REP socket drained with `DONTWAIT`.
pub struct ZmqReplySocket {
    socket: zmq::Socket,
    endpoint: String,
}

impl ZmqReplySocket {
    pub fn bind(ctx: &ZmqContext, endpoint: &str, linger_ms: i32) -> anyhow::Result<Self> {
        let socket = create_reply_and_bind(ctx, endpoint, linger_ms, "control")?;
        info!("accepting commands on {}", endpoint);
        Ok(Self {
            socket,
            endpoint: endpoint.to_string(),
        })
    }
}

impl ReplyTransport for ZmqReplySocket {
    fn try_recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        match self.socket.recv_bytes(zmq::DONTWAIT) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(zmq::Error::EAGAIN) | Err(zmq::Error::EINTR) => Ok(None),
            Err(zmq::Error::EFSM) => {
                // REP socket is waiting to send; retry next tick
                warn!("{}: receive in wrong socket state", self.endpoint);
                Ok(None)
            }
            Err(e) => Err(TransportError::Recv(e.to_string())),
        }
    }

    fn send(&mut self, reply: &str) -> Result<(), TransportError> {
        self.socket
            .send(reply, 0)
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    fn close(self) {
        debug!("closing {}", self.endpoint);
        drop(self.socket);
    }
}

pub struct ServerLoop<T: ReplyTransport, P: Plugin = Builtin> {
    transport: T,
    dispatcher: Dispatcher<P>,
    events: EventReceiver,
    shutdown: CancellationToken,
    tick: Duration,
}

impl<T: ReplyTransport, P: Plugin> ServerLoop<T, P> {
    pub fn new(
        transport: T,
        dispatcher: Dispatcher<P>,
        events: EventReceiver,
        shutdown: CancellationToken,
        tick: Duration,
    ) -> Self {
        Self {
            transport,
            dispatcher,
            events,
            shutdown,
            tick,
        }
    }

    /// Serve until the shutdown token is cancelled or the transport fails,
    /// then tear down the plugins and close the transport.
    pub async fn run(mut self) -> Result<(), TransportError> {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut events_open = true;
        let mut failure = None;

        info!("server loop running, tick {:?}", self.tick);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.shutdown.is_cancelled() {
                        info!("shutdown requested");
                        break;
                    }
                    if let Err(e) = self.drain() {
                        error!("server loop stopping: {}", e);
                        self.shutdown.cancel();
                        failure = Some(e);
                        break;
                    }
                }
                event = self.events.recv(), if events_open => match event {
                    Some(event) => self.dispatcher.deliver(&event),
                    None => events_open = false,
                },
            }
        }

        self.dispatcher.shutdown();
        self.transport.close();
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Answer every queued request. Returns how many were handled.
    fn drain(&mut self) -> Result<usize, TransportError> {
        let mut handled = 0;
        while let Some(bytes) = self.transport.try_recv()? {
            let reply = match std::str::from_utf8(&bytes) {
                Ok(line) => self.dispatcher.dispatch(line),
                Err(_) => Reply::invalid().to_string(),
            };
            debug!("reply: {}", reply.lines().next().unwrap_or_default());
            self.transport.send(&reply)?;
            handled += 1;
        }
        Ok(handled)
    }
}
