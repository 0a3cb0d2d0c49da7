//! Daemon assembly: sockets, plugins and the server loop.

use std::time::Duration;

use anyhow::{Context, Result};
use playconf::PlaydConfig;
use playproto::socket_config::ZmqContext;
use playproto::Endpoints;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::{self, event_channel, EventReceiver, EventSender};
use crate::dispatch::{Dispatcher, Services};
use crate::plugins::{Builtin, Control, Ping, Playback};
use crate::publisher;
use crate::server::{ServerLoop, ZmqReplySocket};
use crate::session::{PlaybackSession, SessionConfig};

pub struct Daemon {
    endpoints: Endpoints,
    transport: ZmqReplySocket,
    dispatcher: Dispatcher,
    events: EventReceiver,
    shutdown: CancellationToken,
    tick: Duration,
    publisher_task: JoinHandle<()>,
}

impl Daemon {
    /// Bind both sockets and register the plugins.
    ///
    /// Must be called from inside a tokio runtime; the publisher task is
    /// spawned here so startup notices are not lost.
    pub fn from_config(config: &PlaydConfig) -> Result<Self> {
        config.validate().context("Refusing to start")?;
        let endpoints = Endpoints::bind_from_config(&config.bind)
            .context("Failed to derive socket addresses")?;
        let ctx = ZmqContext::new();

        let (publisher_server, publisher) = publisher::bind(
            &ctx,
            &endpoints.publish,
            &endpoints.advertised_publish(),
            config.bind.publish_linger_ms,
        )?;
        let publisher_task = tokio::spawn(publisher_server.run());

        let transport = ZmqReplySocket::bind(&ctx, &endpoints.reply, config.bind.reply_linger_ms)?;

        let shutdown = CancellationToken::new();
        let (events_tx, events) = event_channel();
        let services = Services::new(publisher, shutdown.clone());
        let dispatcher = build_dispatcher(config, services, events_tx);

        Ok(Self {
            endpoints,
            transport,
            dispatcher,
            events,
            shutdown,
            tick: Duration::from_millis(config.daemon.tick_ms),
            publisher_task,
        })
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    /// Token that stops the daemon when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn verbs(&self) -> Vec<&str> {
        self.dispatcher.verbs()
    }

    /// Serve until `QUIT`, a signal, or a transport failure.
    pub async fn run(self) -> Result<()> {
        info!(
            "playd serving {} verbs: {}",
            self.dispatcher.plugin_count(),
            self.dispatcher.verbs().join(" ")
        );
        tokio::spawn(watch_signals(self.shutdown.clone()));

        let result = ServerLoop::new(
            self.transport,
            self.dispatcher,
            self.events,
            self.shutdown,
            self.tick,
        )
        .run()
        .await;

        // every publisher handle is gone now; wait for the socket to flush
        if let Err(e) = self.publisher_task.await {
            warn!("publisher task failed: {}", e);
        }
        result.context("server loop failed")?;
        info!("playd shutdown complete");
        Ok(())
    }
}

/// Register the built-in plugins in order: Ping, Control, Playback.
///
/// A backend that cannot be built leaves Playback half-built; its
/// registration fails and the other verbs keep working.
pub fn build_dispatcher(
    config: &PlaydConfig,
    services: Services,
    events: EventSender,
) -> Dispatcher {
    let mut dispatcher = Dispatcher::new(services);

    if let Err(e) = dispatcher.register(|s| Builtin::Ping(Ping::new(s))) {
        warn!("ping unavailable: {}", e);
    }
    if let Err(e) = dispatcher.register(|s| Builtin::Control(Control::new(s))) {
        warn!("control unavailable: {}", e);
    }

    let backend = match backend::from_config(&config.audio, events) {
        Ok(backend) => Some(backend),
        Err(e) => {
            warn!("could not start the {} backend: {}", config.audio.backend, e);
            None
        }
    };
    let session_config = SessionConfig::from_config(config);
    let registered = dispatcher.register(|s| {
        let session = backend
            .map(|backend| PlaybackSession::new(backend, s.publisher.clone(), session_config));
        Builtin::Playback(Playback::new(session))
    });
    if let Err(e) = registered {
        warn!("continuing without playback: {}", e);
    }

    dispatcher
}

async fn watch_signals(shutdown: CancellationToken) {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, shutting down");
            shutdown.cancel();
        }
        _ = terminate() => {
            info!("Received SIGTERM, shutting down");
            shutdown.cancel();
        }
        _ = shutdown.cancelled() => {}
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
