//! Verb routing
//!
//! The dispatcher owns a routing table from verb to plugin and the list of
//! live plugins. Every line becomes exactly one reply string; lines that do
//! not parse or name an unrouted verb get `FAIL Message is Invalid`.

use std::collections::HashMap;

use playproto::{Command, Reply};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::BackendEvent;
use crate::plugins::Builtin;
use crate::publisher::Publisher;

#[derive(Debug, Error)]
pub enum RegisterError {
    /// The plugin was built but its resources could not be set up.
    #[error("{0} plugin is not ready")]
    NotReady(&'static str),

    #[error("{plugin} plugin refused to register: {reason}")]
    Refused {
        plugin: &'static str,
        reason: String,
    },
}

/// A family of verbs with shared state.
pub trait Plugin {
    fn name(&self) -> &'static str;

    /// Verbs this plugin answers. An error means the plugin is unusable.
    fn register(&self) -> Result<&'static [&'static str], RegisterError>;

    /// Answer one command. The reply starts with `OK` or `FAIL`.
    fn handle(&mut self, verb: &str, argument: Option<&str>) -> String;

    fn on_backend_event(&mut self, _event: &BackendEvent) {}

    fn destroy(&mut self) {}
}

/// Shared context handed to every plugin constructor.
#[derive(Clone)]
pub struct Services {
    pub publisher: Publisher,
    pub shutdown: CancellationToken,
}

impl Services {
    pub fn new(publisher: Publisher, shutdown: CancellationToken) -> Self {
        Self {
            publisher,
            shutdown,
        }
    }

    /// Address clients should subscribe to.
    pub fn publish_address(&self) -> &str {
        self.publisher.address()
    }
}

pub struct Dispatcher<P: Plugin = Builtin> {
    services: Services,
    plugins: Vec<P>,
    routes: HashMap<String, usize>,
}

impl<P: Plugin> Dispatcher<P> {
    pub fn new(services: Services) -> Self {
        Self {
            services,
            plugins: Vec::new(),
            routes: HashMap::new(),
        }
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Build a plugin and route its verbs to it.
    ///
    /// A plugin whose `register` fails is destroyed straight away and never
    /// routed. A verb already routed to an earlier plugin is taken over by
    /// the new one.
    pub fn register<F>(&mut self, create: F) -> Result<(), RegisterError>
    where
        F: FnOnce(&Services) -> P,
    {
        let mut plugin = create(&self.services);
        let verbs = match plugin.register() {
            Ok(verbs) => verbs,
            Err(e) => {
                warn!("{}", e);
                plugin.destroy();
                return Err(e);
            }
        };

        let index = self.plugins.len();
        for verb in verbs {
            if let Some(previous) = self.routes.insert(verb.to_string(), index) {
                warn!(
                    "{} was routed to {}, now routed to {}",
                    verb,
                    self.plugins[previous].name(),
                    plugin.name()
                );
            }
        }
        info!("registered {} plugin: {}", plugin.name(), verbs.join(" "));
        self.plugins.push(plugin);
        Ok(())
    }

    /// Route one request line and return its reply.
    pub fn dispatch(&mut self, line: &str) -> String {
        let command = match Command::parse(line) {
            Ok(command) => command,
            Err(e) => {
                debug!("rejecting {:?}: {}", line, e);
                return Reply::invalid().to_string();
            }
        };

        let Some(plugin) = self
            .routes
            .get(&command.verb)
            .and_then(|index| self.plugins.get_mut(*index))
        else {
            debug!("no route for {}", command.verb);
            return Reply::invalid().to_string();
        };

        debug!("{} -> {}", command.verb, plugin.name());
        plugin.handle(&command.verb, command.argument.as_deref())
    }

    /// Hand a backend notification to every live plugin.
    pub fn deliver(&mut self, event: &BackendEvent) {
        for plugin in self.plugins.iter_mut() {
            plugin.on_backend_event(event);
        }
    }

    /// Destroy every plugin, last registered first. Safe to call twice.
    pub fn shutdown(&mut self) {
        self.routes.clear();
        while let Some(mut plugin) = self.plugins.pop() {
            info!("destroying {} plugin", plugin.name());
            plugin.destroy();
        }
    }

    /// Routed verbs, sorted.
    pub fn verbs(&self) -> Vec<&str> {
        let mut verbs: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        verbs.sort_unstable();
        verbs
    }

    pub fn plugin_count(&self) -> usize {
        self.plugins.len()
    }
}

impl<P: Plugin> Drop for Dispatcher<P> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
