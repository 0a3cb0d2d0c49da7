//! Daemon control verbs: `PUBSUB` and `QUIT`.

use playproto::Reply;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::dispatch::{Plugin, RegisterError, Services};

pub struct Control {
    publish_address: String,
    shutdown: CancellationToken,
}

impl Control {
    pub fn new(services: &Services) -> Self {
        Self {
            publish_address: services.publish_address().to_string(),
            shutdown: services.shutdown.clone(),
        }
    }
}

impl Plugin for Control {
    fn name(&self) -> &'static str {
        "control"
    }

    fn register(&self) -> Result<&'static [&'static str], RegisterError> {
        Ok(&["PUBSUB", "QUIT"])
    }

    fn handle(&mut self, verb: &str, _argument: Option<&str>) -> String {
        match verb {
            "PUBSUB" => Reply::ok_with(self.publish_address.as_str()).to_string(),
            "QUIT" => {
                // observed by the server loop on its next tick, after this reply is sent
                info!("QUIT received, shutting down");
                self.shutdown.cancel();
                Reply::ok().to_string()
            }
            _ => Reply::invalid().to_string(),
        }
    }
}
