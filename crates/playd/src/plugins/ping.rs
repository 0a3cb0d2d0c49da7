//! `PING [text]`: liveness check, echoed on the publish channel too.

use playproto::Reply;

use crate::dispatch::{Plugin, RegisterError, Services};
use crate::publisher::Publisher;

pub struct Ping {
    publisher: Publisher,
}

impl Ping {
    pub fn new(services: &Services) -> Self {
        Self {
            publisher: services.publisher.clone(),
        }
    }
}

impl Plugin for Ping {
    fn name(&self) -> &'static str {
        "ping"
    }

    fn register(&self) -> Result<&'static [&'static str], RegisterError> {
        Ok(&["PING"])
    }

    fn handle(&mut self, _verb: &str, argument: Option<&str>) -> String {
        let reply = Reply::ok_with(format!("Message was {}", argument.unwrap_or("(none)"))).to_string();
        self.publisher.publish(reply.clone());
        reply
    }
}
