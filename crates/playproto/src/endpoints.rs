//! Socket addresses derived from a single base port.
//!
//! The request/reply socket lives at `base + 10000` and the publish socket at
//! `base + 10001`, so a client that knows the base port can reach both without
//! a handshake.

use playconf::{BindConfig, PUBLISH_PORT_OFFSET, REPLY_PORT_OFFSET};

use crate::ProtocolError;

/// Hosts that mean "every interface" when binding but cannot be connected to.
const WILDCARD_HOSTS: &[&str] = &["*", "0.0.0.0", "::", "[::]"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    /// Request/reply socket address
    pub reply: String,
    /// Publish socket address
    pub publish: String,
}

impl Endpoints {
    /// Both sockets on one host.
    pub fn from_base_port(host: &str, base_port: u16) -> Result<Self, ProtocolError> {
        Self::with_hosts(host, host, base_port)
    }

    /// Server-side view: reply socket on `reply_host`, publisher on `publish_host`.
    pub fn bind(reply_host: &str, publish_host: &str, base_port: u16) -> Result<Self, ProtocolError> {
        Self::with_hosts(reply_host, publish_host, base_port)
    }

    /// Server-side view from config.
    pub fn bind_from_config(config: &BindConfig) -> Result<Self, ProtocolError> {
        Self::bind(&config.host, &config.publish_host, config.base_port)
    }

    /// Client-side view.
    pub fn connect(host: &str, base_port: u16) -> Result<Self, ProtocolError> {
        Self::from_base_port(host, base_port)
    }

    fn with_hosts(reply_host: &str, publish_host: &str, base_port: u16) -> Result<Self, ProtocolError> {
        let reply_port = offset_port(base_port, REPLY_PORT_OFFSET)?;
        let publish_port = offset_port(base_port, PUBLISH_PORT_OFFSET)?;
        Ok(Self {
            reply: tcp(reply_host, reply_port),
            publish: tcp(publish_host, publish_port),
        })
    }

    /// Publish address a client can connect to verbatim.
    ///
    /// A wildcard bind host is replaced with loopback.
    pub fn advertised_publish(&self) -> String {
        connectable(&self.publish)
    }
}

fn offset_port(base_port: u16, offset: u16) -> Result<u16, ProtocolError> {
    base_port
        .checked_add(offset)
        .ok_or(ProtocolError::PortOutOfRange(base_port))
}

fn tcp(host: &str, port: u16) -> String {
    format!("tcp://{}:{}", host, port)
}

/// Rewrite a `tcp://<wildcard>:<port>` bind address to `tcp://127.0.0.1:<port>`.
pub fn connectable(address: &str) -> String {
    let Some(rest) = address.strip_prefix("tcp://") else {
        return address.to_string();
    };
    match rest.rsplit_once(':') {
        Some((host, port)) if WILDCARD_HOSTS.contains(&host) => {
            format!("tcp://127.0.0.1:{}", port)
        }
        _ => address.to_string(),
    }
}
