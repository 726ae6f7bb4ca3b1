//! Channel address parsing.
//!
//! An address selects the transport by its scheme:
//!
//! ```text
//! broker://host:port/<exchange>/<queue>   broker-queue transport
//! inproc://<name>                         in-process socket
//! ipc://<path>                            Unix domain socket
//! tcp://host:port                         TCP socket
//! ```
//!
//! `zmq+inproc`, `zmq+ipc` and `zmq+tcp` are accepted as aliases of the socket
//! schemes, and `amqp` as an alias of `broker`.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use url::Url;

use crate::error::ChannelError;

use super::TransportKind;

/// Default port of the message broker.
pub const DEFAULT_BROKER_PORT: u16 = 5672;

/// A parsed channel address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelAddress {
    /// Exchange/queue pair on a message broker
    Broker {
        host: String,
        port: u16,
        exchange: String,
        queue: String,
    },

    /// Named endpoint inside this process
    Inproc { name: String },

    /// Unix domain socket path
    Ipc { path: PathBuf },

    /// TCP host and port
    Tcp { host: String, port: u16 },
}

impl ChannelAddress {
    /// Parse an address string.
    pub fn parse(address: &str) -> Result<Self, ChannelError> {
        let invalid = |reason: &str| ChannelError::InvalidAddress(format!("{address}: {reason}"));

        let (scheme, rest) = address
            .split_once("://")
            .ok_or_else(|| invalid("missing scheme"))?;
        let scheme = scheme.to_ascii_lowercase();
        let scheme = scheme.strip_prefix("zmq+").unwrap_or(&scheme);

        match scheme {
            "inproc" => {
                if rest.is_empty() {
                    return Err(invalid("empty inproc name"));
                }
                Ok(ChannelAddress::Inproc {
                    name: rest.to_string(),
                })
            }
            "ipc" => {
                if rest.is_empty() {
                    return Err(invalid("empty socket path"));
                }
                Ok(ChannelAddress::Ipc {
                    path: PathBuf::from(rest),
                })
            }
            "tcp" => {
                let url = Url::parse(address).map_err(|e| invalid(&e.to_string()))?;
                let host = url
                    .host_str()
                    .filter(|h| !h.is_empty())
                    .ok_or_else(|| invalid("missing host"))?;
                let port = url.port().ok_or_else(|| invalid("missing port"))?;
                Ok(ChannelAddress::Tcp {
                    host: host.to_string(),
                    port,
                })
            }
            "broker" | "amqp" => {
                let url = Url::parse(address).map_err(|e| invalid(&e.to_string()))?;
                let host = url
                    .host_str()
                    .filter(|h| !h.is_empty())
                    .ok_or_else(|| invalid("missing host"))?;
                let port = url.port().unwrap_or(DEFAULT_BROKER_PORT);

                let segments: Vec<&str> = url
                    .path_segments()
                    .map(|s| s.filter(|seg| !seg.is_empty()).collect())
                    .unwrap_or_default();
                match segments.as_slice() {
                    [exchange, queue] => Ok(ChannelAddress::Broker {
                        host: host.to_string(),
                        port,
                        exchange: exchange.to_string(),
                        queue: queue.to_string(),
                    }),
                    _ => Err(invalid("expected /<exchange>/<queue>")),
                }
            }
            other => Err(invalid(&format!("unknown scheme '{other}'"))),
        }
    }

    /// The transport this address selects.
    pub fn transport(&self) -> TransportKind {
        match self {
            ChannelAddress::Broker { .. } => TransportKind::Broker,
            ChannelAddress::Inproc { .. } => TransportKind::Inproc,
            ChannelAddress::Ipc { .. } => TransportKind::Ipc,
            ChannelAddress::Tcp { .. } => TransportKind::Tcp,
        }
    }
}

impl FromStr for ChannelAddress {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ChannelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelAddress::Broker {
                host,
                port,
                exchange,
                queue,
            } => write!(f, "broker://{host}:{port}/{exchange}/{queue}"),
            ChannelAddress::Inproc { name } => write!(f, "inproc://{name}"),
            ChannelAddress::Ipc { path } => write!(f, "ipc://{}", path.display()),
            ChannelAddress::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
        }
    }
}
