//! Connection targets.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::nusb::NusbTransport;
use super::stream::StreamTransport;
use super::traits::{Transport, TransportError};

/// Where a programmer lives. Fixed for the lifetime of a connection.
///
/// String form: `usb:<bus>:<address>`, `tcp:<host>:<port>`, `unix:<path>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Endpoint {
    Usb { bus: String, address: u8 },
    Tcp { host: String, port: u16 },
    UnixSocket { path: PathBuf },
}

impl Endpoint {
    /// Open a transport to this endpoint.
    pub fn connect(&self) -> Result<Box<dyn Transport>, TransportError> {
        match self {
            Endpoint::Usb { bus, address } => Ok(Box::new(NusbTransport::open_at(bus, *address)?)),
            Endpoint::Tcp { host, port } => Ok(Box::new(StreamTransport::connect_tcp(host, *port)?)),
            Endpoint::UnixSocket { path } => Ok(Box::new(StreamTransport::connect_unix(path)?)),
        }
    }

    pub fn is_network(&self) -> bool {
        !matches!(self, Endpoint::Usb { .. })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Usb { bus, address } => write!(f, "usb:{}:{}", bus, address),
            Endpoint::Tcp { host, port } => write!(f, "tcp:{}:{}", host, port),
            Endpoint::UnixSocket { path } => write!(f, "unix:{}", path.display()),
        }
    }
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TransportError::InvalidEndpoint(s.to_string());
        let (scheme, rest) = s.split_once(':').ok_or_else(invalid)?;
        match scheme {
            "usb" => {
                let (bus, address) = rest.rsplit_once(':').ok_or_else(invalid)?;
                if bus.is_empty() {
                    return Err(invalid());
                }
                Ok(Endpoint::Usb {
                    bus: bus.to_string(),
                    address: address.parse().map_err(|_| invalid())?,
                })
            }
            "tcp" => {
                let (host, port) = rest.rsplit_once(':').ok_or_else(invalid)?;
                let host = host.trim_start_matches('[').trim_end_matches(']');
                if host.is_empty() {
                    return Err(invalid());
                }
                Ok(Endpoint::Tcp {
                    host: host.to_string(),
                    port: port.parse().map_err(|_| invalid())?,
                })
            }
            "unix" if !rest.is_empty() => Ok(Endpoint::UnixSocket {
                path: PathBuf::from(rest),
            }),
            _ => Err(invalid()),
        }
    }
}

impl TryFrom<String> for Endpoint {
    type Error = TransportError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Endpoint> for String {
    fn from(value: Endpoint) -> Self {
        value.to_string()
    }
}
