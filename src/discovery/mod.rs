//! Zero-configuration broker discovery
//!
//! The [`ServiceLocator`] browses for a DNS-SD service type through a pluggable
//! [`DiscoveryBackend`] and turns raw advertisements into [`DiscoveryEvent`]s for the
//! session controller. [`MdnsBackend`] is the production backend.

pub mod locator;
pub mod mdns;

pub use locator::{AdvertisementFilter, BrowseHandle, ServiceLocator};
pub use mdns::MdnsBackend;

use crate::error::DiscoveryError;
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;
use tokio::sync::mpsc;

/// Resolved network location of a broker
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
}

impl BrokerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Transport URI, `tcp://<host>:<port>` (IPv6 literals are bracketed)
    pub fn uri(&self) -> String {
        if self.host.contains(':') {
            format!("tcp://[{}]:{}", self.host, self.port)
        } else {
            format!("tcp://{}:{}", self.host, self.port)
        }
    }
}

impl From<(IpAddr, u16)> for BrokerAddress {
    fn from((ip, port): (IpAddr, u16)) -> Self {
        Self::new(ip.to_string(), port)
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri())
    }
}

/// Raw advertisement events as reported by a discovery backend
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    /// An advertisement was seen; resolution may follow
    Found { name: String, service_type: String },
    /// An advertisement resolved to concrete addresses
    Resolved {
        name: String,
        service_type: String,
        addresses: Vec<IpAddr>,
        port: u16,
    },
    /// Resolution of an advertisement failed
    ResolveFailed { name: String, reason: String },
    /// A previously seen advertisement went away
    Lost { name: String, service_type: String },
    /// The browse ended
    Stopped,
}

/// Discovery events delivered to the session controller
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    BrowseStarted { service_type: String },
    AddressFound(BrokerAddress),
    ResolveFailed(DiscoveryError),
    AddressLost(BrokerAddress),
    BrowseStopped,
}

/// Network service browsing mechanism
///
/// Implementations start a browse and stream [`BackendEvent`]s until
/// [`DiscoveryBackend::stop_browse`] is called or the receiver is dropped.
pub trait DiscoveryBackend: Send + Sync + 'static {
    /// Start browsing; a start failure is fatal to this browse
    fn browse(&self, service_type: &str) -> Result<mpsc::Receiver<BackendEvent>, DiscoveryError>;

    /// Stop a browse started with [`DiscoveryBackend::browse`]
    fn stop_browse(&self, service_type: &str);
}
