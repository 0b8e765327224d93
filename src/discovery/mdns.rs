//! Multicast DNS / DNS-SD discovery backend built on `mdns-sd`

use super::{BackendEvent, DiscoveryBackend};
use crate::error::DiscoveryError;
use mdns_sd::{ServiceDaemon, ServiceEvent};
use std::net::IpAddr;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Browses the local network through an `mdns-sd` daemon
pub struct MdnsBackend {
    daemon: ServiceDaemon,
}

impl MdnsBackend {
    pub fn new() -> Result<Self, DiscoveryError> {
        let daemon = ServiceDaemon::new().map_err(|e| DiscoveryError::BrowseStartFailed {
            service_type: String::new(),
            reason: format!("mDNS daemon unavailable: {e}"),
        })?;
        Ok(Self { daemon })
    }
}

impl Drop for MdnsBackend {
    fn drop(&mut self) {
        if let Err(e) = self.daemon.shutdown() {
            debug!("mDNS daemon shutdown: {}", e);
        }
    }
}

/// Map daemon events onto backend events. The daemon resolves on its own, so
/// `ServiceResolved` follows `ServiceFound` without an explicit resolve call.
fn map_service_event(event: ServiceEvent) -> Option<BackendEvent> {
    #[allow(unreachable_patterns)]
    match event {
        ServiceEvent::ServiceFound(service_type, name) => {
            Some(BackendEvent::Found { name, service_type })
        }
        ServiceEvent::ServiceResolved(info) => Some(BackendEvent::Resolved {
            name: info.get_fullname().to_string(),
            service_type: info.get_type().to_string(),
            addresses: info
                .get_addresses()
                .iter()
                .copied()
                .map(IpAddr::from)
                .collect(),
            port: info.get_port(),
        }),
        ServiceEvent::ServiceRemoved(service_type, name) => {
            Some(BackendEvent::Lost { name, service_type })
        }
        ServiceEvent::SearchStopped(_) => Some(BackendEvent::Stopped),
        ServiceEvent::SearchStarted(_) => None,
        _ => None,
    }
}

impl DiscoveryBackend for MdnsBackend {
    fn browse(&self, service_type: &str) -> Result<mpsc::Receiver<BackendEvent>, DiscoveryError> {
        let receiver =
            self.daemon
                .browse(service_type)
                .map_err(|e| DiscoveryError::BrowseStartFailed {
                    service_type: service_type.to_string(),
                    reason: e.to_string(),
                })?;

        let (tx, rx) = mpsc::channel(64);

        // The daemon delivers on a blocking channel; bridge it off the async workers.
        tokio::task::spawn_blocking(move || {
            while let Ok(event) = receiver.recv() {
                let Some(mapped) = map_service_event(event) else {
                    continue;
                };
                let stopped = mapped == BackendEvent::Stopped;
                if tx.blocking_send(mapped).is_err() || stopped {
                    break;
                }
            }
        });

        Ok(rx)
    }

    fn stop_browse(&self, service_type: &str) {
        if let Err(e) = self.daemon.stop_browse(service_type) {
            warn!(service_type = %service_type, "Failed to stop mDNS browse: {}", e);
        }
    }
}
