//! Service locator: browse, filter, resolve, and track advertisements

use super::{BackendEvent, BrokerAddress, DiscoveryBackend, DiscoveryEvent};
use crate::config::normalize_service_type;
use crate::error::DiscoveryError;
use crate::session::events::{EventPayload, EventSink};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// Pure advertisement filtering and address bookkeeping.
///
/// Several service types can share one listener in the underlying stack, so every
/// advertisement is checked against the browsed type before it is considered.
#[derive(Debug)]
pub struct AdvertisementFilter {
    service_type: String,
    resolved: HashMap<String, BrokerAddress>,
}

impl AdvertisementFilter {
    pub fn new(service_type: &str) -> Self {
        Self {
            service_type: normalize_service_type(service_type),
            resolved: HashMap::new(),
        }
    }

    fn matches_type(&self, service_type: &str) -> bool {
        normalize_service_type(service_type).eq_ignore_ascii_case(&self.service_type)
    }

    /// Pick the address to connect to, preferring IPv4
    pub fn select_address(addresses: &[IpAddr]) -> Option<IpAddr> {
        addresses
            .iter()
            .find(|ip| ip.is_ipv4())
            .or_else(|| addresses.first())
            .copied()
    }

    /// Translate one backend event into a controller event, if it is relevant
    pub fn accept(&mut self, event: BackendEvent) -> Option<DiscoveryEvent> {
        match event {
            BackendEvent::Found { name, service_type } => {
                if self.matches_type(&service_type) {
                    debug!(name = %name, "Advertisement found, resolving");
                } else {
                    debug!(name = %name, service_type = %service_type, "Ignoring advertisement of other type");
                }
                None
            }
            BackendEvent::Resolved {
                name,
                service_type,
                addresses,
                port,
            } => {
                if !self.matches_type(&service_type) {
                    return None;
                }
                let Some(ip) = Self::select_address(&addresses) else {
                    return Some(DiscoveryEvent::ResolveFailed(DiscoveryError::ResolveFailed {
                        name,
                        reason: "advertisement carries no addresses".to_string(),
                    }));
                };
                if port == 0 {
                    return Some(DiscoveryEvent::ResolveFailed(DiscoveryError::ResolveFailed {
                        name,
                        reason: "advertisement carries port 0".to_string(),
                    }));
                }
                let address = BrokerAddress::from((ip, port));
                self.resolved.insert(name, address.clone());
                Some(DiscoveryEvent::AddressFound(address))
            }
            BackendEvent::ResolveFailed { name, reason } => Some(DiscoveryEvent::ResolveFailed(
                DiscoveryError::ResolveFailed { name, reason },
            )),
            BackendEvent::Lost { name, service_type } => {
                if !self.matches_type(&service_type) {
                    return None;
                }
                self.resolved
                    .remove(&name)
                    .map(DiscoveryEvent::AddressLost)
            }
            BackendEvent::Stopped => Some(DiscoveryEvent::BrowseStopped),
        }
    }
}

/// A running browse. Dropping it cancels the browse.
pub struct BrowseHandle {
    service_type: String,
    stop: Arc<dyn Fn(&str) + Send + Sync>,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl BrowseHandle {
    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    /// Stop the backend browse and the forwarding task
    pub fn cancel(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = self.shutdown_tx.send(true);
            (self.stop)(&self.service_type);
            task.abort();
            info!(service_type = %self.service_type, "Browse cancelled");
        }
    }
}

impl Drop for BrowseHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Locates brokers advertised through a [`DiscoveryBackend`]
pub struct ServiceLocator<B: DiscoveryBackend> {
    backend: Arc<B>,
}

impl<B: DiscoveryBackend> Clone for ServiceLocator<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
        }
    }
}

impl<B: DiscoveryBackend> ServiceLocator<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Start a browse that reports into `sink` until the returned handle is dropped.
    ///
    /// `BrowseStarted` is always delivered before any address. A browse-start failure
    /// is returned to the caller and not retried here. The caller's event channel is
    /// never awaited by this function.
    pub async fn browse(
        &self,
        service_type: &str,
        sink: EventSink,
    ) -> Result<BrowseHandle, DiscoveryError> {
        let service_type = normalize_service_type(service_type);
        let mut raw_events = self.backend.browse(&service_type)?;
        info!(service_type = %service_type, "Browse started");

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let mut filter = AdvertisementFilter::new(&service_type);
        let span = crate::discovery_span!(service_type = %service_type);
        let started = DiscoveryEvent::BrowseStarted {
            service_type: service_type.clone(),
        };

        let task = tokio::spawn(
            async move {
                // Sent from this task so it always precedes any address
                if !sink.emit(started).await {
                    return;
                }
                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() {
                                break;
                            }
                        }
                        raw = raw_events.recv() => {
                            let Some(raw) = raw else {
                                sink.emit(DiscoveryEvent::BrowseStopped).await;
                                break;
                            };
                            let stopped = matches!(raw, BackendEvent::Stopped);
                            if let Some(event) = filter.accept(raw) {
                                if let DiscoveryEvent::ResolveFailed(ref e) = event {
                                    warn!("{}", e);
                                }
                                if !sink.emit(EventPayload::Discovery(event)).await {
                                    break;
                                }
                            }
                            if stopped {
                                break;
                            }
                        }
                    }
                }
                debug!("Browse forwarding task finished");
            }
            .instrument(span),
        );

        let backend = self.backend.clone();
        Ok(BrowseHandle {
            service_type,
            stop: Arc::new(move |service_type: &str| backend.stop_browse(service_type)),
            shutdown_tx,
            task: Some(task),
        })
    }

    /// Browse until the first broker resolves and return its address.
    ///
    /// Cancel by dropping the future; the browse is stopped either way.
    pub async fn locate(&self, service_type: &str) -> Result<BrokerAddress, DiscoveryError> {
        let (tx, mut rx) = mpsc::channel(32);
        let _browse = self.browse(service_type, EventSink::new(0, tx)).await?;

        while let Some(event) = rx.recv().await {
            match event.payload {
                EventPayload::Discovery(DiscoveryEvent::AddressFound(address)) => {
                    return Ok(address)
                }
                EventPayload::Discovery(DiscoveryEvent::BrowseStopped) => break,
                _ => {}
            }
        }

        Err(DiscoveryError::BrowseEnded)
    }
}
