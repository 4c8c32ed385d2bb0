//! Central role: scan, filter, connect, subscribe

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::stream::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::errors::{LinkError, LinkStep, RadioError, Rejection, TransitionError};
use crate::identity::Identity;
use crate::peer_table::{AttemptId, PeerConnection, PeerTable};
use crate::radio::{Advertisement, CentralEvent, CentralEvents, CentralRadio, NotificationStream};
use crate::sink::SharedSink;
use crate::types::{InboundMessage, PeerAddress};

// ----------------------------------------------------------------------------
// Advertisement Filtering
// ----------------------------------------------------------------------------

/// Decide whether an advertisement names a peer of our network other than us
///
/// A missing local name compares as the empty string, so an instance started
/// with an empty self identifier also ignores unnamed advertisements.
pub fn filter_advertisement(
    advertisement: &Advertisement,
    identity: &Identity,
    self_id: &str,
) -> Result<(), Rejection> {
    if !advertisement.advertises(identity.service_uuid()) {
        return Err(Rejection::ForeignService);
    }
    if advertisement.local_name.as_deref().unwrap_or("") == self_id {
        return Err(Rejection::OwnAdvertisement);
    }
    Ok(())
}

/// Outcome of a central-side write to every subscribed peer
#[derive(Debug, Default)]
pub struct WriteReport {
    pub delivered: Vec<PeerAddress>,
    pub failed: Vec<(PeerAddress, RadioError)>,
}

impl WriteReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

// ----------------------------------------------------------------------------
// Central Controller
// ----------------------------------------------------------------------------

/// Drives scanning and link establishment into a [`PeerTable`]
pub struct CentralController<R: CentralRadio> {
    radio: Arc<R>,
    table: PeerTable,
    sink: SharedSink,
    link_timeout: Duration,
    scan_task: Option<JoinHandle<()>>,
}

impl<R: CentralRadio> CentralController<R> {
    pub fn new(radio: Arc<R>, sink: SharedSink, link_timeout: Duration) -> Self {
        Self {
            radio,
            table: PeerTable::new(),
            sink,
            link_timeout,
            scan_task: None,
        }
    }

    pub fn table(&self) -> &PeerTable {
        &self.table
    }

    pub fn is_scanning(&self) -> bool {
        self.scan_task.is_some()
    }

    /// Start scanning for `identity`, ignoring advertisements named `self_id`
    pub async fn start_scanning(&mut self, identity: &Identity, self_id: &str) -> Result<(), RadioError> {
        if self.is_scanning() {
            return Ok(());
        }

        self.table.open().await;
        let events = match self.radio.start_scan(identity.service_uuid()).await {
            Ok(events) => events,
            Err(err) => {
                self.table.close().await;
                return Err(err);
            }
        };

        let context = Arc::new(ScanContext {
            radio: self.radio.clone(),
            table: self.table.clone(),
            sink: self.sink.clone(),
            identity: *identity,
            self_id: self_id.to_string(),
            link_timeout: self.link_timeout,
        });
        self.scan_task = Some(tokio::spawn(context.run(events)));

        info!("Scanning for service {}", identity.service_uuid());
        Ok(())
    }

    /// Stop scanning and drop every peer connection
    ///
    /// In-flight establishment and notification tasks are aborted with their
    /// table entries. No disconnect handshake is attempted.
    pub async fn stop_scanning(&mut self) -> Result<(), RadioError> {
        let Some(task) = self.scan_task.take() else {
            return Ok(());
        };
        task.abort();

        let dropped = self.table.close().await;
        debug!("Dropped {} peer connections", dropped);

        self.radio.stop_scan().await
    }

    /// Handle for writing to subscribed peers without holding the controller
    pub fn writer(&self) -> PeerWriter<R> {
        PeerWriter {
            radio: self.radio.clone(),
            table: self.table.clone(),
            write_timeout: self.link_timeout,
        }
    }
}

impl<R: CentralRadio> Drop for CentralController<R> {
    fn drop(&mut self) {
        if let Some(task) = self.scan_task.take() {
            task.abort();
        }
    }
}

/// Writes to the characteristic of every subscribed peer
pub struct PeerWriter<R: CentralRadio> {
    radio: Arc<R>,
    table: PeerTable,
    write_timeout: Duration,
}

impl<R: CentralRadio> PeerWriter<R> {
    /// Write `value` to every subscribed peer, each write bounded by the link timeout
    pub async fn write_all(&self, value: &[u8]) -> WriteReport {
        let links = self.table.subscribed_links().await;
        let writes = links.into_iter().map(|(peer, characteristic)| {
            let radio = self.radio.clone();
            let limit = self.write_timeout;
            async move {
                let result = match timeout(limit, radio.write(&peer, &characteristic, value)).await {
                    Ok(result) => result,
                    Err(_) => Err(RadioError::TimedOut(limit)),
                };
                (peer, result)
            }
        });

        let mut report = WriteReport::default();
        for (peer, result) in join_all(writes).await {
            match result {
                Ok(()) => report.delivered.push(peer),
                Err(err) => {
                    warn!("Write to peer {} failed: {}", peer, err);
                    report.failed.push((peer, err));
                }
            }
        }
        report
    }
}

// ----------------------------------------------------------------------------
// Scan Context
// ----------------------------------------------------------------------------

/// State shared by the scan loop and the tasks it spawns
struct ScanContext<R: CentralRadio> {
    radio: Arc<R>,
    table: PeerTable,
    sink: SharedSink,
    identity: Identity,
    self_id: String,
    link_timeout: Duration,
}

impl<R: CentralRadio> ScanContext<R> {
    async fn run(self: Arc<Self>, mut events: CentralEvents) {
        while let Some(event) = events.recv().await {
            match event {
                CentralEvent::Advertisement(advertisement) => {
                    let address = advertisement.address.clone();
                    if let Err(rejection) = self.on_advertisement(advertisement).await {
                        trace!("Ignoring advertisement from {}: {}", address, rejection);
                    }
                }
                CentralEvent::Disconnected(address) => {
                    if self.table.remove(&address).await {
                        info!("Peer {} disconnected", address);
                    }
                }
            }
        }
        debug!("Central event stream ended");
    }

    /// Claim a table entry for a matching advertisement and start linking to it
    async fn on_advertisement(self: &Arc<Self>, advertisement: Advertisement) -> Result<AttemptId, Rejection> {
        filter_advertisement(&advertisement, &self.identity, &self.self_id)?;

        let address = advertisement.address;
        let attempt = self
            .table
            .claim(&address, advertisement.local_name.as_deref())
            .await?;
        debug!(
            "Discovered peer {} ({})",
            address,
            advertisement.local_name.as_deref().unwrap_or("unnamed")
        );

        let task = tokio::spawn(self.clone().establish(address.clone(), attempt));
        let handle = task.abort_handle();
        let tracked = self
            .table
            .advance(&address, attempt, |peer| {
                peer.track_establishment(handle);
                Ok(())
            })
            .await;
        if tracked.is_err() {
            task.abort();
        }
        Ok(attempt)
    }

    async fn establish(self: Arc<Self>, peer: PeerAddress, attempt: AttemptId) {
        let err = match self.link(&peer, attempt).await {
            Ok(()) => {
                info!("Subscribed to peer {}", peer);
                return;
            }
            Err(err) => err,
        };

        match &err {
            LinkError::Cancelled { .. } => debug!("{}", err),
            _ if err.is_protocol_mismatch() => debug!("Not our peer: {}", err),
            _ => warn!("Link establishment failed: {}", err),
        }

        let connected = !matches!(err, LinkError::Cancelled { .. })
            && err.step() != Some(LinkStep::Connect);
        if connected {
            if let Err(e) = self.radio.disconnect(&peer).await {
                debug!("Disconnect from {} after failed link: {}", peer, e);
            }
        }

        // Free the address so a later advertisement can retry. Releasing
        // aborts this task, so it must come last.
        self.table.release(&peer, attempt).await;
    }

    async fn link(self: &Arc<Self>, peer: &PeerAddress, attempt: AttemptId) -> Result<(), LinkError> {
        self.step(peer, LinkStep::Connect, self.radio.connect(peer))
            .await?;

        let service_uuid = self.identity.service_uuid();
        let service = self
            .step(
                peer,
                LinkStep::ResolveService,
                self.radio.resolve_service(peer, service_uuid),
            )
            .await?
            .ok_or_else(|| LinkError::ServiceMissing {
                peer: peer.clone(),
                service: service_uuid,
            })?;
        self.transition(peer, attempt, |p| p.resolve_service(service.clone()))
            .await?;

        let characteristic_uuid = self.identity.characteristic_uuid();
        let characteristic = self
            .step(
                peer,
                LinkStep::ResolveCharacteristic,
                self.radio
                    .resolve_characteristic(peer, &service, characteristic_uuid),
            )
            .await?
            .ok_or_else(|| LinkError::CharacteristicMissing {
                peer: peer.clone(),
                characteristic: characteristic_uuid,
            })?;
        self.transition(peer, attempt, |p| {
            p.resolve_characteristic(characteristic.clone())
        })
        .await?;

        let notifications = self
            .step(
                peer,
                LinkStep::Subscribe,
                self.radio.subscribe(peer, &characteristic),
            )
            .await?;

        let listener = tokio::spawn(forward_notifications(
            self.table.clone(),
            self.sink.clone(),
            peer.clone(),
            attempt,
            notifications,
        ));
        let handle = listener.abort_handle();
        if let Err(err) = self.transition(peer, attempt, |p| p.subscribe(handle)).await {
            listener.abort();
            return Err(err);
        }
        Ok(())
    }

    /// Run one establishment step under the link timeout
    async fn step<T, F>(&self, peer: &PeerAddress, step: LinkStep, operation: F) -> Result<T, LinkError>
    where
        F: Future<Output = Result<T, RadioError>>,
    {
        match timeout(self.link_timeout, operation).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(LinkError::Radio {
                peer: peer.clone(),
                step,
                source,
            }),
            Err(_) => Err(LinkError::Timeout {
                peer: peer.clone(),
                step,
                after: self.link_timeout,
            }),
        }
    }

    async fn transition<F>(&self, peer: &PeerAddress, attempt: AttemptId, transition: F) -> Result<(), LinkError>
    where
        F: FnOnce(&mut PeerConnection) -> Result<(), TransitionError>,
    {
        self.table
            .advance(peer, attempt, transition)
            .await
            .map_err(|err| LinkError::from_transition(peer, err))
    }
}

/// Deliver every non-empty notification from `peer` until its stream ends
async fn forward_notifications(
    table: PeerTable,
    sink: SharedSink,
    peer: PeerAddress,
    attempt: AttemptId,
    mut notifications: NotificationStream,
) {
    while let Some(value) = notifications.next().await {
        if value.is_empty() {
            trace!("Skipping empty notification from {}", peer);
            continue;
        }
        sink.deliver(InboundMessage::from_peer(&peer, value));
    }

    debug!("Notification stream for {} ended", peer);
    table.release(&peer, attempt).await;
}
