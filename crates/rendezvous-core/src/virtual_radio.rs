//! In-memory radio medium
//!
//! A [`VirtualAir`] connects any number of stations, each with a central and a
//! peripheral half implementing the radio traits. Advertisements reach every
//! scanning station (including the advertiser itself), GATT operations are
//! routed to the addressed station, and faults can be injected per station to
//! exercise failure paths without hardware.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender as NotificationSender};
use futures::future;
use futures::stream::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tokio::time::sleep;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::errors::RadioError;
use crate::radio::{
    await_outcome, Advertisement, AdvertisementData, CentralEvent, CentralEvents, CentralRadio,
    CharacteristicHandle, Deferral, GattServiceSpec, NotificationStream, PeripheralEvent,
    PeripheralEvents, PeripheralRadio, ServiceHandle, WriteKind, WriteOutcome, WriteRequest,
};
use crate::types::{PeerAddress, SessionId};

// ----------------------------------------------------------------------------
// Station Configuration
// ----------------------------------------------------------------------------

/// Misbehaviour a station shows towards remote centrals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    /// Refuse incoming connections
    RejectConnect,
    /// Hold every incoming connection for the given time first
    DelayConnect(Duration),
    /// Report our service as absent
    HideService,
    /// Report our characteristic as absent
    HideCharacteristic,
    /// Reject the descriptor write that enables notifications
    RejectSubscribe,
    /// Never answer incoming characteristic writes
    StallWrites,
}

#[derive(Debug, Clone)]
pub struct StationOptions {
    /// Whether the host can act as a GATT server and advertiser
    pub peripheral_capable: bool,
}

impl Default for StationOptions {
    fn default() -> Self {
        Self {
            peripheral_capable: true,
        }
    }
}

impl StationOptions {
    pub fn central_only() -> Self {
        Self {
            peripheral_capable: false,
        }
    }
}

// ----------------------------------------------------------------------------
// Medium State
// ----------------------------------------------------------------------------

#[derive(Default)]
struct Station {
    options: StationOptions,
    faults: Vec<Fault>,
    scanner: Option<mpsc::UnboundedSender<CentralEvent>>,
    service: Option<GattServiceSpec>,
    server_events: Option<mpsc::UnboundedSender<PeripheralEvent>>,
    advertisement: Option<AdvertisementData>,
    subscribers: BTreeMap<PeerAddress, NotificationSender<Vec<u8>>>,
    links: HashSet<PeerAddress>,
    notify_calls: usize,
}

impl Station {
    fn new(options: StationOptions) -> Self {
        Self {
            options,
            ..Default::default()
        }
    }

    fn has_fault(&self, fault: Fault) -> bool {
        self.faults.contains(&fault)
    }

    fn connect_delay(&self) -> Option<Duration> {
        self.faults.iter().find_map(|fault| match fault {
            Fault::DelayConnect(delay) => Some(*delay),
            _ => None,
        })
    }

    fn require_peripheral(&self) -> Result<(), RadioError> {
        if self.options.peripheral_capable {
            Ok(())
        } else {
            Err(RadioError::Unsupported("peripheral role".to_string()))
        }
    }

    /// Tell the GATT server who is subscribed right now
    fn announce_subscribers(&self) {
        if let Some(events) = &self.server_events {
            let current = self
                .subscribers
                .keys()
                .map(|address| SessionId::new(address.as_str()))
                .collect();
            let _ = events.send(PeripheralEvent::SubscribersChanged { current });
        }
    }
}

#[derive(Default)]
struct AirInner {
    stations: HashMap<PeerAddress, Station>,
}

impl AirInner {
    fn local(&mut self, address: &PeerAddress) -> Result<&mut Station, RadioError> {
        self.stations
            .get_mut(address)
            .ok_or(RadioError::AdapterUnavailable)
    }

    fn remote(&mut self, peer: &PeerAddress) -> Result<&mut Station, RadioError> {
        self.stations
            .get_mut(peer)
            .ok_or_else(|| RadioError::PeerNotFound(peer.clone()))
    }

    fn ensure_linked(&self, local: &PeerAddress, peer: &PeerAddress) -> Result<(), RadioError> {
        match self.stations.get(local) {
            Some(station) if station.links.contains(peer) => Ok(()),
            Some(_) => Err(RadioError::NotConnected(peer.clone())),
            None => Err(RadioError::AdapterUnavailable),
        }
    }

    fn advertisement_of(&self, address: &PeerAddress) -> Option<Advertisement> {
        let data = self.stations.get(address)?.advertisement.as_ref()?;
        let name = Some(data.local_name.as_str()).filter(|name| !name.is_empty());
        Some(Advertisement::new(address.clone(), name, &data.services))
    }

    fn broadcast(&self, advertisement: &Advertisement) {
        for station in self.stations.values() {
            if let Some(scanner) = &station.scanner {
                let _ = scanner.send(CentralEvent::Advertisement(advertisement.clone()));
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Virtual Air
// ----------------------------------------------------------------------------

/// Shared medium for virtual stations
#[derive(Clone, Default)]
pub struct VirtualAir {
    inner: Arc<Mutex<AirInner>>,
}

impl VirtualAir {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a station at `address`, returning its two radio halves
    pub async fn station(
        &self,
        address: impl Into<PeerAddress>,
        options: StationOptions,
    ) -> (VirtualCentral, VirtualPeripheral) {
        let address = address.into();
        self.inner
            .lock()
            .await
            .stations
            .insert(address.clone(), Station::new(options));

        (
            VirtualCentral {
                air: self.clone(),
                address: address.clone(),
            },
            VirtualPeripheral {
                air: self.clone(),
                address,
            },
        )
    }

    pub async fn set_fault(&self, address: &PeerAddress, fault: Fault) {
        if let Some(station) = self.inner.lock().await.stations.get_mut(address) {
            station.faults.push(fault);
        }
    }

    pub async fn clear_faults(&self, address: &PeerAddress) {
        if let Some(station) = self.inner.lock().await.stations.get_mut(address) {
            station.faults.clear();
        }
    }

    /// Deliver the station's current advertisement to every scanner again
    pub async fn rebroadcast(&self, address: &PeerAddress) {
        let inner = self.inner.lock().await;
        if let Some(advertisement) = inner.advertisement_of(address) {
            inner.broadcast(&advertisement);
        }
    }

    /// Remove a station; its links drop and linked centrals see a disconnect
    pub async fn power_off(&self, address: &PeerAddress) {
        let mut inner = self.inner.lock().await;
        if inner.stations.remove(address).is_none() {
            return;
        }

        for station in inner.stations.values_mut() {
            if station.links.remove(address) {
                if let Some(scanner) = &station.scanner {
                    let _ = scanner.send(CentralEvent::Disconnected(address.clone()));
                }
            }
            if station.subscribers.remove(address).is_some() {
                station.announce_subscribers();
            }
        }
        debug!("Station {} powered off", address);
    }

    /// Number of `notify_all` calls the station's peripheral has made
    pub async fn notify_calls(&self, address: &PeerAddress) -> usize {
        let inner = self.inner.lock().await;
        inner.stations.get(address).map_or(0, |s| s.notify_calls)
    }

    /// Centrals subscribed to the station's characteristic
    pub async fn subscribers(&self, address: &PeerAddress) -> Vec<PeerAddress> {
        let inner = self.inner.lock().await;
        inner
            .stations
            .get(address)
            .map(|s| s.subscribers.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn is_advertising(&self, address: &PeerAddress) -> bool {
        let inner = self.inner.lock().await;
        inner
            .stations
            .get(address)
            .is_some_and(|s| s.advertisement.is_some())
    }

    pub async fn is_scanning(&self, address: &PeerAddress) -> bool {
        let inner = self.inner.lock().await;
        inner
            .stations
            .get(address)
            .is_some_and(|s| s.scanner.is_some())
    }
}

// ----------------------------------------------------------------------------
// Central Half
// ----------------------------------------------------------------------------

pub struct VirtualCentral {
    air: VirtualAir,
    address: PeerAddress,
}

impl VirtualCentral {
    pub fn address(&self) -> &PeerAddress {
        &self.address
    }
}

#[async_trait]
impl CentralRadio for VirtualCentral {
    async fn start_scan(&self, _service: Uuid) -> Result<CentralEvents, RadioError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.air.inner.lock().await;

        let current: Vec<Advertisement> = inner
            .stations
            .keys()
            .filter_map(|address| inner.advertisement_of(address))
            .collect();
        for advertisement in current {
            let _ = tx.send(CentralEvent::Advertisement(advertisement));
        }

        inner.local(&self.address)?.scanner = Some(tx);
        Ok(rx)
    }

    async fn stop_scan(&self) -> Result<(), RadioError> {
        if let Ok(station) = self.air.inner.lock().await.local(&self.address) {
            station.scanner = None;
        }
        Ok(())
    }

    async fn connect(&self, peer: &PeerAddress) -> Result<(), RadioError> {
        let delay = {
            let mut inner = self.air.inner.lock().await;
            let remote = inner.remote(peer)?;
            if remote.has_fault(Fault::RejectConnect) {
                return Err(RadioError::Operation("connection refused".to_string()));
            }
            if remote.advertisement.is_none() {
                return Err(RadioError::PeerNotFound(peer.clone()));
            }
            remote.connect_delay()
        };

        if let Some(delay) = delay {
            sleep(delay).await;
        }

        let mut inner = self.air.inner.lock().await;
        inner.remote(peer)?;
        inner.local(&self.address)?.links.insert(peer.clone());
        trace!("{} connected to {}", self.address, peer);
        Ok(())
    }

    async fn resolve_service(
        &self,
        peer: &PeerAddress,
        service: Uuid,
    ) -> Result<Option<ServiceHandle>, RadioError> {
        let mut inner = self.air.inner.lock().await;
        inner.ensure_linked(&self.address, peer)?;
        let remote = inner.remote(peer)?;
        if remote.has_fault(Fault::HideService) {
            return Ok(None);
        }

        Ok(remote
            .service
            .as_ref()
            .filter(|spec| spec.service == service)
            .map(|spec| ServiceHandle { uuid: spec.service }))
    }

    async fn resolve_characteristic(
        &self,
        peer: &PeerAddress,
        service: &ServiceHandle,
        characteristic: Uuid,
    ) -> Result<Option<CharacteristicHandle>, RadioError> {
        let mut inner = self.air.inner.lock().await;
        inner.ensure_linked(&self.address, peer)?;
        let remote = inner.remote(peer)?;
        if remote.has_fault(Fault::HideCharacteristic) {
            return Ok(None);
        }

        Ok(remote
            .service
            .as_ref()
            .filter(|spec| spec.service == service.uuid && spec.characteristic == characteristic)
            .map(|spec| CharacteristicHandle {
                service: spec.service,
                uuid: spec.characteristic,
                properties: spec.properties,
            }))
    }

    async fn subscribe(
        &self,
        peer: &PeerAddress,
        characteristic: &CharacteristicHandle,
    ) -> Result<NotificationStream, RadioError> {
        let mut inner = self.air.inner.lock().await;
        inner.ensure_linked(&self.address, peer)?;
        let remote = inner.remote(peer)?;
        if remote.has_fault(Fault::RejectSubscribe) {
            return Err(RadioError::Operation("descriptor write rejected".to_string()));
        }
        let published = remote
            .service
            .as_ref()
            .is_some_and(|spec| spec.characteristic == characteristic.uuid && spec.properties.notify);
        if !published {
            return Err(RadioError::Operation("characteristic not published".to_string()));
        }

        let (tx, rx) = unbounded();
        remote.subscribers.insert(self.address.clone(), tx);
        remote.announce_subscribers();
        Ok(rx.boxed())
    }

    async fn write(
        &self,
        peer: &PeerAddress,
        _characteristic: &CharacteristicHandle,
        value: &[u8],
    ) -> Result<(), RadioError> {
        let outcome = {
            let mut inner = self.air.inner.lock().await;
            inner.ensure_linked(&self.address, peer)?;
            let remote = inner.remote(peer)?;
            if remote.has_fault(Fault::StallWrites) {
                drop(inner);
                return future::pending().await;
            }
            let events = remote
                .server_events
                .clone()
                .ok_or_else(|| RadioError::Operation("no service published".to_string()))?;

            let (deferral, outcome) = Deferral::new();
            // A closed server drops the request, which rejects the deferral
            let _ = events.send(PeripheralEvent::WriteRequested(WriteRequest {
                session: Some(SessionId::new(self.address.as_str())),
                kind: WriteKind::WithResponse,
                value: value.to_vec(),
                deferral,
            }));
            outcome
        };

        match await_outcome(outcome).await {
            WriteOutcome::Rejected => Err(RadioError::Operation("write rejected".to_string())),
            WriteOutcome::Responded | WriteOutcome::Acknowledged => Ok(()),
        }
    }

    async fn disconnect(&self, peer: &PeerAddress) -> Result<(), RadioError> {
        let mut inner = self.air.inner.lock().await;
        if let Ok(station) = inner.local(&self.address) {
            station.links.remove(peer);
        }
        if let Ok(remote) = inner.remote(peer) {
            if remote.subscribers.remove(&self.address).is_some() {
                remote.announce_subscribers();
            }
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Peripheral Half
// ----------------------------------------------------------------------------

pub struct VirtualPeripheral {
    air: VirtualAir,
    address: PeerAddress,
}

impl VirtualPeripheral {
    pub fn address(&self) -> &PeerAddress {
        &self.address
    }
}

#[async_trait]
impl PeripheralRadio for VirtualPeripheral {
    async fn publish_service(&self, spec: &GattServiceSpec) -> Result<PeripheralEvents, RadioError> {
        let mut inner = self.air.inner.lock().await;
        let station = inner.local(&self.address)?;
        station.require_peripheral()?;

        let (tx, rx) = mpsc::unbounded_channel();
        station.service = Some(spec.clone());
        station.server_events = Some(tx);
        station.subscribers.clear();
        Ok(rx)
    }

    async fn unpublish_service(&self) -> Result<(), RadioError> {
        let mut inner = self.air.inner.lock().await;
        if let Ok(station) = inner.local(&self.address) {
            station.service = None;
            station.server_events = None;
            // Dropping the senders ends every remote notification stream
            station.subscribers.clear();
        }
        Ok(())
    }

    async fn start_advertising(&self, advertisement: &AdvertisementData) -> Result<(), RadioError> {
        let mut inner = self.air.inner.lock().await;
        let station = inner.local(&self.address)?;
        station.require_peripheral()?;
        station.advertisement = Some(advertisement.clone());

        if let Some(advertisement) = inner.advertisement_of(&self.address) {
            inner.broadcast(&advertisement);
        }
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<(), RadioError> {
        if let Ok(station) = self.air.inner.lock().await.local(&self.address) {
            station.advertisement = None;
        }
        Ok(())
    }

    async fn notify_all(&self, characteristic: Uuid, value: Vec<u8>) -> Result<(), RadioError> {
        let mut inner = self.air.inner.lock().await;
        let station = inner.local(&self.address)?;
        station.notify_calls += 1;

        let published = station
            .service
            .as_ref()
            .is_some_and(|spec| spec.characteristic == characteristic);
        if !published {
            return Err(RadioError::Operation("characteristic not published".to_string()));
        }

        let total = station.subscribers.len();
        station
            .subscribers
            .retain(|_, tx| tx.unbounded_send(value.clone()).is_ok());
        let failed = total - station.subscribers.len();
        if failed > 0 {
            station.announce_subscribers();
            return Err(RadioError::NotifyFailed { failed, total });
        }
        Ok(())
    }
}
