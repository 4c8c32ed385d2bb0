//! Adapter seams between the bridge and a native BLE stack
//!
//! A radio adapter receives native callbacks and translates them into the
//! events below; the controllers never see platform types. Adapters exist
//! for btleplug and BlueZ in `rendezvous-ble` and for the in-memory medium in
//! [`crate::virtual_radio`].

use async_trait::async_trait;
use futures::stream::BoxStream;
use smallvec::SmallVec;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::errors::RadioError;
use crate::identity::Identity;
use crate::types::{PeerAddress, SessionId};

// ----------------------------------------------------------------------------
// GATT Descriptions
// ----------------------------------------------------------------------------

/// Characteristic properties relevant to the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
}

impl CharacteristicProperties {
    /// Read, write, write-without-response and notify
    pub const BRIDGE: Self = Self {
        read: true,
        write: true,
        write_without_response: true,
        notify: true,
    };
}

/// Link-layer protection required for characteristic access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProtectionLevel {
    #[default]
    Plain,
    Encrypted,
}

/// The single service published by the peripheral role
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattServiceSpec {
    pub service: Uuid,
    pub characteristic: Uuid,
    pub properties: CharacteristicProperties,
    pub protection: ProtectionLevel,
}

impl GattServiceSpec {
    pub fn for_identity(identity: &Identity) -> Self {
        Self {
            service: identity.service_uuid(),
            characteristic: identity.characteristic_uuid(),
            properties: CharacteristicProperties::BRIDGE,
            protection: ProtectionLevel::Plain,
        }
    }
}

/// Remote service resolved on a peer
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceHandle {
    pub uuid: Uuid,
}

/// Remote characteristic resolved on a peer
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CharacteristicHandle {
    pub service: Uuid,
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
}

// ----------------------------------------------------------------------------
// Advertisements
// ----------------------------------------------------------------------------

/// Advertisement observed by the central role
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub address: PeerAddress,
    pub local_name: Option<String>,
    pub services: SmallVec<[Uuid; 4]>,
}

impl Advertisement {
    pub fn new(address: impl Into<PeerAddress>, local_name: Option<&str>, services: &[Uuid]) -> Self {
        Self {
            address: address.into(),
            local_name: local_name.map(str::to_string),
            services: SmallVec::from_slice(services),
        }
    }

    pub fn advertises(&self, service: Uuid) -> bool {
        self.services.contains(&service)
    }
}

/// Advertisement broadcast by the peripheral role
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisementData {
    pub local_name: String,
    pub services: Vec<Uuid>,
}

// ----------------------------------------------------------------------------
// Write Requests and Deferred Completion
// ----------------------------------------------------------------------------

/// Whether the remote central expects an ATT response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    WithResponse,
    WithoutResponse,
}

/// How a write request was completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Response sent to the remote central
    Responded,
    /// No response was requested; the event is handled
    Acknowledged,
    /// Completed with an error response
    Rejected,
}

/// Completion token for a platform write event
///
/// The platform treats the event as pending until the deferral completes.
/// Dropping an uncompleted deferral completes it as [`WriteOutcome::Rejected`],
/// so the native stack is answered on every path.
#[derive(Debug)]
pub struct Deferral {
    completion: Option<oneshot::Sender<WriteOutcome>>,
}

impl Deferral {
    pub fn new() -> (Self, oneshot::Receiver<WriteOutcome>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                completion: Some(tx),
            },
            rx,
        )
    }

    pub fn complete(mut self, outcome: WriteOutcome) {
        self.finish(outcome);
    }

    fn finish(&mut self, outcome: WriteOutcome) {
        if let Some(tx) = self.completion.take() {
            // The adapter may have given up waiting; nothing left to answer
            let _ = tx.send(outcome);
        }
    }
}

impl Drop for Deferral {
    fn drop(&mut self) {
        self.finish(WriteOutcome::Rejected);
    }
}

/// Await a deferral's outcome from the adapter side
pub async fn await_outcome(outcome: oneshot::Receiver<WriteOutcome>) -> WriteOutcome {
    outcome.await.unwrap_or(WriteOutcome::Rejected)
}

/// Inbound write to our characteristic
#[derive(Debug)]
pub struct WriteRequest {
    pub session: Option<SessionId>,
    pub kind: WriteKind,
    pub value: Vec<u8>,
    pub deferral: Deferral,
}

// ----------------------------------------------------------------------------
// Events
// ----------------------------------------------------------------------------

/// Events delivered by a central radio while scanning
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CentralEvent {
    Advertisement(Advertisement),
    Disconnected(PeerAddress),
}

/// Events delivered by a peripheral radio while its service is published
#[derive(Debug)]
pub enum PeripheralEvent {
    WriteRequested(WriteRequest),
    /// Authoritative list of every currently subscribed client
    SubscribersChanged { current: Vec<SessionId> },
}

pub type CentralEvents = mpsc::UnboundedReceiver<CentralEvent>;
pub type PeripheralEvents = mpsc::UnboundedReceiver<PeripheralEvent>;

/// Value-changed notifications from one remote characteristic
pub type NotificationStream = BoxStream<'static, Vec<u8>>;

// ----------------------------------------------------------------------------
// Radio Traits
// ----------------------------------------------------------------------------

/// Central (scanner and GATT client) side of a BLE stack
#[async_trait]
pub trait CentralRadio: Send + Sync + 'static {
    /// Begin active scanning; the receiver yields events until `stop_scan`
    async fn start_scan(&self, service: Uuid) -> Result<CentralEvents, RadioError>;

    async fn stop_scan(&self) -> Result<(), RadioError>;

    async fn connect(&self, peer: &PeerAddress) -> Result<(), RadioError>;

    async fn resolve_service(
        &self,
        peer: &PeerAddress,
        service: Uuid,
    ) -> Result<Option<ServiceHandle>, RadioError>;

    async fn resolve_characteristic(
        &self,
        peer: &PeerAddress,
        service: &ServiceHandle,
        characteristic: Uuid,
    ) -> Result<Option<CharacteristicHandle>, RadioError>;

    /// Write the client characteristic configuration descriptor to enable
    /// notifications and return the value-changed stream
    async fn subscribe(
        &self,
        peer: &PeerAddress,
        characteristic: &CharacteristicHandle,
    ) -> Result<NotificationStream, RadioError>;

    async fn write(
        &self,
        peer: &PeerAddress,
        characteristic: &CharacteristicHandle,
        value: &[u8],
    ) -> Result<(), RadioError>;

    async fn disconnect(&self, peer: &PeerAddress) -> Result<(), RadioError>;
}

/// Peripheral (advertiser and GATT server) side of a BLE stack
#[async_trait]
pub trait PeripheralRadio: Send + Sync + 'static {
    /// Register the service; [`RadioError::Unsupported`] when the host cannot act as a peripheral
    async fn publish_service(&self, spec: &GattServiceSpec) -> Result<PeripheralEvents, RadioError>;

    async fn unpublish_service(&self) -> Result<(), RadioError>;

    async fn start_advertising(&self, advertisement: &AdvertisementData) -> Result<(), RadioError>;

    async fn stop_advertising(&self) -> Result<(), RadioError>;

    /// Notify every subscribed client in one fan-out
    async fn notify_all(&self, characteristic: Uuid, value: Vec<u8>) -> Result<(), RadioError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deferral_completes_explicitly() {
        let (deferral, outcome) = Deferral::new();
        deferral.complete(WriteOutcome::Responded);
        assert_eq!(await_outcome(outcome).await, WriteOutcome::Responded);
    }

    #[tokio::test]
    async fn test_dropped_deferral_rejects() {
        let (deferral, outcome) = Deferral::new();
        drop(deferral);
        assert_eq!(await_outcome(outcome).await, WriteOutcome::Rejected);
    }

    #[test]
    fn test_advertisement_service_match_is_exact() {
        let ours = Identity::derive("team1").service_uuid();
        let adv = Advertisement::new("AA", Some("X"), &[ours]);
        assert!(adv.advertises(ours));
        assert!(!adv.advertises(Identity::derive("team2").service_uuid()));
    }
}
