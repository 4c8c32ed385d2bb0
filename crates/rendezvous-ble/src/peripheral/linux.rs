//! GATT server and advertiser on BlueZ via bluer

use std::sync::Arc;

use async_trait::async_trait;
use bluer::adv::{Advertisement, AdvertisementHandle};
use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic, CharacteristicNotifier, CharacteristicNotify,
    CharacteristicNotifyMethod, CharacteristicRead, CharacteristicWrite, CharacteristicWriteMethod,
    ReqError, Service,
};
use bluer::gatt::WriteOp;
use rendezvous_core::radio::await_outcome;
use rendezvous_core::{
    AdvertisementData, Deferral, GattServiceSpec, PeripheralEvent, PeripheralEvents,
    PeripheralRadio, ProtectionLevel, RadioError, SessionId, WriteKind, WriteOutcome, WriteRequest,
};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Server State
// ----------------------------------------------------------------------------

/// Notification session held open by a remote central
trait Notifier: Send + 'static {
    fn is_stopped(&self) -> bool;
}

impl Notifier for CharacteristicNotifier {
    fn is_stopped(&self) -> bool {
        CharacteristicNotifier::is_stopped(self)
    }
}

struct Subscriber<N> {
    session: SessionId,
    notifier: N,
}

/// Subscribed clients in subscription order
struct Roster<N> {
    next_session: u64,
    subscribers: Vec<Subscriber<N>>,
}

impl<N: Notifier> Roster<N> {
    fn new() -> Self {
        Self {
            next_session: 1,
            subscribers: Vec::new(),
        }
    }

    fn add(&mut self, notifier: N) -> SessionId {
        let session = SessionId::new(format!("notify-{}", self.next_session));
        self.next_session += 1;
        self.subscribers.push(Subscriber {
            session: session.clone(),
            notifier,
        });
        session
    }

    /// Drop ended sessions, reporting whether any were removed
    fn prune(&mut self) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|s| !s.notifier.is_stopped());
        self.subscribers.len() != before
    }

    fn sessions(&self) -> Vec<SessionId> {
        self.subscribers.iter().map(|s| s.session.clone()).collect()
    }
}

/// State reachable from the BlueZ request callbacks
struct ServerShared<N> {
    events: mpsc::UnboundedSender<PeripheralEvent>,
    roster: Mutex<Roster<N>>,
    last_value: Mutex<Vec<u8>>,
}

impl<N: Notifier> ServerShared<N> {
    fn new(events: mpsc::UnboundedSender<PeripheralEvent>) -> Self {
        Self {
            events,
            roster: Mutex::new(Roster::new()),
            last_value: Mutex::new(Vec::new()),
        }
    }

    /// Report the full subscriber list
    fn announce(&self, roster: &Roster<N>) {
        let _ = self.events.send(PeripheralEvent::SubscribersChanged {
            current: roster.sessions(),
        });
    }

    async fn add(&self, notifier: N) -> SessionId {
        let mut roster = self.roster.lock().await;
        roster.prune();
        let session = roster.add(notifier);
        self.announce(&roster);
        session
    }

    /// Forget ended sessions and announce the change, if any
    async fn prune(&self) {
        let mut roster = self.roster.lock().await;
        if roster.prune() {
            self.announce(&roster);
        }
    }

    /// Hand a write to the bridge and hold the request until it completes
    async fn write(&self, value: Vec<u8>, kind: WriteKind, session: SessionId) -> Result<(), ReqError> {
        let (deferral, outcome) = Deferral::new();
        let request = WriteRequest {
            session: Some(session),
            kind,
            value,
            deferral,
        };
        if self
            .events
            .send(PeripheralEvent::WriteRequested(request))
            .is_err()
        {
            return Err(ReqError::Failed);
        }

        match await_outcome(outcome).await {
            WriteOutcome::Rejected => Err(ReqError::Failed),
            WriteOutcome::Responded | WriteOutcome::Acknowledged => Ok(()),
        }
    }
}

impl ServerShared<CharacteristicNotifier> {
    /// Track a new notification session until the remote central ends it
    async fn add_subscriber(self: &Arc<Self>, notifier: CharacteristicNotifier) {
        let stopped = notifier.stopped();
        let session = self.add(notifier).await;

        let shared = Arc::downgrade(self);
        tokio::spawn(async move {
            stopped.await;
            if let Some(shared) = shared.upgrade() {
                debug!("Notification session {} ended", session);
                shared.prune().await;
            }
        });
    }
}

fn bridge_characteristic(
    spec: &GattServiceSpec,
    shared: &Arc<ServerShared<CharacteristicNotifier>>,
) -> Characteristic {
    let encrypted = spec.protection == ProtectionLevel::Encrypted;

    let read_shared = shared.clone();
    let write_shared = shared.clone();
    let notify_shared = shared.clone();

    Characteristic {
        uuid: spec.characteristic,
        read: Some(CharacteristicRead {
            read: spec.properties.read,
            encrypt_read: encrypted,
            fun: Box::new(move |_request| {
                let shared = read_shared.clone();
                Box::pin(async move { Ok(shared.last_value.lock().await.clone()) })
            }),
            ..Default::default()
        }),
        write: Some(CharacteristicWrite {
            write: spec.properties.write,
            write_without_response: spec.properties.write_without_response,
            encrypt_write: encrypted,
            method: CharacteristicWriteMethod::Fun(Box::new(move |value, request| {
                let shared = write_shared.clone();
                let kind = match request.op_type {
                    WriteOp::Command => WriteKind::WithoutResponse,
                    _ => WriteKind::WithResponse,
                };
                let session = SessionId::new(request.device_address.to_string());
                Box::pin(async move { shared.write(value, kind, session).await })
            })),
            ..Default::default()
        }),
        notify: Some(CharacteristicNotify {
            notify: spec.properties.notify,
            method: CharacteristicNotifyMethod::Fun(Box::new(move |notifier| {
                let shared = notify_shared.clone();
                Box::pin(async move { shared.add_subscriber(notifier).await })
            })),
            ..Default::default()
        }),
        ..Default::default()
    }
}

struct Server {
    _application: ApplicationHandle,
    characteristic: Uuid,
    shared: Arc<ServerShared<CharacteristicNotifier>>,
}

// ----------------------------------------------------------------------------
// BlueZ Peripheral
// ----------------------------------------------------------------------------

pub struct BluezPeripheral {
    _session: bluer::Session,
    adapter: bluer::Adapter,
    server: Mutex<Option<Server>>,
    advertisement: Mutex<Option<AdvertisementHandle>>,
}

impl BluezPeripheral {
    /// Connect to BlueZ and power on the default adapter
    pub async fn new() -> Result<Self, RadioError> {
        let session = bluer::Session::new()
            .await
            .map_err(|e| RadioError::operation("BlueZ session", e))?;
        let adapter = session
            .default_adapter()
            .await
            .map_err(|_| RadioError::AdapterUnavailable)?;

        if !adapter.is_powered().await.unwrap_or(false) {
            adapter
                .set_powered(true)
                .await
                .map_err(|e| RadioError::operation("Failed to power on adapter", e))?;
        }

        info!("BlueZ adapter {} ready for peripheral role", adapter.name());
        Ok(Self {
            _session: session,
            adapter,
            server: Mutex::new(None),
            advertisement: Mutex::new(None),
        })
    }
}

#[async_trait]
impl PeripheralRadio for BluezPeripheral {
    async fn publish_service(&self, spec: &GattServiceSpec) -> Result<PeripheralEvents, RadioError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ServerShared::new(tx));

        let application = Application {
            services: vec![Service {
                uuid: spec.service,
                primary: true,
                characteristics: vec![bridge_characteristic(spec, &shared)],
                ..Default::default()
            }],
            ..Default::default()
        };
        let handle = self
            .adapter
            .serve_gatt_application(application)
            .await
            .map_err(|e| RadioError::operation("Failed to register GATT service", e))?;

        *self.server.lock().await = Some(Server {
            _application: handle,
            characteristic: spec.characteristic,
            shared,
        });
        debug!("GATT service {} registered", spec.service);
        Ok(rx)
    }

    async fn unpublish_service(&self) -> Result<(), RadioError> {
        // Dropping the application handle unregisters it
        if self.server.lock().await.take().is_some() {
            debug!("GATT service unregistered");
        }
        Ok(())
    }

    async fn start_advertising(&self, advertisement: &AdvertisementData) -> Result<(), RadioError> {
        let local_name = Some(advertisement.local_name.clone()).filter(|name| !name.is_empty());
        let data = Advertisement {
            service_uuids: advertisement.services.iter().copied().collect(),
            local_name,
            discoverable: Some(true),
            ..Default::default()
        };

        let handle = self
            .adapter
            .advertise(data)
            .await
            .map_err(|e| RadioError::operation("Failed to start advertising", e))?;
        *self.advertisement.lock().await = Some(handle);

        info!("Started BLE advertising as {:?}", advertisement.local_name);
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<(), RadioError> {
        if self.advertisement.lock().await.take().is_some() {
            info!("Stopped BLE advertising");
        }
        Ok(())
    }

    async fn notify_all(&self, characteristic: Uuid, value: Vec<u8>) -> Result<(), RadioError> {
        let server = self.server.lock().await;
        let shared = match server.as_ref() {
            Some(server) if server.characteristic == characteristic => server.shared.clone(),
            _ => {
                return Err(RadioError::Operation(format!(
                    "characteristic {} not published",
                    characteristic
                )))
            }
        };
        drop(server);

        *shared.last_value.lock().await = value.clone();

        let mut roster = shared.roster.lock().await;
        let pruned = roster.prune();

        let total = roster.subscribers.len();
        let mut failed = 0;
        for subscriber in roster.subscribers.iter_mut() {
            if let Err(e) = subscriber.notifier.notify(value.clone()).await {
                debug!("Notify to {} failed: {}", subscriber.session, e);
                failed += 1;
            }
        }
        if pruned {
            shared.announce(&roster);
        }

        if failed > 0 {
            return Err(RadioError::NotifyFailed { failed, total });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Clone, Default)]
    struct FakeNotifier(Arc<AtomicBool>);

    impl FakeNotifier {
        fn stop(&self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    impl Notifier for FakeNotifier {
        fn is_stopped(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn expect_subscribers(events: &mut PeripheralEvents) -> Vec<SessionId> {
        match events.try_recv() {
            Ok(PeripheralEvent::SubscribersChanged { current }) => current,
            other => panic!("expected a subscriber update, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ended_session_is_announced() {
        let (tx, mut events) = mpsc::unbounded_channel();
        let shared = ServerShared::new(tx);
        let first = FakeNotifier::default();
        let second = FakeNotifier::default();

        let s1 = shared.add(first.clone()).await;
        assert_eq!(expect_subscribers(&mut events), vec![s1.clone()]);
        let s2 = shared.add(second.clone()).await;
        assert_eq!(expect_subscribers(&mut events), vec![s1, s2.clone()]);

        first.stop();
        shared.prune().await;
        assert_eq!(expect_subscribers(&mut events), vec![s2]);

        // Nothing changed, nothing announced
        shared.prune().await;
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_sessions_are_never_reused() {
        let mut roster = Roster::new();
        let first = FakeNotifier::default();
        let s1 = roster.add(first.clone());
        first.stop();
        assert!(roster.prune());

        let s2 = roster.add(FakeNotifier::default());
        assert_ne!(s1, s2);
        assert_eq!(roster.sessions(), vec![s2]);
    }
}
