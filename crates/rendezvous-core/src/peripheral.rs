//! Peripheral role: GATT service, advertising, writes and subscriptions

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::errors::RadioError;
use crate::identity::Identity;
use crate::radio::{
    AdvertisementData, GattServiceSpec, PeripheralEvent, PeripheralEvents, PeripheralRadio,
    WriteKind, WriteOutcome, WriteRequest,
};
use crate::session_registry::SessionRegistry;
use crate::sink::{MessageSink, SharedSink};
use crate::types::InboundMessage;

/// Publishes our service and turns its events into sink deliveries
pub struct PeripheralController<R: PeripheralRadio> {
    radio: Arc<R>,
    registry: SessionRegistry,
    sink: SharedSink,
    characteristic: Option<Uuid>,
    event_task: Option<JoinHandle<()>>,
}

impl<R: PeripheralRadio> PeripheralController<R> {
    pub fn new(radio: Arc<R>, sink: SharedSink) -> Self {
        Self {
            radio,
            registry: SessionRegistry::new(),
            sink,
            characteristic: None,
            event_task: None,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn is_advertising(&self) -> bool {
        self.characteristic.is_some()
    }

    /// Publish the service for `identity` and advertise it under `self_id`
    pub async fn start_advertising(&mut self, identity: &Identity, self_id: &str) -> Result<(), RadioError> {
        if self.is_advertising() {
            return Ok(());
        }

        let spec = GattServiceSpec::for_identity(identity);
        self.registry.open().await;
        let events = match self.radio.publish_service(&spec).await {
            Ok(events) => events,
            Err(err) => {
                self.registry.close().await;
                return Err(err);
            }
        };

        self.event_task = Some(tokio::spawn(run_events(
            self.registry.clone(),
            self.sink.clone(),
            events,
        )));
        self.characteristic = Some(spec.characteristic);

        let advertisement = AdvertisementData {
            local_name: self_id.to_string(),
            services: vec![spec.service],
        };
        if let Err(err) = self.radio.start_advertising(&advertisement).await {
            if let Err(teardown) = self.stop_advertising().await {
                debug!("Teardown after failed advertising start: {}", teardown);
            }
            return Err(err);
        }

        info!("Advertising service {} as {:?}", spec.service, self_id);
        Ok(())
    }

    /// Stop advertising, withdraw the service and forget every subscriber
    pub async fn stop_advertising(&mut self) -> Result<(), RadioError> {
        if self.characteristic.take().is_none() {
            return Ok(());
        }
        if let Some(task) = self.event_task.take() {
            task.abort();
        }

        let dropped = self.registry.close().await;
        debug!("Dropped {} subscriber sessions", dropped);

        let advertising = self.radio.stop_advertising().await;
        let service = self.radio.unpublish_service().await;
        advertising.and(service)
    }

    /// Handle for notifying subscribers without holding the controller;
    /// `None` while nothing is published
    pub fn publisher(&self) -> Option<Publisher<R>> {
        self.characteristic.map(|characteristic| Publisher {
            radio: self.radio.clone(),
            characteristic,
        })
    }

    /// Notify every subscriber with `payload` in a single fan-out
    pub async fn publish(&self, payload: &[u8]) -> Result<(), RadioError> {
        match self.publisher() {
            Some(publisher) => publisher.publish(payload).await,
            None => Ok(()),
        }
    }
}

/// Notifies the subscribers of one published characteristic
pub struct Publisher<R: PeripheralRadio> {
    radio: Arc<R>,
    characteristic: Uuid,
}

impl<R: PeripheralRadio> Publisher<R> {
    /// Notify every subscriber with `payload`
    ///
    /// Subscribers that went away since the last notification are dropped by
    /// the radio. That only fails the publish when no subscriber was reached.
    pub async fn publish(&self, payload: &[u8]) -> Result<(), RadioError> {
        if payload.is_empty() {
            return Ok(());
        }

        match self.radio.notify_all(self.characteristic, payload.to_vec()).await {
            Ok(()) => {}
            Err(RadioError::NotifyFailed { failed, total }) if failed < total => {
                debug!("Notification missed {} of {} subscribers", failed, total);
            }
            Err(err) => return Err(err),
        }
        trace!("Notified subscribers with {} bytes", payload.len());
        Ok(())
    }
}

impl<R: PeripheralRadio> Drop for PeripheralController<R> {
    fn drop(&mut self) {
        if let Some(task) = self.event_task.take() {
            task.abort();
        }
    }
}

/// Deliver a write to the sink and answer the platform
pub fn handle_write(sink: &dyn MessageSink, request: WriteRequest) -> WriteOutcome {
    let WriteRequest {
        session,
        kind,
        value,
        deferral,
    } = request;

    if value.is_empty() {
        trace!("Empty write from {:?}", session);
    } else {
        sink.deliver(InboundMessage::from_local_write(value));
    }

    let outcome = match kind {
        WriteKind::WithResponse => WriteOutcome::Responded,
        WriteKind::WithoutResponse => WriteOutcome::Acknowledged,
    };
    deferral.complete(outcome);
    outcome
}

async fn run_events(registry: SessionRegistry, sink: SharedSink, mut events: PeripheralEvents) {
    while let Some(event) = events.recv().await {
        match event {
            PeripheralEvent::WriteRequested(request) => {
                handle_write(sink.as_ref(), request);
            }
            PeripheralEvent::SubscribersChanged { current } => {
                match registry.replace_all(current).await {
                    Ok(count) => debug!("Subscribers changed: {} active", count),
                    Err(err) => warn!("Subscriber update dropped: {}", err),
                }
            }
        }
    }
    debug!("Peripheral event stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::{await_outcome, Deferral};
    use crate::sink::Mailbox;
    use crate::types::{Role, SessionId, LOCAL_PEER_ID};

    fn request(kind: WriteKind, value: &[u8]) -> (WriteRequest, tokio::sync::oneshot::Receiver<WriteOutcome>) {
        let (deferral, outcome) = Deferral::new();
        let request = WriteRequest {
            session: Some(SessionId::new("central-1")),
            kind,
            value: value.to_vec(),
            deferral,
        };
        (request, outcome)
    }

    #[tokio::test]
    async fn test_write_with_response_is_answered() {
        let mailbox = Mailbox::new();
        let (req, outcome) = request(WriteKind::WithResponse, b"hello");

        assert_eq!(handle_write(&mailbox, req), WriteOutcome::Responded);
        assert_eq!(await_outcome(outcome).await, WriteOutcome::Responded);

        let message = mailbox.latest().unwrap();
        assert_eq!(message.peer_id, LOCAL_PEER_ID);
        assert_eq!(message.payload, b"hello");
        assert_eq!(message.via, Role::Peripheral);
    }

    #[tokio::test]
    async fn test_empty_write_still_completes() {
        let mailbox = Mailbox::new();
        let (req, outcome) = request(WriteKind::WithoutResponse, b"");

        assert_eq!(handle_write(&mailbox, req), WriteOutcome::Acknowledged);
        assert_eq!(await_outcome(outcome).await, WriteOutcome::Acknowledged);
        assert!(mailbox.latest().is_none());
    }
}
