//! Central radio backed by btleplug

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent as AdapterEvent, CharPropFlags, Characteristic, Manager as _,
    Peripheral as _, PeripheralProperties, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::future;
use futures::stream::StreamExt;
use rendezvous_core::{
    Advertisement, CentralEvent, CentralEvents, CentralRadio, CharacteristicHandle,
    CharacteristicProperties, NotificationStream, PeerAddress, RadioError, ServiceHandle,
};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Adapter State
// ----------------------------------------------------------------------------

struct Shared {
    adapter: Adapter,
    peripherals: RwLock<HashMap<PeerAddress, Peripheral>>,
}

impl Shared {
    /// Translate an adapter event, remembering the peripheral behind each advertisement
    async fn translate(&self, event: AdapterEvent) -> Option<CentralEvent> {
        match event {
            AdapterEvent::DeviceDiscovered(id)
            | AdapterEvent::DeviceUpdated(id)
            | AdapterEvent::ServicesAdvertisement { id, .. } => {
                let peripheral = self.adapter.peripheral(&id).await.ok()?;
                let properties = peripheral.properties().await.ok()??;
                let advertisement = advertisement(&id, &properties);
                self.peripherals
                    .write()
                    .await
                    .insert(advertisement.address.clone(), peripheral);

                Some(CentralEvent::Advertisement(advertisement))
            }
            AdapterEvent::DeviceDisconnected(id) => {
                Some(CentralEvent::Disconnected(peer_address(&id)))
            }
            _ => None,
        }
    }

    async fn peripheral(&self, peer: &PeerAddress) -> Result<Peripheral, RadioError> {
        self.peripherals
            .read()
            .await
            .get(peer)
            .cloned()
            .ok_or_else(|| RadioError::PeerNotFound(peer.clone()))
    }
}

/// Peers are keyed by the adapter's peripheral id; CoreBluetooth hides the
/// device address and reports all zeroes for every peripheral
fn peer_address(id: &impl fmt::Display) -> PeerAddress {
    PeerAddress::new(id.to_string())
}

fn advertisement(id: &impl fmt::Display, properties: &PeripheralProperties) -> Advertisement {
    Advertisement::new(
        peer_address(id),
        properties.local_name.as_deref(),
        &properties.services,
    )
}

fn find_characteristic(
    peripheral: &Peripheral,
    handle: &CharacteristicHandle,
) -> Result<Characteristic, RadioError> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == handle.uuid && c.service_uuid == handle.service)
        .ok_or_else(|| RadioError::Operation(format!("characteristic {} not discovered", handle.uuid)))
}

fn properties(flags: CharPropFlags) -> CharacteristicProperties {
    CharacteristicProperties {
        read: flags.contains(CharPropFlags::READ),
        write: flags.contains(CharPropFlags::WRITE),
        write_without_response: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
        notify: flags.contains(CharPropFlags::NOTIFY),
    }
}

// ----------------------------------------------------------------------------
// btleplug Central
// ----------------------------------------------------------------------------

/// Scanner and GATT client on the first system adapter
pub struct BtleplugCentral {
    shared: Arc<Shared>,
    scan_task: Mutex<Option<JoinHandle<()>>>,
}

impl BtleplugCentral {
    /// Open the first BLE adapter
    pub async fn new() -> Result<Self, RadioError> {
        let manager = Manager::new()
            .await
            .map_err(|e| RadioError::operation("Failed to create BLE manager", e))?;

        let adapter = manager
            .adapters()
            .await
            .map_err(|e| RadioError::operation("Failed to get BLE adapters", e))?
            .into_iter()
            .next()
            .ok_or(RadioError::AdapterUnavailable)?;

        info!("BLE adapter initialized");
        Ok(Self {
            shared: Arc::new(Shared {
                adapter,
                peripherals: RwLock::new(HashMap::new()),
            }),
            scan_task: Mutex::new(None),
        })
    }
}

#[async_trait]
impl CentralRadio for BtleplugCentral {
    async fn start_scan(&self, service: Uuid) -> Result<CentralEvents, RadioError> {
        let mut adapter_events = self
            .shared
            .adapter
            .events()
            .await
            .map_err(|e| RadioError::operation("Failed to get BLE events", e))?;

        self.shared
            .adapter
            .start_scan(ScanFilter {
                services: vec![service],
            })
            .await
            .map_err(|e| RadioError::operation("Failed to start BLE scan", e))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let shared = self.shared.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = adapter_events.next().await {
                if let Some(event) = shared.translate(event).await {
                    if tx.send(event).is_err() {
                        break;
                    }
                }
            }
            debug!("BLE adapter event stream ended");
        });

        if let Some(previous) = self.scan_task.lock().await.replace(task) {
            previous.abort();
        }
        Ok(rx)
    }

    async fn stop_scan(&self) -> Result<(), RadioError> {
        if let Some(task) = self.scan_task.lock().await.take() {
            task.abort();
        }
        self.shared.peripherals.write().await.clear();
        self.shared
            .adapter
            .stop_scan()
            .await
            .map_err(|e| RadioError::operation("Failed to stop BLE scan", e))
    }

    async fn connect(&self, peer: &PeerAddress) -> Result<(), RadioError> {
        self.shared
            .peripheral(peer)
            .await?
            .connect()
            .await
            .map_err(|e| RadioError::operation("Connection failed", e))
    }

    async fn resolve_service(
        &self,
        peer: &PeerAddress,
        service: Uuid,
    ) -> Result<Option<ServiceHandle>, RadioError> {
        let peripheral = self.shared.peripheral(peer).await?;
        peripheral
            .discover_services()
            .await
            .map_err(|e| RadioError::operation("Failed to discover services", e))?;

        Ok(peripheral
            .services()
            .iter()
            .find(|s| s.uuid == service)
            .map(|s| ServiceHandle { uuid: s.uuid }))
    }

    async fn resolve_characteristic(
        &self,
        peer: &PeerAddress,
        service: &ServiceHandle,
        characteristic: Uuid,
    ) -> Result<Option<CharacteristicHandle>, RadioError> {
        let peripheral = self.shared.peripheral(peer).await?;
        Ok(peripheral
            .services()
            .iter()
            .filter(|s| s.uuid == service.uuid)
            .flat_map(|s| s.characteristics.iter())
            .find(|c| c.uuid == characteristic)
            .map(|c| CharacteristicHandle {
                service: c.service_uuid,
                uuid: c.uuid,
                properties: properties(c.properties),
            }))
    }

    async fn subscribe(
        &self,
        peer: &PeerAddress,
        characteristic: &CharacteristicHandle,
    ) -> Result<NotificationStream, RadioError> {
        let peripheral = self.shared.peripheral(peer).await?;
        let target = find_characteristic(&peripheral, characteristic)?;

        peripheral
            .subscribe(&target)
            .await
            .map_err(|e| RadioError::operation("Failed to subscribe to notifications", e))?;
        let notifications = peripheral
            .notifications()
            .await
            .map_err(|e| RadioError::operation("Failed to get notifications stream", e))?;

        let uuid = target.uuid;
        Ok(notifications
            .filter(move |n| future::ready(n.uuid == uuid))
            .map(|n| n.value)
            .boxed())
    }

    async fn write(
        &self,
        peer: &PeerAddress,
        characteristic: &CharacteristicHandle,
        value: &[u8],
    ) -> Result<(), RadioError> {
        let peripheral = self.shared.peripheral(peer).await?;
        let target = find_characteristic(&peripheral, characteristic)?;
        let write_type = if characteristic.properties.write {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };

        peripheral
            .write(&target, value, write_type)
            .await
            .map_err(|e| RadioError::operation("Failed to write to characteristic", e))?;
        debug!("Wrote {} bytes to peer {}", value.len(), peer);
        Ok(())
    }

    async fn disconnect(&self, peer: &PeerAddress) -> Result<(), RadioError> {
        self.shared
            .peripheral(peer)
            .await?
            .disconnect()
            .await
            .map_err(|e| RadioError::operation("Failed to disconnect", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peers_keyed_by_peripheral_id() {
        let service = rendezvous_core::Identity::derive("team1").service_uuid();
        // Both report the zeroed address CoreBluetooth exposes
        let properties = PeripheralProperties {
            local_name: Some("Y".to_string()),
            services: vec![service],
            ..Default::default()
        };

        let first = advertisement(&"6a1f0c2e-0000-4000-8000-000000000001", &properties);
        let second = advertisement(&"6a1f0c2e-0000-4000-8000-000000000002", &properties);

        assert_ne!(first.address, second.address);
        assert_eq!(first.address.as_str(), "6a1f0c2e-0000-4000-8000-000000000001");
        assert!(first.advertises(service));
        assert_eq!(first.local_name.as_deref(), Some("Y"));
    }

    #[test]
    fn test_property_flags_map() {
        let flags = CharPropFlags::READ | CharPropFlags::NOTIFY;
        let mapped = properties(flags);
        assert!(mapped.read && mapped.notify);
        assert!(!mapped.write && !mapped.write_without_response);

        let all = CharPropFlags::READ
            | CharPropFlags::WRITE
            | CharPropFlags::WRITE_WITHOUT_RESPONSE
            | CharPropFlags::NOTIFY;
        assert_eq!(properties(all), CharacteristicProperties::BRIDGE);
    }
}
