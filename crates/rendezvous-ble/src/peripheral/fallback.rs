//! Peripheral stand-in for hosts without GATT server support

use async_trait::async_trait;
use rendezvous_core::{AdvertisementData, GattServiceSpec, PeripheralEvents, PeripheralRadio, RadioError};
use tracing::warn;
use uuid::Uuid;

const ROLE: &str = "BLE peripheral role";

/// Refuses to publish, which keeps the bridge central-only
#[derive(Debug, Default)]
pub struct FallbackPeripheral;

impl FallbackPeripheral {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PeripheralRadio for FallbackPeripheral {
    async fn publish_service(&self, spec: &GattServiceSpec) -> Result<PeripheralEvents, RadioError> {
        warn!(
            "Cannot publish service {} on this platform; this host will not be discoverable",
            spec.service
        );
        Err(RadioError::Unsupported(ROLE.to_string()))
    }

    async fn unpublish_service(&self) -> Result<(), RadioError> {
        Ok(())
    }

    async fn start_advertising(&self, _advertisement: &AdvertisementData) -> Result<(), RadioError> {
        Err(RadioError::Unsupported(ROLE.to_string()))
    }

    async fn stop_advertising(&self) -> Result<(), RadioError> {
        Ok(())
    }

    async fn notify_all(&self, _characteristic: Uuid, _value: Vec<u8>) -> Result<(), RadioError> {
        Err(RadioError::Unsupported(ROLE.to_string()))
    }
}
