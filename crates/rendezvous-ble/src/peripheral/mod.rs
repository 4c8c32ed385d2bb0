//! Peripheral radio with platform detection

pub mod fallback;
#[cfg(target_os = "linux")]
pub mod linux;

use async_trait::async_trait;
use rendezvous_core::{AdvertisementData, GattServiceSpec, PeripheralEvents, PeripheralRadio, RadioError};
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Platform Detection
// ----------------------------------------------------------------------------

/// Peripheral radio for the current platform
pub enum PlatformPeripheral {
    #[cfg(target_os = "linux")]
    Bluez(linux::BluezPeripheral),
    Fallback(fallback::FallbackPeripheral),
}

impl PlatformPeripheral {
    /// Open the platform's GATT server, falling back when none is reachable
    pub async fn new() -> Self {
        #[cfg(target_os = "linux")]
        {
            match linux::BluezPeripheral::new().await {
                Ok(peripheral) => Self::Bluez(peripheral),
                Err(err) => {
                    tracing::warn!("BlueZ unavailable, peripheral role disabled: {}", err);
                    Self::Fallback(fallback::FallbackPeripheral::new())
                }
            }
        }
        #[cfg(not(target_os = "linux"))]
        {
            Self::Fallback(fallback::FallbackPeripheral::new())
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, Self::Fallback(_))
    }
}

#[async_trait]
impl PeripheralRadio for PlatformPeripheral {
    async fn publish_service(&self, spec: &GattServiceSpec) -> Result<PeripheralEvents, RadioError> {
        match self {
            #[cfg(target_os = "linux")]
            Self::Bluez(radio) => radio.publish_service(spec).await,
            Self::Fallback(radio) => radio.publish_service(spec).await,
        }
    }

    async fn unpublish_service(&self) -> Result<(), RadioError> {
        match self {
            #[cfg(target_os = "linux")]
            Self::Bluez(radio) => radio.unpublish_service().await,
            Self::Fallback(radio) => radio.unpublish_service().await,
        }
    }

    async fn start_advertising(&self, advertisement: &AdvertisementData) -> Result<(), RadioError> {
        match self {
            #[cfg(target_os = "linux")]
            Self::Bluez(radio) => radio.start_advertising(advertisement).await,
            Self::Fallback(radio) => radio.start_advertising(advertisement).await,
        }
    }

    async fn stop_advertising(&self) -> Result<(), RadioError> {
        match self {
            #[cfg(target_os = "linux")]
            Self::Bluez(radio) => radio.stop_advertising().await,
            Self::Fallback(radio) => radio.stop_advertising().await,
        }
    }

    async fn notify_all(&self, characteristic: Uuid, value: Vec<u8>) -> Result<(), RadioError> {
        match self {
            #[cfg(target_os = "linux")]
            Self::Bluez(radio) => radio.notify_all(characteristic, value).await,
            Self::Fallback(radio) => radio.notify_all(characteristic, value).await,
        }
    }
}
