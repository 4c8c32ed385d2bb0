//! Native radio adapters for the rendezvous bridge
//!
//! - [`BtleplugCentral`] scans and acts as GATT client through btleplug on
//!   every platform btleplug supports.
//! - [`PlatformPeripheral`] publishes the GATT service and advertises through
//!   BlueZ on Linux. Other platforms get a fallback that refuses the role, so
//!   the bridge runs central-only there.
//!
//! ```rust,no_run
//! use rendezvous_ble::platform_bridge;
//! use rendezvous_core::{BridgeConfig, Mailbox};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mailbox = Mailbox::new();
//! let bridge = platform_bridge(mailbox.clone(), BridgeConfig::default()).await?;
//!
//! bridge.start("team1", "X").await?;
//! bridge.send(b"ping").await?;
//! # Ok(())
//! # }
//! ```

mod central;
mod error;
mod peripheral;

pub use central::BtleplugCentral;
pub use error::BleError;
pub use peripheral::fallback::FallbackPeripheral;
#[cfg(target_os = "linux")]
pub use peripheral::linux::BluezPeripheral;
pub use peripheral::PlatformPeripheral;

use rendezvous_core::{Bridge, BridgeConfig, MessageSink};
use tracing::info;

/// Bridge over the host's BLE radios
pub type PlatformBridge = Bridge<BtleplugCentral, PlatformPeripheral>;

/// Open the host radios and build a stopped bridge delivering into `sink`
pub async fn platform_bridge(
    sink: impl MessageSink,
    config: BridgeConfig,
) -> Result<PlatformBridge, BleError> {
    let central = BtleplugCentral::new().await?;
    let peripheral = PlatformPeripheral::new().await;
    let config = host_config(config, peripheral.is_supported());
    Ok(Bridge::with_config(central, peripheral, sink, config)?)
}

/// Disable the peripheral role up front on hosts that cannot serve it
fn host_config(config: BridgeConfig, peripheral_supported: bool) -> BridgeConfig {
    if config.peripheral_enabled && !peripheral_supported {
        info!("No GATT server on this host, running central-only");
        return config.with_peripheral(false);
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_host_disables_peripheral() {
        let config = BridgeConfig::default();
        assert!(!host_config(config.clone(), false).peripheral_enabled);
        assert!(host_config(config.clone(), true).peripheral_enabled);

        let central_only = config.with_peripheral(false);
        assert!(!host_config(central_only, true).peripheral_enabled);
    }

    #[test]
    fn test_fallback_is_not_supported() {
        let peripheral = PlatformPeripheral::Fallback(FallbackPeripheral::new());
        assert!(!peripheral.is_supported());
    }
}
