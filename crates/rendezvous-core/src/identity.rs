//! Service and characteristic identity derived from a client identifier
//!
//! Instances sharing a client identifier must land on the same GATT service so
//! they can find each other, while unrelated networks should not. The client
//! identifier is folded into the 16-bit slot of the Bluetooth SIG base UUID,
//! which keeps the result usable with 16-bit oriented advertisement filters.
//! This caps the space at 65536 networks; it is a discovery key, not a
//! security boundary.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ----------------------------------------------------------------------------
// BLE Service and Characteristic UUIDs
// ----------------------------------------------------------------------------

/// Bluetooth SIG base UUID (`00000000-0000-1000-8000-00805F9B34FB`)
pub const BLUETOOTH_BASE_UUID: Uuid = Uuid::from_u128(0x00000000_0000_1000_8000_00805F9B34FB);

/// Data characteristic shared by every identity
pub const BRIDGE_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000FFF1_0000_1000_8000_00805F9B34FB);

// ----------------------------------------------------------------------------
// Identity
// ----------------------------------------------------------------------------

/// GATT identity of one bridge network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    service_uuid: Uuid,
    characteristic_uuid: Uuid,
}

impl Identity {
    /// Derive the identity for a client identifier
    pub fn derive(client_id: &str) -> Self {
        Self::from_short_hash(short_hash(client_id))
    }

    /// Build the identity whose service sits at `short` in the base UUID
    pub fn from_short_hash(short: u16) -> Self {
        let service = BLUETOOTH_BASE_UUID.as_u128() | (u128::from(short) << 96);
        Self {
            service_uuid: Uuid::from_u128(service),
            characteristic_uuid: BRIDGE_CHARACTERISTIC_UUID,
        }
    }

    pub fn service_uuid(&self) -> Uuid {
        self.service_uuid
    }

    pub fn characteristic_uuid(&self) -> Uuid {
        self.characteristic_uuid
    }

    /// The 16-bit network fingerprint carried in the service UUID
    pub fn short_hash(&self) -> u16 {
        (self.service_uuid.as_u128() >> 96) as u16
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "service {} / characteristic {}",
            self.service_uuid, self.characteristic_uuid
        )
    }
}

// ----------------------------------------------------------------------------
// Hashing
// ----------------------------------------------------------------------------

/// Order-dependent 32-bit rolling hash (`h = h * 31 + byte`, seed 0)
pub fn client_hash(client_id: &str) -> u32 {
    client_id
        .bytes()
        .fold(0u32, |hash, byte| hash.wrapping_mul(31).wrapping_add(u32::from(byte)))
}

/// Low 16 bits of [`client_hash`]
pub fn short_hash(client_id: &str) -> u16 {
    (client_hash(client_id) & 0xFFFF) as u16
}
