//! Dual-role BLE rendezvous bridge
//!
//! Instances started with the same client identifier derive the same GATT
//! service, find each other while scanning, subscribe to each other's
//! characteristic and exchange raw byte payloads. The [`Bridge`] facade owns a
//! central controller (scan, filter, connect, subscribe) and a peripheral
//! controller (publish, advertise, accept writes, notify), both driven through
//! the radio traits in [`radio`].

pub mod bridge;
pub mod central;
pub mod config;
pub mod errors;
pub mod identity;
pub mod peer_table;
pub mod peripheral;
pub mod radio;
pub mod session_registry;
pub mod sink;
pub mod types;
pub mod virtual_radio;

pub use bridge::{Bridge, BridgeMode, BridgeState};
pub use central::{filter_advertisement, CentralController, PeerWriter, WriteReport};
pub use config::BridgeConfig;
pub use errors::{
    BridgeError, ConfigError, LinkError, LinkStep, RadioError, RegistryClosed, Rejection, Result,
    TransitionError,
};
pub use identity::{client_hash, short_hash, Identity, BLUETOOTH_BASE_UUID, BRIDGE_CHARACTERISTIC_UUID};
pub use peer_table::{AttemptId, LinkPhase, LinkState, PeerConnection, PeerSummary, PeerTable};
pub use peripheral::{handle_write, PeripheralController, Publisher};
pub use radio::{
    Advertisement, AdvertisementData, CentralEvent, CentralEvents, CentralRadio,
    CharacteristicHandle, CharacteristicProperties, Deferral, GattServiceSpec, NotificationStream,
    PeripheralEvent, PeripheralEvents, PeripheralRadio, ProtectionLevel, ServiceHandle, WriteKind,
    WriteOutcome, WriteRequest,
};
pub use session_registry::{SessionRegistry, SubscriberSession};
pub use sink::{FnSink, Mailbox, MessageSink, SharedSink};
pub use types::{InboundMessage, PeerAddress, Role, SessionId, LOCAL_PEER_ID};
pub use virtual_radio::{Fault, StationOptions, VirtualAir, VirtualCentral, VirtualPeripheral};
