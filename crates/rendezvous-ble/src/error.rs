//! Error types for bringing up the native bridge

use rendezvous_core::{BridgeError, RadioError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BleError {
    #[error("BLE radio unavailable: {0}")]
    Radio(#[from] RadioError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}
