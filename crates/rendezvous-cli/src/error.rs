//! Error handling for the rendezvous CLI

use thiserror::Error;

use crate::config::ConfigError;

#[derive(Error, Debug)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Bridge error: {0}")]
    Bridge(#[from] rendezvous_core::BridgeError),

    #[error("BLE initialization failed: {0}")]
    Ble(#[from] rendezvous_ble::BleError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Hex decoding error: {0}")]
    HexDecoding(#[from] hex::FromHexError),

    #[error("Demo failed: {0}")]
    Demo(String),
}

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;
