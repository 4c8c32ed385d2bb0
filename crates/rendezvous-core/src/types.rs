//! Identifiers and messages shared by both roles

use std::fmt;

use serde::{Deserialize, Serialize};

/// Peer identifier reported for data written to our own characteristic
pub const LOCAL_PEER_ID: &str = "local";

// ----------------------------------------------------------------------------
// Addresses and Sessions
// ----------------------------------------------------------------------------

/// Opaque native identifier of a remote device, used as the dedup key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerAddress(String);

impl PeerAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for PeerAddress {
    fn from(address: String) -> Self {
        Self(address)
    }
}

impl From<&str> for PeerAddress {
    fn from(address: &str) -> Self {
        Self(address.to_string())
    }
}

/// Platform handle of a remote client subscribed to our characteristic
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(session: impl Into<String>) -> Self {
        Self(session.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ----------------------------------------------------------------------------
// Inbound Messages
// ----------------------------------------------------------------------------

/// Which role of the bridge received a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Notification from a remote peripheral we subscribed to
    Central,
    /// Write from a remote central to our characteristic
    Peripheral,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Central => f.write_str("central"),
            Role::Peripheral => f.write_str("peripheral"),
        }
    }
}

/// One payload delivered to the host application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub peer_id: String,
    pub payload: Vec<u8>,
    pub via: Role,
}

impl InboundMessage {
    pub fn new(peer_id: impl Into<String>, payload: Vec<u8>, via: Role) -> Self {
        Self {
            peer_id: peer_id.into(),
            payload,
            via,
        }
    }

    /// Notification received from `address` over the central role
    pub fn from_peer(address: &PeerAddress, payload: Vec<u8>) -> Self {
        Self::new(address.to_string(), payload, Role::Central)
    }

    /// Write received by our own characteristic
    pub fn from_local_write(payload: Vec<u8>) -> Self {
        Self::new(LOCAL_PEER_ID, payload, Role::Peripheral)
    }
}
