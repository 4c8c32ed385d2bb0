//! Error types for the rendezvous bridge
//!
//! Every fallible step reports its own error value: advertisement filtering
//! ([`Rejection`]), each link establishment step ([`LinkError`]), table
//! transitions ([`TransitionError`]), radio operations ([`RadioError`]) and
//! the facade itself ([`BridgeError`]).

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::peer_table::LinkPhase;
use crate::types::PeerAddress;

// ----------------------------------------------------------------------------
// Radio Errors
// ----------------------------------------------------------------------------

/// Failures reported by a radio adapter
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RadioError {
    #[error("BLE adapter not available")]
    AdapterUnavailable,

    #[error("{0} is not supported on this platform")]
    Unsupported(String),

    #[error("Peer not found: {0}")]
    PeerNotFound(PeerAddress),

    #[error("Peer not connected: {0}")]
    NotConnected(PeerAddress),

    #[error("Notification failed for {failed} of {total} subscribers")]
    NotifyFailed { failed: usize, total: usize },

    #[error("Radio event stream closed")]
    Closed,

    #[error("Radio operation timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Radio operation failed: {0}")]
    Operation(String),
}

impl RadioError {
    pub fn operation(context: &str, err: impl fmt::Display) -> Self {
        RadioError::Operation(format!("{}: {}", context, err))
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, RadioError::Unsupported(_))
    }
}

// ----------------------------------------------------------------------------
// Advertisement Filtering
// ----------------------------------------------------------------------------

/// Why an advertisement did not open a new peer connection
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    #[error("advertisement does not carry our service")]
    ForeignService,

    #[error("advertisement is our own")]
    OwnAdvertisement,

    #[error("peer already tracked")]
    AlreadyTracked,

    #[error("central role is stopped")]
    Stopped,
}

// ----------------------------------------------------------------------------
// Link Establishment
// ----------------------------------------------------------------------------

/// Steps of central-side link establishment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStep {
    Connect,
    ResolveService,
    ResolveCharacteristic,
    Subscribe,
}

impl fmt::Display for LinkStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkStep::Connect => "connect",
            LinkStep::ResolveService => "service resolution",
            LinkStep::ResolveCharacteristic => "characteristic resolution",
            LinkStep::Subscribe => "notification subscription",
        };
        f.write_str(name)
    }
}

/// A peer that never reached the subscribed state
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("{step} with {peer} failed: {source}")]
    Radio {
        peer: PeerAddress,
        step: LinkStep,
        #[source]
        source: RadioError,
    },

    #[error("{step} with {peer} timed out after {after:?}")]
    Timeout {
        peer: PeerAddress,
        step: LinkStep,
        after: Duration,
    },

    #[error("peer {peer} does not host service {service}")]
    ServiceMissing { peer: PeerAddress, service: Uuid },

    #[error("peer {peer} does not expose characteristic {characteristic}")]
    CharacteristicMissing {
        peer: PeerAddress,
        characteristic: Uuid,
    },

    #[error("link to {peer} was cancelled")]
    Cancelled { peer: PeerAddress },

    #[error("link to {peer} refused a state change: {source}")]
    Transition {
        peer: PeerAddress,
        #[source]
        source: TransitionError,
    },
}

impl LinkError {
    /// Map a refused table transition onto the link that attempted it
    pub fn from_transition(peer: &PeerAddress, err: TransitionError) -> Self {
        match err {
            TransitionError::Stale(_) => LinkError::Cancelled { peer: peer.clone() },
            source => LinkError::Transition {
                peer: peer.clone(),
                source,
            },
        }
    }

    /// Step at which establishment stopped, if it failed at one
    pub fn step(&self) -> Option<LinkStep> {
        match self {
            LinkError::Radio { step, .. } | LinkError::Timeout { step, .. } => Some(*step),
            LinkError::ServiceMissing { .. } => Some(LinkStep::ResolveService),
            LinkError::CharacteristicMissing { .. } => Some(LinkStep::ResolveCharacteristic),
            LinkError::Cancelled { .. } | LinkError::Transition { .. } => None,
        }
    }

    /// The device answered but is not one of ours
    pub fn is_protocol_mismatch(&self) -> bool {
        matches!(
            self,
            LinkError::ServiceMissing { .. } | LinkError::CharacteristicMissing { .. }
        )
    }

    pub fn peer(&self) -> &PeerAddress {
        match self {
            LinkError::Radio { peer, .. }
            | LinkError::Timeout { peer, .. }
            | LinkError::ServiceMissing { peer, .. }
            | LinkError::CharacteristicMissing { peer, .. }
            | LinkError::Cancelled { peer }
            | LinkError::Transition { peer, .. } => peer,
        }
    }
}

// ----------------------------------------------------------------------------
// Table Errors
// ----------------------------------------------------------------------------

/// A peer connection refused a state-machine input
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("no current connection entry for {0}")]
    Stale(PeerAddress),

    #[error("cannot move from {from} to {to}")]
    Invalid { from: LinkPhase, to: LinkPhase },
}

/// The session registry refused an update because the peripheral is stopped
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("session registry is closed")]
pub struct RegistryClosed;

// ----------------------------------------------------------------------------
// Facade Errors
// ----------------------------------------------------------------------------

/// Errors surfaced by the bridge facade
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("Central role failed to start: {0}")]
    CentralStart(#[source] RadioError),

    #[error("Failed to notify subscribers: {0}")]
    Notify(#[source] RadioError),

    #[error("Teardown incomplete: {0}")]
    Teardown(#[source] RadioError),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Configuration validation failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("link timeout must be greater than zero")]
    ZeroLinkTimeout,
}

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;
