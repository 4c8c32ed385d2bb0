//! Bridge facade owning both roles
//!
//! A [`Bridge`] is an ordinary value: create as many as needed, each with its
//! own radios and sink. Its lifecycle is `Stopped -> Starting -> Running ->
//! Stopped`; `start` while running and `stop` while stopped are no-ops.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::central::{CentralController, WriteReport};
use crate::config::BridgeConfig;
use crate::errors::{BridgeError, RadioError, Result};
use crate::identity::Identity;
use crate::peer_table::{PeerSummary, PeerTable};
use crate::peripheral::PeripheralController;
use crate::radio::{CentralRadio, PeripheralRadio};
use crate::session_registry::SessionRegistry;
use crate::sink::{MessageSink, SharedSink};

// ----------------------------------------------------------------------------
// Lifecycle State
// ----------------------------------------------------------------------------

/// Which roles a running bridge operates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeMode {
    /// Scanning and advertising
    DualRole,
    /// Peripheral role unavailable or disabled; receive-only over notifications
    CentralOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Stopped,
    Starting,
    Running(BridgeMode),
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeState::Stopped => f.write_str("stopped"),
            BridgeState::Starting => f.write_str("starting"),
            BridgeState::Running(BridgeMode::DualRole) => f.write_str("running (dual role)"),
            BridgeState::Running(BridgeMode::CentralOnly) => f.write_str("running (central only)"),
        }
    }
}

struct Session {
    identity: Identity,
    mode: BridgeMode,
}

struct Roles<C: CentralRadio, P: PeripheralRadio> {
    central: CentralController<C>,
    peripheral: PeripheralController<P>,
    session: Option<Session>,
}

// ----------------------------------------------------------------------------
// Bridge
// ----------------------------------------------------------------------------

/// Dual-role rendezvous bridge
pub struct Bridge<C: CentralRadio, P: PeripheralRadio> {
    config: BridgeConfig,
    state: watch::Sender<BridgeState>,
    roles: Mutex<Roles<C, P>>,
    peers: PeerTable,
    subscribers: SessionRegistry,
}

impl<C: CentralRadio, P: PeripheralRadio> Bridge<C, P> {
    /// Create a stopped bridge with the default configuration
    pub fn new(central: C, peripheral: P, sink: impl MessageSink) -> Self {
        Self::build(central, peripheral, Arc::new(sink), BridgeConfig::default())
    }

    /// Create a stopped bridge with a validated configuration
    pub fn with_config(
        central: C,
        peripheral: P,
        sink: impl MessageSink,
        config: BridgeConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(central, peripheral, Arc::new(sink), config))
    }

    fn build(central: C, peripheral: P, sink: SharedSink, config: BridgeConfig) -> Self {
        let central = CentralController::new(Arc::new(central), sink.clone(), config.link_timeout);
        let peripheral = PeripheralController::new(Arc::new(peripheral), sink);
        let (state, _) = watch::channel(BridgeState::Stopped);

        Self {
            peers: central.table().clone(),
            subscribers: peripheral.registry().clone(),
            config,
            state,
            roles: Mutex::new(Roles {
                central,
                peripheral,
                session: None,
            }),
        }
    }

    /// Begin dual-role discovery for `client_id`, advertising as `self_id`
    ///
    /// A central failure rolls the bridge back to `Stopped`. A peripheral
    /// failure leaves it running central-only.
    pub async fn start(&self, client_id: &str, self_id: &str) -> Result<BridgeMode> {
        let mut roles = self.roles.lock().await;
        if let Some(session) = &roles.session {
            debug!("Bridge already running");
            return Ok(session.mode);
        }

        let identity = Identity::derive(client_id);
        self.state.send_replace(BridgeState::Starting);
        info!("Starting bridge as {:?}: {}", self_id, identity);

        let Roles {
            central,
            peripheral,
            ..
        } = &mut *roles;
        let peripheral_enabled = self.config.peripheral_enabled;
        let peripheral_start = async {
            if peripheral_enabled {
                Some(peripheral.start_advertising(&identity, self_id).await)
            } else {
                None
            }
        };
        let (central_result, peripheral_result) =
            tokio::join!(central.start_scanning(&identity, self_id), peripheral_start);

        if let Err(err) = central_result {
            if let Some(Ok(())) = peripheral_result {
                if let Err(teardown) = peripheral.stop_advertising().await {
                    debug!("Peripheral rollback failed: {}", teardown);
                }
            }
            self.state.send_replace(BridgeState::Stopped);
            return Err(BridgeError::CentralStart(err));
        }

        let mode = match peripheral_result {
            Some(Ok(())) => BridgeMode::DualRole,
            Some(Err(err)) => {
                warn!("Peripheral role unavailable, running central-only: {}", err);
                BridgeMode::CentralOnly
            }
            None => BridgeMode::CentralOnly,
        };

        roles.session = Some(Session { identity, mode });
        self.state.send_replace(BridgeState::Running(mode));
        info!("Bridge running: {:?}", mode);
        Ok(mode)
    }

    /// Halt both roles and clear all tables
    ///
    /// The bridge always ends `Stopped`; the first teardown error is returned.
    pub async fn stop(&self) -> Result<()> {
        let mut roles = self.roles.lock().await;
        if roles.session.take().is_none() {
            return Ok(());
        }

        let Roles {
            central,
            peripheral,
            ..
        } = &mut *roles;
        let (central_result, peripheral_result) =
            tokio::join!(central.stop_scanning(), peripheral.stop_advertising());

        self.state.send_replace(BridgeState::Stopped);
        info!("Bridge stopped");

        central_result
            .and(peripheral_result)
            .map_err(BridgeError::Teardown)
    }

    /// Notify every current subscriber; no-op when stopped, central-only or
    /// `data` is empty
    ///
    /// The fan-out succeeds when at least one subscriber was reached. Subscribers
    /// that left since the last send are pruned and logged, not reported. An
    /// error means no subscriber was reached: every notification failed
    /// ([`RadioError::NotifyFailed`] with `failed == total`), the radio refused
    /// the call, or it did not return within the link timeout
    /// ([`RadioError::TimedOut`]).
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let publisher = {
            let roles = self.roles.lock().await;
            if roles.session.is_none() {
                return Ok(());
            }
            roles.peripheral.publisher()
        };
        let Some(publisher) = publisher else {
            return Ok(());
        };

        let limit = self.config.link_timeout;
        match timeout(limit, publisher.publish(data)).await {
            Ok(result) => result.map_err(BridgeError::Notify),
            Err(_) => Err(BridgeError::Notify(RadioError::TimedOut(limit))),
        }
    }

    /// Write `data` to every peer we are subscribed to
    ///
    /// Each write is bounded by the link timeout and failures are listed per
    /// peer in the report.
    pub async fn write_to_peers(&self, data: &[u8]) -> WriteReport {
        if data.is_empty() {
            return WriteReport::default();
        }
        let writer = {
            let roles = self.roles.lock().await;
            if roles.session.is_none() {
                return WriteReport::default();
            }
            roles.central.writer()
        };
        writer.write_all(data).await
    }

    pub fn state(&self) -> BridgeState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<BridgeState> {
        self.state.subscribe()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), BridgeState::Running(_))
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Identity of the running session
    pub async fn identity(&self) -> Option<Identity> {
        self.roles.lock().await.session.as_ref().map(|s| s.identity)
    }

    pub async fn peers(&self) -> Vec<PeerSummary> {
        self.peers.snapshot().await
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.len().await
    }
}
