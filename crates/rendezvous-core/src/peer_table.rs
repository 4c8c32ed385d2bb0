//! Central-side peer connection table
//!
//! One [`PeerConnection`] per remote address, advanced through
//! `Discovered -> ServiceResolved -> CharacteristicResolved -> Subscribed` by
//! typed transitions. Every claim carries an [`AttemptId`]; inputs for an
//! attempt that is no longer the current entry are refused as stale, and a
//! closed table refuses new claims, so callbacks that finish after `stop` cannot
//! repopulate it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::errors::{Rejection, TransitionError};
use crate::radio::{CharacteristicHandle, ServiceHandle};
use crate::types::PeerAddress;

// ----------------------------------------------------------------------------
// Link State
// ----------------------------------------------------------------------------

/// Coarse phase of a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LinkPhase {
    Discovered,
    ServiceResolved,
    CharacteristicResolved,
    Subscribed,
}

impl fmt::Display for LinkPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkPhase::Discovered => "discovered",
            LinkPhase::ServiceResolved => "service-resolved",
            LinkPhase::CharacteristicResolved => "characteristic-resolved",
            LinkPhase::Subscribed => "subscribed",
        };
        f.write_str(name)
    }
}

/// Phase together with the handles resolved so far
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Discovered,
    ServiceResolved {
        service: ServiceHandle,
    },
    CharacteristicResolved {
        service: ServiceHandle,
        characteristic: CharacteristicHandle,
    },
    Subscribed {
        service: ServiceHandle,
        characteristic: CharacteristicHandle,
    },
}

impl LinkState {
    pub fn phase(&self) -> LinkPhase {
        match self {
            LinkState::Discovered => LinkPhase::Discovered,
            LinkState::ServiceResolved { .. } => LinkPhase::ServiceResolved,
            LinkState::CharacteristicResolved { .. } => LinkPhase::CharacteristicResolved,
            LinkState::Subscribed { .. } => LinkPhase::Subscribed,
        }
    }
}

/// Identifies one connection attempt for one address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttemptId(u64);

// ----------------------------------------------------------------------------
// Peer Connection
// ----------------------------------------------------------------------------

/// Per-peer state machine owned by the [`PeerTable`]
#[derive(Debug)]
pub struct PeerConnection {
    address: PeerAddress,
    local_name: Option<String>,
    attempt: AttemptId,
    state: LinkState,
    discovered_at: Instant,
    establishing: Option<AbortHandle>,
    listener: Option<AbortHandle>,
}

impl PeerConnection {
    fn new(address: PeerAddress, local_name: Option<String>, attempt: AttemptId) -> Self {
        Self {
            address,
            local_name,
            attempt,
            state: LinkState::Discovered,
            discovered_at: Instant::now(),
            establishing: None,
            listener: None,
        }
    }

    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    pub fn local_name(&self) -> Option<&str> {
        self.local_name.as_deref()
    }

    pub fn state(&self) -> &LinkState {
        &self.state
    }

    pub fn phase(&self) -> LinkPhase {
        self.state.phase()
    }

    pub fn discovered_at(&self) -> Instant {
        self.discovered_at
    }

    /// Attach the task driving this attempt so dropping the entry cancels it
    pub fn track_establishment(&mut self, task: AbortHandle) {
        self.establishing = Some(task);
    }

    /// Record the resolved service
    pub fn resolve_service(&mut self, service: ServiceHandle) -> Result<(), TransitionError> {
        match &self.state {
            LinkState::Discovered => {
                self.state = LinkState::ServiceResolved { service };
                Ok(())
            }
            other => Err(self.invalid(other.phase(), LinkPhase::ServiceResolved)),
        }
    }

    /// Record the resolved characteristic on the already resolved service
    pub fn resolve_characteristic(
        &mut self,
        characteristic: CharacteristicHandle,
    ) -> Result<(), TransitionError> {
        match &self.state {
            LinkState::ServiceResolved { service } if characteristic.service == service.uuid => {
                self.state = LinkState::CharacteristicResolved {
                    service: service.clone(),
                    characteristic,
                };
                Ok(())
            }
            other => Err(self.invalid(other.phase(), LinkPhase::CharacteristicResolved)),
        }
    }

    /// Mark notifications enabled; `listener` is aborted when the entry goes away
    pub fn subscribe(&mut self, listener: AbortHandle) -> Result<(), TransitionError> {
        match &self.state {
            LinkState::CharacteristicResolved {
                service,
                characteristic,
            } => {
                self.state = LinkState::Subscribed {
                    service: service.clone(),
                    characteristic: characteristic.clone(),
                };
                self.establishing = None;
                self.listener = Some(listener);
                Ok(())
            }
            other => Err(self.invalid(other.phase(), LinkPhase::Subscribed)),
        }
    }

    fn invalid(&self, from: LinkPhase, to: LinkPhase) -> TransitionError {
        TransitionError::Invalid { from, to }
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        for task in [self.establishing.take(), self.listener.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
    }
}

/// Point-in-time view of one table entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSummary {
    pub address: PeerAddress,
    pub local_name: Option<String>,
    pub phase: LinkPhase,
    pub discovered_at: Instant,
}

// ----------------------------------------------------------------------------
// Peer Table
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct TableInner {
    open: bool,
    next_attempt: u64,
    peers: HashMap<PeerAddress, PeerConnection>,
}

/// Connection entries keyed by peer address, serialized by one lock
#[derive(Debug, Clone, Default)]
pub struct PeerTable {
    inner: Arc<RwLock<TableInner>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept claims again
    pub async fn open(&self) {
        self.inner.write().await.open = true;
    }

    /// Refuse further claims and drop every entry, returning how many were dropped
    pub async fn close(&self) -> usize {
        let drained: Vec<PeerConnection> = {
            let mut inner = self.inner.write().await;
            inner.open = false;
            inner.peers.drain().map(|(_, peer)| peer).collect()
        };
        drained.len()
    }

    /// Create the entry for `address` unless one already exists
    pub async fn claim(
        &self,
        address: &PeerAddress,
        local_name: Option<&str>,
    ) -> Result<AttemptId, Rejection> {
        let mut inner = self.inner.write().await;
        if !inner.open {
            return Err(Rejection::Stopped);
        }
        if inner.peers.contains_key(address) {
            return Err(Rejection::AlreadyTracked);
        }

        inner.next_attempt += 1;
        let attempt = AttemptId(inner.next_attempt);
        inner.peers.insert(
            address.clone(),
            PeerConnection::new(address.clone(), local_name.map(str::to_string), attempt),
        );
        Ok(attempt)
    }

    /// Apply a transition to the entry created by `attempt`
    pub async fn advance<F>(
        &self,
        address: &PeerAddress,
        attempt: AttemptId,
        transition: F,
    ) -> Result<(), TransitionError>
    where
        F: FnOnce(&mut PeerConnection) -> Result<(), TransitionError>,
    {
        let mut inner = self.inner.write().await;
        match inner.peers.get_mut(address) {
            Some(peer) if peer.attempt == attempt => transition(peer),
            _ => Err(TransitionError::Stale(address.clone())),
        }
    }

    /// Remove the entry created by `attempt`; a newer entry for the address is kept
    pub async fn release(&self, address: &PeerAddress, attempt: AttemptId) -> bool {
        let removed = {
            let mut inner = self.inner.write().await;
            match inner.peers.get(address) {
                Some(peer) if peer.attempt == attempt => inner.peers.remove(address),
                _ => None,
            }
        };
        removed.is_some()
    }

    /// Remove whatever entry exists for `address`
    pub async fn remove(&self, address: &PeerAddress) -> bool {
        let removed = self.inner.write().await.peers.remove(address);
        removed.is_some()
    }

    pub async fn contains(&self, address: &PeerAddress) -> bool {
        self.inner.read().await.peers.contains_key(address)
    }

    pub async fn phase_of(&self, address: &PeerAddress) -> Option<LinkPhase> {
        self.inner.read().await.peers.get(address).map(PeerConnection::phase)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.peers.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.peers.is_empty()
    }

    /// Entries sorted by address
    pub async fn snapshot(&self) -> Vec<PeerSummary> {
        let inner = self.inner.read().await;
        let mut peers: Vec<PeerSummary> = inner
            .peers
            .values()
            .map(|peer| PeerSummary {
                address: peer.address.clone(),
                local_name: peer.local_name.clone(),
                phase: peer.phase(),
                discovered_at: peer.discovered_at(),
            })
            .collect();
        peers.sort_by(|a, b| a.address.cmp(&b.address));
        peers
    }

    /// Address and characteristic of every subscribed peer
    pub async fn subscribed_links(&self) -> Vec<(PeerAddress, CharacteristicHandle)> {
        let inner = self.inner.read().await;
        inner
            .peers
            .values()
            .filter_map(|peer| match &peer.state {
                LinkState::Subscribed { characteristic, .. } => {
                    Some((peer.address.clone(), characteristic.clone()))
                }
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::CharacteristicProperties;
    use uuid::Uuid;

    fn handles() -> (ServiceHandle, CharacteristicHandle) {
        let service = ServiceHandle {
            uuid: Uuid::from_u128(1),
        };
        let characteristic = CharacteristicHandle {
            service: service.uuid,
            uuid: Uuid::from_u128(2),
            properties: CharacteristicProperties::BRIDGE,
        };
        (service, characteristic)
    }

    async fn open_table() -> PeerTable {
        let table = PeerTable::new();
        table.open().await;
        table
    }

    #[tokio::test]
    async fn test_claim_is_deduplicated() {
        let table = open_table().await;
        let peer = PeerAddress::from("AA");

        assert!(table.claim(&peer, Some("Y")).await.is_ok());
        assert_eq!(
            table.claim(&peer, Some("Y")).await,
            Err(Rejection::AlreadyTracked)
        );
        assert_eq!(table.len().await, 1);
    }

    #[tokio::test]
    async fn test_closed_table_refuses_claims() {
        let table = PeerTable::new();
        let peer = PeerAddress::from("AA");
        assert_eq!(table.claim(&peer, None).await, Err(Rejection::Stopped));

        table.open().await;
        table.claim(&peer, None).await.unwrap();
        assert_eq!(table.close().await, 1);
        assert!(table.is_empty().await);
        assert_eq!(table.claim(&peer, None).await, Err(Rejection::Stopped));
    }

    #[tokio::test]
    async fn test_transitions_follow_order() {
        let table = open_table().await;
        let peer = PeerAddress::from("AA");
        let attempt = table.claim(&peer, None).await.unwrap();
        let (service, characteristic) = handles();

        let skipped = table
            .advance(&peer, attempt, |p| p.resolve_characteristic(characteristic.clone()))
            .await;
        assert_eq!(
            skipped,
            Err(TransitionError::Invalid {
                from: LinkPhase::Discovered,
                to: LinkPhase::CharacteristicResolved,
            })
        );

        table
            .advance(&peer, attempt, |p| p.resolve_service(service))
            .await
            .unwrap();
        table
            .advance(&peer, attempt, |p| p.resolve_characteristic(characteristic))
            .await
            .unwrap();
        assert_eq!(
            table.phase_of(&peer).await,
            Some(LinkPhase::CharacteristicResolved)
        );

        let listener = tokio::spawn(futures::future::pending::<()>());
        table
            .advance(&peer, attempt, |p| p.subscribe(listener.abort_handle()))
            .await
            .unwrap();
        assert_eq!(table.subscribed_links().await.len(), 1);

        // Removing the entry stops its listener
        assert!(table.remove(&peer).await);
        assert!(listener.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_stale_attempt_cannot_touch_new_entry() {
        let table = open_table().await;
        let peer = PeerAddress::from("AA");
        let first = table.claim(&peer, None).await.unwrap();
        assert!(table.release(&peer, first).await);

        let second = table.claim(&peer, None).await.unwrap();
        assert_ne!(first, second);

        let (service, _) = handles();
        assert_eq!(
            table.advance(&peer, first, |p| p.resolve_service(service)).await,
            Err(TransitionError::Stale(peer.clone()))
        );
        assert!(!table.release(&peer, first).await);
        assert!(table.contains(&peer).await);
    }

    #[tokio::test]
    async fn test_snapshot_is_sorted() {
        let table = open_table().await;
        table.claim(&PeerAddress::from("BB"), Some("Y")).await.unwrap();
        table.claim(&PeerAddress::from("AA"), None).await.unwrap();

        let snapshot = table.snapshot().await;
        assert_eq!(snapshot[0].address.as_str(), "AA");
        assert_eq!(snapshot[1].local_name.as_deref(), Some("Y"));
        assert!(snapshot.iter().all(|p| p.phase == LinkPhase::Discovered));
        assert!(snapshot[0].discovered_at <= Instant::now());
    }
}
