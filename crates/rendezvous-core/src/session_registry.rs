//! Peripheral-side registry of subscribed clients
//!
//! Rebuilt in full from the platform's subscriber list on every change.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::errors::RegistryClosed;
use crate::types::SessionId;

/// A remote client with notifications enabled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberSession {
    pub session: SessionId,
    pub since: Instant,
}

#[derive(Debug, Default)]
struct RegistryInner {
    open: bool,
    sessions: BTreeMap<SessionId, SubscriberSession>,
}

#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn open(&self) {
        self.inner.write().await.open = true;
    }

    /// Refuse further updates and forget every session
    pub async fn close(&self) -> usize {
        let mut inner = self.inner.write().await;
        inner.open = false;
        let dropped = inner.sessions.len();
        inner.sessions.clear();
        dropped
    }

    /// Replace the registry with `current`, keeping `since` for sessions that stay
    pub async fn replace_all<I>(&self, current: I) -> Result<usize, RegistryClosed>
    where
        I: IntoIterator<Item = SessionId>,
    {
        let mut inner = self.inner.write().await;
        if !inner.open {
            return Err(RegistryClosed);
        }

        let now = Instant::now();
        let mut previous = std::mem::take(&mut inner.sessions);
        for session in current {
            let entry = previous
                .remove(&session)
                .unwrap_or_else(|| SubscriberSession {
                    session: session.clone(),
                    since: now,
                });
            inner.sessions.insert(session, entry);
        }
        Ok(inner.sessions.len())
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.sessions.is_empty()
    }

    pub async fn contains(&self, session: &SessionId) -> bool {
        self.inner.read().await.sessions.contains_key(session)
    }

    pub async fn sessions(&self) -> Vec<SubscriberSession> {
        self.inner.read().await.sessions.values().cloned().collect()
    }
}
