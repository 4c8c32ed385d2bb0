//! Delivery of inbound payloads to the host application
//!
//! Sinks are called from radio event context and must not block.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::types::InboundMessage;

/// Consumer of `(peer id, payload)` deliveries
pub trait MessageSink: Send + Sync + 'static {
    fn deliver(&self, message: InboundMessage);
}

/// Sink shared between the controllers of one bridge
pub type SharedSink = Arc<dyn MessageSink>;

impl MessageSink for mpsc::UnboundedSender<InboundMessage> {
    fn deliver(&self, message: InboundMessage) {
        if self.send(message).is_err() {
            debug!("Inbound message dropped: receiver closed");
        }
    }
}

impl<S: MessageSink + ?Sized> MessageSink for Arc<S> {
    fn deliver(&self, message: InboundMessage) {
        (**self).deliver(message)
    }
}

// ----------------------------------------------------------------------------
// Closure Sink
// ----------------------------------------------------------------------------

/// Adapts a closure into a [`MessageSink`]
pub struct FnSink<F>(F);

impl<F> FnSink<F>
where
    F: Fn(InboundMessage) + Send + Sync + 'static,
{
    pub fn new(callback: F) -> Self {
        Self(callback)
    }
}

impl<F> MessageSink for FnSink<F>
where
    F: Fn(InboundMessage) + Send + Sync + 'static,
{
    fn deliver(&self, message: InboundMessage) {
        (self.0)(message)
    }
}

// ----------------------------------------------------------------------------
// Mailbox
// ----------------------------------------------------------------------------

/// Keeps only the most recent inbound message
///
/// Hosts that poll for "the latest thing received" read it with
/// [`Mailbox::latest`] and reset it with [`Mailbox::clear`]; hosts that want a
/// callback await changes on [`Mailbox::watch`].
#[derive(Clone)]
pub struct Mailbox {
    latest: Arc<watch::Sender<Option<InboundMessage>>>,
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Mailbox {
    pub fn new() -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            latest: Arc::new(latest),
        }
    }

    pub fn latest(&self) -> Option<InboundMessage> {
        self.latest.borrow().clone()
    }

    /// Remove and return the stored message
    pub fn take(&self) -> Option<InboundMessage> {
        self.latest.send_replace(None)
    }

    pub fn clear(&self) {
        self.latest.send_replace(None);
    }

    /// Receiver that is marked changed on every delivery and clear
    pub fn watch(&self) -> watch::Receiver<Option<InboundMessage>> {
        self.latest.subscribe()
    }
}

impl MessageSink for Mailbox {
    fn deliver(&self, message: InboundMessage) {
        self.latest.send_replace(Some(message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::types::Role;

    #[test]
    fn test_mailbox_keeps_latest() {
        let mailbox = Mailbox::new();
        assert!(mailbox.latest().is_none());

        mailbox.deliver(InboundMessage::from_local_write(b"one".to_vec()));
        mailbox.deliver(InboundMessage::from_local_write(b"two".to_vec()));
        assert_eq!(mailbox.latest().unwrap().payload, b"two");

        mailbox.clear();
        assert!(mailbox.latest().is_none());
    }

    #[tokio::test]
    async fn test_mailbox_watch_sees_delivery() {
        let mailbox = Mailbox::new();
        let mut watch = mailbox.watch();

        let writer = mailbox.clone();
        tokio::spawn(async move {
            writer.deliver(InboundMessage::new("peer", b"hi".to_vec(), Role::Central));
        });

        watch.changed().await.unwrap();
        let message = watch.borrow().clone().unwrap();
        assert_eq!(message.peer_id, "peer");
        assert_eq!(mailbox.take().unwrap().payload, b"hi");
        assert!(mailbox.latest().is_none());
    }

    #[test]
    fn test_fn_sink_and_channel_sink() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();
        let sink = FnSink::new(move |m: InboundMessage| recorder.lock().unwrap().push(m.payload));
        sink.deliver(InboundMessage::from_local_write(vec![1, 2]));
        assert_eq!(*seen.lock().unwrap(), vec![vec![1, 2]]);

        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.deliver(InboundMessage::from_local_write(vec![3]));
        assert_eq!(rx.try_recv().unwrap().payload, vec![3]);

        drop(rx);
        // Closed receiver must not panic
        tx.deliver(InboundMessage::from_local_write(vec![4]));
    }
}
