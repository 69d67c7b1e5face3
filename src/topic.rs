//! Topic handles, subscriptions, and local message delivery.
//!
//! A [`Topic`] is a cheap cloneable handle obtained from
//! [`GossipEngine::join`](crate::engine::GossipEngine::join). Local delivery
//! fans a message out to every live subscription over bounded channels;
//! a slow consumer loses messages rather than stalling the engine.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::engine::{GossipEngine, PublishError};
use crate::peer::PeerId;
use crate::wire::{MessageId, WireMessage};

/// A message as handed to subscribers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GossipMessage {
    pub sender: PeerId,
    pub topic: String,
    pub payload: Vec<u8>,
    pub seqno: Vec<u8>,
    pub id: MessageId,
}

impl GossipMessage {
    pub(crate) fn from_wire(message: &WireMessage) -> Self {
        Self {
            id: message.id(),
            sender: message.sender.clone(),
            topic: message.topic.clone(),
            payload: message.payload.clone(),
            seqno: message.seqno.clone(),
        }
    }
}

/// Mesh membership change on one topic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TopicPeerEvent {
    Joined(PeerId),
    Left(PeerId),
}

/// Why a subscription read did not yield a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionError {
    /// This subscription was cancelled locally.
    Cancelled,
    /// No message arrived before the deadline.
    DeadlineExpired,
    /// The topic was closed while waiting.
    TopicClosed,
}

impl fmt::Display for SubscriptionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "subscription cancelled"),
            Self::DeadlineExpired => write!(f, "deadline expired with no message"),
            Self::TopicClosed => write!(f, "topic closed"),
        }
    }
}

impl std::error::Error for SubscriptionError {}

struct Subscriber {
    tx: mpsc::Sender<GossipMessage>,
    cancelled: Arc<AtomicBool>,
}

/// State shared between a topic's handles and the engine.
pub(crate) struct TopicShared {
    name: String,
    closed: AtomicBool,
    subscribers: Mutex<Vec<Subscriber>>,
    peer_watchers: Mutex<Vec<mpsc::Sender<TopicPeerEvent>>>,
    subscription_buffer: usize,
}

impl TopicShared {
    pub(crate) fn new(name: String, subscription_buffer: usize) -> Self {
        Self {
            name,
            closed: AtomicBool::new(false),
            subscribers: Mutex::new(Vec::new()),
            peer_watchers: Mutex::new(Vec::new()),
            subscription_buffer,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Mark closed and drop every subscriber and watcher channel, which
    /// wakes pending `next` calls with `TopicClosed`.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.subscribers.lock().expect("subscriber lock poisoned").clear();
        self.peer_watchers.lock().expect("watcher lock poisoned").clear();
    }

    pub(crate) fn subscribe(&self) -> Result<Subscription, SubscriptionError> {
        if self.is_closed() {
            return Err(SubscriptionError::TopicClosed);
        }
        let (tx, rx) = mpsc::channel(self.subscription_buffer);
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut subscribers = self.subscribers.lock().expect("subscriber lock poisoned");
        subscribers.push(Subscriber {
            tx,
            cancelled: cancelled.clone(),
        });
        Ok(Subscription { rx, cancelled })
    }

    /// Deliver a message to every live subscription. Non-blocking: a full
    /// buffer drops the message for that subscriber only.
    pub(crate) fn deliver(&self, message: GossipMessage) {
        if self.is_closed() {
            return;
        }
        let mut subscribers = self.subscribers.lock().expect("subscriber lock poisoned");
        subscribers.retain(|s| {
            if s.cancelled.load(Ordering::SeqCst) {
                return false;
            }
            match s.tx.try_send(message.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(topic = %self.name, "subscriber buffer full, dropping message");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    pub(crate) fn watch_peers(&self) -> mpsc::Receiver<TopicPeerEvent> {
        let (tx, rx) = mpsc::channel(self.subscription_buffer);
        self.peer_watchers
            .lock()
            .expect("watcher lock poisoned")
            .push(tx);
        rx
    }

    pub(crate) fn notify_peer_event(&self, event: TopicPeerEvent) {
        let mut watchers = self.peer_watchers.lock().expect("watcher lock poisoned");
        watchers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                trace!(topic = %self.name, "peer watcher buffer full, dropping event");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("subscriber lock poisoned").len()
    }
}

/// Handle to a joined topic.
#[derive(Clone)]
pub struct Topic {
    engine: GossipEngine,
    shared: Arc<TopicShared>,
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topic")
            .field("name", &self.shared.name)
            .finish_non_exhaustive()
    }
}

impl Topic {
    pub(crate) fn new(engine: GossipEngine, shared: Arc<TopicShared>) -> Self {
        Self { engine, shared }
    }

    pub fn name(&self) -> &str {
        self.shared.name()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Publish a payload to the topic. Returns the derived message id on
    /// success; partial fan-out success is success.
    pub async fn publish(&self, payload: Vec<u8>) -> Result<MessageId, PublishError> {
        if self.shared.is_closed() {
            return Err(PublishError::TopicClosed(self.name().to_string()));
        }
        self.engine.publish(self.name(), payload).await
    }

    /// Open a new subscription receiving all future messages on the topic.
    pub fn subscribe(&self) -> Result<Subscription, SubscriptionError> {
        self.shared.subscribe()
    }

    /// Current mesh members for this topic.
    pub fn peers(&self) -> Vec<PeerId> {
        self.engine.topic_peers(self.name())
    }

    /// Watch mesh join/leave events for this topic.
    pub fn peer_events(&self) -> mpsc::Receiver<TopicPeerEvent> {
        self.shared.watch_peers()
    }

    /// Close the topic: leave its mesh, drop all subscriptions, and remove
    /// it from the engine. Idempotent.
    pub fn close(&self) {
        self.engine.close_topic(self.name());
    }
}

/// One subscriber's receive side.
pub struct Subscription {
    rx: mpsc::Receiver<GossipMessage>,
    cancelled: Arc<AtomicBool>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

impl Subscription {
    /// Wait up to `deadline` for the next message.
    pub async fn next(&mut self, deadline: Duration) -> Result<GossipMessage, SubscriptionError> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(SubscriptionError::Cancelled);
        }
        match tokio::time::timeout(deadline, self.rx.recv()).await {
            Ok(Some(message)) => Ok(message),
            Ok(None) => {
                if self.cancelled.load(Ordering::SeqCst) {
                    Err(SubscriptionError::Cancelled)
                } else {
                    Err(SubscriptionError::TopicClosed)
                }
            }
            Err(_) => Err(SubscriptionError::DeadlineExpired),
        }
    }

    /// Cancel this subscription. Queued messages are discarded and the
    /// engine stops delivering to it.
    pub fn cancel(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.rx.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(n: u64) -> GossipMessage {
        let wire = WireMessage {
            sender: PeerId::from("sender"),
            payload: vec![n as u8],
            topic: "t".to_string(),
            seqno: n.to_be_bytes().to_vec(),
        };
        GossipMessage::from_wire(&wire)
    }

    #[tokio::test]
    async fn delivery_reaches_every_subscription() {
        let shared = TopicShared::new("t".to_string(), 8);
        let mut a = shared.subscribe().unwrap();
        let mut b = shared.subscribe().unwrap();

        shared.deliver(message(1));
        assert_eq!(a.next(Duration::from_millis(50)).await.unwrap(), message(1));
        assert_eq!(b.next(Duration::from_millis(50)).await.unwrap(), message(1));
    }

    #[tokio::test]
    async fn next_times_out_without_messages() {
        let shared = TopicShared::new("t".to_string(), 8);
        let mut sub = shared.subscribe().unwrap();
        assert_eq!(
            sub.next(Duration::from_millis(10)).await,
            Err(SubscriptionError::DeadlineExpired)
        );
    }

    #[tokio::test]
    async fn cancel_stops_delivery() {
        let shared = TopicShared::new("t".to_string(), 8);
        let mut sub = shared.subscribe().unwrap();
        sub.cancel();
        assert_eq!(
            sub.next(Duration::from_millis(10)).await,
            Err(SubscriptionError::Cancelled)
        );

        // The engine side drops the cancelled subscriber on next delivery.
        shared.deliver(message(1));
        assert_eq!(shared.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn close_wakes_pending_readers() {
        let shared = Arc::new(TopicShared::new("t".to_string(), 8));
        let mut sub = shared.subscribe().unwrap();

        let closer = shared.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            closer.close();
        });
        assert_eq!(
            sub.next(Duration::from_secs(5)).await,
            Err(SubscriptionError::TopicClosed)
        );
        assert!(shared.subscribe().is_err(), "closed topic refuses new subscriptions");
    }

    #[tokio::test]
    async fn full_buffer_drops_for_that_subscriber_only() {
        let shared = TopicShared::new("t".to_string(), 1);
        let mut slow = shared.subscribe().unwrap();
        let mut fast = shared.subscribe().unwrap();

        shared.deliver(message(1));
        shared.deliver(message(2));

        // Slow reader holds one buffered message; the second was dropped.
        assert_eq!(slow.next(Duration::from_millis(10)).await.unwrap(), message(1));
        assert_eq!(
            slow.next(Duration::from_millis(10)).await,
            Err(SubscriptionError::DeadlineExpired)
        );

        // Fast reader has the same single-slot buffer here, so it also
        // dropped the second; drain what it has.
        assert_eq!(fast.next(Duration::from_millis(10)).await.unwrap(), message(1));
    }

    #[tokio::test]
    async fn peer_events_fan_out_to_watchers() {
        let shared = TopicShared::new("t".to_string(), 8);
        let mut watcher = shared.watch_peers();

        shared.notify_peer_event(TopicPeerEvent::Joined(PeerId::from("p")));
        shared.notify_peer_event(TopicPeerEvent::Left(PeerId::from("p")));

        assert_eq!(
            watcher.recv().await,
            Some(TopicPeerEvent::Joined(PeerId::from("p")))
        );
        assert_eq!(
            watcher.recv().await,
            Some(TopicPeerEvent::Left(PeerId::from("p")))
        );
    }
}
