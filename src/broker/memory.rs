//! In-process broker
//!
//! A hub holding the destinations, plus any number of sessions attached to
//! it. Queues hand each message to one subscriber (round-robin) and hold it
//! back while nobody listens; topics copy it to every current subscriber.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

use super::{
    BrokerClient, BrokerError, BrokerMessage, BrokerResult, Destination, DestinationKind,
    MessageHandler, SessionState, StateCell, SubscriptionId,
};

type SubscriberKey = u64;

#[derive(Default)]
struct DestinationState {
    subscribers: Vec<(SubscriberKey, mpsc::UnboundedSender<BrokerMessage>)>,
    backlog: VecDeque<BrokerMessage>,
    cursor: usize,
}

impl DestinationState {
    fn deliver(&mut self, kind: DestinationKind, message: BrokerMessage) {
        match kind {
            DestinationKind::Topic => {
                self.subscribers
                    .retain(|(_, tx)| tx.send(message.clone()).is_ok());
            }
            DestinationKind::Queue => {
                let mut message = message;
                while !self.subscribers.is_empty() {
                    let index = self.cursor % self.subscribers.len();
                    match self.subscribers[index].1.send(message) {
                        Ok(()) => {
                            self.cursor = index + 1;
                            return;
                        }
                        Err(mpsc::error::SendError(returned)) => {
                            self.subscribers.remove(index);
                            message = returned;
                        }
                    }
                }
                self.backlog.push_back(message);
            }
        }
    }
}

#[derive(Default)]
struct Hub {
    destinations: Mutex<HashMap<(DestinationKind, String), DestinationState>>,
    next_key: AtomicU64,
    unavailable: AtomicBool,
}

impl Hub {
    fn with_destination<R>(
        &self,
        destination: &Destination,
        f: impl FnOnce(&mut DestinationState) -> R,
    ) -> R {
        let mut destinations = self
            .destinations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let state = destinations
            .entry((destination.kind, destination.name.clone()))
            .or_default();
        f(state)
    }

    fn attach(
        &self,
        destination: &Destination,
        tx: mpsc::UnboundedSender<BrokerMessage>,
    ) -> SubscriberKey {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        self.with_destination(destination, |state| {
            if destination.kind == DestinationKind::Queue {
                while let Some(message) = state.backlog.pop_front() {
                    if let Err(mpsc::error::SendError(message)) = tx.send(message) {
                        state.backlog.push_front(message);
                        return;
                    }
                }
            }
            state.subscribers.push((key, tx));
        });
        key
    }

    fn detach(&self, destination: &Destination, key: SubscriberKey) {
        self.with_destination(destination, |state| {
            state.subscribers.retain(|(k, _)| *k != key);
        });
    }
}

/// Shared in-process broker. Cheap to clone; clones see the same destinations.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    hub: Arc<Hub>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new, not yet connected session on this broker
    pub fn session(&self) -> MemorySession {
        MemorySession {
            hub: self.hub.clone(),
            state: StateCell::new(SessionState::Disconnected),
            subscriptions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Make later connect() calls fail as if the broker were unreachable
    pub fn set_available(&self, available: bool) {
        self.hub.unavailable.store(!available, Ordering::Relaxed);
    }

    /// Messages waiting on a queue with no subscriber
    pub fn backlog_len(&self, destination: &Destination) -> usize {
        self.hub
            .with_destination(destination, |state| state.backlog.len())
    }
}

/// One client session on an [`InMemoryBroker`]
pub struct MemorySession {
    hub: Arc<Hub>,
    state: StateCell,
    subscriptions: Mutex<HashMap<SubscriptionId, (Destination, SubscriberKey)>>,
    next_id: AtomicU64,
}

impl MemorySession {
    fn ensure_open(&self, destination: &Destination) -> BrokerResult<()> {
        match self.state.get() {
            SessionState::Connected => Ok(()),
            _ => Err(BrokerError::delivery(destination, "session closed")),
        }
    }
}

#[async_trait]
impl BrokerClient for MemorySession {
    async fn connect(&self) -> BrokerResult<()> {
        match self.state.get() {
            SessionState::Connected => Ok(()),
            SessionState::Closed => Err(BrokerError::Connection {
                addr: "memory://".to_string(),
                reason: "session already closed".to_string(),
            }),
            _ if self.hub.unavailable.load(Ordering::Relaxed) => Err(BrokerError::Connection {
                addr: "memory://".to_string(),
                reason: "broker unavailable".to_string(),
            }),
            _ => {
                self.state.set(SessionState::Connected);
                Ok(())
            }
        }
    }

    async fn publish(
        &self,
        destination: &Destination,
        mut message: BrokerMessage,
    ) -> BrokerResult<()> {
        self.ensure_open(destination)?;
        message.destination = destination.name.clone();
        self.hub
            .with_destination(destination, |state| state.deliver(destination.kind, message));
        Ok(())
    }

    async fn subscribe(
        &self,
        destination: &Destination,
        handler: Arc<dyn MessageHandler>,
    ) -> BrokerResult<SubscriptionId> {
        self.ensure_open(destination)?;

        let (tx, mut rx) = mpsc::unbounded_channel::<BrokerMessage>();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                handler.on_message(message).await;
            }
        });

        let key = self.hub.attach(destination, tx);
        let id = format!("sub-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), (destination.clone(), key));
        tracing::debug!("Subscribed to {} as {} (in-process)", destination, id);
        Ok(id)
    }

    async fn unsubscribe(&self, id: &SubscriptionId) -> BrokerResult<()> {
        let removed = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        if let Some((destination, key)) = removed {
            self.hub.detach(&destination, key);
        }
        Ok(())
    }

    async fn close(&self) {
        self.state.set(SessionState::Closed);
        let subscriptions: Vec<_> = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (_, (destination, key)) in subscriptions {
            self.hub.detach(&destination, key);
        }
    }

    fn state(&self) -> SessionState {
        self.state.get()
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::handler_fn;
    use std::time::Duration;

    async fn recv_within(rx: &mut mpsc::UnboundedReceiver<String>) -> Option<String> {
        tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .ok()
            .flatten()
    }

    fn collecting_handler() -> (Arc<dyn MessageHandler>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = handler_fn(move |message: BrokerMessage| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(message.payload);
            }
        });
        (handler, rx)
    }

    async fn connected(broker: &InMemoryBroker) -> MemorySession {
        let session = broker.session();
        session.connect().await.unwrap();
        session
    }

    #[tokio::test]
    async fn test_queue_round_robin() {
        let broker = InMemoryBroker::new();
        let producer = connected(&broker).await;
        let consumer = connected(&broker).await;
        let queue = Destination::queue("orders");

        let (h1, mut rx1) = collecting_handler();
        let (h2, mut rx2) = collecting_handler();
        consumer.subscribe(&queue, h1).await.unwrap();
        consumer.subscribe(&queue, h2).await.unwrap();

        for i in 0..4 {
            producer
                .publish(&queue, BrokerMessage::new(format!("m{}", i)))
                .await
                .unwrap();
        }

        assert_eq!(recv_within(&mut rx1).await.as_deref(), Some("m0"));
        assert_eq!(recv_within(&mut rx2).await.as_deref(), Some("m1"));
        assert_eq!(recv_within(&mut rx1).await.as_deref(), Some("m2"));
        assert_eq!(recv_within(&mut rx2).await.as_deref(), Some("m3"));
    }

    #[tokio::test]
    async fn test_topic_fans_out() {
        let broker = InMemoryBroker::new();
        let session = connected(&broker).await;
        let topic = Destination::topic("stocks");

        let (h1, mut rx1) = collecting_handler();
        let (h2, mut rx2) = collecting_handler();
        session.subscribe(&topic, h1).await.unwrap();
        session.subscribe(&topic, h2).await.unwrap();

        session
            .publish(&topic, BrokerMessage::new("tick"))
            .await
            .unwrap();

        assert_eq!(recv_within(&mut rx1).await.as_deref(), Some("tick"));
        assert_eq!(recv_within(&mut rx2).await.as_deref(), Some("tick"));
    }

    #[tokio::test]
    async fn test_queue_holds_messages_until_subscribed() {
        let broker = InMemoryBroker::new();
        let session = connected(&broker).await;
        let queue = Destination::queue("status");

        session
            .publish(&queue, BrokerMessage::new("early"))
            .await
            .unwrap();
        assert_eq!(broker.backlog_len(&queue), 1);

        let (handler, mut rx) = collecting_handler();
        session.subscribe(&queue, handler).await.unwrap();
        assert_eq!(recv_within(&mut rx).await.as_deref(), Some("early"));
        assert_eq!(broker.backlog_len(&queue), 0);
    }

    #[tokio::test]
    async fn test_topic_drops_messages_without_subscribers() {
        let broker = InMemoryBroker::new();
        let session = connected(&broker).await;
        let topic = Destination::topic("stocks");

        session
            .publish(&topic, BrokerMessage::new("lost"))
            .await
            .unwrap();
        assert_eq!(broker.backlog_len(&topic), 0);
    }

    #[tokio::test]
    async fn test_publish_after_close_fails() {
        let broker = InMemoryBroker::new();
        let session = connected(&broker).await;
        session.close().await;

        let result = session
            .publish(&Destination::queue("q"), BrokerMessage::new("x"))
            .await;
        assert!(matches!(result, Err(BrokerError::Delivery { .. })));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_publish_before_connect_fails() {
        let broker = InMemoryBroker::new();
        let session = broker.session();
        let result = session
            .publish(&Destination::queue("q"), BrokerMessage::new("x"))
            .await;
        assert!(matches!(result, Err(BrokerError::Delivery { .. })));
    }

    #[tokio::test]
    async fn test_connect_fails_when_unavailable() {
        let broker = InMemoryBroker::new();
        broker.set_available(false);
        let result = broker.session().connect().await;
        assert!(matches!(result, Err(BrokerError::Connection { .. })));
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let broker = InMemoryBroker::new();
        let session = connected(&broker).await;
        let queue = Destination::queue("orders");

        let (handler, mut rx) = collecting_handler();
        let id = session.subscribe(&queue, handler).await.unwrap();
        session.unsubscribe(&id).await.unwrap();

        session
            .publish(&queue, BrokerMessage::new("after"))
            .await
            .unwrap();
        assert_eq!(recv_within(&mut rx).await, None);
        assert_eq!(broker.backlog_len(&queue), 1);
    }

    #[tokio::test]
    async fn test_publish_stamps_destination_and_keeps_correlation() {
        let broker = InMemoryBroker::new();
        let session = connected(&broker).await;
        let queue = Destination::queue("orders.Stuttgart");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = handler_fn(move |message: BrokerMessage| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(message);
            }
        });
        session.subscribe(&queue, handler).await.unwrap();
        session
            .publish(&queue, BrokerMessage::new("{}").with_correlation_id("order-1"))
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.destination, "orders.Stuttgart");
        assert_eq!(received.correlation_id.as_deref(), Some("order-1"));
    }
}
