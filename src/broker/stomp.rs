//! STOMP 1.2 broker client
//!
//! One I/O task owns the TCP connection. Publishers, ACKs and subscription
//! changes reach it through an unbounded channel; receipts come back through
//! oneshot channels keyed by receipt id. Each subscription gets its own
//! dispatcher task so a handler never sees two messages at once, and a
//! message is ACKed only after its handler returns, on the connection it
//! arrived on. Every connection gets a new generation number; an ACK whose
//! connection is gone is dropped and the broker redelivers the message.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use super::frame::{Command, Frame, StompCodec};
use super::{
    BrokerClient, BrokerConfig, BrokerError, BrokerMessage, BrokerResult, Destination,
    MessageHandler, SessionState, StateCell, SubscriptionId,
};

type Connection = Framed<TcpStream, StompCodec>;

struct Ack {
    /// Value for the ACK frame's `id` header
    id: String,
    /// Connection the message arrived on
    generation: u64,
}

struct Delivery {
    message: BrokerMessage,
    ack: Option<Ack>,
}

/// Sender into one live connection's I/O task
struct Outbound {
    generation: u64,
    tx: mpsc::UnboundedSender<Frame>,
}

struct Subscription {
    destination: Destination,
    deliveries: mpsc::UnboundedSender<Delivery>,
}

impl Subscription {
    fn subscribe_frame(&self, id: &str) -> Frame {
        Frame::new(Command::Subscribe)
            .header("id", id)
            .header("destination", self.destination.name.as_str())
            .header("destination-type", self.destination.routing_type())
            .header("ack", "client-individual")
    }
}

struct Shared {
    state: StateCell,
    /// None while disconnected
    outbound: Mutex<Option<Outbound>>,
    generation: AtomicU64,
    subscriptions: RwLock<HashMap<SubscriptionId, Subscription>>,
    receipts: Mutex<HashMap<String, oneshot::Sender<Result<(), String>>>>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl Shared {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Install the sender for a new connection, or clear it on loss
    fn set_sender(&self, sender: Option<mpsc::UnboundedSender<Frame>>) {
        let outbound = sender.map(|tx| Outbound {
            generation: self.generation.fetch_add(1, Ordering::AcqRel) + 1,
            tx,
        });
        *self.outbound.lock().unwrap_or_else(PoisonError::into_inner) = outbound;
    }

    fn current_generation(&self) -> Option<u64> {
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|outbound| outbound.generation)
    }

    fn send(&self, frame: Frame) -> bool {
        match &*self.outbound.lock().unwrap_or_else(PoisonError::into_inner) {
            Some(outbound) => outbound.tx.send(frame).is_ok(),
            None => false,
        }
    }

    /// Send only if the given connection is still the live one
    fn send_on(&self, generation: u64, frame: Frame) -> bool {
        match &*self.outbound.lock().unwrap_or_else(PoisonError::into_inner) {
            Some(outbound) if outbound.generation == generation => outbound.tx.send(frame).is_ok(),
            _ => false,
        }
    }

    fn register_receipt(&self, id: String) -> oneshot::Receiver<Result<(), String>> {
        let (tx, rx) = oneshot::channel();
        self.receipts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);
        rx
    }

    fn forget_receipt(&self, id: &str) -> Option<oneshot::Sender<Result<(), String>>> {
        self.receipts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    fn resolve_receipt(&self, id: &str, outcome: Result<(), String>) {
        if let Some(waiter) = self.forget_receipt(id) {
            let _ = waiter.send(outcome);
        }
    }

    fn fail_all_receipts(&self, reason: &str) {
        let waiters: Vec<_> = self
            .receipts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (_, waiter) in waiters {
            let _ = waiter.send(Err(reason.to_string()));
        }
    }

    /// Route an inbound frame. Err means the session must be torn down.
    async fn dispatch(&self, frame: Frame) -> Result<(), String> {
        match frame.command {
            Command::Message => {
                self.dispatch_message(frame).await;
                Ok(())
            }
            Command::Receipt => {
                if let Some(id) = frame.get("receipt-id") {
                    self.resolve_receipt(id, Ok(()));
                }
                Ok(())
            }
            Command::Error => {
                let message = frame
                    .get("message")
                    .map(str::to_string)
                    .unwrap_or_else(|| String::from_utf8_lossy(&frame.body).into_owned());
                if let Some(id) = frame.get("receipt-id") {
                    self.resolve_receipt(id, Err(message.clone()));
                }
                Err(format!("broker sent ERROR: {}", message))
            }
            other => {
                tracing::debug!("Ignoring unexpected {} frame", other);
                Ok(())
            }
        }
    }

    async fn dispatch_message(&self, frame: Frame) {
        let ack_id = frame.get("ack").map(str::to_string);
        let Some(subscription_id) = frame.get("subscription") else {
            tracing::warn!("MESSAGE frame without subscription header, dropping");
            return;
        };

        let payload = match frame.body_text() {
            Ok(text) => text.to_string(),
            Err(e) => {
                // Redelivery would fail the same way
                tracing::warn!("Dropping non-UTF-8 message on {}: {}", subscription_id, e);
                if let Some(id) = ack_id {
                    self.send(Frame::new(Command::Ack).header("id", id));
                }
                return;
            }
        };

        let timestamp = frame
            .get("timestamp")
            .and_then(|ts| ts.parse::<i64>().ok())
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
            .unwrap_or_else(Utc::now);

        let message = BrokerMessage {
            destination: frame.get("destination").unwrap_or_default().to_string(),
            payload,
            correlation_id: frame.get("correlation-id").map(str::to_string),
            timestamp,
        };

        // Called from the I/O task, so the live connection is the one this came on
        let ack = ack_id
            .zip(self.current_generation())
            .map(|(id, generation)| Ack { id, generation });

        let subscriptions = self.subscriptions.read().await;
        match subscriptions.get(subscription_id) {
            Some(subscription) => {
                let _ = subscription.deliveries.send(Delivery { message, ack });
            }
            None => tracing::debug!(
                "Message for unknown subscription {} (already unsubscribed?)",
                subscription_id
            ),
        }
    }
}

/// Drains one subscription, calling the handler sequentially and ACKing after each
async fn run_dispatcher(
    shared: Arc<Shared>,
    handler: Arc<dyn MessageHandler>,
    mut deliveries: mpsc::UnboundedReceiver<Delivery>,
) {
    while let Some(delivery) = deliveries.recv().await {
        handler.on_message(delivery.message).await;
        if let Some(ack) = delivery.ack {
            // Message ids are per connection; the broker redelivers unacked messages
            let frame = Frame::new(Command::Ack).header("id", ack.id.as_str());
            if !shared.send_on(ack.generation, frame) {
                tracing::debug!("ACK {} dropped, its connection is gone", ack.id);
            }
        }
    }
}

enum SessionEnd {
    Shutdown,
    Lost(String),
}

/// STOMP client for Artemis (or any STOMP 1.2 broker)
pub struct StompBroker {
    addr: String,
    config: BrokerConfig,
    shared: Arc<Shared>,
    connection_task: Mutex<Option<JoinHandle<()>>>,
    /// Serializes connect() so two callers don't open two sessions
    connect_lock: tokio::sync::Mutex<()>,
}

impl StompBroker {
    pub fn new(addr: String, config: BrokerConfig) -> Self {
        Self {
            addr,
            config,
            shared: Arc::new(Shared {
                state: StateCell::new(SessionState::Disconnected),
                outbound: Mutex::new(None),
                generation: AtomicU64::new(0),
                subscriptions: RwLock::new(HashMap::new()),
                receipts: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                shutdown: CancellationToken::new(),
            }),
            connection_task: Mutex::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }
}

fn connection_error(addr: &str, reason: impl Into<String>) -> BrokerError {
    BrokerError::Connection {
        addr: addr.to_string(),
        reason: reason.into(),
    }
}

/// Open TCP, send CONNECT and wait for CONNECTED
async fn open_session(addr: &str, config: &BrokerConfig) -> BrokerResult<Connection> {
    let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| connection_error(addr, format!("timed out after {:?}", config.connect_timeout)))?
        .map_err(|e| connection_error(addr, e.to_string()))?;
    let _ = stream.set_nodelay(true);

    let mut connection = Framed::new(stream, StompCodec::new(config.max_frame_bytes));

    let host = addr.rsplit_once(':').map(|(host, _)| host).unwrap_or(addr);
    let mut connect = Frame::new(Command::Connect)
        .header("accept-version", "1.2")
        .header("host", host)
        .header("heart-beat", "0,0");
    if let Some(login) = &config.login {
        connect = connect.header("login", login.as_str());
    }
    if let Some(passcode) = &config.passcode {
        connect = connect.header("passcode", passcode.as_str());
    }

    connection
        .send(connect)
        .await
        .map_err(|e| connection_error(addr, e.to_string()))?;

    let reply = tokio::time::timeout(config.connect_timeout, connection.next())
        .await
        .map_err(|_| connection_error(addr, "no CONNECTED frame before timeout"))?;

    match reply {
        Some(Ok(frame)) if frame.command == Command::Connected => {
            tracing::info!(
                "Connected to broker at {} (server={}, version={})",
                addr,
                frame.get("server").unwrap_or("unknown"),
                frame.get("version").unwrap_or("unknown")
            );
            Ok(connection)
        }
        Some(Ok(frame)) if frame.command == Command::Error => Err(connection_error(
            addr,
            frame.get("message").unwrap_or("broker rejected CONNECT"),
        )),
        Some(Ok(frame)) => Err(BrokerError::Protocol(format!(
            "expected CONNECTED, got {}",
            frame.command
        ))),
        Some(Err(e)) => Err(connection_error(addr, e.to_string())),
        None => Err(connection_error(addr, "connection closed during handshake")),
    }
}

/// Pump frames both ways until shutdown or connection loss
async fn drive_session(
    shared: &Shared,
    connection: &mut Connection,
    outbound: &mut mpsc::UnboundedReceiver<Frame>,
) -> SessionEnd {
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => return SessionEnd::Shutdown,

            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = connection.send(frame).await {
                        return SessionEnd::Lost(e.to_string());
                    }
                }
                None => return SessionEnd::Shutdown,
            },

            inbound = connection.next() => match inbound {
                Some(Ok(frame)) => {
                    if let Err(reason) = shared.dispatch(frame).await {
                        return SessionEnd::Lost(reason);
                    }
                }
                Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                None => return SessionEnd::Lost("connection closed by broker".to_string()),
            },
        }
    }
}

/// Re-establish the session and re-issue every live subscription
async fn reconnect(
    shared: &Shared,
    addr: &str,
    config: &BrokerConfig,
) -> Option<(Connection, mpsc::UnboundedReceiver<Frame>)> {
    let mut attempt = 1;
    while config.reconnect.allows(attempt) {
        let delay = config.reconnect.jittered_delay_for(attempt);
        tracing::info!("Reconnecting to {} in {:?} (attempt {})", addr, delay, attempt);

        tokio::select! {
            _ = shared.shutdown.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }

        match open_session(addr, config).await {
            Ok(mut connection) => {
                // Held across resubscribe so subscribe() can't race us into a duplicate id
                let subscriptions = shared.subscriptions.read().await;
                let mut resubscribed = true;
                for (id, subscription) in subscriptions.iter() {
                    if let Err(e) = connection.send(subscription.subscribe_frame(id)).await {
                        tracing::warn!("Resubscribe of {} failed: {}", id, e);
                        resubscribed = false;
                        break;
                    }
                }
                if resubscribed {
                    let (tx, rx) = mpsc::unbounded_channel();
                    shared.set_sender(Some(tx));
                    shared
                        .state
                        .transition(SessionState::Reconnecting, SessionState::Connected);
                    tracing::info!(
                        "Reconnected to {}, restored {} subscription(s)",
                        addr,
                        subscriptions.len()
                    );
                    return Some((connection, rx));
                }
            }
            Err(e) => tracing::warn!("Reconnect attempt {} failed: {}", attempt, e),
        }
        attempt += 1;
    }

    tracing::error!(
        "Giving up on broker at {} after {} attempt(s)",
        addr,
        attempt - 1
    );
    None
}

async fn run_connection(
    shared: Arc<Shared>,
    addr: String,
    config: BrokerConfig,
    mut connection: Connection,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
) {
    loop {
        match drive_session(&shared, &mut connection, &mut outbound).await {
            SessionEnd::Shutdown => {
                let disconnect = Frame::new(Command::Disconnect);
                if let Err(e) = connection.send(disconnect).await {
                    tracing::debug!("DISCONNECT not sent: {}", e);
                }
                let _ = connection.close().await;
                tracing::info!("Broker session to {} closed", addr);
                return;
            }
            SessionEnd::Lost(reason) => {
                tracing::warn!("Lost broker connection to {}: {}", addr, reason);
                shared.set_sender(None);
                shared.fail_all_receipts("connection lost");
                shared
                    .state
                    .transition(SessionState::Connected, SessionState::Reconnecting);
            }
        }

        match reconnect(&shared, &addr, &config).await {
            Some((next_connection, next_outbound)) => {
                connection = next_connection;
                outbound = next_outbound;
            }
            None => {
                shared.state.set(SessionState::Closed);
                shared.subscriptions.write().await.clear();
                return;
            }
        }
    }
}

#[async_trait]
impl BrokerClient for StompBroker {
    async fn connect(&self) -> BrokerResult<()> {
        let _guard = self.connect_lock.lock().await;
        match self.shared.state.get() {
            SessionState::Connected | SessionState::Reconnecting => return Ok(()),
            SessionState::Closed => {
                return Err(connection_error(&self.addr, "session already closed"))
            }
            SessionState::Disconnected => {}
        }

        let connection = open_session(&self.addr, &self.config).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.set_sender(Some(tx));
        self.shared.state.set(SessionState::Connected);

        let task = tokio::spawn(run_connection(
            self.shared.clone(),
            self.addr.clone(),
            self.config.clone(),
            connection,
            rx,
        ));
        *self
            .connection_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);
        Ok(())
    }

    async fn publish(
        &self,
        destination: &Destination,
        mut message: BrokerMessage,
    ) -> BrokerResult<()> {
        match self.shared.state.get() {
            SessionState::Connected => {}
            SessionState::Reconnecting => {
                return Err(BrokerError::delivery(destination, "broker connection is down"))
            }
            SessionState::Disconnected | SessionState::Closed => {
                return Err(BrokerError::delivery(destination, "session closed"))
            }
        }

        message.destination = destination.name.clone();
        let receipt = format!("rcpt-{}", self.shared.next_id());

        let mut frame = Frame::new(Command::Send)
            .header("destination", destination.name.as_str())
            .header("destination-type", destination.routing_type())
            .header("content-type", "text/plain;charset=utf-8")
            .header("timestamp", message.timestamp.timestamp_millis().to_string())
            .header("receipt", receipt.as_str());
        if let Some(id) = &message.correlation_id {
            frame = frame.header("correlation-id", id.as_str());
        }
        let frame = frame.text_body(message.payload);

        let waiter = self.shared.register_receipt(receipt.clone());
        if !self.shared.send(frame) {
            self.shared.forget_receipt(&receipt);
            return Err(BrokerError::delivery(destination, "broker connection is down"));
        }

        match tokio::time::timeout(self.config.receipt_timeout, waiter).await {
            Ok(Ok(Ok(()))) => {
                tracing::debug!("Published to {} ({})", destination, receipt);
                Ok(())
            }
            Ok(Ok(Err(reason))) => Err(BrokerError::delivery(destination, reason)),
            Ok(Err(_)) => Err(BrokerError::delivery(destination, "connection lost")),
            Err(_) => {
                self.shared.forget_receipt(&receipt);
                Err(BrokerError::delivery(
                    destination,
                    format!("no receipt within {:?}", self.config.receipt_timeout),
                ))
            }
        }
    }

    async fn subscribe(
        &self,
        destination: &Destination,
        handler: Arc<dyn MessageHandler>,
    ) -> BrokerResult<SubscriptionId> {
        match self.shared.state.get() {
            SessionState::Connected | SessionState::Reconnecting => {}
            SessionState::Disconnected | SessionState::Closed => {
                return Err(BrokerError::delivery(destination, "session closed"))
            }
        }

        let id = format!("sub-{}", self.shared.next_id());
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_dispatcher(self.shared.clone(), handler, rx));

        let subscription = Subscription {
            destination: destination.clone(),
            deliveries: tx,
        };

        let mut subscriptions = self.shared.subscriptions.write().await;
        // While reconnecting there is no sender; reconnect() subscribes from the map
        self.shared.send(subscription.subscribe_frame(&id));
        subscriptions.insert(id.clone(), subscription);

        tracing::info!("Subscribed to {} as {}", destination, id);
        Ok(id)
    }

    async fn unsubscribe(&self, id: &SubscriptionId) -> BrokerResult<()> {
        let removed = self.shared.subscriptions.write().await.remove(id);
        if let Some(subscription) = removed {
            self.shared
                .send(Frame::new(Command::Unsubscribe).header("id", id.as_str()));
            tracing::info!("Unsubscribed {} from {}", id, subscription.destination);
        }
        Ok(())
    }

    async fn close(&self) {
        if self.shared.state.get() == SessionState::Closed {
            return;
        }
        self.shared.state.set(SessionState::Closed);
        self.shared.shutdown.cancel();
        self.shared.subscriptions.write().await.clear();
        self.shared.fail_all_receipts("session closed");
        self.shared.set_sender(None);

        let task = self
            .connection_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if tokio::time::timeout(self.config.connect_timeout, task)
                .await
                .is_err()
            {
                tracing::warn!("Broker connection task did not stop in time");
            }
        }
    }

    fn state(&self) -> SessionState {
        self.shared.state.get()
    }

    fn name(&self) -> &str {
        "stomp"
    }
}
