//! Message broker client
//!
//! A session to a JMS-style broker, reached either over STOMP 1.2 (the text
//! protocol Artemis exposes next to its core protocol) or through an
//! in-process broker used for local runs and tests.

pub mod frame;
mod memory;
mod stomp;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{env_parsed, env_trimmed};

pub use memory::{InMemoryBroker, MemorySession};
pub use stomp::StompBroker;

/// Result type for broker operations
pub type BrokerResult<T> = Result<T, BrokerError>;

pub type SubscriptionId = String;

/// Errors that can occur while talking to the broker
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Failed to connect to broker at {addr}: {reason}")]
    Connection { addr: String, reason: String },

    #[error("Delivery to '{destination}' failed: {reason}")]
    Delivery { destination: String, reason: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl BrokerError {
    pub(crate) fn delivery(destination: &Destination, reason: impl Into<String>) -> Self {
        BrokerError::Delivery {
            destination: destination.name.clone(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationKind {
    /// Point-to-point: each message goes to one subscriber
    Queue,
    /// Publish/subscribe: each message goes to every subscriber
    Topic,
}

/// A named queue or topic on the broker
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub name: String,
    pub kind: DestinationKind,
}

impl Destination {
    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: DestinationKind::Queue,
        }
    }

    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: DestinationKind::Topic,
        }
    }

    /// Artemis routing type for the `destination-type` header
    pub fn routing_type(&self) -> &'static str {
        match self.kind {
            DestinationKind::Queue => "ANYCAST",
            DestinationKind::Topic => "MULTICAST",
        }
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// A message travelling through the broker
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerMessage {
    /// Destination name; stamped by the client on publish and on delivery
    pub destination: String,
    pub payload: String,
    pub correlation_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl BrokerMessage {
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            destination: String::new(),
            payload: payload.into(),
            correlation_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

/// Lifecycle of a broker session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connected,
    Reconnecting,
    Closed,
}

/// Lock-free holder for a [`SessionState`], readable from sync code
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new(state: SessionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn get(&self) -> SessionState {
        match self.0.load(Ordering::Acquire) {
            1 => SessionState::Connected,
            2 => SessionState::Reconnecting,
            3 => SessionState::Closed,
            _ => SessionState::Disconnected,
        }
    }

    pub(crate) fn set(&self, state: SessionState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Swap `from` for `to`; false if the state was something else
    pub(crate) fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Callback invoked once per received message
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message(&self, message: BrokerMessage);
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(BrokerMessage) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    async fn on_message(&self, message: BrokerMessage) {
        (self.0)(message).await
    }
}

/// Wrap an async closure as a [`MessageHandler`]
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(BrokerMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Trait that all broker clients must implement
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Establish the session. No-op when already connected.
    async fn connect(&self) -> BrokerResult<()>;

    /// Send a message to a destination
    async fn publish(&self, destination: &Destination, message: BrokerMessage)
        -> BrokerResult<()>;

    /// Register a handler for every message arriving on a destination.
    ///
    /// Messages of one subscription reach the handler in order, one at a time.
    async fn subscribe(
        &self,
        destination: &Destination,
        handler: Arc<dyn MessageHandler>,
    ) -> BrokerResult<SubscriptionId>;

    async fn unsubscribe(&self, id: &SubscriptionId) -> BrokerResult<()>;

    /// End the session; later publishes and subscribes fail
    async fn close(&self);

    fn state(&self) -> SessionState;

    /// Get the name of this client implementation
    fn name(&self) -> &str;
}

/// Backoff applied when an established connection drops
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// 0 retries forever
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 0,
        }
    }
}

impl ReconnectPolicy {
    /// Un-jittered delay before the given attempt (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// `delay_for` with +/-20% jitter so both profiles don't reconnect in lockstep
    pub fn jittered_delay_for(&self, attempt: u32) -> Duration {
        use rand::Rng;
        let factor = rand::rng().random_range(0.8..=1.2);
        self.delay_for(attempt).mul_f64(factor)
    }

    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts == 0 || attempt <= self.max_attempts
    }
}

/// Where the broker lives
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEndpoint {
    /// STOMP over TCP, `host:port`
    Stomp(String),
    /// In-process broker
    Memory,
}

impl BrokerEndpoint {
    pub fn parse(url: &str) -> BrokerResult<Self> {
        let url = url.trim();
        if url == "memory://" || url == "memory" {
            return Ok(BrokerEndpoint::Memory);
        }

        let addr = url
            .strip_prefix("tcp://")
            .or_else(|| url.strip_prefix("stomp://"))
            .ok_or_else(|| {
                BrokerError::Config(format!(
                    "Unsupported broker URL '{}', expected tcp://host:port or memory://",
                    url
                ))
            })?;

        let addr = addr.trim_end_matches('/');
        match addr.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                Ok(BrokerEndpoint::Stomp(addr.to_string()))
            }
            _ => Err(BrokerError::Config(format!(
                "Broker URL '{}' must include host and port",
                url
            ))),
        }
    }
}

/// Configuration for the broker session
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub url: String,
    pub login: Option<String>,
    pub passcode: Option<String>,
    pub connect_timeout: Duration,
    /// How long a publish waits for the broker's RECEIPT
    pub receipt_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub max_frame_bytes: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "tcp://localhost:61613".to_string(),
            login: None,
            passcode: None,
            connect_timeout: Duration::from_secs(5),
            receipt_timeout: Duration::from_secs(5),
            reconnect: ReconnectPolicy::default(),
            max_frame_bytes: frame::DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl BrokerConfig {
    /// Load configuration from environment variables.
    ///
    /// Unset variables keep their defaults; values that don't parse are
    /// rejected rather than ignored.
    pub fn from_env() -> BrokerResult<Self> {
        let defaults = Self::default();
        let parsed = |name: &str| env_parsed::<u64>(name).map_err(BrokerError::Config);
        let millis = |name: &str, fallback: Duration| -> BrokerResult<Duration> {
            Ok(parsed(name)?.map(Duration::from_millis).unwrap_or(fallback))
        };
        let secs = |name: &str, fallback: Duration| -> BrokerResult<Duration> {
            Ok(parsed(name)?.map(Duration::from_secs).unwrap_or(fallback))
        };

        let reconnect = ReconnectPolicy {
            initial_delay: millis("BROKER_RECONNECT_INITIAL_MS", defaults.reconnect.initial_delay)?,
            max_delay: millis("BROKER_RECONNECT_MAX_MS", defaults.reconnect.max_delay)?,
            max_attempts: env_parsed("BROKER_RECONNECT_MAX_ATTEMPTS")
                .map_err(BrokerError::Config)?
                .unwrap_or(defaults.reconnect.max_attempts),
        };

        Ok(Self {
            url: env_trimmed("BROKER_URL").unwrap_or(defaults.url),
            login: env_trimmed("BROKER_LOGIN"),
            passcode: env_trimmed("BROKER_PASSCODE"),
            connect_timeout: secs("BROKER_CONNECT_TIMEOUT_SECS", defaults.connect_timeout)?,
            receipt_timeout: secs("BROKER_RECEIPT_TIMEOUT_SECS", defaults.receipt_timeout)?,
            reconnect,
            max_frame_bytes: defaults.max_frame_bytes,
        })
    }

    /// Build the client matching the configured URL. Does not connect.
    pub fn build_client(&self) -> BrokerResult<Arc<dyn BrokerClient>> {
        match BrokerEndpoint::parse(&self.url)? {
            BrokerEndpoint::Stomp(addr) => Ok(Arc::new(StompBroker::new(addr, self.clone()))),
            BrokerEndpoint::Memory => {
                tracing::warn!("Using in-process broker; messages never leave this process");
                Ok(Arc::new(InMemoryBroker::new().session()))
            }
        }
    }
}
