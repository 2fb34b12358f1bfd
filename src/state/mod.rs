mod orders;

pub use orders::OrderError;

use crate::broker::BrokerClient;
use crate::profile::RoleBindings;
use crate::protocol::ServerMessage;
use crate::types::*;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// Messages a socket may fall behind by before it starts skipping
pub const BROADCAST_CAPACITY: usize = 256;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Orders placed by this client, oldest first
    pub orders: Arc<RwLock<Vec<Order>>>,
    pub broker: Arc<dyn BrokerClient>,
    pub bindings: RoleBindings,
    /// Fan-out to every connected WebSocket
    pub broadcast: broadcast::Sender<ServerMessage>,
}

impl AppState {
    pub fn new(broker: Arc<dyn BrokerClient>, bindings: RoleBindings) -> Self {
        let (tx, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            orders: Arc::new(RwLock::new(Vec::new())),
            broker,
            bindings,
            broadcast: tx,
        }
    }

    /// Push the full order list to every socket
    pub async fn publish_orders(&self) {
        let orders = self.all_orders().await;
        tracing::debug!("Publishing {} order(s) to WebSocket clients", orders.len());
        // No receivers connected is fine
        let _ = self.broadcast.send(ServerMessage::Orders { orders });
    }
}
