//! Broker listeners feeding the WebSocket broadcast

use async_trait::async_trait;
use std::sync::Arc;

use crate::broker::{BrokerMessage, BrokerResult, MessageHandler, SubscriptionId};
use crate::protocol::ServerMessage;
use crate::state::{AppState, OrderError};
use crate::types::{Exchange, OrderWrapper};

/// Forwards stock price updates to every socket
pub struct StockPriceRelay {
    state: Arc<AppState>,
}

#[async_trait]
impl MessageHandler for StockPriceRelay {
    async fn on_message(&self, message: BrokerMessage) {
        tracing::debug!("Stock update from {}: {}", message.destination, message.payload);
        match serde_json::from_str::<serde_json::Value>(&message.payload) {
            Ok(data) => {
                // Ignore send errors (no sockets connected is fine)
                let _ = self.state.broadcast.send(ServerMessage::StockPrices { data });
            }
            Err(e) => tracing::warn!(
                "Dropping malformed stock update on {}: {}",
                message.destination,
                e
            ),
        }
    }
}

/// Applies status updates from one exchange and republishes the order list
pub struct OrderStatusRelay {
    state: Arc<AppState>,
    exchange: Exchange,
}

#[async_trait]
impl MessageHandler for OrderStatusRelay {
    async fn on_message(&self, message: BrokerMessage) {
        tracing::debug!(
            "Order status from {}: {}",
            self.exchange,
            message.payload
        );
        let update: OrderWrapper = match serde_json::from_str(&message.payload) {
            Ok(update) => update,
            Err(e) => {
                tracing::warn!(
                    "Dropping malformed order status from {}: {}",
                    self.exchange,
                    e
                );
                return;
            }
        };

        match self.state.update_order_status(update).await {
            Ok(Some(_)) => self.state.publish_orders().await,
            Ok(None) => {}
            Err(OrderError::UnknownOrder(id)) => {
                tracing::warn!("Status from {} for unknown order {}", self.exchange, id)
            }
            Err(e) => tracing::error!("Failed to apply status from {}: {}", self.exchange, e),
        }
    }
}

/// Subscribe to the stock topic and this role's status queues
pub async fn start_relays(state: &Arc<AppState>) -> BrokerResult<Vec<SubscriptionId>> {
    let mut subscriptions = Vec::new();

    let stocks = state.bindings.stock_updates.clone();
    subscriptions.push(
        state
            .broker
            .subscribe(
                &stocks,
                Arc::new(StockPriceRelay {
                    state: state.clone(),
                }),
            )
            .await?,
    );

    for exchange in Exchange::ALL {
        let destination = state.bindings.status_destination(exchange);
        subscriptions.push(
            state
                .broker
                .subscribe(
                    &destination,
                    Arc::new(OrderStatusRelay {
                        state: state.clone(),
                        exchange,
                    }),
                )
                .await?,
        );
    }

    tracing::info!(
        "Relaying {} and status queues for {}",
        stocks,
        state.bindings.client_id
    );
    Ok(subscriptions)
}
