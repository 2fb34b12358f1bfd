use super::AppState;
use crate::broker::{BrokerError, BrokerMessage};
use crate::types::*;

#[derive(Debug, thiserror::Error)]
pub enum OrderError {
    #[error("Invalid order: {0}")]
    Invalid(String),

    #[error("Unknown order '{0}'")]
    UnknownOrder(OrderId),

    #[error("Order {order_id} could not be sent: {source}")]
    Delivery {
        order_id: OrderId,
        #[source]
        source: BrokerError,
    },

    #[error("Failed to encode order: {0}")]
    Encode(#[from] serde_json::Error),
}

fn validate(request: &OrderRequest) -> Result<(), OrderError> {
    if request.symbol.trim().is_empty() {
        return Err(OrderError::Invalid("symbol must not be empty".to_string()));
    }
    if request.amount == 0 {
        return Err(OrderError::Invalid("amount must be positive".to_string()));
    }
    if !request.price.is_finite() || request.price <= 0.0 {
        return Err(OrderError::Invalid("price must be positive".to_string()));
    }
    Ok(())
}

impl AppState {
    /// Record a new order and send it to its exchange.
    ///
    /// The order stays in the book even when the broker refuses it, marked
    /// as failed.
    pub async fn send_order(
        &self,
        order_type: OrderType,
        request: OrderRequest,
    ) -> Result<Order, OrderError> {
        validate(&request)?;

        let order = Order {
            id: ulid::Ulid::new().to_string(),
            client_id: self.bindings.client_id.clone(),
            symbol: request.symbol.trim().to_uppercase(),
            exchange: request.exchange,
            amount: request.amount,
            price: request.price,
            status: OrderStatusType::Pending,
            created_at: chrono::Utc::now().to_rfc3339(),
        };

        let payload = serde_json::to_string(&OrderWrapper {
            order_type,
            order: order.clone(),
        })?;

        self.orders.write().await.push(order.clone());

        let destination = self.bindings.order_destination(order.exchange);
        tracing::info!(
            "Sending {:?} order {} ({} x {} @ {}) to {}",
            order_type,
            order.id,
            order.amount,
            order.symbol,
            order.price,
            destination
        );

        let message = BrokerMessage::new(payload).with_correlation_id(order.id.clone());
        if let Err(source) = self.broker.publish(&destination, message).await {
            tracing::error!("Order {} not delivered: {}", order.id, source);
            self.set_status(&order.id, OrderStatusType::Error).await;
            return Err(OrderError::Delivery {
                order_id: order.id,
                source,
            });
        }

        Ok(order)
    }

    /// Apply a status update from an exchange.
    ///
    /// Returns the changed order, or None when the update was a no-op
    /// (redelivery, or the order already reached a final state).
    pub async fn update_order_status(
        &self,
        update: OrderWrapper,
    ) -> Result<Option<Order>, OrderError> {
        let mut orders = self.orders.write().await;
        let order = orders
            .iter_mut()
            .find(|o| o.id == update.order.id)
            .ok_or_else(|| OrderError::UnknownOrder(update.order.id.clone()))?;

        let new_status = update.order.status;
        if order.status.is_terminal() {
            if order.status != new_status {
                tracing::warn!(
                    "Ignoring status {} for order {}, already final ({})",
                    new_status,
                    order.id,
                    order.status
                );
            }
            return Ok(None);
        }
        if new_status == order.status {
            return Ok(None);
        }

        tracing::info!("Order {}: {} -> {}", order.id, order.status, new_status);
        order.status = new_status;
        Ok(Some(order.clone()))
    }

    pub async fn all_orders(&self) -> Vec<Order> {
        self.orders.read().await.clone()
    }

    pub async fn get_order(&self, id: &str) -> Option<Order> {
        self.orders.read().await.iter().find(|o| o.id == id).cloned()
    }

    async fn set_status(&self, id: &str, status: OrderStatusType) {
        if let Some(order) = self.orders.write().await.iter_mut().find(|o| o.id == id) {
            order.status = status;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{handler_fn, BrokerClient, Destination, InMemoryBroker};
    use crate::profile::{DestinationConfig, Profile, RoleBindings};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn state_on(broker: &InMemoryBroker) -> AppState {
        let session = broker.session();
        session.connect().await.unwrap();
        AppState::new(
            Arc::new(session),
            RoleBindings::for_profile(Profile::Client1, &DestinationConfig::default()),
        )
    }

    fn request(exchange: Exchange) -> OrderRequest {
        OrderRequest {
            symbol: "sap".to_string(),
            exchange,
            amount: 5,
            price: 120.0,
        }
    }

    #[tokio::test]
    async fn test_send_order_publishes_to_exchange_queue() {
        let broker = InMemoryBroker::new();
        let state = state_on(&broker).await;

        let exchange_side = broker.session();
        exchange_side.connect().await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        exchange_side
            .subscribe(
                &Destination::queue("stocks.orders.Frankfurt"),
                handler_fn(move |message| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(message);
                    }
                }),
            )
            .await
            .unwrap();

        let order = state
            .send_order(OrderType::Buy, request(Exchange::Frankfurt))
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatusType::Pending);
        assert_eq!(order.client_id, "client1");
        assert_eq!(order.symbol, "SAP");

        let message = tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.correlation_id.as_deref(), Some(order.id.as_str()));
        let wrapper: OrderWrapper = serde_json::from_str(&message.payload).unwrap();
        assert_eq!(wrapper.order_type, OrderType::Buy);
        assert_eq!(wrapper.order, order);
    }

    #[tokio::test]
    async fn test_invalid_orders_are_rejected() {
        let broker = InMemoryBroker::new();
        let state = state_on(&broker).await;

        let mut bad = request(Exchange::Stuttgart);
        bad.amount = 0;
        assert!(matches!(
            state.send_order(OrderType::Sell, bad).await,
            Err(OrderError::Invalid(_))
        ));

        let mut bad = request(Exchange::Stuttgart);
        bad.price = f64::NAN;
        assert!(matches!(
            state.send_order(OrderType::Sell, bad).await,
            Err(OrderError::Invalid(_))
        ));

        let mut bad = request(Exchange::Stuttgart);
        bad.symbol = "  ".to_string();
        assert!(matches!(
            state.send_order(OrderType::Sell, bad).await,
            Err(OrderError::Invalid(_))
        ));

        assert!(state.all_orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_delivery_failure_marks_order_failed() {
        let broker = InMemoryBroker::new();
        let state = state_on(&broker).await;
        state.broker.close().await;

        let result = state
            .send_order(OrderType::Buy, request(Exchange::Stuttgart))
            .await;
        let order_id = match result {
            Err(OrderError::Delivery { order_id, .. }) => order_id,
            other => panic!("Expected delivery failure, got {:?}", other),
        };

        let order = state.get_order(&order_id).await.unwrap();
        assert_eq!(order.status, OrderStatusType::Error);
    }

    #[tokio::test]
    async fn test_status_update_lifecycle() {
        let broker = InMemoryBroker::new();
        let state = state_on(&broker).await;
        let order = state
            .send_order(OrderType::Buy, request(Exchange::Stuttgart))
            .await
            .unwrap();

        let mut update = OrderWrapper {
            order_type: OrderType::Buy,
            order: order.clone(),
        };

        // Still pending: nothing changes
        assert!(state.update_order_status(update.clone()).await.unwrap().is_none());

        update.order.status = OrderStatusType::Success;
        let changed = state.update_order_status(update.clone()).await.unwrap();
        assert_eq!(changed.unwrap().status, OrderStatusType::Success);

        // Redelivery is a no-op
        assert!(state.update_order_status(update.clone()).await.unwrap().is_none());

        // Final states stick
        update.order.status = OrderStatusType::Error;
        assert!(state.update_order_status(update).await.unwrap().is_none());
        assert_eq!(
            state.get_order(&order.id).await.unwrap().status,
            OrderStatusType::Success
        );
    }

    #[tokio::test]
    async fn test_status_for_unknown_order() {
        let broker = InMemoryBroker::new();
        let state = state_on(&broker).await;
        let order = state
            .send_order(OrderType::Sell, request(Exchange::Frankfurt))
            .await
            .unwrap();

        let mut stranger = order;
        stranger.id = "01UNKNOWN".to_string();
        let result = state
            .update_order_status(OrderWrapper {
                order_type: OrderType::Sell,
                order: stranger,
            })
            .await;
        assert!(matches!(result, Err(OrderError::UnknownOrder(id)) if id == "01UNKNOWN"));
    }

    #[tokio::test]
    async fn test_all_orders_keeps_placement_order() {
        let broker = InMemoryBroker::new();
        let state = state_on(&broker).await;

        let first = state
            .send_order(OrderType::Buy, request(Exchange::Stuttgart))
            .await
            .unwrap();
        let second = state
            .send_order(OrderType::Sell, request(Exchange::Frankfurt))
            .await
            .unwrap();

        let ids: Vec<_> = state.all_orders().await.into_iter().map(|o| o.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }
}
