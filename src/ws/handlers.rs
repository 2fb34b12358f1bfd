//! WebSocket message dispatch

use crate::protocol::{ClientMessage, ServerMessage};
use crate::state::{AppState, OrderError};
use crate::types::{OrderRequest, OrderType};
use std::sync::Arc;

/// Handle client messages and return optional response
pub async fn handle_message(msg: ClientMessage, state: &Arc<AppState>) -> Option<ServerMessage> {
    match msg {
        ClientMessage::Buy { order } => handle_place_order(state, OrderType::Buy, order).await,

        ClientMessage::Sell { order } => handle_place_order(state, OrderType::Sell, order).await,

        ClientMessage::All => {
            state.publish_orders().await;
            None
        }
    }
}

/// Error code sent to the socket for a failed order
fn error_code(error: &OrderError) -> &'static str {
    match error {
        OrderError::Invalid(_) => "INVALID_ORDER",
        OrderError::Delivery { .. } => "DELIVERY_FAILED",
        OrderError::UnknownOrder(_) | OrderError::Encode(_) => "INTERNAL",
    }
}

async fn handle_place_order(
    state: &Arc<AppState>,
    order_type: OrderType,
    request: OrderRequest,
) -> Option<ServerMessage> {
    tracing::debug!("{:?} order requested: {:?}", order_type, request);

    let response = match state.send_order(order_type, request).await {
        Ok(order) => ServerMessage::OrderAccepted { order },
        Err(e @ OrderError::Delivery { .. }) => ServerMessage::error(error_code(&e), e.to_string()),
        Err(e) => {
            if !matches!(e, OrderError::Invalid(_)) {
                tracing::error!("Order could not be placed: {}", e);
            }
            return Some(ServerMessage::error(error_code(&e), e.to_string()));
        }
    };

    // The book changed either way (pending or failed)
    state.publish_orders().await;
    Some(response)
}
