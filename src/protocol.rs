use crate::profile::Profile;
use crate::types::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum ClientMessage {
    Buy {
        order: OrderRequest,
    },
    Sell {
        order: OrderRequest,
    },
    /// Ask for the current order list
    All,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome {
        profile: Profile,
        client_id: ClientId,
        orders: Vec<Order>,
    },
    /// Stock update from the broker, passed through untouched
    StockPrices {
        data: serde_json::Value,
    },
    /// Full order list, oldest first
    Orders {
        orders: Vec<Order>,
    },
    /// Sent to the socket that placed the order
    OrderAccepted {
        order: Order,
    },
    Error {
        code: String,
        msg: String,
    },
}

impl ServerMessage {
    pub fn error(code: &str, msg: impl Into<String>) -> Self {
        ServerMessage::Error {
            code: code.to_string(),
            msg: msg.into(),
        }
    }
}
