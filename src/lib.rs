// Public API for integration tests and potential library usage

pub mod api;
pub mod broker;
pub mod config;
pub mod logging;
pub mod profile;
pub mod protocol;
pub mod relay;
pub mod state;
pub mod types;
pub mod ws;
