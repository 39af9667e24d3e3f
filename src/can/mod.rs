pub mod adapter;
pub mod canbus;
pub mod cantypes;
pub mod channel_config;
pub mod config;
pub mod error;
pub mod sim;
pub mod transport;
