pub mod candle;
pub mod catalog;
pub mod config;
pub mod data;
pub mod error;
pub mod events;
pub mod logging;
pub mod market;
pub mod orchestrator;
pub mod plugin;
pub mod plugins;
pub mod router;
pub mod storage;
pub mod stream;
