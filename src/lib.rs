//! Local SMS provider simulator.
//!
//! Accepts outbound messages, walks them through a simulated carrier
//! lifecycle, fans updates out to connected viewers, and replays inbound
//! replies to a developer-configured webhook.

pub mod config;
pub mod conversation;
pub mod engine;
pub mod error;
pub mod http_server;
pub mod hub;
pub mod lifecycle;
pub mod signing;
pub mod store;
pub mod types;
pub mod webhook;

pub use config::{Cli, SimulatorConfig};
pub use engine::Simulator;
pub use error::SimError;
