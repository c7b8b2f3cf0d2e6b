//! Tether - multi-tenant messaging session gateway
//!
//! Keeps many independent messaging sessions connected to an upstream
//! network, persists their status, reconnects them with backoff, and
//! streams every change to real-time subscribers.

pub mod audit;
pub mod broadcast;
pub mod cli;
pub mod config;
pub mod error;
pub mod server;
pub mod session;
pub mod transport;
pub mod ui;

pub use error::{TetherError, TetherResult};
