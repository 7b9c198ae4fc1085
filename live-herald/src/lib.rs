//! live-herald library crate.
//!
//! Keeps exactly one evolving "went live" announcement per chat destination and
//! streamer, reconciling raw live/offline events against persisted state.

pub mod config;
pub mod domain;
pub mod error;
pub mod logging;
pub mod monitor;
pub mod notifier;
pub mod store;
pub mod transport;
pub mod utils;

pub use error::{Error, Result};
