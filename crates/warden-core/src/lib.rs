//! Core domain + application logic for the Warden chat relay.
//!
//! This crate is transport- and provider-agnostic. The chat transport and the
//! remote completion service live behind ports (traits) implemented in adapter
//! crates.

pub mod completion;
pub mod config;
pub mod dedup;
pub mod dispatch;
pub mod domain;
pub mod errors;
pub mod ledger;
pub mod limiter;
pub mod logging;
pub mod messaging;
pub mod model;
pub mod session;

pub use errors::{Error, Result};
