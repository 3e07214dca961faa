//! Remote completion service port and wire-adjacent types.

pub mod client;
pub mod types;
