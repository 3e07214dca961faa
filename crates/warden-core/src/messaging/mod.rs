//! Transport-agnostic outbound boundary.

pub mod port;

pub use port::MessagingPort;
