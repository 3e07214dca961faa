use async_trait::async_trait;

use crate::{
    domain::{Destination, Reply},
    Result,
};

/// Port for delivering replies.
///
/// The transport adapter owns delivery; the core calls `send` exactly once per
/// non-dropped event and does not retry delivery at this layer.
#[async_trait]
pub trait MessagingPort: Send + Sync {
    async fn send(&self, reply: Reply, destination: &Destination) -> Result<()>;
}
