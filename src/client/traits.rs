//! Trait seams between the dispatcher, the sequencing client and the wire

use super::ClientError;
use async_trait::async_trait;
use provision_shared::{CommandSequence, Outcome};

/// Sends one command payload to one phone
#[async_trait]
pub trait StepTransport: Send + Sync {
    /// Post a payload and return the response status code
    async fn post(&self, address: &str, payload: &str) -> Result<u16, ClientError>;

    /// Human-readable name for this transport
    fn name(&self) -> &'static str;
}

/// Runs a whole command sequence against one phone
#[async_trait]
pub trait EndpointExecutor: Send + Sync {
    /// Execute every step in order. Never fails; transport errors become
    /// [`Outcome::Failed`].
    async fn execute(&self, address: &str, commands: &CommandSequence) -> Outcome;
}
