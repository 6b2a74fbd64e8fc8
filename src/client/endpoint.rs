//! Sequenced execution of a keypress sequence against one phone

use super::{EndpointExecutor, StepTransport};
use async_trait::async_trait;
use provision_shared::{aggregate_codes, CommandSequence, Outcome};
use std::time::Duration;
use tracing::debug;

/// Runs the steps of a sequence strictly one after another.
///
/// Phones reject overlapping commands, so steps for one address are never
/// issued concurrently, and a pause follows each step.
pub struct EndpointClient<T> {
    transport: T,
    pause: Duration,
    skip_final_pause: bool,
}

impl<T: StepTransport> EndpointClient<T> {
    /// Create a client that pauses after every step, including the last
    pub fn new(transport: T, pause: Duration) -> Self {
        Self {
            transport,
            pause,
            skip_final_pause: false,
        }
    }

    /// Skip the pause after the final step
    pub fn with_skip_final_pause(mut self, skip: bool) -> Self {
        self.skip_final_pause = skip;
        self
    }

    #[cfg(test)]
    pub fn transport(&self) -> &T {
        &self.transport
    }
}

#[async_trait]
impl<T: StepTransport> EndpointExecutor for EndpointClient<T> {
    async fn execute(&self, address: &str, commands: &CommandSequence) -> Outcome {
        let steps = commands.payloads();
        let mut codes = Vec::with_capacity(steps.len());

        for (index, payload) in steps.iter().enumerate() {
            match self.transport.post(address, payload).await {
                Ok(code) => {
                    debug!("{} step {}/{} -> {}", address, index + 1, steps.len(), code);
                    codes.push(code);
                }
                Err(e) => {
                    debug!(
                        "{} step {}/{} failed over {}: {}",
                        address,
                        index + 1,
                        steps.len(),
                        self.transport.name(),
                        e
                    );
                    return Outcome::Failed {
                        error: e.to_string(),
                    };
                }
            }

            let is_last = index + 1 == steps.len();
            if !(is_last && self.skip_final_pause) && !self.pause.is_zero() {
                tokio::time::sleep(self.pause).await;
            }
        }

        Outcome::Response {
            code: aggregate_codes(&codes),
        }
    }
}
