//! Endpoint client for sending keypress sequences to phones
//!
//! This module handles:
//! - Posting each command payload to a phone's CGI Execute interface
//! - Per-call timeouts and pacing between steps
//! - Collapsing per-step results into one outcome per phone

mod endpoint;
mod error;
mod http;
mod traits;

pub use endpoint::EndpointClient;
pub use error::ClientError;
pub use http::HttpTransport;
pub use traits::{EndpointExecutor, StepTransport};
