//! Provisioning Shared Types
//!
//! This crate provides the data model shared by the endpoint client, the
//! persistence backends and the batch dispatcher: endpoint records, raw
//! outcomes, the result classifier and the command payload builder.

pub mod classify;
pub mod payload;

use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub use classify::{aggregate_codes, classify, Classification};
pub use payload::CommandSequence;

/// Get the current wall-clock timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Default operating parameters for a provisioning run
pub mod defaults {
    /// Per-call connect/read timeout in milliseconds
    pub const CALL_TIMEOUT_MS: u64 = 3000;

    /// Pause between consecutive keypress commands sent to one phone
    pub const PAUSE_MS: u64 = 1500;

    /// Number of phones dispatched together in one chunk
    pub const CHUNK_SIZE: usize = 20;

    /// Response code reported when every step of a sequence succeeded
    pub const OK_CODE: u16 = 200;

    /// Highest response code still counted as a successful step
    pub const SUCCESS_THRESHOLD: u16 = 400;

    /// Maximum stored length of an error message, in characters
    pub const ERROR_MESSAGE_MAX: usize = 4096;

    /// CUCM end user the phones accept remote control from
    pub const USERNAME: &str = "phonecontrol";
    pub const PASSWORD: &str = "phonecontrol";
}

/// Persisted provisioning status of one phone.
///
/// A record without a status has never been dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    InProgress,
    Success,
    Error,
    Canceled,
}

impl Status {
    /// Label used in the persisted `status` column
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::InProgress => "In progress",
            Status::Success => "Success",
            Status::Error => "Error",
            Status::Canceled => "Canceled",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown status label: {0:?}")]
pub struct ParseStatusError(pub String);

impl FromStr for Status {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "In progress" => Ok(Status::InProgress),
            "Success" => Ok(Status::Success),
            "Error" => Ok(Status::Error),
            "Canceled" => Ok(Status::Canceled),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

/// Stored state of one phone
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointRecord {
    pub address: String,
    pub status: Option<Status>,
    pub error: Option<String>,
    pub created: DateTime<Utc>,
    pub updated: Option<DateTime<Utc>>,
}

impl EndpointRecord {
    /// Create a freshly ingested record with no status
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            status: None,
            error: None,
            created: now(),
            updated: None,
        }
    }

    /// Whether the next run should dispatch to this phone again
    pub fn is_pending(&self) -> bool {
        self.status != Some(Status::Success)
    }
}

/// Raw result of running a full command sequence against one phone
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Every step completed at the transport level; `code` is the aggregated response
    Response { code: u16 },
    /// A step failed at the transport level and the remaining steps were skipped
    Failed { error: String },
}

/// Cut an error message down to the stored bound, on a char boundary
pub fn bound_message(message: &str) -> String {
    message.chars().take(defaults::ERROR_MESSAGE_MAX).collect()
}

/// Partition of a dispatched address set by persisted status
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tally {
    pub success: Vec<String>,
    pub error: Vec<String>,
}

impl Tally {
    /// Number of devices that ended with a recorded status
    pub fn devices(&self) -> usize {
        self.success.len() + self.error.len()
    }
}

impl fmt::Display for Tally {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{Success: {:?}, Error: {:?}, Devices: {}}}",
            self.success,
            self.error,
            self.devices()
        )
    }
}
