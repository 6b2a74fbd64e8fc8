//! Store contract and its failure kinds

use async_trait::async_trait;
use provision_shared::{EndpointRecord, Status, Tally};
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised by a store backend
#[derive(Error, Debug)]
pub enum StoreError {
    /// No usable connection could be obtained. Fatal to a run.
    #[error("Store unavailable ({context}): {source}")]
    Unavailable {
        context: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("Store query failed ({context}): {source}")]
    Query {
        context: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("Corrupt record for {address}: {message}")]
    Corrupt { address: String, message: String },

    #[error("Store worker failed: {0}")]
    Worker(String),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable { .. })
    }
}

/// Decode a stored status label
pub(super) fn parse_status(
    address: &str,
    label: Option<String>,
) -> Result<Option<Status>, StoreError> {
    label
        .map(|l| {
            l.parse::<Status>().map_err(|e| StoreError::Corrupt {
                address: address.to_string(),
                message: e.to_string(),
            })
        })
        .transpose()
}

/// Per-address status records. Every operation commits or rolls back as a unit.
#[async_trait]
pub trait EndpointStore: Send + Sync {
    /// Look up one record
    async fn find(&self, address: &str) -> Result<Option<EndpointRecord>, StoreError>;

    /// Add a record with no status. Returns 0 if the address already exists.
    async fn insert(&self, address: &str) -> Result<usize, StoreError>;

    /// Addresses whose status is anything but Success, unset included
    async fn list_pending(&self) -> Result<Vec<String>, StoreError>;

    /// Set status and message and stamp `updated`. Returns 0 for an unknown address.
    async fn update_status(
        &self,
        address: &str,
        status: Status,
        message: &str,
    ) -> Result<usize, StoreError>;

    /// Remove every record
    async fn clear_all(&self) -> Result<usize, StoreError>;

    /// Partition the given addresses by persisted status, keeping input order
    async fn tally(&self, addresses: &[String]) -> Result<Tally, StoreError>;

    /// Human-readable backend name
    fn name(&self) -> &'static str;
}
