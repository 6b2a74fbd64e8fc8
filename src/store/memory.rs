//! In-memory phone store for dry runs

use super::{EndpointStore, StoreError};
use async_trait::async_trait;
use indexmap::IndexMap;
use provision_shared::{bound_message, now, EndpointRecord, Status, Tally};
use tokio::sync::Mutex;

/// Keeps records in insertion order; lost when the process exits
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<IndexMap<String, EndpointRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EndpointStore for MemoryStore {
    async fn find(&self, address: &str) -> Result<Option<EndpointRecord>, StoreError> {
        Ok(self.records.lock().await.get(address).cloned())
    }

    async fn insert(&self, address: &str) -> Result<usize, StoreError> {
        let mut records = self.records.lock().await;
        if records.contains_key(address) {
            return Ok(0);
        }
        records.insert(address.to_string(), EndpointRecord::new(address));
        Ok(1)
    }

    async fn list_pending(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .records
            .lock()
            .await
            .values()
            .filter(|r| r.is_pending())
            .map(|r| r.address.clone())
            .collect())
    }

    async fn update_status(
        &self,
        address: &str,
        status: Status,
        message: &str,
    ) -> Result<usize, StoreError> {
        let mut records = self.records.lock().await;
        match records.get_mut(address) {
            Some(record) => {
                record.status = Some(status);
                record.error = Some(bound_message(message));
                record.updated = Some(now());
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn clear_all(&self) -> Result<usize, StoreError> {
        let mut records = self.records.lock().await;
        let removed = records.len();
        records.clear();
        Ok(removed)
    }

    async fn tally(&self, addresses: &[String]) -> Result<Tally, StoreError> {
        let records = self.records.lock().await;
        let mut tally = Tally::default();
        for address in addresses {
            match records.get(address).and_then(|r| r.status) {
                Some(Status::Success) => tally.success.push(address.clone()),
                Some(_) => tally.error.push(address.clone()),
                None => {}
            }
        }
        Ok(tally)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
