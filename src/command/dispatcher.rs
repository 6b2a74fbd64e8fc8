//! Batch dispatcher fanning a command sequence out to phones

use crate::client::EndpointExecutor;
use crate::progress::ProgressReporter;
use crate::store::{EndpointStore, StoreError};
use provision_shared::{classify, Classification, CommandSequence, Outcome, Status, Tally};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const CANCELED_MESSAGE: &str = "Canceled by operator";

/// Reasons a run ends without a tally
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Chunk size must be at least 1")]
    InvalidChunkSize,

    /// Results can no longer be recorded; nothing further was dispatched
    #[error("Run aborted, store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),

    #[error("Failed to tally results: {0}")]
    Tally(#[source] StoreError),
}

/// Summary of a finished run
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Success/Error partition of the dispatched addresses
    pub tally: Tally,
    /// Chunks that were launched
    pub chunks: usize,
    /// Addresses that were launched, in input order
    pub dispatched: Vec<String>,
    /// The operator interrupted the run
    pub canceled: bool,
    pub elapsed: Duration,
}

/// One phone's finished client task
#[derive(Debug)]
struct Completion {
    address: String,
    outcome: Outcome,
}

/// One finished store update
#[derive(Debug)]
struct Persisted {
    address: String,
    status: Status,
    result: Result<usize, StoreError>,
}

/// Split addresses into contiguous chunks of `chunk_size`, the last possibly shorter
pub fn partition(addresses: &[String], chunk_size: usize) -> Vec<&[String]> {
    if chunk_size == 0 {
        return Vec::new();
    }
    addresses.chunks(chunk_size).collect()
}

/// Dispatches a sequence to phones chunk by chunk and records every outcome.
///
/// At most `chunk_size` client tasks are in flight: chunk N+1 starts only
/// after every phone of chunk N finished. Store updates run detached from
/// the chunk loop but are always drained before [`Dispatcher::run`] returns.
pub struct Dispatcher {
    executor: Arc<dyn EndpointExecutor>,
    store: Arc<dyn EndpointStore>,
    progress: Arc<dyn ProgressReporter>,
    cancel: CancellationToken,
}

impl Dispatcher {
    /// Create a new dispatcher
    pub fn new(
        executor: Arc<dyn EndpointExecutor>,
        store: Arc<dyn EndpointStore>,
        progress: Arc<dyn ProgressReporter>,
    ) -> Self {
        Self {
            executor,
            store,
            progress,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that stops the run when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run `commands` against every address and return the resulting tally
    pub async fn run(
        &self,
        addresses: &[String],
        commands: &CommandSequence,
        chunk_size: usize,
    ) -> Result<RunReport, DispatchError> {
        if chunk_size == 0 {
            return Err(DispatchError::InvalidChunkSize);
        }

        let started = Instant::now();
        let chunks = partition(addresses, chunk_size);
        let total = addresses.len();
        info!(
            "Dispatching {} steps to {} phones in {} chunks of up to {}",
            commands.len(),
            total,
            chunks.len(),
            chunk_size
        );

        let mut persists: JoinSet<Persisted> = JoinSet::new();
        let mut dispatched: Vec<String> = Vec::with_capacity(total);
        let mut fatal: Option<StoreError> = None;
        let mut canceled = false;
        let mut completed = 0usize;
        let mut launched_chunks = 0usize;

        for (index, chunk) in chunks.iter().enumerate() {
            // Collect updates that already finished so a dead store stops the next chunk
            if !persists.is_empty() {
                tokio::task::yield_now().await;
                while let Some(done) = persists.try_join_next() {
                    if let Some(err) = reap(done) {
                        error!("Store unavailable, aborting run: {}", err);
                        fatal.get_or_insert(err);
                    }
                }
            }
            if self.cancel.is_cancelled() {
                canceled = true;
            }
            if canceled || fatal.is_some() {
                break;
            }

            launched_chunks += 1;
            debug!("Chunk {}/{}: {:?}", index + 1, chunks.len(), chunk);
            self.progress.chunk_started(index + 1, chunks.len(), chunk);
            dispatched.extend(chunk.iter().cloned());

            let mut clients: JoinSet<Completion> = JoinSet::new();
            let mut in_flight: HashMap<tokio::task::Id, String> = HashMap::new();
            for address in chunk.iter() {
                let executor = self.executor.clone();
                let commands = commands.clone();
                let task_address = address.clone();
                let handle = clients.spawn(async move {
                    let outcome = executor.execute(&task_address, &commands).await;
                    Completion {
                        address: task_address,
                        outcome,
                    }
                });
                in_flight.insert(handle.id(), address.clone());
            }

            while !clients.is_empty() {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled(), if !canceled => {
                        warn!("Run canceled, aborting {} in-flight phones", clients.len());
                        canceled = true;
                        clients.abort_all();
                    }
                    Some(done) = persists.join_next(), if !persists.is_empty() => {
                        if let Some(err) = reap(done) {
                            error!("Store unavailable, aborting run: {}", err);
                            fatal.get_or_insert(err);
                            clients.abort_all();
                        }
                    }
                    Some(joined) = clients.join_next_with_id() => {
                        let finished = match joined {
                            Ok((id, completion)) => {
                                in_flight.remove(&id);
                                let classification = classify(&completion.outcome);
                                Some((completion.address, classification))
                            }
                            Err(e) => match in_flight.remove(&e.id()) {
                                Some(address) => Some((address, classify_join_error(&e))),
                                None => {
                                    error!("Phone task {} finished without an address: {}", e.id(), e);
                                    None
                                }
                            },
                        };

                        completed += 1;
                        self.progress.report(completed, total);

                        if let Some((address, classification)) = finished {
                            debug!(
                                "{} -> {} ({})",
                                address, classification.status, classification.message
                            );
                            if fatal.is_none() {
                                self.spawn_persist(&mut persists, address, classification);
                            }
                        }
                    }
                }
            }
        }

        info!("Draining {} in-flight store updates", persists.len());
        while let Some(done) = persists.join_next().await {
            if let Some(err) = reap(done) {
                error!("Store unavailable while draining: {}", err);
                fatal.get_or_insert(err);
            }
        }
        self.progress.finish();

        if let Some(err) = fatal {
            return Err(DispatchError::StoreUnavailable(err));
        }

        let tally = self.store.tally(&dispatched).await.map_err(|e| {
            if e.is_unavailable() {
                DispatchError::StoreUnavailable(e)
            } else {
                DispatchError::Tally(e)
            }
        })?;

        let report = RunReport {
            tally,
            chunks: launched_chunks,
            dispatched,
            canceled,
            elapsed: started.elapsed(),
        };
        info!(
            "Run finished: {} ok, {} failed, {} chunks, canceled={}, {:.3}s",
            report.tally.success.len(),
            report.tally.error.len(),
            report.chunks,
            report.canceled,
            report.elapsed.as_secs_f64()
        );
        Ok(report)
    }

    /// Record a classification as a detached task owned by `persists`
    fn spawn_persist(
        &self,
        persists: &mut JoinSet<Persisted>,
        address: String,
        classification: Classification,
    ) {
        let store = self.store.clone();
        persists.spawn(async move {
            let result = store
                .update_status(&address, classification.status, &classification.message)
                .await;
            Persisted {
                address,
                status: classification.status,
                result,
            }
        });
    }
}

fn classify_join_error(err: &JoinError) -> Classification {
    if err.is_cancelled() {
        Classification {
            status: Status::Canceled,
            message: CANCELED_MESSAGE.to_string(),
        }
    } else {
        Classification {
            status: Status::Error,
            message: format!("Phone task failed: {}", err),
        }
    }
}

/// Log a finished store update; returns the error if the store is gone
fn reap(done: Result<Persisted, JoinError>) -> Option<StoreError> {
    match done {
        Ok(Persisted {
            address,
            status,
            result: Ok(0),
        }) => {
            warn!("{} is not in the store, {} was not recorded", address, status);
            None
        }
        Ok(Persisted {
            address,
            status,
            result: Ok(_),
        }) => {
            debug!("{} recorded as {}", address, status);
            None
        }
        Ok(Persisted {
            result: Err(e), ..
        }) if e.is_unavailable() => Some(e),
        Ok(Persisted {
            address,
            result: Err(e),
            ..
        }) => {
            error!("Failed to record {}: {}", address, e);
            None
        }
        Err(e) => {
            error!("Store update task failed: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, SqliteStore};
    use async_trait::async_trait;
    use provision_shared::EndpointRecord;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Executor with per-address delay and outcome that tracks concurrency
    #[derive(Default)]
    struct FakeExecutor {
        plan: HashMap<String, (Duration, Outcome)>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        started: Mutex<Vec<String>>,
    }

    impl FakeExecutor {
        fn plan(mut self, address: &str, delay_ms: u64, outcome: Outcome) -> Self {
            self.plan
                .insert(address.to_string(), (Duration::from_millis(delay_ms), outcome));
            self
        }

        fn started(&self) -> Vec<String> {
            self.started.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EndpointExecutor for FakeExecutor {
        async fn execute(&self, address: &str, _commands: &CommandSequence) -> Outcome {
            self.started.lock().unwrap().push(address.to_string());
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            let (delay, outcome) = self
                .plan
                .get(address)
                .cloned()
                .unwrap_or((Duration::from_millis(10), Outcome::Response { code: 200 }));
            tokio::time::sleep(delay).await;

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            outcome
        }
    }

    /// Memory store that records update order and can be told to fail
    #[derive(Default)]
    struct RecordingStore {
        inner: MemoryStore,
        updates: Mutex<Vec<(String, Status)>>,
        update_delay: Duration,
        unavailable: bool,
        broken_address: Option<String>,
    }

    impl RecordingStore {
        async fn with_phones(addresses: &[String]) -> Self {
            let store = Self::default();
            for address in addresses {
                store.inner.insert(address).await.unwrap();
            }
            store
        }

        fn updates(&self) -> Vec<(String, Status)> {
            self.updates.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EndpointStore for RecordingStore {
        async fn find(&self, address: &str) -> Result<Option<EndpointRecord>, StoreError> {
            self.inner.find(address).await
        }

        async fn insert(&self, address: &str) -> Result<usize, StoreError> {
            self.inner.insert(address).await
        }

        async fn list_pending(&self) -> Result<Vec<String>, StoreError> {
            self.inner.list_pending().await
        }

        async fn update_status(
            &self,
            address: &str,
            status: Status,
            message: &str,
        ) -> Result<usize, StoreError> {
            if !self.update_delay.is_zero() {
                tokio::time::sleep(self.update_delay).await;
            }
            self.updates
                .lock()
                .unwrap()
                .push((address.to_string(), status));
            if self.unavailable {
                return Err(StoreError::Unavailable {
                    context: "open sqlite db",
                    source: "unable to open database file".into(),
                });
            }
            if self.broken_address.as_deref() == Some(address) {
                return Err(StoreError::Query {
                    context: "update phone",
                    source: "constraint failed".into(),
                });
            }
            self.inner.update_status(address, status, message).await
        }

        async fn clear_all(&self) -> Result<usize, StoreError> {
            self.inner.clear_all().await
        }

        async fn tally(&self, addresses: &[String]) -> Result<Tally, StoreError> {
            self.inner.tally(addresses).await
        }

        fn name(&self) -> &'static str {
            "recording"
        }
    }

    #[derive(Default)]
    struct RecordingProgress {
        chunks: Mutex<Vec<Vec<String>>>,
        reports: Mutex<Vec<(usize, usize)>>,
        finished: AtomicUsize,
    }

    impl ProgressReporter for RecordingProgress {
        fn chunk_started(&self, _index: usize, _chunks: usize, addresses: &[String]) {
            self.chunks.lock().unwrap().push(addresses.to_vec());
        }

        fn report(&self, completed: usize, total: usize) {
            self.reports.lock().unwrap().push((completed, total));
        }

        fn finish(&self) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn addrs(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn commands() -> CommandSequence {
        CommandSequence::from_steps(["Key:Settings", "Key:KeyPad3"])
    }

    struct Harness {
        executor: Arc<FakeExecutor>,
        store: Arc<RecordingStore>,
        progress: Arc<RecordingProgress>,
        dispatcher: Dispatcher,
    }

    fn harness(executor: FakeExecutor, store: RecordingStore) -> Harness {
        let executor = Arc::new(executor);
        let store = Arc::new(store);
        let progress = Arc::new(RecordingProgress::default());
        let dispatcher = Dispatcher::new(executor.clone(), store.clone(), progress.clone());
        Harness {
            executor,
            store,
            progress,
            dispatcher,
        }
    }

    #[test]
    fn test_partition_three_into_two() {
        let addresses = addrs(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
        let chunks = partition(&addresses, 2);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], &addrs(&["10.0.0.1", "10.0.0.2"])[..]);
        assert_eq!(chunks[1], &addrs(&["10.0.0.3"])[..]);
    }

    #[test]
    fn test_partition_sizes() {
        for n in 0..30usize {
            let addresses: Vec<String> = (0..n).map(|i| format!("10.0.1.{}", i)).collect();
            for c in 1..8usize {
                let chunks = partition(&addresses, c);
                assert_eq!(chunks.len(), n.div_ceil(c), "n={n} c={c}");
                for (i, chunk) in chunks.iter().enumerate() {
                    if i + 1 < chunks.len() {
                        assert_eq!(chunk.len(), c);
                    } else {
                        assert!(!chunk.is_empty() && chunk.len() <= c);
                    }
                }
                let flattened: Vec<String> = chunks.concat();
                assert_eq!(flattened, addresses);
            }
        }
        assert!(partition(&addrs(&["a"]), 0).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_records_every_phone() {
        let addresses = addrs(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
        let executor = FakeExecutor::default()
            .plan("10.0.0.1", 50, Outcome::Response { code: 200 })
            .plan("10.0.0.2", 20, Outcome::Response { code: 500 })
            .plan("10.0.0.3", 30, Outcome::Response { code: 200 });
        let h = harness(executor, RecordingStore::with_phones(&addresses).await);

        let report = h.dispatcher.run(&addresses, &commands(), 2).await.unwrap();

        assert_eq!(report.chunks, 2);
        assert!(!report.canceled);
        assert_eq!(report.dispatched, addresses);
        assert_eq!(report.tally.success, addrs(&["10.0.0.1", "10.0.0.3"]));
        assert_eq!(report.tally.error, addrs(&["10.0.0.2"]));
        assert_eq!(report.tally.devices(), 3);

        assert_eq!(
            *h.progress.chunks.lock().unwrap(),
            vec![addrs(&["10.0.0.1", "10.0.0.2"]), addrs(&["10.0.0.3"])]
        );
        assert_eq!(*h.progress.reports.lock().unwrap(), vec![(1, 3), (2, 3), (3, 3)]);
        assert_eq!(h.progress.finished.load(Ordering::SeqCst), 1);

        // Exactly one update per address
        let mut updated: Vec<String> = h.store.updates().into_iter().map(|(a, _)| a).collect();
        updated.sort();
        assert_eq!(updated, addresses);

        let record = h.store.find("10.0.0.2").await.unwrap().unwrap();
        assert_eq!(record.status, Some(Status::Error));
        assert_eq!(record.error.as_deref(), Some("Response 500"));
        let record = h.store.find("10.0.0.1").await.unwrap().unwrap();
        assert_eq!(record.error.as_deref(), Some("Response 200"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_completions_processed_first_come_first_served() {
        let addresses = addrs(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
        let executor = FakeExecutor::default()
            .plan("10.0.0.1", 300, Outcome::Response { code: 200 })
            .plan("10.0.0.2", 100, Outcome::Response { code: 200 })
            .plan("10.0.0.3", 200, Outcome::Response { code: 200 });
        let h = harness(executor, RecordingStore::with_phones(&addresses).await);

        h.dispatcher.run(&addresses, &commands(), 3).await.unwrap();

        let order: Vec<String> = h.store.updates().into_iter().map(|(a, _)| a).collect();
        assert_eq!(order, addrs(&["10.0.0.2", "10.0.0.3", "10.0.0.1"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_bounded_by_chunk_size() {
        let addresses: Vec<String> = (1..=10).map(|i| format!("10.0.0.{}", i)).collect();
        let mut executor = FakeExecutor::default();
        for (i, address) in addresses.iter().enumerate() {
            executor = executor.plan(address, 10 + (i as u64 * 7) % 40, Outcome::Response { code: 200 });
        }
        let h = harness(executor, RecordingStore::with_phones(&addresses).await);

        let report = h.dispatcher.run(&addresses, &commands(), 3).await.unwrap();

        assert_eq!(report.chunks, 4);
        assert_eq!(h.executor.max_in_flight.load(Ordering::SeqCst), 3);
        assert_eq!(h.executor.started().len(), 10);
        assert_eq!(report.tally.success.len(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failure_message_is_persisted() {
        let addresses = addrs(&["10.0.0.1"]);
        let error = "Request to http://10.0.0.1/CGI/Execute timed out after 3000ms".to_string();
        let executor = FakeExecutor::default().plan(
            "10.0.0.1",
            10,
            Outcome::Failed {
                error: error.clone(),
            },
        );
        let h = harness(executor, RecordingStore::with_phones(&addresses).await);

        let report = h.dispatcher.run(&addresses, &commands(), 20).await.unwrap();

        assert_eq!(report.tally.error, addresses);
        let record = h.store.find("10.0.0.1").await.unwrap().unwrap();
        assert_eq!(record.status, Some(Status::Error));
        assert_eq!(record.error, Some(error));
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_unavailable_aborts_run() {
        let addresses = addrs(&["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4"]);
        let mut store = RecordingStore::with_phones(&addresses).await;
        store.unavailable = true;
        let executor = FakeExecutor::default()
            .plan("10.0.0.1", 10, Outcome::Response { code: 200 })
            .plan("10.0.0.2", 500, Outcome::Response { code: 200 });
        let h = harness(executor, store);

        let err = h
            .dispatcher
            .run(&addresses, &commands(), 2)
            .await
            .expect_err("run cannot continue without a store");

        assert!(matches!(err, DispatchError::StoreUnavailable(_)), "{err}");
        // The second chunk never starts and the aborted phone is not recorded
        assert_eq!(h.executor.started(), addrs(&["10.0.0.1", "10.0.0.2"]));
        assert_eq!(h.store.updates(), vec![("10.0.0.1".to_string(), Status::Success)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_failure_seen_at_chunk_boundary() {
        let addresses = addrs(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
        let mut store = RecordingStore::with_phones(&addresses).await;
        store.unavailable = true;
        // Both phones of the first chunk finish together
        let h = harness(FakeExecutor::default(), store);

        let err = h.dispatcher.run(&addresses, &commands(), 2).await.unwrap_err();

        assert!(matches!(err, DispatchError::StoreUnavailable(_)));
        assert_eq!(h.executor.started(), addrs(&["10.0.0.1", "10.0.0.2"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_failure_is_isolated() {
        let addresses = addrs(&["10.0.0.1", "10.0.0.2"]);
        let mut store = RecordingStore::with_phones(&addresses).await;
        store.broken_address = Some("10.0.0.1".into());
        let h = harness(FakeExecutor::default(), store);

        let report = h.dispatcher.run(&addresses, &commands(), 1).await.unwrap();

        assert_eq!(report.chunks, 2);
        assert_eq!(report.tally.success, addrs(&["10.0.0.2"]));
        assert_eq!(report.tally.devices(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_address_is_not_fatal() {
        let addresses = addrs(&["10.0.0.1", "10.0.0.99"]);
        let h = harness(
            FakeExecutor::default(),
            RecordingStore::with_phones(&addresses[..1]).await,
        );

        let report = h.dispatcher.run(&addresses, &commands(), 2).await.unwrap();

        assert_eq!(report.tally.success, addrs(&["10.0.0.1"]));
        assert!(h.store.find("10.0.0.99").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drains_slow_store_updates() {
        let addresses: Vec<String> = (1..=5).map(|i| format!("10.0.0.{}", i)).collect();
        let mut store = RecordingStore::with_phones(&addresses).await;
        store.update_delay = Duration::from_secs(2);
        let h = harness(FakeExecutor::default(), store);

        let report = h.dispatcher.run(&addresses, &commands(), 2).await.unwrap();

        assert_eq!(h.store.updates().len(), 5);
        assert_eq!(report.tally.success, addresses);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_run() {
        let addresses = addrs(&["10.0.0.1", "10.0.0.2"]);
        let h = harness(
            FakeExecutor::default(),
            RecordingStore::with_phones(&addresses).await,
        );
        h.dispatcher.cancellation_token().cancel();

        let report = h.dispatcher.run(&addresses, &commands(), 1).await.unwrap();

        assert!(report.canceled);
        assert_eq!(report.chunks, 0);
        assert!(report.dispatched.is_empty());
        assert!(h.executor.started().is_empty());
        assert_eq!(report.tally.devices(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_chunk() {
        let addresses = addrs(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
        let executor = FakeExecutor::default()
            .plan("10.0.0.1", 10, Outcome::Response { code: 200 })
            .plan("10.0.0.2", 10_000, Outcome::Response { code: 200 })
            .plan("10.0.0.3", 10, Outcome::Response { code: 200 });
        let h = harness(executor, RecordingStore::with_phones(&addresses).await);

        let cancel = h.dispatcher.cancellation_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });

        let report = h.dispatcher.run(&addresses, &commands(), 2).await.unwrap();

        assert!(report.canceled);
        assert_eq!(report.chunks, 1);
        assert_eq!(report.tally.success, addrs(&["10.0.0.1"]));
        assert_eq!(report.tally.error, addrs(&["10.0.0.2"]));
        let record = h.store.find("10.0.0.2").await.unwrap().unwrap();
        assert_eq!(record.status, Some(Status::Canceled));
        assert_eq!(record.error.as_deref(), Some(CANCELED_MESSAGE));
        // Third phone was never launched and stays pending
        assert!(h.store.find("10.0.0.3").await.unwrap().unwrap().status.is_none());
        assert_eq!(
            h.store.list_pending().await.unwrap(),
            addrs(&["10.0.0.2", "10.0.0.3"])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeat_success_is_idempotent() {
        let addresses = addrs(&["10.0.0.1"]);
        let h = harness(
            FakeExecutor::default(),
            RecordingStore::with_phones(&addresses).await,
        );

        h.dispatcher.run(&addresses, &commands(), 1).await.unwrap();
        let report = h.dispatcher.run(&addresses, &commands(), 1).await.unwrap();

        assert_eq!(report.tally.success, addresses);
        assert_eq!(h.store.insert("10.0.0.1").await.unwrap(), 0);
        assert!(h.store.list_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_zero_chunk_size_rejected() {
        let h = harness(FakeExecutor::default(), RecordingStore::default());
        let err = h
            .dispatcher
            .run(&addrs(&["10.0.0.1"]), &commands(), 0)
            .await
            .expect_err("zero chunk size");
        assert!(matches!(err, DispatchError::InvalidChunkSize));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_sqlite_store_records_concurrent_updates() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::open(dir.path().join("phones.sqlite")).await.unwrap());

        let addresses: Vec<String> = (0..300)
            .map(|i| format!("10.1.{}.{}", i / 250, i % 250))
            .collect();
        let mut executor = FakeExecutor::default();
        for (i, address) in addresses.iter().enumerate() {
            let code = if i % 7 == 0 { 500 } else { 200 };
            executor = executor.plan(address, 0, Outcome::Response { code });
        }
        for address in &addresses {
            store.insert(address).await.unwrap();
        }

        let progress = Arc::new(RecordingProgress::default());
        let dispatcher = Dispatcher::new(Arc::new(executor), store.clone(), progress.clone());
        let report = dispatcher.run(&addresses, &commands(), 150).await.unwrap();

        let failed = addresses.iter().step_by(7).count();
        assert_eq!(report.chunks, 2);
        assert_eq!(report.dispatched.len(), addresses.len());
        assert_eq!(report.tally.devices(), addresses.len());
        assert_eq!(report.tally.error.len(), failed);
        assert_eq!(report.tally.success.len(), addresses.len() - failed);

        // Every update landed, so only the failed phones are still pending
        let pending = store.list_pending().await.unwrap();
        assert_eq!(pending.len(), failed);
        for address in &addresses {
            let record = store.find(address).await.unwrap().expect("record exists");
            assert!(record.status.is_some(), "{address} was never recorded");
            assert!(record.updated.is_some());
        }
    }
}
