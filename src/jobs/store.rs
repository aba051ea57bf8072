//! In-memory job registry and per-job cancellation signals.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Notify, RwLock};

use crate::error::DownloadError;
use crate::jobs::state::JobRecord;

/// Cooperative stop flag shared between a job's runner and stop requests.
///
/// Setting it is idempotent. The runner polls `is_set` before each message and
/// may also await `cancelled` while blocked on its source.
#[derive(Debug, Default)]
pub struct CancelSignal {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Returns `true` if this call set the flag.
    pub fn cancel(&self) -> bool {
        let first = !self.flag.swap(true, Ordering::AcqRel);
        if first {
            self.notify.notify_waiters();
        }
        first
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Resolve once cancellation has been requested.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

/// Concurrency-safe registry of every job submitted during the process lifetime.
///
/// A single coarse lock guards the record map so every read returns a whole
/// record and every `update` applies all of its field changes at once.
/// Cancellation signals live in a parallel map keyed by the same id.
#[derive(Debug, Default)]
pub struct JobStore {
    records: RwLock<HashMap<String, JobRecord>>,
    signals: RwLock<HashMap<String, Arc<CancelSignal>>>,
}

impl JobStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new record together with its cancellation signal.
    pub async fn insert(&self, record: JobRecord) -> Result<Arc<CancelSignal>, DownloadError> {
        self.insert_bounded(record, None).await
    }

    /// Insert a new record unless `limit` active jobs already exist.
    ///
    /// The active count and the insert happen under the same write lock.
    pub async fn insert_bounded(
        &self,
        record: JobRecord,
        limit: Option<usize>,
    ) -> Result<Arc<CancelSignal>, DownloadError> {
        let mut records = self.records.write().await;

        if records.contains_key(&record.id) {
            return Err(DownloadError::Conflict {
                id: record.id.clone(),
                reason: "id already in use".to_string(),
            });
        }
        if let Some(max) = limit {
            let active = records.values().filter(|r| r.status.is_active()).count();
            if active >= max {
                return Err(DownloadError::Admission { max });
            }
        }

        let id = record.id.clone();
        let signal = Arc::new(CancelSignal::new());
        // Signal goes in before the record is visible, so a stop request can
        // never see a record without its signal.
        self.signals
            .write()
            .await
            .insert(id.clone(), Arc::clone(&signal));
        records.insert(id, record);

        Ok(signal)
    }

    /// Get a snapshot of a record.
    pub async fn get(&self, id: &str) -> Result<JobRecord, DownloadError> {
        self.records
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| DownloadError::NotFound { id: id.to_string() })
    }

    /// Apply a mutation to a record under exclusive access.
    pub async fn update<F, R>(&self, id: &str, f: F) -> Result<R, DownloadError>
    where
        F: FnOnce(&mut JobRecord) -> R,
    {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| DownloadError::NotFound { id: id.to_string() })?;
        Ok(f(record))
    }

    /// Get the cancellation signal for a job.
    pub async fn signal(&self, id: &str) -> Option<Arc<CancelSignal>> {
        self.signals.read().await.get(id).cloned()
    }

    /// Snapshots of every record, oldest first.
    pub async fn list_all(&self) -> Vec<JobRecord> {
        let mut all: Vec<JobRecord> = self.records.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        all
    }

    /// Count of jobs in `starting` or `running`.
    pub async fn active_count(&self) -> usize {
        self.records
            .read()
            .await
            .values()
            .filter(|r| r.status.is_active())
            .count()
    }

    /// Total number of jobs known to this store.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use super::*;
    use crate::jobs::state::{JobStatus, OutputFormat};

    fn record(id: &str) -> JobRecord {
        JobRecord::new(
            id,
            "https://youtube.com/watch?v=abc",
            OutputFormat::Json,
            PathBuf::from(format!("/tmp/{id}.json")),
        )
    }

    #[tokio::test]
    async fn insert_and_get() {
        let store = JobStore::new();
        store.insert(record("a")).await.unwrap();
        let rec = store.get("a").await.unwrap();
        assert_eq!(rec.status, JobStatus::Starting);
        assert!(store.signal("a").await.is_some());
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        let store = JobStore::new();
        store.insert(record("a")).await.unwrap();
        let err = store.insert(record("a")).await.unwrap_err();
        assert_eq!(err.kind(), "conflict");
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn get_unknown_is_not_found() {
        let store = JobStore::new();
        let err = store.get("missing").await.unwrap_err();
        assert_eq!(err, DownloadError::NotFound { id: "missing".into() });
        assert!(store.update("missing", |_| ()).await.is_err());
    }

    #[tokio::test]
    async fn bounded_insert_counts_only_active() {
        let store = JobStore::new();
        store.insert_bounded(record("a"), Some(1)).await.unwrap();
        let err = store.insert_bounded(record("b"), Some(1)).await.unwrap_err();
        assert_eq!(err, DownloadError::Admission { max: 1 });
        assert_eq!(store.len().await, 1);

        store
            .update("a", |r| {
                r.transition_to(JobStatus::Error, Some("boom".into()))
            })
            .await
            .unwrap()
            .unwrap();
        store.insert_bounded(record("b"), Some(1)).await.unwrap();
        assert_eq!(store.active_count().await, 1);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn concurrent_updates_are_not_lost() {
        let store = Arc::new(JobStore::new());
        store.insert(record("a")).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    store.update("a", |r| r.record_message(10)).await.unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(store.get("a").await.unwrap().message_count, 800);
    }

    #[tokio::test]
    async fn list_all_is_ordered_by_creation() {
        let store = JobStore::new();
        store.insert(record("first")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        store.insert(record("second")).await.unwrap();
        let ids: Vec<String> = store.list_all().await.into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["first", "second"]);
    }

    #[test]
    fn cancel_signal_is_idempotent() {
        let signal = CancelSignal::new();
        assert!(!signal.is_set());
        assert!(signal.cancel());
        assert!(!signal.cancel());
        assert!(signal.is_set());
    }

    #[tokio::test]
    async fn cancelled_wakes_waiter() {
        let signal = Arc::new(CancelSignal::new());
        let waiter = {
            let signal = Arc::clone(&signal);
            tokio::spawn(async move { signal.cancelled().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn cancelled_returns_immediately_when_already_set() {
        let signal = CancelSignal::new();
        signal.cancel();
        tokio::time::timeout(Duration::from_millis(100), signal.cancelled())
            .await
            .expect("already-set signal should resolve");
    }
}
