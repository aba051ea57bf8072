//! Job manager: admission control, submission, stop requests and queries.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::config::ServiceConfig;
use crate::error::DownloadError;
use crate::jobs::runner::{DEFAULT_UPDATE_CADENCE, JobRunner, RunnerDeps};
use crate::jobs::state::{JobRecord, JobStatus, OutputFormat};
use crate::jobs::store::JobStore;
use crate::source::{ChatSource, is_supported_url};

/// A download request as submitted by a client.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DownloadRequest {
    pub url: Option<String>,
    pub format: Option<String>,
    pub max_messages: Option<u64>,
    /// Seconds.
    pub timeout: Option<u64>,
}

/// Effective parameters of an accepted download, after defaults and clamping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadConfig {
    pub url: String,
    pub format: OutputFormat,
    pub max_messages: Option<u64>,
    /// Seconds.
    pub timeout: u64,
}

/// Result of a successful submission.
#[derive(Debug, Clone, Serialize)]
pub struct Submission {
    pub download_id: String,
    pub config: DownloadConfig,
}

/// Per-job summary used in listings.
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub id: String,
    pub status: JobStatus,
    pub message_count: u64,
    pub created_at: DateTime<Utc>,
}

impl From<&JobRecord> for JobSummary {
    fn from(r: &JobRecord) -> Self {
        Self {
            id: r.id.clone(),
            status: r.status,
            message_count: r.message_count,
            created_at: r.created_at,
        }
    }
}

/// A fetchable artifact.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub path: PathBuf,
    /// Suggested download name; `_partial` for stopped jobs.
    pub filename: String,
    pub format: OutputFormat,
    pub size: u64,
    pub partial: bool,
}

/// Tracked runner handle.
#[derive(Debug)]
struct TrackedJob {
    handle: JoinHandle<()>,
}

/// Public operation surface over the job store and runners.
pub struct JobManager {
    config: ServiceConfig,
    store: Arc<JobStore>,
    source: Arc<dyn ChatSource>,
    next_seq: AtomicU64,
    /// Runner handles, for shutdown.
    runners: RwLock<HashMap<String, TrackedJob>>,
}

impl JobManager {
    /// Create a manager with a fresh store.
    pub fn new(config: ServiceConfig, source: Arc<dyn ChatSource>) -> Self {
        Self::with_store(config, source, Arc::new(JobStore::new()))
    }

    pub fn with_store(
        config: ServiceConfig,
        source: Arc<dyn ChatSource>,
        store: Arc<JobStore>,
    ) -> Self {
        Self {
            config,
            store,
            source,
            next_seq: AtomicU64::new(0),
            runners: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    /// Validate, admit and start a download. Returns as soon as the runner is spawned.
    pub async fn submit(&self, request: DownloadRequest) -> Result<Submission, DownloadError> {
        let config = self.resolve(request)?;

        let download_id = self.next_id();
        let artifact_path = self
            .config
            .download_dir
            .join(format!("{}.{}", download_id, config.format));

        let record = JobRecord::new(&download_id, &config.url, config.format, artifact_path)
            .with_limits(config.max_messages, Duration::from_secs(config.timeout));

        let signal = self
            .store
            .insert_bounded(record, Some(self.config.max_concurrent_downloads))
            .await
            .inspect_err(|e| {
                if let DownloadError::Admission { max } = e {
                    tracing::warn!(
                        max,
                        url = %config.url,
                        "Download rejected: concurrency cap reached"
                    );
                }
            })?;

        let runner = JobRunner::new(
            &download_id,
            signal,
            RunnerDeps {
                store: Arc::clone(&self.store),
                source: Arc::clone(&self.source),
                watchdog_grace: self.config.watchdog_grace,
                update_cadence: DEFAULT_UPDATE_CADENCE,
            },
        );
        let handle = self.spawn_runner(runner);

        let mut runners = self.runners.write().await;
        runners.retain(|_, tracked| !tracked.handle.is_finished());
        runners.insert(download_id.clone(), TrackedJob { handle });
        drop(runners);

        tracing::info!(
            download_id = %download_id,
            url = %config.url,
            format = %config.format,
            max_messages = ?config.max_messages,
            timeout_secs = config.timeout,
            "Download submitted"
        );

        Ok(Submission {
            download_id,
            config,
        })
    }

    /// Apply defaults, validation and clamping. No side effects.
    fn resolve(&self, request: DownloadRequest) -> Result<DownloadConfig, DownloadError> {
        let url = request
            .url
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .ok_or_else(|| DownloadError::Validation("URL is required".to_string()))?;

        let format = match request.format.as_deref() {
            None => OutputFormat::default(),
            Some(f) => f.parse().map_err(DownloadError::Validation)?,
        };

        if !is_supported_url(&url) {
            return Err(DownloadError::Validation(
                "Unsupported platform. Use Twitch, YouTube, Facebook, or Zoom URLs".to_string(),
            ));
        }

        // Zero means "no limit", as it always has for this API.
        let max_messages = request
            .max_messages
            .filter(|m| *m > 0)
            .map(|m| m.min(self.config.max_messages_limit));

        let timeout = request
            .timeout
            .filter(|t| *t > 0)
            .unwrap_or(self.config.default_timeout.as_secs())
            .min(self.config.max_timeout.as_secs());

        Ok(DownloadConfig {
            url,
            format,
            max_messages,
            timeout,
        })
    }

    fn next_id(&self) -> String {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        format!("download_{}_{}", Utc::now().timestamp(), seq)
    }

    /// Spawn the runner, isolating panics so they end only their own job.
    fn spawn_runner(&self, runner: JobRunner) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let job_id = runner.job_id().to_string();
        let inner = tokio::spawn(runner.run());

        tokio::spawn(async move {
            if let Err(e) = inner.await {
                tracing::error!(download_id = %job_id, error = %e, "Runner panicked");
                let _ = store
                    .update(&job_id, |r| {
                        if r.status.is_active() {
                            let _ = r.transition_to(
                                JobStatus::Error,
                                Some("Internal error while downloading".to_string()),
                            );
                        }
                    })
                    .await;
            }
        })
    }

    /// Ask a download to stop. The runner observes the request within about
    /// one message; this call does not wait for it.
    pub async fn request_stop(&self, id: &str) -> Result<(), DownloadError> {
        let record = self.store.get(id).await?;
        if !record.cancellable() {
            return Err(DownloadError::Conflict {
                id: id.to_string(),
                reason: format!("cannot be stopped (status: {})", record.status),
            });
        }

        let signal = self
            .store
            .signal(id)
            .await
            .ok_or_else(|| DownloadError::NotFound { id: id.to_string() })?;
        if signal.cancel() {
            tracing::info!(download_id = %id, status = %record.status, "Stop requested");
        }
        Ok(())
    }

    /// Snapshot of one job.
    pub async fn status(&self, id: &str) -> Result<JobRecord, DownloadError> {
        self.store.get(id).await
    }

    /// Summaries of every job submitted during this process lifetime.
    pub async fn list_all(&self) -> Vec<JobSummary> {
        self.store
            .list_all()
            .await
            .iter()
            .map(JobSummary::from)
            .collect()
    }

    /// Locate the artifact of a finished job.
    ///
    /// Only `completed` and `stopped` jobs with a non-empty artifact qualify.
    pub async fn fetch_artifact(&self, id: &str) -> Result<Artifact, DownloadError> {
        let record = self.store.get(id).await?;
        if !record.status.has_artifact() {
            return Err(DownloadError::Conflict {
                id: id.to_string(),
                reason: format!("Download not ready yet. Status: {}", record.status),
            });
        }

        let size = match tokio::fs::metadata(&record.artifact_path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => {
                tracing::warn!(download_id = %id, error = %e, "Could not stat artifact");
                0
            }
        };
        if size == 0 {
            return Err(DownloadError::Conflict {
                id: id.to_string(),
                reason: "No messages captured".to_string(),
            });
        }

        Ok(Artifact {
            filename: record.artifact_filename(),
            path: record.artifact_path,
            format: record.output_format,
            size,
            partial: record.status == JobStatus::Stopped,
        })
    }

    /// Request every active job to stop and wait up to `wait` for runners to finish.
    pub async fn stop_all(&self, wait: Duration) {
        for record in self.store.list_all().await {
            if record.cancellable() {
                let _ = self.request_stop(&record.id).await;
            }
        }

        let handles: Vec<(String, TrackedJob)> = self.runners.write().await.drain().collect();
        let joined = tokio::time::timeout(wait, async {
            for (_, tracked) in handles {
                let _ = tracked.handle.await;
            }
        })
        .await;
        if joined.is_err() {
            tracing::warn!("Some downloads did not stop before shutdown");
        }
    }
}
