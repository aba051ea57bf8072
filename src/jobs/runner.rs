//! Per-job download execution.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;

use crate::artifact::ArtifactWriter;
use crate::error::Error;
use crate::jobs::state::{JobRecord, JobStatus};
use crate::jobs::store::{CancelSignal, JobStore};
use crate::source::{ChatRequest, ChatSource};

/// `last_update` is refreshed every this many messages.
pub const DEFAULT_UPDATE_CADENCE: u64 = 10;

/// Shared dependencies for runner execution.
#[derive(Clone)]
pub struct RunnerDeps {
    pub store: Arc<JobStore>,
    pub source: Arc<dyn ChatSource>,
    /// Slack beyond the job's timeout before the runner abandons its source.
    pub watchdog_grace: Duration,
    pub update_cadence: u64,
}

/// Why consumption of the message stream ended without a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    /// The source ended the stream.
    Exhausted,
    /// `max_messages` were written.
    LimitReached,
    /// A stop request was observed.
    Cancelled,
}

/// Runner that drives exactly one job from `Starting` to a terminal status.
pub struct JobRunner {
    job_id: String,
    signal: Arc<CancelSignal>,
    deps: RunnerDeps,
}

impl JobRunner {
    /// Create a new runner for a specific job.
    pub fn new(job_id: impl Into<String>, signal: Arc<CancelSignal>, deps: RunnerDeps) -> Self {
        Self {
            job_id: job_id.into(),
            signal,
            deps,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Run the job to completion. Faults are recorded into the job, never returned.
    pub async fn run(self) {
        let record = match self.deps.store.get(&self.job_id).await {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(
                    download_id = %self.job_id,
                    error = %e,
                    "Runner started for unknown job"
                );
                return;
            }
        };

        tracing::info!(
            download_id = %self.job_id,
            url = %record.source_url,
            format = %record.output_format,
            source = self.deps.source.name(),
            "Download starting"
        );

        let request = ChatRequest {
            url: record.source_url.clone(),
            max_messages: record.max_messages,
            timeout: record.timeout,
        };
        let mut writer = ArtifactWriter::new(&record.artifact_path, record.output_format);
        let deadline = record.timeout + self.deps.watchdog_grace;

        let result = tokio::time::timeout(deadline, self.consume(&request, &mut writer)).await;

        let (status, reason) = match result {
            Ok(Ok(Outcome::Cancelled)) => (JobStatus::Stopped, Some("Stop requested".to_string())),
            // A stop request observable at the end of the stream wins over completion.
            Ok(Ok(_)) if self.signal.is_set() => {
                (JobStatus::Stopped, Some("Stop requested".to_string()))
            }
            Ok(Ok(Outcome::Exhausted)) => (JobStatus::Completed, None),
            Ok(Ok(Outcome::LimitReached)) => {
                (JobStatus::Completed, Some("Message limit reached".to_string()))
            }
            Ok(Err(e)) => (JobStatus::Error, Some(e.to_string())),
            Err(_) => self.watchdog_outcome(deadline).await,
        };

        let (status, reason) = match writer.finish().await {
            Err(e) if status != JobStatus::Error => {
                (JobStatus::Error, Some(format!("Failed to finalize artifact: {e}")))
            }
            _ => (status, reason),
        };
        if writer.written() > 0 {
            tracing::debug!(
                download_id = %self.job_id,
                path = %writer.path().display(),
                messages = writer.written(),
                "Artifact closed"
            );
        }

        self.finish(status, reason).await;
    }

    /// Pull messages until the stream ends, the limit is hit, or a stop is requested.
    async fn consume(
        &self,
        request: &ChatRequest,
        writer: &mut ArtifactWriter,
    ) -> Result<Outcome, Error> {
        let mut stream = self.deps.source.open(request).await?;

        let running = self
            .deps
            .store
            .update(&self.job_id, |r| {
                r.transition_to(JobStatus::Running, Some("Connected to chat source".to_string()))
            })
            .await?;
        if let Err(reason) = running {
            tracing::warn!(download_id = %self.job_id, %reason, "Unexpected transition failure");
        }

        let mut count: u64 = 0;
        loop {
            if self.signal.is_set() {
                return Ok(Outcome::Cancelled);
            }
            if request.max_messages.is_some_and(|max| count >= max) {
                return Ok(Outcome::LimitReached);
            }

            let next = tokio::select! {
                biased;
                _ = self.signal.cancelled() => return Ok(Outcome::Cancelled),
                next = stream.next() => next,
            };

            let msg = match next {
                None => return Ok(Outcome::Exhausted),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(msg)) => msg,
            };

            // Checkpoint: a stop observed here drops the message unprocessed.
            if self.signal.is_set() {
                return Ok(Outcome::Cancelled);
            }

            writer.write(&msg).await?;
            count += 1;

            let cadence = self.deps.update_cadence;
            self.deps
                .store
                .update(&self.job_id, |r| r.record_message(cadence))
                .await?;

            if count % 1000 == 0 {
                tracing::debug!(download_id = %self.job_id, messages = count, "Download progress");
            }
        }
    }

    /// Decide the terminal status when the source outlived the watchdog.
    async fn watchdog_outcome(&self, deadline: Duration) -> (JobStatus, Option<String>) {
        let status = self
            .deps
            .store
            .get(&self.job_id)
            .await
            .map(|r| r.status)
            .unwrap_or(JobStatus::Starting);

        tracing::warn!(
            download_id = %self.job_id,
            source = self.deps.source.name(),
            deadline_secs = deadline.as_secs(),
            "Chat source overran its time budget"
        );

        match status {
            JobStatus::Starting => (
                JobStatus::Error,
                Some(format!(
                    "Chat source did not respond within {}s",
                    deadline.as_secs()
                )),
            ),
            _ if self.signal.is_set() => (JobStatus::Stopped, Some("Stop requested".to_string())),
            _ => (JobStatus::Completed, Some("Time budget reached".to_string())),
        }
    }

    /// Apply the terminal transition as one store update.
    async fn finish(&self, status: JobStatus, reason: Option<String>) {
        let result = self
            .deps
            .store
            .update(&self.job_id, |r: &mut JobRecord| {
                r.transition_to(status, reason.clone())?;
                Ok::<_, String>((r.message_count, r.elapsed()))
            })
            .await;

        match result {
            Ok(Ok((messages, elapsed))) => match status {
                JobStatus::Error => tracing::error!(
                    download_id = %self.job_id,
                    messages,
                    elapsed_secs = elapsed.as_secs(),
                    error = reason.as_deref().unwrap_or("unknown"),
                    "Download failed"
                ),
                _ => tracing::info!(
                    download_id = %self.job_id,
                    status = %status,
                    messages,
                    elapsed_secs = elapsed.as_secs(),
                    "Download finished"
                ),
            },
            Ok(Err(e)) => tracing::error!(
                download_id = %self.job_id,
                error = %e,
                "Could not record final status"
            ),
            Err(e) => {
                tracing::error!(download_id = %self.job_id, error = %e, "Job vanished from store")
            }
        }
    }
}
