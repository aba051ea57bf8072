//! Download job state machine.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a download job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, chat source not yet contacted.
    Starting,
    /// Chat source contacted, messages are being consumed.
    Running,
    /// Source exhausted (end of stream, message cap or time budget).
    Completed,
    /// Cancelled on request; artifact holds a partial result.
    Stopped,
    /// Source or sink faulted.
    Error,
}

impl JobStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            (Starting, Running) | (Starting, Error) |
            (Running, Completed) | (Running, Stopped) | (Running, Error)
        )
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Stopped | Self::Error)
    }

    /// Active jobs count against admission control and may be cancelled.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether the job's artifact may be fetched in this status.
    pub fn has_artifact(&self) -> bool {
        matches!(self, Self::Completed | Self::Stopped)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Stopped => "stopped",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Artifact encoding requested by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Json,
    #[default]
    Jsonl,
    Csv,
    Txt,
}

impl OutputFormat {
    pub const ALL: [OutputFormat; 4] = [Self::Json, Self::Jsonl, Self::Csv, Self::Txt];

    /// File extension, also the wire name of the format.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Jsonl => "jsonl",
            Self::Csv => "csv",
            Self::Txt => "txt",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Jsonl => "application/x-ndjson",
            Self::Csv => "text/csv; charset=utf-8",
            Self::Txt => "text/plain; charset=utf-8",
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|f| f.extension() == s)
            .ok_or_else(|| "Invalid format. Use: json, jsonl, csv, txt".to_string())
    }
}

/// A status transition event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: JobStatus,
    pub to: JobStatus,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// One submitted download job.
///
/// Owned by the `JobStore`; everyone else holds the id and reads snapshots.
/// `status`, `message_count` and the timestamps are written only by the job's
/// runner.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: String,
    pub source_url: String,
    pub output_format: OutputFormat,
    pub artifact_path: PathBuf,
    pub max_messages: Option<u64>,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    pub status: JobStatus,
    pub message_count: u64,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_update: Option<DateTime<Utc>>,
    pub error_detail: Option<String>,
    pub transitions: Vec<StateTransition>,
}

impl JobRecord {
    /// Create a new record in `Starting`.
    pub fn new(
        id: impl Into<String>,
        source_url: impl Into<String>,
        output_format: OutputFormat,
        artifact_path: PathBuf,
    ) -> Self {
        Self {
            id: id.into(),
            source_url: source_url.into(),
            output_format,
            artifact_path,
            max_messages: None,
            timeout: Duration::ZERO,
            status: JobStatus::Starting,
            message_count: 0,
            created_at: Utc::now(),
            finished_at: None,
            last_update: None,
            error_detail: None,
            transitions: Vec::new(),
        }
    }

    pub fn with_limits(mut self, max_messages: Option<u64>, timeout: Duration) -> Self {
        self.max_messages = max_messages;
        self.timeout = timeout;
        self
    }

    /// True iff the job can still be stopped. Derived, never stored.
    pub fn cancellable(&self) -> bool {
        self.status.is_active()
    }

    /// Transition to a new status.
    ///
    /// `finished_at` is stamped on entering a terminal status; terminal
    /// statuses have no outgoing edges so it is set at most once.
    pub fn transition_to(
        &mut self,
        new_status: JobStatus,
        reason: Option<String>,
    ) -> Result<(), String> {
        if !self.status.can_transition_to(new_status) {
            return Err(format!(
                "Cannot transition from {} to {}",
                self.status, new_status
            ));
        }

        let now = Utc::now();
        self.transitions.push(StateTransition {
            from: self.status,
            to: new_status,
            timestamp: now,
            reason: reason.clone(),
        });
        self.status = new_status;

        if new_status == JobStatus::Error {
            self.error_detail = reason;
        }
        if new_status.is_terminal() {
            self.finished_at = Some(now);
            self.last_update = Some(now);
        }

        Ok(())
    }

    /// Record one consumed message. `last_update` is refreshed every
    /// `cadence` messages.
    pub fn record_message(&mut self, cadence: u64) {
        self.message_count += 1;
        if cadence > 0 && self.message_count % cadence == 0 {
            self.last_update = Some(Utc::now());
        }
    }

    /// Download name for the artifact; stopped jobs carry a `_partial` suffix.
    pub fn artifact_filename(&self) -> String {
        let suffix = if self.status == JobStatus::Stopped {
            "_partial"
        } else {
            ""
        };
        format!("chat_{}{}.{}", self.id, suffix, self.output_format)
    }

    /// Get the duration the job has been (or was) running.
    pub fn elapsed(&self) -> Duration {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        let duration = end.signed_duration_since(self.created_at);
        Duration::from_millis(duration.num_milliseconds().max(0) as u64)
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> JobRecord {
        JobRecord::new(
            "download_1_1",
            "https://twitch.tv/example",
            OutputFormat::Jsonl,
            PathBuf::from("/tmp/download_1_1.jsonl"),
        )
    }

    #[test]
    fn status_transitions_valid() {
        assert!(JobStatus::Starting.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Starting.can_transition_to(JobStatus::Error));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Stopped));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Error));
    }

    #[test]
    fn status_transitions_invalid() {
        assert!(!JobStatus::Starting.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Starting));
        for terminal in [JobStatus::Completed, JobStatus::Stopped, JobStatus::Error] {
            for target in [
                JobStatus::Starting,
                JobStatus::Running,
                JobStatus::Completed,
                JobStatus::Stopped,
                JobStatus::Error,
            ] {
                assert!(!terminal.can_transition_to(target), "{terminal} -> {target}");
            }
        }
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Stopped.is_terminal());
        assert!(JobStatus::Error.is_terminal());
        assert!(!JobStatus::Starting.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn cancellable_is_derived_from_status() {
        let mut rec = record();
        assert!(rec.cancellable());
        rec.transition_to(JobStatus::Running, None).unwrap();
        assert!(rec.cancellable());
        rec.transition_to(JobStatus::Stopped, None).unwrap();
        assert!(!rec.cancellable());
    }

    #[test]
    fn finished_at_set_once_on_terminal() {
        let mut rec = record();
        rec.transition_to(JobStatus::Running, None).unwrap();
        assert!(rec.finished_at.is_none());
        rec.transition_to(JobStatus::Completed, None).unwrap();
        let finished = rec.finished_at;
        assert!(finished.is_some());

        assert!(rec.transition_to(JobStatus::Stopped, None).is_err());
        assert_eq!(rec.status, JobStatus::Completed);
        assert_eq!(rec.finished_at, finished);
        assert_eq!(rec.transitions.len(), 2);
    }

    #[test]
    fn error_detail_only_on_error() {
        let mut rec = record();
        rec.transition_to(JobStatus::Running, Some("connected".into()))
            .unwrap();
        assert!(rec.error_detail.is_none());
        rec.transition_to(JobStatus::Error, Some("connection reset".into()))
            .unwrap();
        assert_eq!(rec.error_detail.as_deref(), Some("connection reset"));
    }

    #[test]
    fn last_update_follows_cadence() {
        let mut rec = record();
        for _ in 0..9 {
            rec.record_message(10);
        }
        assert!(rec.last_update.is_none());
        rec.record_message(10);
        assert_eq!(rec.message_count, 10);
        assert!(rec.last_update.is_some());
    }

    #[test]
    fn artifact_filename_marks_partial() {
        let mut rec = record();
        rec.transition_to(JobStatus::Running, None).unwrap();
        let mut done = rec.clone();
        done.transition_to(JobStatus::Completed, None).unwrap();
        assert_eq!(done.artifact_filename(), "chat_download_1_1.jsonl");

        rec.transition_to(JobStatus::Stopped, None).unwrap();
        assert_eq!(rec.artifact_filename(), "chat_download_1_1_partial.jsonl");
    }

    #[test]
    fn output_format_parse() {
        assert_eq!("csv".parse::<OutputFormat>().unwrap(), OutputFormat::Csv);
        assert_eq!("jsonl".parse::<OutputFormat>().unwrap(), OutputFormat::Jsonl);
        assert!("xml".parse::<OutputFormat>().is_err());
        assert!("JSON".parse::<OutputFormat>().is_err());
        assert_eq!(OutputFormat::default(), OutputFormat::Jsonl);
    }

    #[test]
    fn status_serde_matches_display() {
        let json = serde_json::to_string(&JobStatus::Stopped).unwrap();
        assert_eq!(json, "\"stopped\"");
        assert_eq!(JobStatus::Running.to_string(), "running");
    }

    #[test]
    fn record_serializes_timeout_as_seconds() {
        let rec = record().with_limits(Some(20), Duration::from_secs(60));
        let value = serde_json::to_value(&rec).unwrap();
        assert_eq!(value["timeout"], 60);
        assert_eq!(value["max_messages"], 20);
        assert_eq!(value["status"], "starting");
        assert_eq!(value["output_format"], "jsonl");
    }
}
