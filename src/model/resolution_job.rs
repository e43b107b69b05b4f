use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Generic job-queue state shared by every queue-backed table.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Processing,
    Errored,
    Failed,
    Completed,
    Canceled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Processing => "processing",
            JobState::Errored => "errored",
            JobState::Failed => "failed",
            JobState::Completed => "completed",
            JobState::Canceled => "canceled",
        }
    }

    pub fn parse_state(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "queued" => Some(JobState::Queued),
            "processing" => Some(JobState::Processing),
            "errored" => Some(JobState::Errored),
            "failed" => Some(JobState::Failed),
            "completed" => Some(JobState::Completed),
            "canceled" => Some(JobState::Canceled),
            _ => None,
        }
    }

    /// No worker will pick the job up again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Failed | JobState::Completed | JobState::Canceled
        )
    }
}

/// One entry of a job's execution log, written by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionLogEntry {
    pub key: String,
    #[serde(default)]
    pub command: Vec<String>,
    pub start_time: DateTime<Utc>,
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub out: String,
    pub duration_ms: Option<i64>,
}

/// A queued request to resolve the workspaces of one batch spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSpecResolutionJob {
    pub id: i64,
    pub batch_spec_id: i64,
    pub initiator_id: i64,
    pub state: JobState,
    pub failure_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub process_after: Option<DateTime<Utc>>,
    pub num_resets: i64,
    pub num_failures: i64,
    pub execution_logs: Vec<ExecutionLogEntry>,
    pub worker_hostname: String,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub queued_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BatchSpecResolutionJob {
    pub fn new(batch_spec_id: i64, initiator_id: i64) -> Self {
        Self {
            id: 0,
            batch_spec_id,
            initiator_id,
            state: JobState::Queued,
            failure_message: None,
            started_at: None,
            finished_at: None,
            process_after: None,
            num_resets: 0,
            num_failures: 0,
            execution_logs: Vec::new(),
            worker_hostname: String::new(),
            last_heartbeat_at: None,
            queued_at: None,
            created_at: DateTime::<Utc>::default(),
            updated_at: DateTime::<Utc>::default(),
        }
    }
}
