//! The surface a job-queue engine needs from a queue-backed table.
//!
//! Leasing, heartbeats and resets belong to the engine. This module only
//! describes where the jobs live, how to scan them and how a job's state is
//! classified under a given set of options.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;

use crate::error::Result;
use crate::model::JobState;

/// Declarative configuration consumed by the job-queue engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStoreOptions {
    pub name: &'static str,
    pub table_name: &'static str,
    /// Select list used when dequeuing; must be scannable by the record type.
    pub column_expressions: &'static [&'static str],
    /// Dequeue order. Errored jobs go last, most recently updated first.
    pub order_by_expression: &'static str,
    /// A processing job without a heartbeat for this long is reset.
    pub stalled_max_age: Duration,
    /// Resets after which a stalled job is failed for good.
    pub max_num_resets: i64,
    /// Delay before an errored job becomes eligible again.
    pub retry_after: Duration,
    pub max_num_retries: i64,
}

pub const RESOLUTION_JOB_COLUMNS: &[&str] = &[
    "batch_spec_resolution_jobs.id",
    "batch_spec_resolution_jobs.batch_spec_id",
    "batch_spec_resolution_jobs.initiator_id",
    "batch_spec_resolution_jobs.state",
    "batch_spec_resolution_jobs.failure_message",
    "batch_spec_resolution_jobs.started_at",
    "batch_spec_resolution_jobs.finished_at",
    "batch_spec_resolution_jobs.process_after",
    "batch_spec_resolution_jobs.num_resets",
    "batch_spec_resolution_jobs.num_failures",
    "batch_spec_resolution_jobs.execution_logs",
    "batch_spec_resolution_jobs.worker_hostname",
    "batch_spec_resolution_jobs.last_heartbeat_at",
    "batch_spec_resolution_jobs.queued_at",
    "batch_spec_resolution_jobs.created_at",
    "batch_spec_resolution_jobs.updated_at",
];

impl WorkerStoreOptions {
    /// Options for `batch_spec_resolution_jobs`. Resolution failures need a
    /// corrected batch spec, so failed jobs are never retried.
    pub fn batch_spec_resolution() -> Self {
        Self {
            name: "batch_spec_resolution_worker_store",
            table_name: "batch_spec_resolution_jobs",
            column_expressions: RESOLUTION_JOB_COLUMNS,
            order_by_expression: "batch_spec_resolution_jobs.state = 'errored', batch_spec_resolution_jobs.updated_at DESC",
            stalled_max_age: Duration::from_secs(60),
            max_num_resets: 60,
            retry_after: Duration::from_secs(5),
            max_num_retries: 0,
        }
    }
}

/// What the engine may do with a job in its current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Waiting to be dequeued.
    Pending,
    /// Held by a worker whose heartbeat is recent.
    Leased,
    /// Held by a worker that stopped heartbeating; eligible for reset.
    Stalled,
    /// Errored and still within the retry budget.
    Retryable,
    /// Will never be picked up again.
    Terminal,
}

/// A row of a queue-backed table.
pub trait QueueRecord: Sized {
    fn from_row(row: &SqliteRow) -> Result<Self>;

    fn record_id(&self) -> i64;
    fn job_state(&self) -> JobState;
    fn num_resets(&self) -> i64;
    fn num_failures(&self) -> i64;
    fn last_heartbeat_at(&self) -> Option<DateTime<Utc>>;

    fn disposition(&self, opts: &WorkerStoreOptions, now: DateTime<Utc>) -> Disposition {
        match self.job_state() {
            JobState::Queued => Disposition::Pending,
            JobState::Processing => {
                let stalled_for = self
                    .last_heartbeat_at()
                    .and_then(|hb| (now - hb).to_std().ok())
                    .unwrap_or(Duration::MAX);
                if stalled_for < opts.stalled_max_age {
                    Disposition::Leased
                } else if self.num_resets() >= opts.max_num_resets {
                    Disposition::Terminal
                } else {
                    Disposition::Stalled
                }
            }
            JobState::Errored if self.num_failures() <= opts.max_num_retries => {
                Disposition::Retryable
            }
            JobState::Errored => Disposition::Terminal,
            JobState::Failed | JobState::Completed | JobState::Canceled => Disposition::Terminal,
        }
    }
}
