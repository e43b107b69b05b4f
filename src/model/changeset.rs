use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::{classify_changeset, ChangesetState};

/// Internal processing state of the reconciler driving a changeset.
///
/// Stored lowercase so the job-queue engine can lease changesets directly.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReconcilerState {
    Scheduled,
    Queued,
    Processing,
    Errored,
    Failed,
    Completed,
}

impl ReconcilerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcilerState::Scheduled => "scheduled",
            ReconcilerState::Queued => "queued",
            ReconcilerState::Processing => "processing",
            ReconcilerState::Errored => "errored",
            ReconcilerState::Failed => "failed",
            ReconcilerState::Completed => "completed",
        }
    }

    pub fn parse_state(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "scheduled" => Some(ReconcilerState::Scheduled),
            "queued" => Some(ReconcilerState::Queued),
            "processing" => Some(ReconcilerState::Processing),
            "errored" => Some(ReconcilerState::Errored),
            "failed" => Some(ReconcilerState::Failed),
            "completed" => Some(ReconcilerState::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PublicationState {
    #[default]
    Unpublished,
    Published,
}

impl PublicationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PublicationState::Unpublished => "UNPUBLISHED",
            PublicationState::Published => "PUBLISHED",
        }
    }

    pub fn parse_state(s: &str) -> Option<Self> {
        match s {
            "UNPUBLISHED" => Some(PublicationState::Unpublished),
            "PUBLISHED" => Some(PublicationState::Published),
            _ => None,
        }
    }
}

/// State of the changeset as last synced from the code host.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExternalState {
    Draft,
    Open,
    Closed,
    Merged,
    Deleted,
    #[serde(rename = "READONLY")]
    ReadOnly,
}

impl ExternalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExternalState::Draft => "DRAFT",
            ExternalState::Open => "OPEN",
            ExternalState::Closed => "CLOSED",
            ExternalState::Merged => "MERGED",
            ExternalState::Deleted => "DELETED",
            ExternalState::ReadOnly => "READONLY",
        }
    }

    pub fn parse_state(s: &str) -> Option<Self> {
        match s {
            "DRAFT" => Some(ExternalState::Draft),
            "OPEN" => Some(ExternalState::Open),
            "CLOSED" => Some(ExternalState::Closed),
            "MERGED" => Some(ExternalState::Merged),
            "DELETED" => Some(ExternalState::Deleted),
            "READONLY" => Some(ExternalState::ReadOnly),
            _ => None,
        }
    }
}

/// Per-batch-change flags stored on a changeset's association set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct BatchChangeAssoc {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub detach: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub archive: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_archived: bool,
}

/// A pull/merge request tracked or created by one or more batch changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Changeset {
    pub id: i64,
    pub repo_id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Associated batch changes, keyed by batch change id.
    pub batch_changes: BTreeMap<i64, BatchChangeAssoc>,
    pub external_id: Option<String>,
    pub external_service_type: String,
    /// Always fully qualified (`refs/heads/...`) when set.
    pub external_branch: Option<String>,
    pub external_title: Option<String>,
    pub external_state: Option<ExternalState>,
    pub external_deleted_at: Option<DateTime<Utc>>,
    pub diff_stat_added: Option<i32>,
    pub diff_stat_deleted: Option<i32>,
    /// Set when a batch change created this changeset; absent for imports.
    pub owned_by_batch_change_id: Option<i64>,
    pub current_spec_id: Option<i64>,
    pub previous_spec_id: Option<i64>,
    pub publication_state: PublicationState,
    pub reconciler_state: ReconcilerState,
    pub failure_message: Option<String>,
    pub num_resets: i64,
    pub num_failures: i64,
    pub closing: bool,
    pub detached_at: Option<DateTime<Utc>>,
}

impl Changeset {
    pub fn new(repo_id: i64) -> Self {
        Self {
            id: 0,
            repo_id,
            created_at: DateTime::<Utc>::default(),
            updated_at: DateTime::<Utc>::default(),
            batch_changes: BTreeMap::new(),
            external_id: None,
            external_service_type: String::new(),
            external_branch: None,
            external_title: None,
            external_state: None,
            external_deleted_at: None,
            diff_stat_added: None,
            diff_stat_deleted: None,
            owned_by_batch_change_id: None,
            current_spec_id: None,
            previous_spec_id: None,
            publication_state: PublicationState::Unpublished,
            reconciler_state: ReconcilerState::Queued,
            failure_message: None,
            num_resets: 0,
            num_failures: 0,
            closing: false,
            detached_at: None,
        }
    }

    /// The coarse state used for filtering.
    pub fn state(&self) -> ChangesetState {
        classify_changeset(
            self.reconciler_state,
            self.publication_state,
            self.external_state,
        )
    }

    pub fn attached_to(&self, batch_change_id: i64) -> bool {
        self.batch_changes.contains_key(&batch_change_id)
    }

    pub fn archived_in(&self, batch_change_id: i64) -> bool {
        self.batch_changes
            .get(&batch_change_id)
            .is_some_and(|assoc| assoc.is_archived)
    }

    pub fn attach(&mut self, batch_change_id: i64) {
        self.batch_changes.entry(batch_change_id).or_default();
    }

    pub fn archive(&mut self, batch_change_id: i64) {
        self.batch_changes.entry(batch_change_id).or_default().is_archived = true;
    }

    pub fn detach(&mut self, batch_change_id: i64) {
        self.batch_changes.remove(&batch_change_id);
    }
}
