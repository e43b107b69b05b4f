//! Derived states: the coarse changeset state used for filtering and the
//! lifecycle state of a batch change. Neither is stored authoritatively; both
//! are pure functions of other fields.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::changeset::{ExternalState, PublicationState, ReconcilerState};
use crate::predicate::Predicate;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangesetState {
    Retrying,
    Failed,
    Scheduled,
    Processing,
    Unpublished,
    Draft,
    Open,
    Closed,
    Merged,
    Deleted,
    #[serde(rename = "READONLY")]
    ReadOnly,
}

impl ChangesetState {
    pub const ALL: [ChangesetState; 11] = [
        ChangesetState::Retrying,
        ChangesetState::Failed,
        ChangesetState::Scheduled,
        ChangesetState::Processing,
        ChangesetState::Unpublished,
        ChangesetState::Draft,
        ChangesetState::Open,
        ChangesetState::Closed,
        ChangesetState::Merged,
        ChangesetState::Deleted,
        ChangesetState::ReadOnly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangesetState::Retrying => "RETRYING",
            ChangesetState::Failed => "FAILED",
            ChangesetState::Scheduled => "SCHEDULED",
            ChangesetState::Processing => "PROCESSING",
            ChangesetState::Unpublished => "UNPUBLISHED",
            ChangesetState::Draft => "DRAFT",
            ChangesetState::Open => "OPEN",
            ChangesetState::Closed => "CLOSED",
            ChangesetState::Merged => "MERGED",
            ChangesetState::Deleted => "DELETED",
            ChangesetState::ReadOnly => "READONLY",
        }
    }

    pub fn parse_state(s: &str) -> Option<Self> {
        let upper = s.to_ascii_uppercase();
        Self::ALL.into_iter().find(|st| st.as_str() == upper)
    }
}

impl From<ExternalState> for ChangesetState {
    fn from(s: ExternalState) -> Self {
        match s {
            ExternalState::Draft => ChangesetState::Draft,
            ExternalState::Open => ChangesetState::Open,
            ExternalState::Closed => ChangesetState::Closed,
            ExternalState::Merged => ChangesetState::Merged,
            ExternalState::Deleted => ChangesetState::Deleted,
            ExternalState::ReadOnly => ChangesetState::ReadOnly,
        }
    }
}

/// Classify a changeset into its coarse state.
///
/// Reconciler-level states win over the cached external state, which may be
/// stale or missing while the reconciler is still working on the changeset.
pub fn classify_changeset(
    reconciler: ReconcilerState,
    publication: PublicationState,
    external: Option<ExternalState>,
) -> ChangesetState {
    match reconciler {
        ReconcilerState::Errored => return ChangesetState::Retrying,
        ReconcilerState::Failed => return ChangesetState::Failed,
        ReconcilerState::Scheduled => return ChangesetState::Scheduled,
        _ => {}
    }
    if publication == PublicationState::Unpublished {
        return if reconciler == ReconcilerState::Completed {
            ChangesetState::Unpublished
        } else {
            ChangesetState::Processing
        };
    }
    // Published but never synced: nothing on the code host to report yet.
    external.map_or(ChangesetState::Processing, ChangesetState::from)
}

/// Lifecycle state of a batch change, derived from two timestamps.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchChangeState {
    Draft,
    Open,
    Closed,
}

impl BatchChangeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchChangeState::Draft => "DRAFT",
            BatchChangeState::Open => "OPEN",
            BatchChangeState::Closed => "CLOSED",
        }
    }

    pub fn parse_state(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "DRAFT" => Some(BatchChangeState::Draft),
            "OPEN" => Some(BatchChangeState::Open),
            "CLOSED" => Some(BatchChangeState::Closed),
            _ => None,
        }
    }

    pub fn from_timestamps(
        closed_at: Option<DateTime<Utc>>,
        last_applied_at: Option<DateTime<Utc>>,
    ) -> Self {
        match (closed_at, last_applied_at) {
            (Some(_), _) => BatchChangeState::Closed,
            (None, Some(_)) => BatchChangeState::Open,
            (None, None) => BatchChangeState::Draft,
        }
    }

    /// SQL predicate over `batch_changes` selecting this state.
    pub fn predicate(&self) -> Predicate {
        match self {
            BatchChangeState::Draft => Predicate::raw(
                "batch_changes.last_applied_at IS NULL AND batch_changes.closed_at IS NULL",
            ),
            BatchChangeState::Open => Predicate::raw(
                "batch_changes.closed_at IS NULL AND batch_changes.last_applied_at IS NOT NULL",
            ),
            BatchChangeState::Closed => Predicate::raw("batch_changes.closed_at IS NOT NULL"),
        }
    }
}

/// OR of the requested states. Duplicates collapse and an empty request
/// means no filter at all.
pub fn batch_change_states_predicate(states: &[BatchChangeState]) -> Predicate {
    if states.is_empty() {
        return Predicate::Always;
    }
    let unique: BTreeSet<BatchChangeState> = states.iter().copied().collect();
    Predicate::or(unique.iter().map(BatchChangeState::predicate))
}
