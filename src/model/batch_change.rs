use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::namespace::Namespace;
use crate::state::BatchChangeState;

/// A named, versioned unit of work applied across repositories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchChange {
    pub id: i64,
    pub name: String,
    pub description: String,
    /// Absent for batch changes created as unapplied drafts.
    pub creator_id: Option<i64>,
    pub last_applier_id: Option<i64>,
    pub last_applied_at: Option<DateTime<Utc>>,
    pub namespace: Namespace,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    /// The batch spec currently applied (or, for drafts, previewed).
    pub batch_spec_id: i64,
}

impl BatchChange {
    /// A draft batch change: no creator, never applied.
    pub fn draft(name: impl Into<String>, namespace: Namespace, batch_spec_id: i64) -> Self {
        Self {
            id: 0,
            name: name.into(),
            description: String::new(),
            creator_id: None,
            last_applier_id: None,
            last_applied_at: None,
            namespace,
            created_at: DateTime::<Utc>::default(),
            updated_at: DateTime::<Utc>::default(),
            closed_at: None,
            batch_spec_id,
        }
    }

    pub fn state(&self) -> BatchChangeState {
        BatchChangeState::from_timestamps(self.closed_at, self.last_applied_at)
    }

    pub fn closed(&self) -> bool {
        self.closed_at.is_some()
    }

    /// Record an application of `batch_spec_id` by `user_id` at `now`.
    pub fn apply(&mut self, batch_spec_id: i64, user_id: i64, now: DateTime<Utc>) {
        self.batch_spec_id = batch_spec_id;
        if self.creator_id.is_none() {
            self.creator_id = Some(user_id);
        }
        self.last_applier_id = Some(user_id);
        self.last_applied_at = Some(now);
    }
}
