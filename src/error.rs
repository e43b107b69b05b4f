//! Typed errors returned by the batch change store.
//!
//! Storage-level constraint violations never leave the store raw: every write
//! path runs its error through [`StoreError::from_write`], which maps the
//! constraints we know about onto dedicated variants.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tracing::warn;

/// Name of the CHECK constraint enforcing the batch change naming policy.
pub const BATCH_CHANGE_NAME_CONSTRAINT: &str = "batch_change_name_is_valid";

/// Column covered by the one-job-per-batch-spec unique constraint.
pub const RESOLUTION_JOB_BATCH_SPEC_CONSTRAINT: &str = "batch_spec_resolution_jobs.batch_spec_id";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("batch change namespace has been deleted")]
    DeletedNamespace,
    #[error("batch change name violates naming policy")]
    InvalidName,
    #[error("a resolution job for batch spec {batch_spec_id} already exists")]
    DuplicateResolutionJob { batch_spec_id: i64 },
    #[error("invalid published value: {0}")]
    InvalidPublishedValue(String),
    #[error("invalid options: {0}")]
    InvalidOptions(&'static str),
    #[error("authorization provider failed: {0}")]
    Authz(#[source] anyhow::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// Kind of constraint SQLite reports as violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    Check,
    Unique,
    ForeignKey,
    NotNull,
}

/// A constraint violation extracted from a database error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstraintViolation {
    pub kind: ConstraintKind,
    /// Constraint name for CHECK, `table.column[, table.column]` for UNIQUE and
    /// NOT NULL, empty for foreign keys (SQLite does not name them).
    pub target: String,
}

static CONSTRAINT_MESSAGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(CHECK|UNIQUE|FOREIGN KEY|NOT NULL) constraint failed(?::\s*(.*))?$")
        .expect("constraint regex")
});

/// Inspect a database error and return the constraint it violated, if any.
///
/// SQLite only exposes the constraint identifier in the message text; the
/// driver-provided name is a fallback for messages without one.
pub fn constraint_violation(err: &sqlx::Error) -> Option<ConstraintViolation> {
    let db_err = err.as_database_error()?;
    let message = db_err.message().trim();
    let caps = CONSTRAINT_MESSAGE.captures(message)?;
    let kind = match caps.get(1)?.as_str().to_ascii_uppercase().as_str() {
        "CHECK" => ConstraintKind::Check,
        "UNIQUE" => ConstraintKind::Unique,
        "FOREIGN KEY" => ConstraintKind::ForeignKey,
        _ => ConstraintKind::NotNull,
    };
    let target = caps
        .get(2)
        .map(|m| m.as_str().trim().to_string())
        .or_else(|| db_err.constraint().map(str::to_string))
        .unwrap_or_default();
    Some(ConstraintViolation { kind, target })
}

/// Context a write path supplies so constraint violations can be attributed.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteContext {
    /// Batch spec id of a resolution job being inserted.
    pub resolution_job_batch_spec_id: Option<i64>,
}

impl StoreError {
    /// Translate a write error, mapping known constraint violations to typed
    /// variants and leaving everything else opaque.
    pub fn from_write(err: sqlx::Error, ctx: WriteContext) -> Self {
        let Some(violation) = constraint_violation(&err) else {
            return StoreError::Database(err);
        };
        match violation.kind {
            ConstraintKind::Check if violation.target == BATCH_CHANGE_NAME_CONSTRAINT => {
                warn!(constraint = %violation.target, "rejected batch change name");
                StoreError::InvalidName
            }
            ConstraintKind::Unique
                if violation
                    .target
                    .split(',')
                    .any(|t| t.trim() == RESOLUTION_JOB_BATCH_SPEC_CONSTRAINT) =>
            {
                let batch_spec_id = ctx.resolution_job_batch_spec_id.unwrap_or_default();
                warn!(batch_spec_id, "duplicate batch spec resolution job");
                StoreError::DuplicateResolutionJob { batch_spec_id }
            }
            _ => StoreError::Database(err),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound)
    }
}

/// Map `RowNotFound` to [`StoreError::NotFound`]; everything else stays opaque.
pub(crate) fn not_found_or(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::RowNotFound => StoreError::NotFound,
        other => StoreError::Database(other),
    }
}
