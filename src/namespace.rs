//! Namespace ownership and soft-delete visibility.
//!
//! A batch change belongs to exactly one user or one org. Hard-deleting the
//! owner removes the batch change through a foreign key, but soft deletes do
//! not cascade, so every read path joins both namespace tables and re-checks
//! their `deleted_at` columns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::predicate::Predicate;

/// The owner of a batch change or batch spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Namespace {
    User(i64),
    Org(i64),
}

impl Namespace {
    pub fn user_id(&self) -> Option<i64> {
        match self {
            Namespace::User(id) => Some(*id),
            Namespace::Org(_) => None,
        }
    }

    pub fn org_id(&self) -> Option<i64> {
        match self {
            Namespace::Org(id) => Some(*id),
            Namespace::User(_) => None,
        }
    }

    /// Rebuild a namespace from the two nullable storage columns. Rows that
    /// carry both or neither are rejected; the schema forbids them.
    pub fn from_columns(user_id: Option<i64>, org_id: Option<i64>) -> Result<Self> {
        match (user_id, org_id) {
            (Some(id), None) if id != 0 => Ok(Namespace::User(id)),
            (None, Some(id)) if id != 0 => Ok(Namespace::Org(id)),
            _ => Err(StoreError::Database(sqlx::Error::Decode(
                format!("namespace columns user={user_id:?} org={org_id:?} must set exactly one")
                    .into(),
            ))),
        }
    }
}

/// Why a batch change is hidden.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvisibleReason {
    UserDeleted,
    OrgDeleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceVisibility {
    Visible,
    Invisible(InvisibleReason),
}

impl NamespaceVisibility {
    /// Single-record lookups surface invisibility as `DeletedNamespace`.
    pub fn into_result(self) -> Result<()> {
        match self {
            NamespaceVisibility::Visible => Ok(()),
            NamespaceVisibility::Invisible(_) => Err(StoreError::DeletedNamespace),
        }
    }
}

/// Soft-delete timestamps of both possible namespace owners, as selected by
/// [`NAMESPACE_JOINS`]. Only one slot is ever populated per record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NamespaceDeletion {
    pub user_deleted_at: Option<DateTime<Utc>>,
    pub org_deleted_at: Option<DateTime<Utc>>,
}

impl NamespaceDeletion {
    pub fn resolve(&self) -> NamespaceVisibility {
        if self.user_deleted_at.is_some() {
            NamespaceVisibility::Invisible(InvisibleReason::UserDeleted)
        } else if self.org_deleted_at.is_some() {
            NamespaceVisibility::Invisible(InvisibleReason::OrgDeleted)
        } else {
            NamespaceVisibility::Visible
        }
    }
}

/// Joins exposing `namespace_user.deleted_at` and `namespace_org.deleted_at`
/// for a query over `batch_changes`.
pub const NAMESPACE_JOINS: &str = "LEFT JOIN users namespace_user ON namespace_user.id = batch_changes.namespace_user_id \
     LEFT JOIN orgs namespace_org ON namespace_org.id = batch_changes.namespace_org_id";

/// Select list fragment for the two deletion timestamps.
pub const NAMESPACE_DELETED_COLUMNS: &str =
    "namespace_user.deleted_at AS namespace_user_deleted_at, namespace_org.deleted_at AS namespace_org_deleted_at";

/// Predicate that silently drops batch changes in soft-deleted namespaces.
pub fn visible_namespace_predicate() -> Predicate {
    Predicate::and([
        Predicate::raw("namespace_user.deleted_at IS NULL"),
        Predicate::raw("namespace_org.deleted_at IS NULL"),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_columns_requires_exactly_one() {
        assert_eq!(Namespace::from_columns(Some(3), None).unwrap(), Namespace::User(3));
        assert_eq!(Namespace::from_columns(None, Some(4)).unwrap(), Namespace::Org(4));
        assert!(Namespace::from_columns(Some(3), Some(4)).is_err());
        assert!(Namespace::from_columns(None, None).is_err());
        assert!(Namespace::from_columns(Some(0), None).is_err());
    }

    #[test]
    fn either_deleted_slot_hides() {
        let now = Utc::now();
        assert_eq!(NamespaceDeletion::default().resolve(), NamespaceVisibility::Visible);

        let user = NamespaceDeletion {
            user_deleted_at: Some(now),
            org_deleted_at: None,
        };
        assert_eq!(
            user.resolve(),
            NamespaceVisibility::Invisible(InvisibleReason::UserDeleted)
        );
        assert!(matches!(
            user.resolve().into_result(),
            Err(StoreError::DeletedNamespace)
        ));

        let org = NamespaceDeletion {
            user_deleted_at: None,
            org_deleted_at: Some(now),
        };
        assert_eq!(
            org.resolve(),
            NamespaceVisibility::Invisible(InvisibleReason::OrgDeleted)
        );
    }
}
