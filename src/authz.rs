//! Repository authorization seam.
//!
//! The store never decides who may see a repository. It asks an
//! [`AuthzProvider`] for the caller's [`RepoAccess`] and intersects every
//! query that joins `repo` with the resulting predicate.

use std::collections::BTreeSet;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::predicate::{in_list, Predicate};

/// The caller a store operation runs on behalf of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Actor {
    /// Background work and maintenance tasks; bypasses repository checks.
    #[default]
    Internal,
    User(i64),
    Anonymous,
}

impl Actor {
    pub fn user_id(&self) -> Option<i64> {
        match self {
            Actor::User(id) => Some(*id),
            _ => None,
        }
    }
}

/// Repositories an actor may see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepoAccess {
    Unrestricted,
    Restricted(BTreeSet<i64>),
}

impl RepoAccess {
    pub fn allows(&self, repo_id: i64) -> bool {
        match self {
            RepoAccess::Unrestricted => true,
            RepoAccess::Restricted(ids) => ids.contains(&repo_id),
        }
    }

    /// Predicate over `column`, typically `repo.id`.
    pub fn predicate(&self, column: &str) -> Predicate {
        match self {
            RepoAccess::Unrestricted => Predicate::Always,
            RepoAccess::Restricted(ids) => {
                let ids: Vec<i64> = ids.iter().copied().collect();
                in_list(column, &ids)
            }
        }
    }
}

#[async_trait]
pub trait AuthzProvider: Send + Sync {
    async fn repo_access(&self, actor: &Actor) -> Result<RepoAccess>;
}

/// Grants every actor every repository.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl AuthzProvider for AllowAll {
    async fn repo_access(&self, _actor: &Actor) -> Result<RepoAccess> {
        Ok(RepoAccess::Unrestricted)
    }
}
