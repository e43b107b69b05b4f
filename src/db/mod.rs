//! SQLite persistence for batch changes and their changesets.
//!
//! The submodules each add `impl Store` blocks for one table family:
//! - `batch_changes`: the aggregate root (CRUD, upsert, list/count, diff stats).
//! - `batch_specs`, `changeset_specs`, `changesets`: the rows it references.
//! - `rewirer`: loading candidates and hydrating rewirer mappings.
//! - `resolution_jobs`: the queue-backed resolution job table.
//! - `namespaces`: thin adapters over the identity and repository tables.

use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use mockable::{Clock, DefaultClock};
use sqlx::SqlitePool;

use crate::authz::{Actor, AllowAll, AuthzProvider, RepoAccess};
use crate::config::StoreSettings;
use crate::error::{Result, StoreError};

pub mod batch_changes;
pub mod batch_specs;
pub mod changeset_specs;
pub mod changesets;
pub mod namespaces;
pub mod resolution_jobs;
pub mod rewirer;

pub use batch_changes::{DiffStat, GetBatchChangeOpts, ListBatchChangesOpts};
pub use changeset_specs::{DeleteChangesetSpecsOpts, GetChangesetSpecOpts, ListChangesetSpecsOpts};
pub use changesets::{GetChangesetOpts, ListChangesetsOpts};
pub use resolution_jobs::{GetResolutionJobOpts, ListResolutionJobsOpts};
pub use rewirer::{GetRewirerMappingsOpts, HydratedMapping};

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
pub fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() || path_part == ":memory:" {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Handle to the batch change tables.
///
/// Holds no state besides its collaborators: every call is one or a few
/// round trips to the pool.
#[derive(Clone)]
pub struct Store {
    pool: Pool,
    clock: Arc<dyn Clock + Send + Sync>,
    authz: Arc<dyn AuthzProvider>,
    settings: StoreSettings,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// A store using the system clock and no repository restrictions.
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            clock: Arc::new(DefaultClock),
            authz: Arc::new(AllowAll),
            settings: StoreSettings::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_authz(mut self, authz: Arc<dyn AuthzProvider>) -> Self {
        self.authz = authz;
        self
    }

    pub fn with_settings(mut self, settings: StoreSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    /// Current time at the precision the database round-trips.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.utc().trunc_subsecs(6)
    }

    pub(crate) async fn repo_access(&self, actor: &Actor) -> Result<RepoAccess> {
        if *actor == Actor::Internal {
            return Ok(RepoAccess::Unrestricted);
        }
        self.authz
            .repo_access(actor)
            .await
            .map_err(StoreError::Authz)
    }
}

/// Split a page fetched with one extra row into the page and the cursor of
/// the next one.
pub(crate) fn split_page<T>(
    mut rows: Vec<T>,
    limit: Option<usize>,
    id: impl Fn(&T) -> i64,
) -> (Vec<T>, Option<i64>) {
    match limit {
        Some(limit) if rows.len() > limit => {
            let next = rows.get(limit).map(&id);
            rows.truncate(limit);
            (rows, next)
        }
        _ => (rows, None),
    }
}
