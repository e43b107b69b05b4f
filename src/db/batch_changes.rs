use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::{debug, info, instrument};

use super::{split_page, Store};
use crate::authz::Actor;
use crate::error::{Result, StoreError, WriteContext};
use crate::model::BatchChange;
use crate::namespace::{
    visible_namespace_predicate, Namespace, NamespaceDeletion, NAMESPACE_DELETED_COLUMNS,
    NAMESPACE_JOINS,
};
use crate::predicate::{Bind, Predicate};
use crate::state::{batch_change_states_predicate, BatchChangeState};

const BATCH_CHANGE_COLUMNS: &str = "batch_changes.id, batch_changes.name, batch_changes.description, \
     batch_changes.creator_id, batch_changes.last_applier_id, batch_changes.last_applied_at, \
     batch_changes.namespace_user_id, batch_changes.namespace_org_id, batch_changes.created_at, \
     batch_changes.updated_at, batch_changes.closed_at, batch_changes.batch_spec_id";

/// Lookup keys for a single batch change. Every key set is ANDed; when
/// several rows match, the highest id wins.
#[derive(Debug, Clone, Default)]
pub struct GetBatchChangeOpts {
    pub id: Option<i64>,
    pub batch_spec_id: Option<i64>,
    pub namespace: Option<Namespace>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ListBatchChangesOpts {
    /// Only batch changes this changeset is attached to.
    pub changeset_id: Option<i64>,
    /// Only batch changes with a visible changeset in this repository.
    pub repo_id: Option<i64>,
    /// OR of states; empty means any.
    pub states: Vec<BatchChangeState>,
    pub namespace: Option<Namespace>,
    /// Owned by the user directly or by an org the user is a member of.
    /// Org roles are not checked: any member counts as an administrator.
    pub only_administered_by_user_id: Option<i64>,
    /// Hide drafts unless the user owns the namespace or wrote the batch spec.
    pub exclude_drafts_not_owned_by_user_id: Option<i64>,
    pub limit: Option<usize>,
    /// Id to resume from, as returned by a previous page.
    pub cursor: Option<i64>,
}

/// Added and deleted line counts summed over changesets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStat {
    pub added: i64,
    pub deleted: i64,
}

fn scan_batch_change(row: &SqliteRow) -> Result<BatchChange> {
    Ok(BatchChange {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        creator_id: row.try_get("creator_id")?,
        last_applier_id: row.try_get("last_applier_id")?,
        last_applied_at: row.try_get("last_applied_at")?,
        namespace: Namespace::from_columns(
            row.try_get("namespace_user_id")?,
            row.try_get("namespace_org_id")?,
        )?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        closed_at: row.try_get("closed_at")?,
        batch_spec_id: row.try_get("batch_spec_id")?,
    })
}

fn scan_namespace_deletion(row: &SqliteRow) -> Result<NamespaceDeletion> {
    Ok(NamespaceDeletion {
        user_deleted_at: row.try_get("namespace_user_deleted_at")?,
        org_deleted_at: row.try_get("namespace_org_deleted_at")?,
    })
}

/// `batch_changes.id` is in `changesets.batch_change_ids` of some changeset
/// matched by `changeset_filter` (a predicate over `changesets`).
fn attached_changeset_exists(changeset_filter: &Predicate, extra_join: &str) -> Predicate {
    let (sql, binds) = changeset_filter.render();
    Predicate::sql(
        format!(
            "EXISTS (SELECT 1 FROM changesets {extra_join} \
             JOIN json_each(changesets.batch_change_ids) assoc \
             WHERE assoc.key = CAST(batch_changes.id AS TEXT) AND {sql})"
        ),
        binds,
    )
}

fn namespace_predicate(namespace: Namespace) -> Predicate {
    match namespace {
        Namespace::User(id) => Predicate::sql("batch_changes.namespace_user_id = ?", vec![Bind::Int(id)]),
        Namespace::Org(id) => Predicate::sql("batch_changes.namespace_org_id = ?", vec![Bind::Int(id)]),
    }
}

impl Store {
    #[instrument(skip_all, fields(name = %batch_change.name))]
    pub async fn create_batch_change(&self, batch_change: &mut BatchChange) -> Result<()> {
        let now = self.now();
        if batch_change.created_at == DateTime::<Utc>::default() {
            batch_change.created_at = now;
        }
        batch_change.updated_at = batch_change.created_at;

        let row = sqlx::query(
            "INSERT INTO batch_changes (name, description, creator_id, last_applier_id, last_applied_at, \
             namespace_user_id, namespace_org_id, created_at, updated_at, closed_at, batch_spec_id) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(&batch_change.name)
        .bind(&batch_change.description)
        .bind(batch_change.creator_id)
        .bind(batch_change.last_applier_id)
        .bind(batch_change.last_applied_at)
        .bind(batch_change.namespace.user_id())
        .bind(batch_change.namespace.org_id())
        .bind(batch_change.created_at)
        .bind(batch_change.updated_at)
        .bind(batch_change.closed_at)
        .bind(batch_change.batch_spec_id)
        .fetch_one(self.pool())
        .await
        .map_err(|e| StoreError::from_write(e, WriteContext::default()))?;
        batch_change.id = row.try_get("id")?;
        info!(id = batch_change.id, "created batch change");
        Ok(())
    }

    /// Overwrite every mutable column from `batch_change`. Last writer wins.
    #[instrument(skip_all, fields(id = batch_change.id))]
    pub async fn update_batch_change(&self, batch_change: &mut BatchChange) -> Result<()> {
        batch_change.updated_at = self.now();
        let res = sqlx::query(
            "UPDATE batch_changes SET name = ?, description = ?, creator_id = ?, last_applier_id = ?, \
             last_applied_at = ?, namespace_user_id = ?, namespace_org_id = ?, updated_at = ?, \
             closed_at = ?, batch_spec_id = ? WHERE id = ?",
        )
        .bind(&batch_change.name)
        .bind(&batch_change.description)
        .bind(batch_change.creator_id)
        .bind(batch_change.last_applier_id)
        .bind(batch_change.last_applied_at)
        .bind(batch_change.namespace.user_id())
        .bind(batch_change.namespace.org_id())
        .bind(batch_change.updated_at)
        .bind(batch_change.closed_at)
        .bind(batch_change.batch_spec_id)
        .bind(batch_change.id)
        .execute(self.pool())
        .await
        .map_err(|e| StoreError::from_write(e, WriteContext::default()))?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        info!("updated batch change");
        Ok(())
    }

    /// Insert, or update in place when a batch change with the same name
    /// already exists in the same namespace. The row keeps its id and
    /// creation time.
    #[instrument(skip_all, fields(name = %batch_change.name))]
    pub async fn upsert_batch_change(&self, batch_change: &mut BatchChange) -> Result<()> {
        let now = self.now();
        if batch_change.created_at == DateTime::<Utc>::default() {
            batch_change.created_at = now;
        }
        batch_change.updated_at = now;

        // The conflict target must repeat the partial index predicate or
        // SQLite will not pick the index up.
        let conflict_target = match batch_change.namespace {
            Namespace::User(_) => "(name, namespace_user_id) WHERE namespace_user_id IS NOT NULL",
            Namespace::Org(_) => "(name, namespace_org_id) WHERE namespace_org_id IS NOT NULL",
        };
        let sql = format!(
            "INSERT INTO batch_changes (name, description, creator_id, last_applier_id, last_applied_at, \
             namespace_user_id, namespace_org_id, created_at, updated_at, closed_at, batch_spec_id) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT {conflict_target} DO UPDATE SET \
             description = excluded.description, creator_id = excluded.creator_id, \
             last_applier_id = excluded.last_applier_id, last_applied_at = excluded.last_applied_at, \
             updated_at = excluded.updated_at, closed_at = excluded.closed_at, \
             batch_spec_id = excluded.batch_spec_id \
             RETURNING id, created_at"
        );
        let row = sqlx::query(&sql)
            .bind(&batch_change.name)
            .bind(&batch_change.description)
            .bind(batch_change.creator_id)
            .bind(batch_change.last_applier_id)
            .bind(batch_change.last_applied_at)
            .bind(batch_change.namespace.user_id())
            .bind(batch_change.namespace.org_id())
            .bind(batch_change.created_at)
            .bind(batch_change.updated_at)
            .bind(batch_change.closed_at)
            .bind(batch_change.batch_spec_id)
            .fetch_one(self.pool())
            .await
            .map_err(|e| StoreError::from_write(e, WriteContext::default()))?;
        batch_change.id = row.try_get("id")?;
        batch_change.created_at = row.try_get("created_at")?;
        info!(id = batch_change.id, "upserted batch change");
        Ok(())
    }

    #[instrument(skip_all, fields(id = id))]
    pub async fn delete_batch_change(&self, id: i64) -> Result<()> {
        let res = sqlx::query("DELETE FROM batch_changes WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        info!(id, "deleted batch change");
        Ok(())
    }

    /// Fetch one batch change. A match whose namespace is soft-deleted is
    /// reported as [`StoreError::DeletedNamespace`]; no match at all (which
    /// includes a hard-deleted namespace) as [`StoreError::NotFound`].
    #[instrument(skip_all)]
    pub async fn get_batch_change(&self, opts: &GetBatchChangeOpts) -> Result<BatchChange> {
        let mut preds = Vec::new();
        if let Some(id) = opts.id {
            preds.push(Predicate::sql("batch_changes.id = ?", vec![Bind::Int(id)]));
        }
        if let Some(batch_spec_id) = opts.batch_spec_id {
            preds.push(Predicate::sql(
                "batch_changes.batch_spec_id = ?",
                vec![Bind::Int(batch_spec_id)],
            ));
        }
        if let Some(namespace) = opts.namespace {
            preds.push(namespace_predicate(namespace));
        }
        if let Some(name) = &opts.name {
            preds.push(Predicate::sql("batch_changes.name = ?", vec![Bind::from(name.as_str())]));
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {BATCH_CHANGE_COLUMNS}, {NAMESPACE_DELETED_COLUMNS} FROM batch_changes {NAMESPACE_JOINS}"
        ));
        Predicate::and(preds).push_where(&mut qb);
        qb.push(" ORDER BY batch_changes.id DESC LIMIT 1");

        let row = qb
            .build()
            .fetch_optional(self.pool())
            .await?
            .ok_or(StoreError::NotFound)?;
        scan_namespace_deletion(&row)?.resolve().into_result()?;
        scan_batch_change(&row)
    }

    fn list_predicate(&self, opts: &ListBatchChangesOpts, repo_access: Predicate) -> Predicate {
        let mut preds = vec![visible_namespace_predicate()];

        if let Some(changeset_id) = opts.changeset_id {
            preds.push(attached_changeset_exists(
                &Predicate::sql("changesets.id = ?", vec![Bind::Int(changeset_id)]),
                "",
            ));
        }
        if let Some(repo_id) = opts.repo_id {
            let in_repo = Predicate::and([
                Predicate::sql("changesets.repo_id = ?", vec![Bind::Int(repo_id)]),
                Predicate::raw("repo.deleted_at IS NULL"),
                repo_access,
            ]);
            preds.push(attached_changeset_exists(
                &in_repo,
                "JOIN repo ON repo.id = changesets.repo_id",
            ));
        }
        preds.push(batch_change_states_predicate(&opts.states));
        if let Some(namespace) = opts.namespace {
            preds.push(namespace_predicate(namespace));
        }
        if let Some(user_id) = opts.only_administered_by_user_id {
            // Membership is enough; org roles are not consulted.
            preds.push(Predicate::sql(
                "batch_changes.namespace_user_id = ? OR batch_changes.namespace_org_id IN \
                 (SELECT org_members.org_id FROM org_members WHERE org_members.user_id = ?)",
                vec![Bind::Int(user_id), Bind::Int(user_id)],
            ));
        }
        if let Some(user_id) = opts.exclude_drafts_not_owned_by_user_id {
            preds.push(Predicate::sql(
                "batch_changes.last_applied_at IS NOT NULL OR batch_changes.namespace_user_id = ? \
                 OR EXISTS (SELECT 1 FROM batch_specs WHERE batch_specs.id = batch_changes.batch_spec_id \
                 AND batch_specs.user_id = ?)",
                vec![Bind::Int(user_id), Bind::Int(user_id)],
            ));
        }
        Predicate::and(preds)
    }

    /// List batch changes newest first. Returns the page and the cursor for
    /// the next one.
    #[instrument(skip_all)]
    pub async fn list_batch_changes(
        &self,
        actor: &Actor,
        opts: &ListBatchChangesOpts,
    ) -> Result<(Vec<BatchChange>, Option<i64>)> {
        let access = self.repo_access(actor).await?.predicate("repo.id");
        let mut pred = self.list_predicate(opts, access);
        if let Some(cursor) = opts.cursor {
            pred = Predicate::and([
                pred,
                Predicate::sql("batch_changes.id <= ?", vec![Bind::Int(cursor)]),
            ]);
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {BATCH_CHANGE_COLUMNS} FROM batch_changes {NAMESPACE_JOINS}"
        ));
        pred.push_where(&mut qb);
        qb.push(" ORDER BY batch_changes.id DESC");
        if let Some(limit) = opts.limit {
            qb.push(" LIMIT ");
            qb.push_bind((limit + 1) as i64);
        }

        let mut rows = qb.build().fetch(self.pool());
        let mut items = Vec::new();
        while let Some(row) = rows.try_next().await? {
            items.push(scan_batch_change(&row)?);
        }
        let (items, next) = split_page(items, opts.limit, |bc| bc.id);
        debug!(count = items.len(), ?next, "listed batch changes");
        Ok((items, next))
    }

    /// Count with the same filters as [`Store::list_batch_changes`]; paging
    /// fields are ignored.
    #[instrument(skip_all)]
    pub async fn count_batch_changes(
        &self,
        actor: &Actor,
        opts: &ListBatchChangesOpts,
    ) -> Result<i64> {
        let access = self.repo_access(actor).await?.predicate("repo.id");
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT COUNT(*) FROM batch_changes {NAMESPACE_JOINS}"));
        self.list_predicate(opts, access).push_where(&mut qb);
        let count: i64 = qb.build_query_scalar().fetch_one(self.pool()).await?;
        Ok(count)
    }

    /// Diff stat over the batch change's changesets in repositories the
    /// actor may see.
    #[instrument(skip_all, fields(batch_change_id = batch_change_id))]
    pub async fn get_batch_change_diff_stat(
        &self,
        actor: &Actor,
        batch_change_id: i64,
    ) -> Result<DiffStat> {
        let access = self.repo_access(actor).await?.predicate("repo.id");
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT COALESCE(SUM(changesets.diff_stat_added), 0) AS added, \
             COALESCE(SUM(changesets.diff_stat_deleted), 0) AS deleted \
             FROM changesets JOIN repo ON repo.id = changesets.repo_id",
        );
        Predicate::and([
            Predicate::raw("repo.deleted_at IS NULL"),
            Predicate::sql(
                "EXISTS (SELECT 1 FROM json_each(changesets.batch_change_ids) assoc WHERE assoc.key = ?)",
                vec![Bind::from(batch_change_id.to_string())],
            ),
            access,
        ])
        .push_where(&mut qb);
        let row = qb.build().fetch_one(self.pool()).await?;
        Ok(DiffStat {
            added: row.try_get("added")?,
            deleted: row.try_get("deleted")?,
        })
    }

    /// Diff stat over all batch-change changesets in one repository, or
    /// `None` when the actor may not see the repository.
    #[instrument(skip_all, fields(repo_id = repo_id))]
    pub async fn get_repo_diff_stat(&self, actor: &Actor, repo_id: i64) -> Result<Option<DiffStat>> {
        let access = self.repo_access(actor).await?;
        if !access.allows(repo_id) {
            return Ok(None);
        }
        let row = sqlx::query(
            "SELECT COALESCE(SUM(changesets.diff_stat_added), 0) AS added, \
             COALESCE(SUM(changesets.diff_stat_deleted), 0) AS deleted \
             FROM changesets JOIN repo ON repo.id = changesets.repo_id \
             WHERE changesets.repo_id = ? AND repo.deleted_at IS NULL \
             AND changesets.batch_change_ids <> '{}'",
        )
        .bind(repo_id)
        .fetch_one(self.pool())
        .await?;
        Ok(Some(DiffStat {
            added: row.try_get("added")?,
            deleted: row.try_get("deleted")?,
        }))
    }
}
