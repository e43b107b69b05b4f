use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection};
use tracing::{debug, info, instrument};

use super::batch_specs::new_rand_id;
use super::{split_page, Store};
use crate::error::{not_found_or, Result, StoreError, WriteContext};
use crate::model::{ChangesetSpec, ChangesetSpecType, PublishedValue};
use crate::predicate::{in_list, Bind, Predicate};
use crate::rewirer::ref_prefix_sql;
use crate::search::fold_case;

pub(crate) const CHANGESET_SPEC_COLUMNS: &str = "changeset_specs.id, changeset_specs.rand_id, \
     changeset_specs.batch_spec_id, changeset_specs.repo_id, changeset_specs.user_id, \
     changeset_specs.diff_stat_added, changeset_specs.diff_stat_deleted, changeset_specs.created_at, \
     changeset_specs.updated_at, changeset_specs.fork_namespace, changeset_specs.type, \
     changeset_specs.external_id, changeset_specs.head_ref, changeset_specs.title, \
     changeset_specs.base_rev, changeset_specs.base_ref, changeset_specs.body, \
     changeset_specs.published, changeset_specs.diff, changeset_specs.commit_message, \
     changeset_specs.commit_author_name, changeset_specs.commit_author_email";

#[derive(Debug, Clone, Default)]
pub struct GetChangesetSpecOpts {
    pub id: Option<i64>,
    pub rand_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ListChangesetSpecsOpts {
    pub batch_spec_id: Option<i64>,
    pub rand_ids: Vec<String>,
    pub ids: Vec<i64>,
    pub repo_id: Option<i64>,
    pub spec_type: Option<ChangesetSpecType>,
    pub limit: Option<usize>,
    /// Smallest id of the page, as returned by a previous page.
    pub cursor: Option<i64>,
}

/// Selects specs to delete. At least one field must be set.
#[derive(Debug, Clone, Default)]
pub struct DeleteChangesetSpecsOpts {
    pub batch_spec_id: Option<i64>,
    pub ids: Vec<i64>,
}

pub(crate) fn scan_changeset_spec(row: &SqliteRow) -> Result<ChangesetSpec> {
    let spec_type: String = row.try_get("type")?;
    let spec_type = ChangesetSpecType::parse_type(&spec_type).ok_or_else(|| {
        StoreError::Database(sqlx::Error::Decode(
            format!("unknown changeset spec type {spec_type:?}").into(),
        ))
    })?;
    let published: Option<String> = row.try_get("published")?;
    let diff: Option<Vec<u8>> = row.try_get("diff")?;
    Ok(ChangesetSpec {
        id: row.try_get("id")?,
        rand_id: row.try_get("rand_id")?,
        batch_spec_id: row.try_get("batch_spec_id")?,
        repo_id: row.try_get("repo_id")?,
        user_id: row.try_get("user_id")?,
        diff_stat_added: row.try_get("diff_stat_added")?,
        diff_stat_deleted: row.try_get("diff_stat_deleted")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        fork_namespace: row.try_get("fork_namespace")?,
        spec_type,
        external_id: row.try_get("external_id")?,
        head_ref: row.try_get("head_ref")?,
        title: row.try_get("title")?,
        base_rev: row.try_get("base_rev")?,
        base_ref: row.try_get("base_ref")?,
        body: row.try_get("body")?,
        published: PublishedValue::from_db(published.as_deref())?,
        diff: diff.unwrap_or_default(),
        commit_message: row.try_get("commit_message")?,
        commit_author_name: row.try_get("commit_author_name")?,
        commit_author_email: row.try_get("commit_author_email")?,
    })
}

fn list_predicate(opts: &ListChangesetSpecsOpts) -> Predicate {
    let mut preds = vec![Predicate::raw("repo.deleted_at IS NULL")];
    if let Some(batch_spec_id) = opts.batch_spec_id {
        preds.push(Predicate::sql(
            "changeset_specs.batch_spec_id = ?",
            vec![Bind::Int(batch_spec_id)],
        ));
    }
    if !opts.ids.is_empty() {
        preds.push(in_list("changeset_specs.id", &opts.ids));
    }
    if !opts.rand_ids.is_empty() {
        let placeholders = vec!["?"; opts.rand_ids.len()].join(", ");
        preds.push(Predicate::sql(
            format!("changeset_specs.rand_id IN ({placeholders})"),
            opts.rand_ids.iter().map(|r| Bind::from(r.as_str())).collect(),
        ));
    }
    if let Some(repo_id) = opts.repo_id {
        preds.push(Predicate::sql("changeset_specs.repo_id = ?", vec![Bind::Int(repo_id)]));
    }
    if let Some(spec_type) = opts.spec_type {
        preds.push(Predicate::sql(
            "changeset_specs.type = ?",
            vec![Bind::from(spec_type.as_str())],
        ));
    }
    Predicate::and(preds)
}

async fn fetch_specs(store: &Store, mut qb: QueryBuilder<'_, Sqlite>) -> Result<Vec<ChangesetSpec>> {
    let mut rows = qb.build().fetch(store.pool());
    let mut specs = Vec::new();
    while let Some(row) = rows.try_next().await? {
        specs.push(scan_changeset_spec(&row)?);
    }
    Ok(specs)
}

async fn insert_changeset_spec(
    conn: &mut SqliteConnection,
    spec: &mut ChangesetSpec,
    now: DateTime<Utc>,
) -> Result<()> {
    if spec.rand_id.is_empty() {
        spec.rand_id = new_rand_id();
    }
    if spec.created_at == DateTime::<Utc>::default() {
        spec.created_at = now;
    }
    spec.updated_at = spec.created_at;

    let row = sqlx::query(
        "INSERT INTO changeset_specs (rand_id, batch_spec_id, repo_id, user_id, diff_stat_added, \
         diff_stat_deleted, created_at, updated_at, fork_namespace, external_id, head_ref, title, \
         title_folded, base_rev, base_ref, body, published, diff, commit_message, commit_author_name, \
         commit_author_email, type) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(&spec.rand_id)
    .bind(spec.batch_spec_id)
    .bind(spec.repo_id)
    .bind(spec.user_id)
    .bind(spec.diff_stat_added)
    .bind(spec.diff_stat_deleted)
    .bind(spec.created_at)
    .bind(spec.updated_at)
    .bind(&spec.fork_namespace)
    .bind(&spec.external_id)
    .bind(&spec.head_ref)
    .bind(&spec.title)
    .bind(spec.title.as_deref().map(fold_case))
    .bind(&spec.base_rev)
    .bind(&spec.base_ref)
    .bind(&spec.body)
    .bind(spec.published.to_db())
    .bind(&spec.diff)
    .bind(&spec.commit_message)
    .bind(&spec.commit_author_name)
    .bind(&spec.commit_author_email)
    .bind(spec.spec_type.as_str())
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| StoreError::from_write(e, WriteContext::default()))?;
    spec.id = row.try_get("id")?;
    Ok(())
}

impl Store {
    /// Insert a spec, assigning its random id and timestamps.
    #[instrument(skip_all, fields(repo_id = spec.repo_id))]
    pub async fn create_changeset_spec(&self, spec: &mut ChangesetSpec) -> Result<()> {
        let mut conn = self.pool().acquire().await?;
        insert_changeset_spec(&mut conn, spec, self.now()).await?;
        debug!(id = spec.id, "created changeset spec");
        Ok(())
    }

    /// Create several specs in one transaction.
    #[instrument(skip_all, fields(count = specs.len()))]
    pub async fn create_changeset_specs(&self, specs: &mut [ChangesetSpec]) -> Result<()> {
        let now = self.now();
        let mut tx = self.pool().begin().await?;
        for spec in specs.iter_mut() {
            insert_changeset_spec(&mut tx, spec, now).await?;
        }
        tx.commit().await?;
        info!(count = specs.len(), "created changeset specs");
        Ok(())
    }

    #[instrument(skip_all)]
    pub async fn get_changeset_spec(&self, opts: &GetChangesetSpecOpts) -> Result<ChangesetSpec> {
        let mut preds = Vec::new();
        if let Some(id) = opts.id {
            preds.push(Predicate::sql("changeset_specs.id = ?", vec![Bind::Int(id)]));
        }
        if let Some(rand_id) = &opts.rand_id {
            preds.push(Predicate::sql(
                "changeset_specs.rand_id = ?",
                vec![Bind::from(rand_id.as_str())],
            ));
        }
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {CHANGESET_SPEC_COLUMNS} FROM changeset_specs"
        ));
        Predicate::and(preds).push_where(&mut qb);
        qb.push(" LIMIT 1");
        let row = qb
            .build()
            .fetch_one(self.pool())
            .await
            .map_err(not_found_or)?;
        scan_changeset_spec(&row)
    }

    /// List specs in repositories that still exist, oldest first.
    #[instrument(skip_all)]
    pub async fn list_changeset_specs(
        &self,
        opts: &ListChangesetSpecsOpts,
    ) -> Result<(Vec<ChangesetSpec>, Option<i64>)> {
        let mut pred = list_predicate(opts);
        if let Some(cursor) = opts.cursor {
            pred = Predicate::and([
                pred,
                Predicate::sql("changeset_specs.id >= ?", vec![Bind::Int(cursor)]),
            ]);
        }
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {CHANGESET_SPEC_COLUMNS} FROM changeset_specs \
             JOIN repo ON repo.id = changeset_specs.repo_id"
        ));
        pred.push_where(&mut qb);
        qb.push(" ORDER BY changeset_specs.id ASC");
        if let Some(limit) = opts.limit {
            qb.push(" LIMIT ");
            qb.push_bind((limit + 1) as i64);
        }
        let specs = fetch_specs(self, qb).await?;
        Ok(split_page(specs, opts.limit, |s| s.id))
    }

    #[instrument(skip_all)]
    pub async fn count_changeset_specs(&self, opts: &ListChangesetSpecsOpts) -> Result<i64> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT COUNT(*) FROM changeset_specs JOIN repo ON repo.id = changeset_specs.repo_id",
        );
        list_predicate(opts).push_where(&mut qb);
        let count: i64 = qb.build_query_scalar().fetch_one(self.pool()).await?;
        Ok(count)
    }

    /// Attach specs to a batch spec.
    #[instrument(skip_all, fields(batch_spec_id = batch_spec_id))]
    pub async fn update_changeset_spec_batch_spec_id(
        &self,
        ids: &[i64],
        batch_spec_id: i64,
    ) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE changeset_specs SET batch_spec_id = ");
        qb.push_bind(batch_spec_id);
        qb.push(", updated_at = ");
        qb.push_bind(self.now());
        in_list("id", ids).push_where(&mut qb);
        let res = qb.build().execute(self.pool()).await?;
        info!(updated = res.rows_affected(), "attached changeset specs");
        Ok(())
    }

    #[instrument(skip_all, fields(id = id))]
    pub async fn delete_changeset_spec(&self, id: i64) -> Result<()> {
        let res = sqlx::query("DELETE FROM changeset_specs WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Delete specs by batch spec and/or ids. Refuses to run unfiltered.
    #[instrument(skip_all)]
    pub async fn delete_changeset_specs(&self, opts: &DeleteChangesetSpecsOpts) -> Result<u64> {
        if opts.batch_spec_id.is_none() && opts.ids.is_empty() {
            return Err(StoreError::InvalidOptions(
                "batch_spec_id or ids required to delete changeset specs",
            ));
        }
        let mut preds = Vec::new();
        if let Some(batch_spec_id) = opts.batch_spec_id {
            preds.push(Predicate::sql("batch_spec_id = ?", vec![Bind::Int(batch_spec_id)]));
        }
        if !opts.ids.is_empty() {
            preds.push(in_list("id", &opts.ids));
        }
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("DELETE FROM changeset_specs");
        Predicate::and(preds).push_where(&mut qb);
        let deleted = qb.build().execute(self.pool()).await?.rows_affected();
        info!(deleted, "deleted changeset specs");
        Ok(deleted)
    }

    /// Branch specs of `batch_spec_id` that share `(repo, head ref)` with
    /// another spec of the same batch spec. Head refs compare with the
    /// `refs/heads/` prefix added, as the rewirer does. Every member of a
    /// colliding group is returned, ordered by repo, head ref and id.
    #[instrument(skip_all, fields(batch_spec_id = batch_spec_id))]
    pub async fn list_changeset_specs_with_conflicting_head_ref(
        &self,
        batch_spec_id: i64,
    ) -> Result<Vec<ChangesetSpec>> {
        let head_ref = ref_prefix_sql("changeset_specs.head_ref");
        let grouped = ref_prefix_sql("s.head_ref");
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {CHANGESET_SPEC_COLUMNS} FROM changeset_specs \
             JOIN repo ON repo.id = changeset_specs.repo_id \
             WHERE repo.deleted_at IS NULL AND changeset_specs.type = 'branch' \
             AND changeset_specs.batch_spec_id = "
        ));
        qb.push_bind(batch_spec_id);
        qb.push(format!(
            " AND (changeset_specs.repo_id, {head_ref}) IN (\
             SELECT s.repo_id, {grouped} FROM changeset_specs s \
             WHERE s.type = 'branch' AND s.head_ref IS NOT NULL AND s.batch_spec_id = "
        ));
        qb.push_bind(batch_spec_id);
        qb.push(format!(
            " GROUP BY s.repo_id, {grouped} HAVING COUNT(*) > 1) \
             ORDER BY changeset_specs.repo_id, {head_ref}, changeset_specs.id"
        ));
        let conflicts = fetch_specs(self, qb).await?;
        debug!(count = conflicts.len(), "found conflicting changeset specs");
        Ok(conflicts)
    }

    /// Delete specs never attached to a batch spec once they outlive the
    /// changeset spec TTL.
    #[instrument(skip_all)]
    pub async fn delete_unattached_expired_changeset_specs(&self) -> Result<u64> {
        let cutoff = self.now() - self.settings().changeset_spec_ttl();
        let deleted = sqlx::query(
            "DELETE FROM changeset_specs WHERE batch_spec_id IS NULL AND created_at < ? \
             AND NOT EXISTS (SELECT 1 FROM changesets \
             WHERE changesets.current_spec_id = changeset_specs.id \
             OR changesets.previous_spec_id = changeset_specs.id)",
        )
        .bind(cutoff)
        .execute(self.pool())
        .await?
        .rows_affected();
        info!(deleted, %cutoff, "deleted unattached expired changeset specs");
        Ok(deleted)
    }

    /// Delete attached specs whose batch spec was never applied, once they
    /// outlive the batch spec TTL. Specs of server-side batch specs and specs
    /// a changeset still points at are kept.
    #[instrument(skip_all)]
    pub async fn delete_expired_changeset_specs(&self) -> Result<u64> {
        let cutoff = self.now() - self.settings().batch_spec_ttl();
        let deleted = sqlx::query(
            "DELETE FROM changeset_specs WHERE id IN (\
             SELECT cs.id FROM changeset_specs cs \
             JOIN batch_specs bs ON bs.id = cs.batch_spec_id \
             WHERE cs.created_at < ? AND bs.created_from_raw = 0 \
             AND NOT EXISTS (SELECT 1 FROM batch_changes WHERE batch_changes.batch_spec_id = bs.id) \
             AND NOT EXISTS (SELECT 1 FROM changesets \
             WHERE changesets.current_spec_id = cs.id OR changesets.previous_spec_id = cs.id))",
        )
        .bind(cutoff)
        .execute(self.pool())
        .await?
        .rows_affected();
        info!(deleted, %cutoff, "deleted expired changeset specs");
        Ok(deleted)
    }
}
