use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::{debug, info, instrument};

use super::{split_page, Store};
use crate::authz::Actor;
use crate::error::{not_found_or, Result, StoreError, WriteContext};
use crate::model::{BatchChangeAssoc, Changeset, ExternalState, PublicationState, ReconcilerState};
use crate::predicate::{in_list, Bind, Predicate};
use crate::search::{fold_case, ChangesetFilter, SearchColumns};

const CHANGESET_COLUMNS: &str = "changesets.id, changesets.repo_id, changesets.created_at, \
     changesets.updated_at, changesets.batch_change_ids, changesets.external_id, \
     changesets.external_service_type, changesets.external_branch, changesets.external_title, \
     changesets.external_state, changesets.external_deleted_at, changesets.diff_stat_added, \
     changesets.diff_stat_deleted, changesets.owned_by_batch_change_id, changesets.current_spec_id, \
     changesets.previous_spec_id, changesets.publication_state, changesets.reconciler_state, \
     changesets.failure_message, changesets.num_resets, changesets.num_failures, \
     changesets.closing, changesets.detached_at";

const CHANGESET_JOINS: &str = "JOIN repo ON repo.id = changesets.repo_id \
     LEFT JOIN changeset_specs current_spec ON current_spec.id = changesets.current_spec_id";

/// Text search runs over the case-folded synced title, falling back to the
/// spec title for changesets that were never published.
pub(crate) const CHANGESET_SEARCH_COLUMNS: SearchColumns<'static> = SearchColumns {
    title: "COALESCE(changesets.external_title_folded, current_spec.title_folded)",
    repo_name: "repo.name_folded",
};

#[derive(Debug, Clone, Default)]
pub struct GetChangesetOpts {
    pub id: Option<i64>,
    pub repo_id: Option<i64>,
    pub external_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ListChangesetsOpts {
    /// Only changesets attached to this batch change.
    pub batch_change_id: Option<i64>,
    /// With `batch_change_id`: list only changesets archived in it.
    pub only_archived: bool,
    /// With `batch_change_id`: list archived changesets too.
    pub include_archived: bool,
    pub repo_ids: Vec<i64>,
    pub owned_by_batch_change_id: Option<i64>,
    pub reconciler_states: Vec<ReconcilerState>,
    pub filter: ChangesetFilter,
    pub limit: Option<usize>,
    pub cursor: Option<i64>,
}

pub(crate) fn decode_error(what: &str, value: &str) -> StoreError {
    StoreError::Database(sqlx::Error::Decode(
        format!("unknown {what} {value:?}").into(),
    ))
}

pub(crate) fn parse_batch_change_ids(raw: &str) -> Result<BTreeMap<i64, BatchChangeAssoc>> {
    Ok(serde_json::from_str(raw)?)
}

fn scan_changeset(row: &SqliteRow) -> Result<Changeset> {
    let batch_change_ids: String = row.try_get("batch_change_ids")?;
    let external_state: Option<String> = row.try_get("external_state")?;
    let external_state = external_state
        .map(|s| ExternalState::parse_state(&s).ok_or_else(|| decode_error("external state", &s)))
        .transpose()?;
    let publication_state: String = row.try_get("publication_state")?;
    let reconciler_state: String = row.try_get("reconciler_state")?;
    Ok(Changeset {
        id: row.try_get("id")?,
        repo_id: row.try_get("repo_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        batch_changes: parse_batch_change_ids(&batch_change_ids)?,
        external_id: row.try_get("external_id")?,
        external_service_type: row.try_get("external_service_type")?,
        external_branch: row.try_get("external_branch")?,
        external_title: row.try_get("external_title")?,
        external_state,
        external_deleted_at: row.try_get("external_deleted_at")?,
        diff_stat_added: row.try_get("diff_stat_added")?,
        diff_stat_deleted: row.try_get("diff_stat_deleted")?,
        owned_by_batch_change_id: row.try_get("owned_by_batch_change_id")?,
        current_spec_id: row.try_get("current_spec_id")?,
        previous_spec_id: row.try_get("previous_spec_id")?,
        publication_state: PublicationState::parse_state(&publication_state)
            .ok_or_else(|| decode_error("publication state", &publication_state))?,
        reconciler_state: ReconcilerState::parse_state(&reconciler_state)
            .ok_or_else(|| decode_error("reconciler state", &reconciler_state))?,
        failure_message: row.try_get("failure_message")?,
        num_resets: row.try_get("num_resets")?,
        num_failures: row.try_get("num_failures")?,
        closing: row.try_get("closing")?,
        detached_at: row.try_get("detached_at")?,
    })
}

/// Predicate over `changesets` for membership in a batch change.
pub(crate) fn attached_to_batch_change(batch_change_id: i64, archived: Option<bool>) -> Predicate {
    let archived_sql = match archived {
        None => "",
        Some(true) => " AND COALESCE(json_extract(assoc.value, '$.isArchived'), 0) = 1",
        Some(false) => " AND COALESCE(json_extract(assoc.value, '$.isArchived'), 0) = 0",
    };
    Predicate::sql(
        format!(
            "EXISTS (SELECT 1 FROM json_each(changesets.batch_change_ids) assoc \
             WHERE assoc.key = ?{archived_sql})"
        ),
        vec![Bind::from(batch_change_id.to_string())],
    )
}

impl Store {
    fn changeset_predicate(&self, opts: &ListChangesetsOpts, repo_access: Predicate) -> Predicate {
        let mut preds = vec![Predicate::raw("repo.deleted_at IS NULL"), repo_access];
        if let Some(batch_change_id) = opts.batch_change_id {
            let archived = if opts.only_archived {
                Some(true)
            } else if opts.include_archived {
                None
            } else {
                Some(false)
            };
            preds.push(attached_to_batch_change(batch_change_id, archived));
        }
        if !opts.repo_ids.is_empty() {
            preds.push(in_list("changesets.repo_id", &opts.repo_ids));
        }
        if let Some(owner) = opts.owned_by_batch_change_id {
            preds.push(Predicate::sql(
                "changesets.owned_by_batch_change_id = ?",
                vec![Bind::Int(owner)],
            ));
        }
        if !opts.reconciler_states.is_empty() {
            preds.push(Predicate::or(opts.reconciler_states.iter().map(|s| {
                Predicate::sql("changesets.reconciler_state = ?", vec![Bind::from(s.as_str())])
            })));
        }
        preds.push(
            opts.filter
                .to_predicate("changesets.computed_state", CHANGESET_SEARCH_COLUMNS),
        );
        Predicate::and(preds)
    }

    #[instrument(skip_all, fields(repo_id = changeset.repo_id))]
    pub async fn create_changeset(&self, changeset: &mut Changeset) -> Result<()> {
        let now = self.now();
        if changeset.created_at == DateTime::<Utc>::default() {
            changeset.created_at = now;
        }
        changeset.updated_at = changeset.created_at;

        let row = sqlx::query(
            "INSERT INTO changesets (repo_id, created_at, updated_at, batch_change_ids, external_id, \
             external_service_type, external_branch, external_title, external_title_folded, external_state, \
             external_deleted_at, diff_stat_added, diff_stat_deleted, owned_by_batch_change_id, current_spec_id, \
             previous_spec_id, publication_state, reconciler_state, computed_state, failure_message, num_resets, \
             num_failures, closing, detached_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(changeset.repo_id)
        .bind(changeset.created_at)
        .bind(changeset.updated_at)
        .bind(serde_json::to_string(&changeset.batch_changes)?)
        .bind(&changeset.external_id)
        .bind(&changeset.external_service_type)
        .bind(&changeset.external_branch)
        .bind(&changeset.external_title)
        .bind(changeset.external_title.as_deref().map(fold_case))
        .bind(changeset.external_state.map(|s| s.as_str()))
        .bind(changeset.external_deleted_at)
        .bind(changeset.diff_stat_added)
        .bind(changeset.diff_stat_deleted)
        .bind(changeset.owned_by_batch_change_id)
        .bind(changeset.current_spec_id)
        .bind(changeset.previous_spec_id)
        .bind(changeset.publication_state.as_str())
        .bind(changeset.reconciler_state.as_str())
        .bind(changeset.state().as_str())
        .bind(&changeset.failure_message)
        .bind(changeset.num_resets)
        .bind(changeset.num_failures)
        .bind(changeset.closing)
        .bind(changeset.detached_at)
        .fetch_one(self.pool())
        .await
        .map_err(|e| StoreError::from_write(e, WriteContext::default()))?;
        changeset.id = row.try_get("id")?;
        debug!(id = changeset.id, state = changeset.state().as_str(), "created changeset");
        Ok(())
    }

    /// Overwrite every column and recompute the stored state.
    #[instrument(skip_all, fields(id = changeset.id))]
    pub async fn update_changeset(&self, changeset: &mut Changeset) -> Result<()> {
        changeset.updated_at = self.now();
        let res = sqlx::query(
            "UPDATE changesets SET repo_id = ?, updated_at = ?, batch_change_ids = ?, external_id = ?, \
             external_service_type = ?, external_branch = ?, external_title = ?, \
             external_title_folded = ?, external_state = ?, \
             external_deleted_at = ?, diff_stat_added = ?, diff_stat_deleted = ?, \
             owned_by_batch_change_id = ?, current_spec_id = ?, previous_spec_id = ?, \
             publication_state = ?, reconciler_state = ?, computed_state = ?, failure_message = ?, \
             num_resets = ?, num_failures = ?, closing = ?, detached_at = ? WHERE id = ?",
        )
        .bind(changeset.repo_id)
        .bind(changeset.updated_at)
        .bind(serde_json::to_string(&changeset.batch_changes)?)
        .bind(&changeset.external_id)
        .bind(&changeset.external_service_type)
        .bind(&changeset.external_branch)
        .bind(&changeset.external_title)
        .bind(changeset.external_title.as_deref().map(fold_case))
        .bind(changeset.external_state.map(|s| s.as_str()))
        .bind(changeset.external_deleted_at)
        .bind(changeset.diff_stat_added)
        .bind(changeset.diff_stat_deleted)
        .bind(changeset.owned_by_batch_change_id)
        .bind(changeset.current_spec_id)
        .bind(changeset.previous_spec_id)
        .bind(changeset.publication_state.as_str())
        .bind(changeset.reconciler_state.as_str())
        .bind(changeset.state().as_str())
        .bind(&changeset.failure_message)
        .bind(changeset.num_resets)
        .bind(changeset.num_failures)
        .bind(changeset.closing)
        .bind(changeset.detached_at)
        .bind(changeset.id)
        .execute(self.pool())
        .await
        .map_err(|e| StoreError::from_write(e, WriteContext::default()))?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        info!(state = changeset.state().as_str(), "updated changeset");
        Ok(())
    }

    /// Fetch by id, or by repository and external id. Changesets in deleted
    /// repositories are not found.
    #[instrument(skip_all)]
    pub async fn get_changeset(&self, opts: &GetChangesetOpts) -> Result<Changeset> {
        let mut preds = vec![Predicate::raw("repo.deleted_at IS NULL")];
        if let Some(id) = opts.id {
            preds.push(Predicate::sql("changesets.id = ?", vec![Bind::Int(id)]));
        }
        if let Some(repo_id) = opts.repo_id {
            preds.push(Predicate::sql("changesets.repo_id = ?", vec![Bind::Int(repo_id)]));
        }
        if let Some(external_id) = &opts.external_id {
            preds.push(Predicate::sql(
                "changesets.external_id = ?",
                vec![Bind::from(external_id.as_str())],
            ));
        }
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {CHANGESET_COLUMNS} FROM changesets {CHANGESET_JOINS}"
        ));
        Predicate::and(preds).push_where(&mut qb);
        qb.push(" ORDER BY changesets.id DESC LIMIT 1");
        let row = qb
            .build()
            .fetch_one(self.pool())
            .await
            .map_err(not_found_or)?;
        scan_changeset(&row)
    }

    /// List changesets in repositories the actor may see, oldest first.
    #[instrument(skip_all)]
    pub async fn list_changesets(
        &self,
        actor: &Actor,
        opts: &ListChangesetsOpts,
    ) -> Result<(Vec<Changeset>, Option<i64>)> {
        let access = self.repo_access(actor).await?.predicate("repo.id");
        let mut pred = self.changeset_predicate(opts, access);
        if let Some(cursor) = opts.cursor {
            pred = Predicate::and([
                pred,
                Predicate::sql("changesets.id >= ?", vec![Bind::Int(cursor)]),
            ]);
        }
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {CHANGESET_COLUMNS} FROM changesets {CHANGESET_JOINS}"
        ));
        pred.push_where(&mut qb);
        qb.push(" ORDER BY changesets.id ASC");
        if let Some(limit) = opts.limit {
            qb.push(" LIMIT ");
            qb.push_bind((limit + 1) as i64);
        }

        let mut rows = qb.build().fetch(self.pool());
        let mut items = Vec::new();
        while let Some(row) = rows.try_next().await? {
            items.push(scan_changeset(&row)?);
        }
        let (items, next) = split_page(items, opts.limit, |cs| cs.id);
        debug!(count = items.len(), ?next, "listed changesets");
        Ok((items, next))
    }

    #[instrument(skip_all)]
    pub async fn count_changesets(&self, actor: &Actor, opts: &ListChangesetsOpts) -> Result<i64> {
        let access = self.repo_access(actor).await?.predicate("repo.id");
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT COUNT(*) FROM changesets {CHANGESET_JOINS}"));
        self.changeset_predicate(opts, access).push_where(&mut qb);
        let count: i64 = qb.build_query_scalar().fetch_one(self.pool()).await?;
        Ok(count)
    }
}
