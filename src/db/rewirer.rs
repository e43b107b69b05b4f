use std::collections::{BTreeMap, BTreeSet};

use futures::TryStreamExt;
use serde::Serialize;
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::{debug, instrument};

use super::changeset_specs::{scan_changeset_spec, CHANGESET_SPEC_COLUMNS};
use super::changesets::{decode_error, parse_batch_change_ids, GetChangesetOpts};
use super::Store;
use crate::authz::Actor;
use crate::error::Result;
use crate::model::{Changeset, ChangesetSpec, ChangesetSpecType, Repo};
use crate::predicate::in_list;
use crate::rewirer::{
    compute_mappings, ChangesetCandidate, LimitOffset, MappingAction, RewirerMapping,
    SpecCandidate,
};
use crate::search::ChangesetFilter;
use crate::state::ChangesetState;

#[derive(Debug, Clone, Default)]
pub struct GetRewirerMappingsOpts {
    pub batch_spec_id: i64,
    /// Zero when previewing a batch change that does not exist yet.
    pub batch_change_id: i64,
    pub filter: ChangesetFilter,
    pub page: LimitOffset,
}

/// A mapping with its rows loaded.
#[derive(Debug, Clone, Serialize)]
pub struct HydratedMapping {
    #[serde(flatten)]
    pub mapping: RewirerMapping,
    pub action: MappingAction,
    pub changeset_spec: Option<ChangesetSpec>,
    pub changeset: Option<Changeset>,
    /// Absent when the actor may not see the repository.
    pub repo: Option<Repo>,
}

impl Store {
    async fn load_spec_candidates(&self, batch_spec_id: i64) -> Result<Vec<SpecCandidate>> {
        let mut rows = sqlx::query(
            "SELECT changeset_specs.id, changeset_specs.repo_id, changeset_specs.type, \
             changeset_specs.external_id, changeset_specs.head_ref FROM changeset_specs \
             JOIN repo ON repo.id = changeset_specs.repo_id \
             WHERE changeset_specs.batch_spec_id = ? AND repo.deleted_at IS NULL",
        )
        .bind(batch_spec_id)
        .fetch(self.pool());

        let mut specs = Vec::new();
        while let Some(row) = rows.try_next().await? {
            let spec_type: String = row.try_get("type")?;
            // Unknown types cannot match anything; the CHECK constraint
            // keeps them out anyway.
            let Some(spec_type) = ChangesetSpecType::parse_type(&spec_type) else {
                continue;
            };
            specs.push(SpecCandidate {
                id: row.try_get("id")?,
                repo_id: row.try_get("repo_id")?,
                spec_type,
                external_id: row.try_get("external_id")?,
                head_ref: row.try_get("head_ref")?,
            });
        }
        Ok(specs)
    }

    /// Changesets attached to or owned by the batch change, plus changesets
    /// the batch spec wants to start tracking.
    async fn load_changeset_candidates(
        &self,
        batch_spec_id: i64,
        batch_change_id: i64,
    ) -> Result<Vec<ChangesetCandidate>> {
        let mut rows = sqlx::query(
            "SELECT changesets.id, changesets.repo_id, changesets.external_id, \
             COALESCE(changesets.external_branch, current_spec.head_ref) AS branch, \
             changesets.owned_by_batch_change_id, changesets.batch_change_ids, \
             changesets.computed_state, \
             COALESCE(changesets.external_title, current_spec.title, '') AS title, \
             repo.name AS repo_name \
             FROM changesets \
             JOIN repo ON repo.id = changesets.repo_id \
             LEFT JOIN changeset_specs current_spec ON current_spec.id = changesets.current_spec_id \
             WHERE repo.deleted_at IS NULL AND (\
             EXISTS (SELECT 1 FROM json_each(changesets.batch_change_ids) assoc WHERE assoc.key = ?) \
             OR changesets.owned_by_batch_change_id = ? \
             OR EXISTS (SELECT 1 FROM changeset_specs tracking \
             WHERE tracking.batch_spec_id = ? AND tracking.type = 'existing' \
             AND tracking.repo_id = changesets.repo_id \
             AND tracking.external_id = changesets.external_id))",
        )
        .bind(batch_change_id.to_string())
        .bind(batch_change_id)
        .bind(batch_spec_id)
        .fetch(self.pool());

        let mut candidates = Vec::new();
        while let Some(row) = rows.try_next().await? {
            let associations = parse_batch_change_ids(&row.try_get::<String, _>("batch_change_ids")?)?;
            let assoc = associations.get(&batch_change_id);
            let state: String = row.try_get("computed_state")?;
            candidates.push(ChangesetCandidate {
                id: row.try_get("id")?,
                repo_id: row.try_get("repo_id")?,
                external_id: row.try_get("external_id")?,
                branch: row.try_get("branch")?,
                owned_by_batch_change_id: row.try_get("owned_by_batch_change_id")?,
                attached: assoc.is_some(),
                archived: assoc.is_some_and(|a| a.is_archived),
                state: ChangesetState::parse_state(&state)
                    .ok_or_else(|| decode_error("changeset state", &state))?,
                title: row.try_get("title")?,
                repo_name: row.try_get("repo_name")?,
            });
        }
        Ok(candidates)
    }

    /// Pair the changeset specs of a batch spec with the changesets of the
    /// batch change it is applied to. Deterministically ordered by repo,
    /// spec and changeset id, then paged.
    #[instrument(skip_all, fields(batch_spec_id = opts.batch_spec_id, batch_change_id = opts.batch_change_id))]
    pub async fn get_rewirer_mappings(
        &self,
        opts: &GetRewirerMappingsOpts,
    ) -> Result<Vec<RewirerMapping>> {
        let specs = self.load_spec_candidates(opts.batch_spec_id).await?;
        let changesets = self
            .load_changeset_candidates(opts.batch_spec_id, opts.batch_change_id)
            .await?;
        let mappings = compute_mappings(
            opts.batch_change_id,
            &specs,
            &changesets,
            &opts.filter,
            opts.page,
        );
        debug!(
            specs = specs.len(),
            changesets = changesets.len(),
            mappings = mappings.len(),
            "computed rewirer mappings"
        );
        Ok(mappings)
    }

    /// Load the spec, changeset and repository of each mapping. Repositories
    /// the actor may not see are left empty rather than failing the call.
    #[instrument(skip_all, fields(count = mappings.len()))]
    pub async fn hydrate_rewirer_mappings(
        &self,
        actor: &Actor,
        mappings: &[RewirerMapping],
    ) -> Result<Vec<HydratedMapping>> {
        let spec_ids: BTreeSet<i64> = mappings.iter().filter_map(|m| m.changeset_spec_id).collect();
        let repo_ids: BTreeSet<i64> = mappings.iter().map(|m| m.repo_id).collect();

        let mut specs = BTreeMap::new();
        if !spec_ids.is_empty() {
            let ids: Vec<i64> = spec_ids.into_iter().collect();
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
                "SELECT {CHANGESET_SPEC_COLUMNS} FROM changeset_specs"
            ));
            in_list("changeset_specs.id", &ids).push_where(&mut qb);
            let mut rows = qb.build().fetch(self.pool());
            while let Some(row) = rows.try_next().await? {
                let spec = scan_changeset_spec(&row)?;
                specs.insert(spec.id, spec);
            }
        }

        let mut changesets = BTreeMap::new();
        for id in mappings.iter().filter_map(|m| m.changeset_id) {
            if changesets.contains_key(&id) {
                continue;
            }
            let opts = GetChangesetOpts {
                id: Some(id),
                ..Default::default()
            };
            changesets.insert(id, self.get_changeset(&opts).await?);
        }

        let ids: Vec<i64> = repo_ids.into_iter().collect();
        let repos: BTreeMap<i64, Repo> = self
            .list_repos(actor, &ids)
            .await?
            .into_iter()
            .map(|r| (r.id, r))
            .collect();

        Ok(mappings
            .iter()
            .map(|m| HydratedMapping {
                mapping: *m,
                action: m.action(),
                changeset_spec: m.changeset_spec_id.and_then(|id| specs.get(&id).cloned()),
                changeset: m.changeset_id.and_then(|id| changesets.get(&id).cloned()),
                repo: repos.get(&m.repo_id).cloned(),
            })
            .collect())
    }
}
