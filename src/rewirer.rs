//! Identity matching between a new batch spec and the changesets of a
//! previous application.
//!
//! Everything here is pure: the store loads the candidate rows and hands them
//! to [`compute_mappings`], which pairs, filters, sorts and pages them.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::model::ChangesetSpecType;
use crate::search::ChangesetFilter;
use crate::state::ChangesetState;

/// What applying a mapping does to the batch change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingAction {
    Create,
    Update,
    Detach,
}

/// A `(spec?, changeset?, repo)` triple. At most one side is absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RewirerMapping {
    pub changeset_spec_id: Option<i64>,
    pub changeset_id: Option<i64>,
    pub repo_id: i64,
}

impl RewirerMapping {
    pub fn action(&self) -> MappingAction {
        match (self.changeset_spec_id, self.changeset_id) {
            (Some(_), Some(_)) => MappingAction::Update,
            (Some(_), None) => MappingAction::Create,
            (None, _) => MappingAction::Detach,
        }
    }

    fn sort_key(&self) -> (i64, Option<i64>, Option<i64>) {
        (self.repo_id, self.changeset_spec_id, self.changeset_id)
    }
}

impl PartialOrd for RewirerMapping {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RewirerMapping {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

/// A changeset spec of the batch spec being applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecCandidate {
    pub id: i64,
    pub repo_id: i64,
    pub spec_type: ChangesetSpecType,
    pub external_id: Option<String>,
    pub head_ref: Option<String>,
}

/// An existing changeset that may be carried forward or detached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangesetCandidate {
    pub id: i64,
    pub repo_id: i64,
    pub external_id: Option<String>,
    /// Head branch on the code host, or the head ref of the current spec
    /// when the changeset has not been pushed yet.
    pub branch: Option<String>,
    pub owned_by_batch_change_id: Option<i64>,
    /// In the association set of the batch change being reconciled.
    pub attached: bool,
    pub archived: bool,
    pub state: ChangesetState,
    pub title: String,
    pub repo_name: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitOffset {
    pub limit: Option<usize>,
    pub offset: usize,
}

impl LimitOffset {
    pub fn apply<T>(&self, items: Vec<T>) -> Vec<T> {
        let iter = items.into_iter().skip(self.offset);
        match self.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        }
    }
}

/// Prefix bare branch names with `refs/heads/` so spec head refs and synced
/// branches compare equal.
pub fn ensure_ref_prefix(branch: &str) -> String {
    if branch.starts_with("refs/") {
        branch.to_string()
    } else {
        format!("refs/heads/{branch}")
    }
}

/// SQL form of [`ensure_ref_prefix`] over `column`.
pub(crate) fn ref_prefix_sql(column: &str) -> String {
    format!("CASE WHEN substr({column}, 1, 5) = 'refs/' THEN {column} ELSE 'refs/heads/' || {column} END")
}

/// Pair `specs` with `changesets` for `batch_change_id` (0 for a batch change
/// that does not exist yet).
///
/// Tracking specs match on `(repo, external id)`. Branch specs match on
/// `(repo, head ref)` but only against changesets the batch change created;
/// when several do, the newest wins. Attached, unarchived changesets that
/// nothing matched are detached. With an active filter, mappings are kept
/// only when their changeset passes it.
pub fn compute_mappings(
    batch_change_id: i64,
    specs: &[SpecCandidate],
    changesets: &[ChangesetCandidate],
    filter: &ChangesetFilter,
    page: LimitOffset,
) -> Vec<RewirerMapping> {
    let mut by_external: BTreeMap<(i64, &str), &ChangesetCandidate> = BTreeMap::new();
    let mut by_branch: BTreeMap<(i64, String), &ChangesetCandidate> = BTreeMap::new();
    for cs in changesets {
        if let Some(ext) = cs.external_id.as_deref() {
            let slot = by_external.entry((cs.repo_id, ext)).or_insert(cs);
            if cs.id > slot.id {
                *slot = cs;
            }
        }
        let owned = batch_change_id != 0 && cs.owned_by_batch_change_id == Some(batch_change_id);
        if let (true, Some(branch)) = (owned, cs.branch.as_deref()) {
            let slot = by_branch
                .entry((cs.repo_id, ensure_ref_prefix(branch)))
                .or_insert(cs);
            if cs.id > slot.id {
                *slot = cs;
            }
        }
    }

    let mut matched = BTreeSet::new();
    let mut mappings = Vec::with_capacity(specs.len());
    for spec in specs {
        let found = match spec.spec_type {
            ChangesetSpecType::Existing => spec
                .external_id
                .as_deref()
                .and_then(|ext| by_external.get(&(spec.repo_id, ext))),
            ChangesetSpecType::Branch => spec
                .head_ref
                .as_deref()
                .and_then(|head| by_branch.get(&(spec.repo_id, ensure_ref_prefix(head)))),
        };
        match found {
            Some(cs) => {
                matched.insert(cs.id);
                if filter.matches(cs.state, &cs.title, &cs.repo_name) {
                    mappings.push(RewirerMapping {
                        changeset_spec_id: Some(spec.id),
                        changeset_id: Some(cs.id),
                        repo_id: spec.repo_id,
                    });
                }
            }
            None if !filter.is_active() => mappings.push(RewirerMapping {
                changeset_spec_id: Some(spec.id),
                changeset_id: None,
                repo_id: spec.repo_id,
            }),
            None => {}
        }
    }

    for cs in changesets {
        if !cs.attached || cs.archived || matched.contains(&cs.id) {
            continue;
        }
        if filter.matches(cs.state, &cs.title, &cs.repo_name) {
            mappings.push(RewirerMapping {
                changeset_spec_id: None,
                changeset_id: Some(cs.id),
                repo_id: cs.repo_id,
            });
        }
    }

    mappings.sort();
    mappings.dedup();
    page.apply(mappings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::TextSearchTerm;

    fn branch_spec(id: i64, repo_id: i64, head: &str) -> SpecCandidate {
        SpecCandidate {
            id,
            repo_id,
            spec_type: ChangesetSpecType::Branch,
            external_id: None,
            head_ref: Some(head.to_string()),
        }
    }

    fn tracking_spec(id: i64, repo_id: i64, ext: &str) -> SpecCandidate {
        SpecCandidate {
            id,
            repo_id,
            spec_type: ChangesetSpecType::Existing,
            external_id: Some(ext.to_string()),
            head_ref: None,
        }
    }

    fn owned(id: i64, repo_id: i64, branch: &str, bc: i64) -> ChangesetCandidate {
        ChangesetCandidate {
            id,
            repo_id,
            external_id: None,
            branch: Some(branch.to_string()),
            owned_by_batch_change_id: Some(bc),
            attached: true,
            archived: false,
            state: ChangesetState::Open,
            title: format!("changeset {id}"),
            repo_name: format!("repo-{repo_id}"),
        }
    }

    fn tracked(id: i64, repo_id: i64, ext: &str, attached: bool) -> ChangesetCandidate {
        ChangesetCandidate {
            id,
            repo_id,
            external_id: Some(ext.to_string()),
            branch: None,
            owned_by_batch_change_id: None,
            attached,
            archived: false,
            state: ChangesetState::Open,
            title: format!("tracked {id}"),
            repo_name: format!("repo-{repo_id}"),
        }
    }

    fn count(mappings: &[RewirerMapping], action: MappingAction) -> usize {
        mappings.iter().filter(|m| m.action() == action).count()
    }

    #[test]
    fn first_application_is_all_creates() {
        let specs = [branch_spec(1, 1, "refs/heads/a"), branch_spec(2, 2, "refs/heads/a")];
        let got = compute_mappings(0, &specs, &[], &ChangesetFilter::default(), LimitOffset::default());
        assert_eq!(got.len(), 2);
        assert!(got.iter().all(|m| m.action() == MappingAction::Create));
    }

    #[test]
    fn update_create_detach_counts() {
        let bc = 10;
        let specs = [
            branch_spec(1, 1, "refs/heads/a"),
            branch_spec(2, 2, "b"),
            tracking_spec(3, 3, "42"),
            branch_spec(4, 4, "refs/heads/new"),
        ];
        let changesets = [
            owned(100, 1, "refs/heads/a", bc),
            owned(101, 2, "refs/heads/b", bc),
            tracked(102, 3, "42", true),
            owned(103, 5, "refs/heads/gone", bc),
            owned(104, 6, "refs/heads/also-gone", bc),
        ];
        let got = compute_mappings(bc, &specs, &changesets, &ChangesetFilter::default(), LimitOffset::default());
        assert_eq!(count(&got, MappingAction::Update), 3);
        assert_eq!(count(&got, MappingAction::Create), 1);
        assert_eq!(count(&got, MappingAction::Detach), 2);
    }

    #[test]
    fn archived_changesets_are_never_detached() {
        let bc = 10;
        let mut archived = owned(100, 1, "refs/heads/a", bc);
        archived.archived = true;
        let got = compute_mappings(bc, &[], &[archived], &ChangesetFilter::default(), LimitOffset::default());
        assert!(got.is_empty());
    }

    #[test]
    fn branch_match_requires_ownership() {
        let specs = [branch_spec(1, 1, "refs/heads/a")];
        let other = owned(100, 1, "refs/heads/a", 99);
        let mut imported = owned(101, 1, "refs/heads/a", 10);
        imported.owned_by_batch_change_id = None;
        imported.attached = false;
        let got = compute_mappings(10, &specs, &[other, imported], &ChangesetFilter::default(), LimitOffset::default());
        assert_eq!(
            got,
            vec![RewirerMapping {
                changeset_spec_id: Some(1),
                changeset_id: None,
                repo_id: 1
            }]
        );
    }

    #[test]
    fn newest_owned_changeset_wins() {
        let specs = [branch_spec(1, 1, "refs/heads/a")];
        let changesets = [owned(100, 1, "refs/heads/a", 10), owned(105, 1, "refs/heads/a", 10)];
        let got = compute_mappings(10, &specs, &changesets, &ChangesetFilter::default(), LimitOffset::default());
        assert_eq!(
            got,
            vec![
                RewirerMapping {
                    changeset_spec_id: None,
                    changeset_id: Some(100),
                    repo_id: 1
                },
                RewirerMapping {
                    changeset_spec_id: Some(1),
                    changeset_id: Some(105),
                    repo_id: 1
                },
            ]
        );
    }

    #[test]
    fn tracking_spec_picks_up_unattached_import() {
        let specs = [tracking_spec(1, 3, "42")];
        let changesets = [tracked(7, 3, "42", false)];
        let got = compute_mappings(10, &specs, &changesets, &ChangesetFilter::default(), LimitOffset::default());
        assert_eq!(got[0].action(), MappingAction::Update);
        assert_eq!(got[0].changeset_id, Some(7));
    }

    #[test]
    fn filters_drop_creates_and_non_matching_changesets() {
        let bc = 10;
        let specs = [branch_spec(1, 1, "refs/heads/a"), branch_spec(2, 2, "refs/heads/b")];
        let mut merged = owned(100, 1, "refs/heads/a", bc);
        merged.state = ChangesetState::Merged;
        let changesets = [merged, owned(101, 3, "refs/heads/c", bc)];

        let by_state = ChangesetFilter {
            state: Some(ChangesetState::Merged),
            text_search: Vec::new(),
        };
        let got = compute_mappings(bc, &specs, &changesets, &by_state, LimitOffset::default());
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].changeset_id, Some(100));

        let by_text = ChangesetFilter {
            state: None,
            text_search: vec![TextSearchTerm::new("repo-3")],
        };
        let got = compute_mappings(bc, &specs, &changesets, &by_text, LimitOffset::default());
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].action(), MappingAction::Detach);
    }

    #[test]
    fn ordering_and_paging_are_stable() {
        let specs = [
            branch_spec(3, 2, "x"),
            branch_spec(1, 1, "x"),
            branch_spec(2, 1, "y"),
        ];
        let all = compute_mappings(0, &specs, &[], &ChangesetFilter::default(), LimitOffset::default());
        let ids: Vec<_> = all.iter().map(|m| m.changeset_spec_id).collect();
        assert_eq!(ids, vec![Some(1), Some(2), Some(3)]);

        let page = LimitOffset {
            limit: Some(1),
            offset: 1,
        };
        let got = compute_mappings(0, &specs, &[], &ChangesetFilter::default(), page);
        assert_eq!(got, vec![all[1]]);
    }

    #[test]
    fn ref_prefix() {
        assert_eq!(ensure_ref_prefix("main"), "refs/heads/main");
        assert_eq!(ensure_ref_prefix("refs/heads/main"), "refs/heads/main");
    }
}
