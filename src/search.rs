//! Changeset filters shared by listing, counting and rewirer mapping.
//!
//! Every filter exists twice: as a SQL predicate for the relational paths and
//! as an in-memory check for the rewirer, which filters after matching. Both
//! fold case with [`fold_case`]: SQLite's `lower` only knows ASCII, so the
//! searchable columns are stored folded and compared without `lower`.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::predicate::{Bind, Predicate};
use crate::state::ChangesetState;

/// One term of a free-text search.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TextSearchTerm {
    pub term: String,
    #[serde(default)]
    pub not: bool,
}

impl TextSearchTerm {
    pub fn new(term: impl Into<String>) -> Self {
        Self {
            term: term.into(),
            not: false,
        }
    }

    pub fn negated(term: impl Into<String>) -> Self {
        Self {
            term: term.into(),
            not: true,
        }
    }

    fn matches(&self, title: &str, repo_name: &str) -> bool {
        let needle = fold_case(&self.term);
        let hit = fold_case(title).contains(&needle) || fold_case(repo_name).contains(&needle);
        hit != self.not
    }
}

/// Unicode case folding used for every text search comparison.
pub fn fold_case(text: &str) -> String {
    text.to_lowercase()
}

static SEARCH_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(-?)(?:"([^"]*)"?|([^\s-]\S*))"#).expect("search token regex"));

/// Split a query such as `foo -bar "two words"` into terms. A leading `-`
/// negates the term; double quotes keep spaces. Empty terms are dropped.
pub fn parse_text_search(query: &str) -> Vec<TextSearchTerm> {
    SEARCH_TOKEN
        .captures_iter(query)
        .filter_map(|caps| {
            let not = !caps[1].is_empty();
            let term = caps
                .get(2)
                .or_else(|| caps.get(3))
                .map(|m| m.as_str().trim())
                .unwrap_or_default();
            if term.is_empty() {
                return None;
            }
            Some(TextSearchTerm {
                term: term.to_string(),
                not,
            })
        })
        .collect()
}

/// Column expressions a text search runs against. Both must hold text
/// already passed through [`fold_case`].
#[derive(Debug, Clone, Copy)]
pub struct SearchColumns<'a> {
    pub title: &'a str,
    pub repo_name: &'a str,
}

/// Filter over the changeset side of a query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangesetFilter {
    pub state: Option<ChangesetState>,
    pub text_search: Vec<TextSearchTerm>,
}

impl ChangesetFilter {
    pub fn is_active(&self) -> bool {
        self.state.is_some() || !self.text_search.is_empty()
    }

    /// In-memory form of [`ChangesetFilter::to_predicate`].
    pub fn matches(&self, state: ChangesetState, title: &str, repo_name: &str) -> bool {
        if self.state.is_some_and(|want| want != state) {
            return false;
        }
        self.text_search
            .iter()
            .all(|term| term.matches(title, repo_name))
    }

    /// SQL form. `state_column` holds the stored classification.
    pub fn to_predicate(&self, state_column: &str, columns: SearchColumns<'_>) -> Predicate {
        let mut preds = Vec::new();
        if let Some(state) = self.state {
            preds.push(Predicate::sql(
                format!("{state_column} = ?"),
                vec![Bind::from(state.as_str())],
            ));
        }
        preds.extend(
            self.text_search
                .iter()
                .map(|term| text_search_predicate(term, columns)),
        );
        Predicate::and(preds)
    }
}

fn text_search_predicate(term: &TextSearchTerm, columns: SearchColumns<'_>) -> Predicate {
    let needle = fold_case(&term.term);
    let hit = Predicate::sql(
        format!(
            "instr(COALESCE({}, ''), ?) > 0 OR instr({}, ?) > 0",
            columns.title, columns.repo_name
        ),
        vec![Bind::from(needle.clone()), Bind::from(needle)],
    );
    if term.not {
        hit.negate()
    } else {
        hit
    }
}
