use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::{Result, StoreError};

/// How long a changeset spec may live without being attached to a batch spec.
pub const CHANGESET_SPEC_TTL_HOURS: i64 = 2 * 24;
/// How long an attached changeset spec may live while its batch spec is not
/// applied and no changeset references it.
pub const BATCH_SPEC_TTL_HOURS: i64 = 7 * 24;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChangesetSpecType {
    /// Tracks an existing changeset on the code host by external id.
    Existing,
    /// Proposes a commit on a head branch.
    Branch,
}

impl ChangesetSpecType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangesetSpecType::Existing => "existing",
            ChangesetSpecType::Branch => "branch",
        }
    }

    pub fn parse_type(s: &str) -> Option<Self> {
        match s {
            "existing" => Some(ChangesetSpecType::Existing),
            "branch" => Some(ChangesetSpecType::Branch),
            _ => None,
        }
    }
}

/// Publication intent of a changeset spec.
///
/// Stored as a single nullable JSON scalar: `NULL`, `true`, `false` or
/// `"draft"`. Anything else is rejected rather than coerced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PublishedValue {
    #[default]
    Absent,
    False,
    True,
    Draft,
}

impl PublishedValue {
    pub fn from_json(value: Option<&Value>) -> Result<Self> {
        match value {
            None | Some(Value::Null) => Ok(PublishedValue::Absent),
            Some(Value::Bool(true)) => Ok(PublishedValue::True),
            Some(Value::Bool(false)) => Ok(PublishedValue::False),
            Some(Value::String(s)) if s == "draft" => Ok(PublishedValue::Draft),
            Some(other) => Err(StoreError::InvalidPublishedValue(format!(
                "invalid value {other} for published, must be true, false or \"draft\""
            ))),
        }
    }

    pub fn to_json(&self) -> Option<Value> {
        match self {
            PublishedValue::Absent => None,
            PublishedValue::True => Some(Value::Bool(true)),
            PublishedValue::False => Some(Value::Bool(false)),
            PublishedValue::Draft => Some(Value::String("draft".into())),
        }
    }

    /// Decode the storage representation (a JSON document or `NULL`).
    pub fn from_db(raw: Option<&str>) -> Result<Self> {
        match raw.map(str::trim).filter(|s| !s.is_empty()) {
            None => Ok(PublishedValue::Absent),
            Some(raw) => {
                let value: Value = serde_json::from_str(raw).map_err(|_| {
                    StoreError::InvalidPublishedValue(format!("stored value {raw:?} is not JSON"))
                })?;
                Self::from_json(Some(&value))
            }
        }
    }

    pub fn to_db(&self) -> Option<String> {
        self.to_json().map(|v| v.to_string())
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, PublishedValue::Absent)
    }
}

impl Serialize for PublishedValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PublishedValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Option::<Value>::deserialize(deserializer)?;
        PublishedValue::from_json(value.as_ref()).map_err(serde::de::Error::custom)
    }
}

/// A proposed change produced when a batch spec is parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesetSpec {
    pub id: i64,
    /// Externally-facing random id, distinct from `id`.
    pub rand_id: String,
    pub batch_spec_id: Option<i64>,
    pub repo_id: i64,
    pub user_id: Option<i64>,
    pub diff_stat_added: i32,
    pub diff_stat_deleted: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub fork_namespace: Option<String>,
    #[serde(rename = "type")]
    pub spec_type: ChangesetSpecType,
    pub external_id: Option<String>,
    pub head_ref: Option<String>,
    pub title: Option<String>,
    pub base_rev: Option<String>,
    pub base_ref: Option<String>,
    pub body: Option<String>,
    #[serde(default)]
    pub published: PublishedValue,
    #[serde(default)]
    pub diff: Vec<u8>,
    pub commit_message: Option<String>,
    pub commit_author_name: Option<String>,
    pub commit_author_email: Option<String>,
}

impl ChangesetSpec {
    fn blank(repo_id: i64, spec_type: ChangesetSpecType) -> Self {
        Self {
            id: 0,
            rand_id: String::new(),
            batch_spec_id: None,
            repo_id,
            user_id: None,
            diff_stat_added: 0,
            diff_stat_deleted: 0,
            created_at: DateTime::<Utc>::default(),
            updated_at: DateTime::<Utc>::default(),
            fork_namespace: None,
            spec_type,
            external_id: None,
            head_ref: None,
            title: None,
            base_rev: None,
            base_ref: None,
            body: None,
            published: PublishedValue::Absent,
            diff: Vec::new(),
            commit_message: None,
            commit_author_name: None,
            commit_author_email: None,
        }
    }

    /// A spec that tracks `external_id` in `repo_id`.
    pub fn existing(repo_id: i64, external_id: impl Into<String>) -> Self {
        Self {
            external_id: Some(external_id.into()),
            ..Self::blank(repo_id, ChangesetSpecType::Existing)
        }
    }

    /// A spec that proposes a commit on `head_ref` in `repo_id`.
    pub fn branch(repo_id: i64, head_ref: impl Into<String>) -> Self {
        Self {
            head_ref: Some(head_ref.into()),
            ..Self::blank(repo_id, ChangesetSpecType::Branch)
        }
    }
}
