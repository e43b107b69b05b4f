use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::namespace::Namespace;

/// The parsed input a batch change is applied from. Only the fields the
/// store joins on are modelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSpec {
    pub id: i64,
    pub rand_id: String,
    pub raw_spec: String,
    pub namespace: Namespace,
    /// Author of the spec.
    pub user_id: Option<i64>,
    /// Created server-side from a raw spec rather than uploaded.
    pub created_from_raw: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BatchSpec {
    pub fn new(namespace: Namespace, user_id: Option<i64>) -> Self {
        Self {
            id: 0,
            rand_id: String::new(),
            raw_spec: String::new(),
            namespace,
            user_id,
            created_from_raw: false,
            created_at: DateTime::<Utc>::default(),
            updated_at: DateTime::<Utc>::default(),
        }
    }
}
