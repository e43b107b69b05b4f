use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::{info, instrument};
use uuid::Uuid;

use super::Store;
use crate::error::{not_found_or, Result, StoreError, WriteContext};
use crate::model::BatchSpec;
use crate::namespace::Namespace;

const BATCH_SPEC_COLUMNS: &str = "id, rand_id, raw_spec, namespace_user_id, namespace_org_id, user_id, \
     created_from_raw, created_at, updated_at";

fn scan_batch_spec(row: &SqliteRow) -> Result<BatchSpec> {
    Ok(BatchSpec {
        id: row.try_get("id")?,
        rand_id: row.try_get("rand_id")?,
        raw_spec: row.try_get("raw_spec")?,
        namespace: Namespace::from_columns(
            row.try_get("namespace_user_id")?,
            row.try_get("namespace_org_id")?,
        )?,
        user_id: row.try_get("user_id")?,
        created_from_raw: row.try_get("created_from_raw")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Externally-facing identifier for specs, distinct from the row id.
pub(crate) fn new_rand_id() -> String {
    Uuid::new_v4().simple().to_string()
}

impl Store {
    #[instrument(skip_all)]
    pub async fn create_batch_spec(&self, spec: &mut BatchSpec) -> Result<()> {
        if spec.rand_id.is_empty() {
            spec.rand_id = new_rand_id();
        }
        if spec.created_at == DateTime::<Utc>::default() {
            spec.created_at = self.now();
        }
        spec.updated_at = spec.created_at;

        let row = sqlx::query(
            "INSERT INTO batch_specs (rand_id, raw_spec, namespace_user_id, namespace_org_id, user_id, \
             created_from_raw, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(&spec.rand_id)
        .bind(&spec.raw_spec)
        .bind(spec.namespace.user_id())
        .bind(spec.namespace.org_id())
        .bind(spec.user_id)
        .bind(spec.created_from_raw)
        .bind(spec.created_at)
        .bind(spec.updated_at)
        .fetch_one(self.pool())
        .await
        .map_err(|e| StoreError::from_write(e, WriteContext::default()))?;
        spec.id = row.try_get("id")?;
        info!(id = spec.id, rand_id = %spec.rand_id, "created batch spec");
        Ok(())
    }

    #[instrument(skip_all, fields(id = id))]
    pub async fn get_batch_spec(&self, id: i64) -> Result<BatchSpec> {
        let row = sqlx::query(&format!("SELECT {BATCH_SPEC_COLUMNS} FROM batch_specs WHERE id = ?"))
            .bind(id)
            .fetch_one(self.pool())
            .await
            .map_err(not_found_or)?;
        scan_batch_spec(&row)
    }

    #[instrument(skip_all)]
    pub async fn get_batch_spec_by_rand_id(&self, rand_id: &str) -> Result<BatchSpec> {
        let row = sqlx::query(&format!(
            "SELECT {BATCH_SPEC_COLUMNS} FROM batch_specs WHERE rand_id = ?"
        ))
        .bind(rand_id)
        .fetch_one(self.pool())
        .await
        .map_err(not_found_or)?;
        scan_batch_spec(&row)
    }
}
