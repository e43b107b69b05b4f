//! Adapters over tables owned by the identity and repository services.
//!
//! The store only reads these tables; the writes exist so the joins have
//! something to join against when seeding data.

use futures::TryStreamExt;
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::{info, instrument};

use super::Store;
use crate::authz::Actor;
use crate::error::{not_found_or, Result, StoreError};
use crate::model::{Org, Repo, User};
use crate::predicate::{in_list, Predicate};
use crate::search::fold_case;

impl Store {
    #[instrument(skip_all, fields(username = %username))]
    pub async fn create_user(&self, username: &str, site_admin: bool) -> Result<User> {
        let row = sqlx::query(
            "INSERT INTO users (username, site_admin, created_at) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(username)
        .bind(site_admin)
        .bind(self.now())
        .fetch_one(self.pool())
        .await?;
        Ok(User {
            id: row.try_get("id")?,
            username: username.to_string(),
            site_admin,
            deleted_at: None,
        })
    }

    #[instrument(skip_all, fields(id = id))]
    pub async fn get_user(&self, id: i64) -> Result<User> {
        let row = sqlx::query("SELECT id, username, site_admin, deleted_at FROM users WHERE id = ?")
            .bind(id)
            .fetch_one(self.pool())
            .await
            .map_err(not_found_or)?;
        Ok(User {
            id: row.try_get("id")?,
            username: row.try_get("username")?,
            site_admin: row.try_get("site_admin")?,
            deleted_at: row.try_get("deleted_at")?,
        })
    }

    /// Mark a user deleted. Their batch changes stay but become invisible.
    #[instrument(skip_all, fields(id = id))]
    pub async fn soft_delete_user(&self, id: i64) -> Result<()> {
        let res = sqlx::query("UPDATE users SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL")
            .bind(self.now())
            .bind(id)
            .execute(self.pool())
            .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        info!("soft-deleted user");
        Ok(())
    }

    /// Remove a user row; foreign keys cascade to batch changes in the
    /// user's namespace.
    #[instrument(skip_all, fields(id = id))]
    pub async fn hard_delete_user(&self, id: i64) -> Result<()> {
        let res = sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        info!("hard-deleted user");
        Ok(())
    }

    #[instrument(skip_all, fields(name = %name))]
    pub async fn create_org(&self, name: &str) -> Result<Org> {
        let row = sqlx::query("INSERT INTO orgs (name, created_at) VALUES (?, ?) RETURNING id")
            .bind(name)
            .bind(self.now())
            .fetch_one(self.pool())
            .await?;
        Ok(Org {
            id: row.try_get("id")?,
            name: name.to_string(),
            deleted_at: None,
        })
    }

    #[instrument(skip_all, fields(id = id))]
    pub async fn soft_delete_org(&self, id: i64) -> Result<()> {
        let res = sqlx::query("UPDATE orgs SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL")
            .bind(self.now())
            .bind(id)
            .execute(self.pool())
            .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        info!("soft-deleted org");
        Ok(())
    }

    #[instrument(skip_all, fields(id = id))]
    pub async fn hard_delete_org(&self, id: i64) -> Result<()> {
        let res = sqlx::query("DELETE FROM orgs WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        info!("hard-deleted org");
        Ok(())
    }

    #[instrument(skip_all, fields(org_id = org_id, user_id = user_id))]
    pub async fn add_org_member(&self, org_id: i64, user_id: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO org_members (org_id, user_id, created_at) VALUES (?, ?, ?) \
             ON CONFLICT (org_id, user_id) DO NOTHING",
        )
        .bind(org_id)
        .bind(user_id)
        .bind(self.now())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    #[instrument(skip_all, fields(name = %name))]
    pub async fn create_repo(&self, name: &str, private: bool) -> Result<Repo> {
        let row = sqlx::query(
            "INSERT INTO repo (name, name_folded, private, created_at) VALUES (?, ?, ?, ?) RETURNING id",
        )
        .bind(name)
        .bind(fold_case(name))
        .bind(private)
        .bind(self.now())
        .fetch_one(self.pool())
        .await?;
        Ok(Repo {
            id: row.try_get("id")?,
            name: name.to_string(),
            private,
        })
    }

    #[instrument(skip_all, fields(id = id))]
    pub async fn soft_delete_repo(&self, id: i64) -> Result<()> {
        let res = sqlx::query("UPDATE repo SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL")
            .bind(self.now())
            .bind(id)
            .execute(self.pool())
            .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        info!("soft-deleted repo");
        Ok(())
    }

    /// Repositories among `ids` that exist and the actor may see, by id.
    #[instrument(skip_all, fields(count = ids.len()))]
    pub async fn list_repos(&self, actor: &Actor, ids: &[i64]) -> Result<Vec<Repo>> {
        let access = self.repo_access(actor).await?.predicate("repo.id");
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT repo.id, repo.name, repo.private FROM repo");
        Predicate::and([
            in_list("repo.id", ids),
            Predicate::raw("repo.deleted_at IS NULL"),
            access,
        ])
        .push_where(&mut qb);
        qb.push(" ORDER BY repo.id");

        let mut rows = qb.build().fetch(self.pool());
        let mut repos = Vec::new();
        while let Some(row) = rows.try_next().await? {
            repos.push(Repo {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                private: row.try_get("private")?,
            });
        }
        Ok(repos)
    }
}
