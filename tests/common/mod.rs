#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use async_trait::async_trait;
use batch_changes::authz::{Actor, AuthzProvider, RepoAccess};
use batch_changes::db::{self, Store};
use batch_changes::model::{BatchChange, BatchSpec, Changeset, ExternalState, PublicationState, ReconcilerState};
use batch_changes::namespace::Namespace;
use chrono::{DateTime, Duration, Local, TimeZone, Utc};
use mockable::Clock;

/// Clock whose time only moves when a test moves it.
pub struct MutableClock(Mutex<DateTime<Utc>>);

impl MutableClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self(Mutex::new(now))
    }

    fn lock_clock(&self) -> MutexGuard<'_, DateTime<Utc>> {
        match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.lock_clock();
        *now += by;
    }
}

impl Clock for MutableClock {
    fn local(&self) -> DateTime<Local> {
        self.utc().with_timezone(&Local)
    }

    fn utc(&self) -> DateTime<Utc> {
        *self.lock_clock()
    }
}

/// Users see only the repositories listed for them; anyone else sees none.
#[derive(Default)]
pub struct RestrictedAuthz {
    pub visible: std::collections::BTreeMap<i64, BTreeSet<i64>>,
}

impl RestrictedAuthz {
    pub fn allow(mut self, user_id: i64, repo_ids: &[i64]) -> Self {
        self.visible
            .entry(user_id)
            .or_default()
            .extend(repo_ids.iter().copied());
        self
    }
}

#[async_trait]
impl AuthzProvider for RestrictedAuthz {
    async fn repo_access(&self, actor: &Actor) -> Result<RepoAccess> {
        let ids = actor
            .user_id()
            .and_then(|id| self.visible.get(&id).cloned())
            .unwrap_or_default();
        Ok(RepoAccess::Restricted(ids))
    }
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

pub async fn setup_store() -> (Store, Arc<MutableClock>) {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    let clock = Arc::new(MutableClock::new(start_time()));
    let store = Store::new(pool).with_clock(clock.clone());
    (store, clock)
}

pub async fn batch_spec(store: &Store, namespace: Namespace, user_id: i64) -> BatchSpec {
    let mut spec = BatchSpec::new(namespace, Some(user_id));
    store.create_batch_spec(&mut spec).await.unwrap();
    spec
}

/// An applied batch change owned by `user_id`'s namespace.
pub async fn open_batch_change(store: &Store, name: &str, namespace: Namespace, user_id: i64) -> BatchChange {
    let spec = batch_spec(store, namespace, user_id).await;
    let mut bc = BatchChange::draft(name, namespace, spec.id);
    bc.apply(spec.id, user_id, store.now());
    store.create_batch_change(&mut bc).await.unwrap();
    bc
}

/// A published, synced changeset attached to `batch_change_id`.
pub fn synced_changeset(repo_id: i64, external_id: &str, state: ExternalState, batch_change_id: i64) -> Changeset {
    let mut cs = Changeset::new(repo_id);
    cs.external_id = Some(external_id.to_string());
    cs.external_service_type = "github".to_string();
    cs.external_state = Some(state);
    cs.publication_state = PublicationState::Published;
    cs.reconciler_state = ReconcilerState::Completed;
    cs.attach(batch_change_id);
    cs
}
