mod common;

use std::sync::Arc;

use batch_changes::authz::Actor;
use batch_changes::db::{DiffStat, GetBatchChangeOpts, ListBatchChangesOpts};
use batch_changes::model::{BatchChange, ExternalState};
use batch_changes::namespace::Namespace;
use batch_changes::state::BatchChangeState;
use batch_changes::StoreError;
use chrono::Duration;
use common::{batch_spec, open_batch_change, setup_store, synced_changeset, RestrictedAuthz};

fn by_id(id: i64) -> GetBatchChangeOpts {
    GetBatchChangeOpts {
        id: Some(id),
        ..Default::default()
    }
}

#[tokio::test]
async fn create_get_update_round_trip() {
    let (store, clock) = setup_store().await;
    let alice = store.create_user("alice", false).await.unwrap();
    let spec = batch_spec(&store, Namespace::User(alice.id), alice.id).await;

    let mut bc = BatchChange::draft("my-batch-change", Namespace::User(alice.id), spec.id);
    bc.description = "initial".into();
    store.create_batch_change(&mut bc).await.unwrap();
    assert!(bc.id > 0);
    assert_eq!(bc.created_at, common::start_time());
    assert_eq!(bc.updated_at, bc.created_at);

    let fetched = store.get_batch_change(&by_id(bc.id)).await.unwrap();
    assert_eq!(fetched, bc);
    assert_eq!(fetched.state(), BatchChangeState::Draft);

    clock.advance(Duration::minutes(5));
    bc.description = "changed".into();
    store.update_batch_change(&mut bc).await.unwrap();
    let fetched = store.get_batch_change(&by_id(bc.id)).await.unwrap();
    assert_eq!(fetched.description, "changed");
    assert_eq!(fetched.created_at, common::start_time());
    assert_eq!(fetched.updated_at, common::start_time() + Duration::minutes(5));
}

#[tokio::test]
async fn get_by_name_and_namespace() {
    let (store, _clock) = setup_store().await;
    let alice = store.create_user("alice", false).await.unwrap();
    let acme = store.create_org("acme").await.unwrap();
    let mine = open_batch_change(&store, "shared-name", Namespace::User(alice.id), alice.id).await;
    let theirs = open_batch_change(&store, "shared-name", Namespace::Org(acme.id), alice.id).await;

    let got = store
        .get_batch_change(&GetBatchChangeOpts {
            namespace: Some(Namespace::Org(acme.id)),
            name: Some("shared-name".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(got.id, theirs.id);

    let got = store
        .get_batch_change(&GetBatchChangeOpts {
            batch_spec_id: Some(mine.batch_spec_id),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(got.id, mine.id);

    let err = store.get_batch_change(&by_id(9999)).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound));
}

#[tokio::test]
async fn upsert_updates_in_place() {
    let (store, clock) = setup_store().await;
    let alice = store.create_user("alice", false).await.unwrap();
    let first = batch_spec(&store, Namespace::User(alice.id), alice.id).await;
    let second = batch_spec(&store, Namespace::User(alice.id), alice.id).await;

    let mut original = BatchChange::draft("upserted", Namespace::User(alice.id), first.id);
    store.upsert_batch_change(&mut original).await.unwrap();

    clock.advance(Duration::hours(1));
    let mut again = BatchChange::draft("upserted", Namespace::User(alice.id), second.id);
    again.apply(second.id, alice.id, store.now());
    store.upsert_batch_change(&mut again).await.unwrap();

    assert_eq!(again.id, original.id);
    assert_eq!(again.created_at, original.created_at);
    assert!(again.updated_at > original.updated_at);

    let stored = store.get_batch_change(&by_id(original.id)).await.unwrap();
    assert_eq!(stored.batch_spec_id, second.id);
    assert_eq!(stored.state(), BatchChangeState::Open);
    assert_eq!(stored.creator_id, Some(alice.id));
    assert_eq!(
        store
            .count_batch_changes(&Actor::Internal, &ListBatchChangesOpts::default())
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn invalid_name_is_rejected() {
    let (store, _clock) = setup_store().await;
    let alice = store.create_user("alice", false).await.unwrap();
    let spec = batch_spec(&store, Namespace::User(alice.id), alice.id).await;

    let mut bc = BatchChange::draft("Invalid name", Namespace::User(alice.id), spec.id);
    let err = store.create_batch_change(&mut bc).await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidName), "{err:?}");

    let mut bc = BatchChange::draft("Invalid name", Namespace::User(alice.id), spec.id);
    let err = store.upsert_batch_change(&mut bc).await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidName), "{err:?}");
}

#[tokio::test]
async fn update_and_delete_missing_rows_are_not_found() {
    let (store, _clock) = setup_store().await;
    let alice = store.create_user("alice", false).await.unwrap();
    let mut ghost = BatchChange::draft("ghost", Namespace::User(alice.id), 1);
    ghost.id = 42;
    assert!(matches!(
        store.update_batch_change(&mut ghost).await,
        Err(StoreError::NotFound)
    ));
    assert!(matches!(
        store.delete_batch_change(42).await,
        Err(StoreError::NotFound)
    ));

    let bc = open_batch_change(&store, "real", Namespace::User(alice.id), alice.id).await;
    store.delete_batch_change(bc.id).await.unwrap();
    assert!(matches!(
        store.get_batch_change(&by_id(bc.id)).await,
        Err(StoreError::NotFound)
    ));
}

#[tokio::test]
async fn lifecycle_draft_open_closed() {
    let (store, clock) = setup_store().await;
    let alice = store.create_user("alice", false).await.unwrap();
    let acme = store.create_org("acme").await.unwrap();
    let spec = batch_spec(&store, Namespace::Org(acme.id), alice.id).await;
    let mut bc = BatchChange::draft("lifecycle", Namespace::Org(acme.id), spec.id);
    store.create_batch_change(&mut bc).await.unwrap();
    assert_eq!(bc.creator_id, None);

    let in_state = |state| ListBatchChangesOpts {
        states: vec![state],
        ..Default::default()
    };
    let count = |opts: ListBatchChangesOpts| {
        let store = store.clone();
        async move { store.count_batch_changes(&Actor::Internal, &opts).await.unwrap() }
    };

    assert_eq!(count(in_state(BatchChangeState::Draft)).await, 1);
    assert_eq!(count(in_state(BatchChangeState::Open)).await, 0);

    clock.advance(Duration::minutes(1));
    bc.apply(spec.id, alice.id, store.now());
    store.update_batch_change(&mut bc).await.unwrap();
    assert_eq!(count(in_state(BatchChangeState::Draft)).await, 0);
    assert_eq!(count(in_state(BatchChangeState::Open)).await, 1);

    clock.advance(Duration::minutes(1));
    bc.closed_at = Some(store.now());
    store.update_batch_change(&mut bc).await.unwrap();
    assert_eq!(count(in_state(BatchChangeState::Open)).await, 0);
    assert_eq!(count(in_state(BatchChangeState::Closed)).await, 1);
    let stored = store.get_batch_change(&by_id(bc.id)).await.unwrap();
    assert_eq!(stored.state(), BatchChangeState::Closed);
}

#[tokio::test]
async fn state_filters_partition_and_collapse_duplicates() {
    let (store, _clock) = setup_store().await;
    let alice = store.create_user("alice", false).await.unwrap();
    let ns = Namespace::User(alice.id);

    let spec = batch_spec(&store, ns, alice.id).await;
    let mut draft = BatchChange::draft("draft", ns, spec.id);
    store.create_batch_change(&mut draft).await.unwrap();
    open_batch_change(&store, "open", ns, alice.id).await;
    let mut closed = open_batch_change(&store, "closed", ns, alice.id).await;
    closed.closed_at = Some(store.now());
    store.update_batch_change(&mut closed).await.unwrap();

    let count = |states: Vec<BatchChangeState>| {
        let store = store.clone();
        async move {
            store
                .count_batch_changes(
                    &Actor::Internal,
                    &ListBatchChangesOpts {
                        states,
                        ..Default::default()
                    },
                )
                .await
                .unwrap()
        }
    };

    let unfiltered = count(vec![]).await;
    assert_eq!(unfiltered, 3);
    assert_eq!(
        count(vec![
            BatchChangeState::Draft,
            BatchChangeState::Open,
            BatchChangeState::Closed
        ])
        .await,
        unfiltered
    );
    assert_eq!(
        count(vec![BatchChangeState::Open, BatchChangeState::Open]).await,
        count(vec![BatchChangeState::Open]).await
    );
    assert_eq!(
        count(vec![BatchChangeState::Draft, BatchChangeState::Closed]).await,
        2
    );
}

#[tokio::test]
async fn soft_deleted_namespace_hides_batch_changes() {
    let (store, _clock) = setup_store().await;
    let alice = store.create_user("alice", false).await.unwrap();
    let bob = store.create_user("bob", false).await.unwrap();
    let acme = store.create_org("acme").await.unwrap();

    let alices = open_batch_change(&store, "alices", Namespace::User(alice.id), alice.id).await;
    let orgs = open_batch_change(&store, "orgs", Namespace::Org(acme.id), alice.id).await;
    open_batch_change(&store, "bobs", Namespace::User(bob.id), bob.id).await;

    store.soft_delete_user(alice.id).await.unwrap();

    let err = store.get_batch_change(&by_id(alices.id)).await.unwrap_err();
    assert!(matches!(err, StoreError::DeletedNamespace), "{err:?}");

    // The creator being deleted does not hide an org-owned batch change.
    let got = store.get_batch_change(&by_id(orgs.id)).await.unwrap();
    assert_eq!(got.namespace, Namespace::Org(acme.id));

    let (listed, _) = store
        .list_batch_changes(&Actor::Internal, &ListBatchChangesOpts::default())
        .await
        .unwrap();
    let names: Vec<_> = listed.iter().map(|bc| bc.name.as_str()).collect();
    assert_eq!(names, vec!["bobs", "orgs"]);
    assert_eq!(
        store
            .count_batch_changes(&Actor::Internal, &ListBatchChangesOpts::default())
            .await
            .unwrap(),
        2
    );

    store.soft_delete_org(acme.id).await.unwrap();
    let err = store.get_batch_change(&by_id(orgs.id)).await.unwrap_err();
    assert!(matches!(err, StoreError::DeletedNamespace), "{err:?}");
}

#[tokio::test]
async fn hard_deleted_namespace_removes_batch_changes() {
    let (store, _clock) = setup_store().await;
    let alice = store.create_user("alice", false).await.unwrap();
    let acme = store.create_org("acme").await.unwrap();
    let alices = open_batch_change(&store, "alices", Namespace::User(alice.id), alice.id).await;
    let orgs = open_batch_change(&store, "orgs", Namespace::Org(acme.id), alice.id).await;

    store.hard_delete_org(acme.id).await.unwrap();
    let err = store.get_batch_change(&by_id(orgs.id)).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound), "{err:?}");

    store.hard_delete_user(alice.id).await.unwrap();
    let err = store.get_batch_change(&by_id(alices.id)).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound), "{err:?}");
    assert_eq!(
        store
            .count_batch_changes(&Actor::Internal, &ListBatchChangesOpts::default())
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn hard_deleting_a_user_keeps_org_batch_changes_they_applied() {
    let (store, _clock) = setup_store().await;
    let alice = store.create_user("alice", false).await.unwrap();
    let acme = store.create_org("acme").await.unwrap();
    let alices = open_batch_change(&store, "alices", Namespace::User(alice.id), alice.id).await;
    let orgs = open_batch_change(&store, "orgs", Namespace::Org(acme.id), alice.id).await;
    assert_eq!(orgs.last_applier_id, Some(alice.id));

    store.hard_delete_user(alice.id).await.unwrap();

    let err = store.get_batch_change(&by_id(alices.id)).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound), "{err:?}");
    let got = store.get_batch_change(&by_id(orgs.id)).await.unwrap();
    assert_eq!(got.namespace, Namespace::Org(acme.id));
    assert_eq!(got.creator_id, None);
    assert_eq!(got.last_applier_id, None);
    assert_eq!(
        store
            .count_batch_changes(&Actor::Internal, &ListBatchChangesOpts::default())
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn administered_by_includes_org_memberships() {
    let (store, _clock) = setup_store().await;
    let alice = store.create_user("alice", false).await.unwrap();
    let bob = store.create_user("bob", false).await.unwrap();
    let acme = store.create_org("acme").await.unwrap();
    let other = store.create_org("other").await.unwrap();
    store.add_org_member(acme.id, alice.id).await.unwrap();

    let own = open_batch_change(&store, "own", Namespace::User(alice.id), alice.id).await;
    let via_org = open_batch_change(&store, "via-org", Namespace::Org(acme.id), bob.id).await;
    open_batch_change(&store, "bobs", Namespace::User(bob.id), bob.id).await;
    open_batch_change(&store, "other-org", Namespace::Org(other.id), bob.id).await;

    let (listed, _) = store
        .list_batch_changes(
            &Actor::Internal,
            &ListBatchChangesOpts {
                only_administered_by_user_id: Some(alice.id),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let ids: Vec<_> = listed.iter().map(|bc| bc.id).collect();
    assert_eq!(ids, vec![via_org.id, own.id]);
}

#[tokio::test]
async fn drafts_only_visible_to_their_owners() {
    let (store, _clock) = setup_store().await;
    let alice = store.create_user("alice", false).await.unwrap();
    let bob = store.create_user("bob", false).await.unwrap();
    let acme = store.create_org("acme").await.unwrap();

    let alice_spec = batch_spec(&store, Namespace::User(alice.id), alice.id).await;
    let mut alice_draft = BatchChange::draft("alice-draft", Namespace::User(alice.id), alice_spec.id);
    store.create_batch_change(&mut alice_draft).await.unwrap();

    // Org draft authored by bob.
    let org_spec = batch_spec(&store, Namespace::Org(acme.id), bob.id).await;
    let mut org_draft = BatchChange::draft("org-draft", Namespace::Org(acme.id), org_spec.id);
    store.create_batch_change(&mut org_draft).await.unwrap();

    let applied = open_batch_change(&store, "applied", Namespace::User(alice.id), alice.id).await;

    let visible_to = |user_id: i64| {
        let store = store.clone();
        async move {
            let (listed, _) = store
                .list_batch_changes(
                    &Actor::User(user_id),
                    &ListBatchChangesOpts {
                        exclude_drafts_not_owned_by_user_id: Some(user_id),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            listed.into_iter().map(|bc| bc.id).collect::<Vec<_>>()
        }
    };

    assert_eq!(visible_to(alice.id).await, vec![applied.id, alice_draft.id]);
    assert_eq!(visible_to(bob.id).await, vec![applied.id, org_draft.id]);
}

#[tokio::test]
async fn list_pages_newest_first() {
    let (store, _clock) = setup_store().await;
    let alice = store.create_user("alice", false).await.unwrap();
    let ns = Namespace::User(alice.id);
    let a = open_batch_change(&store, "a", ns, alice.id).await;
    let b = open_batch_change(&store, "b", ns, alice.id).await;
    let c = open_batch_change(&store, "c", ns, alice.id).await;

    let mut opts = ListBatchChangesOpts {
        limit: Some(2),
        ..Default::default()
    };
    let (page, next) = store.list_batch_changes(&Actor::Internal, &opts).await.unwrap();
    assert_eq!(page.iter().map(|bc| bc.id).collect::<Vec<_>>(), vec![c.id, b.id]);
    assert_eq!(next, Some(a.id));

    opts.cursor = next;
    let (page, next) = store.list_batch_changes(&Actor::Internal, &opts).await.unwrap();
    assert_eq!(page.iter().map(|bc| bc.id).collect::<Vec<_>>(), vec![a.id]);
    assert_eq!(next, None);
}

#[tokio::test]
async fn list_by_changeset_and_repo() {
    let (store, _clock) = setup_store().await;
    let alice = store.create_user("alice", false).await.unwrap();
    let ns = Namespace::User(alice.id);
    let with_changeset = open_batch_change(&store, "with-changeset", ns, alice.id).await;
    open_batch_change(&store, "without", ns, alice.id).await;

    let repo = store.create_repo("github.com/acme/api", false).await.unwrap();
    let mut cs = synced_changeset(repo.id, "12", ExternalState::Open, with_changeset.id);
    store.create_changeset(&mut cs).await.unwrap();

    let by_changeset = ListBatchChangesOpts {
        changeset_id: Some(cs.id),
        ..Default::default()
    };
    let (listed, _) = store.list_batch_changes(&Actor::Internal, &by_changeset).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, with_changeset.id);

    let by_repo = ListBatchChangesOpts {
        repo_id: Some(repo.id),
        ..Default::default()
    };
    assert_eq!(store.count_batch_changes(&Actor::Internal, &by_repo).await.unwrap(), 1);

    store.soft_delete_repo(repo.id).await.unwrap();
    assert_eq!(store.count_batch_changes(&Actor::Internal, &by_repo).await.unwrap(), 0);
}

#[tokio::test]
async fn diff_stats_respect_repo_access() {
    let (store, _clock) = setup_store().await;
    let alice = store.create_user("alice", false).await.unwrap();
    let public = store.create_repo("github.com/acme/public", false).await.unwrap();
    let secret = store.create_repo("github.com/acme/secret", true).await.unwrap();
    let store = store.with_authz(Arc::new(RestrictedAuthz::default().allow(alice.id, &[public.id])));

    let bc = open_batch_change(&store, "stats", Namespace::User(alice.id), alice.id).await;
    for (repo_id, ext, added, deleted) in [(public.id, "1", 10, 2), (secret.id, "2", 5, 5)] {
        let mut cs = synced_changeset(repo_id, ext, ExternalState::Open, bc.id);
        cs.diff_stat_added = Some(added);
        cs.diff_stat_deleted = Some(deleted);
        store.create_changeset(&mut cs).await.unwrap();
    }

    let all = store.get_batch_change_diff_stat(&Actor::Internal, bc.id).await.unwrap();
    assert_eq!(all, DiffStat { added: 15, deleted: 7 });
    let visible = store
        .get_batch_change_diff_stat(&Actor::User(alice.id), bc.id)
        .await
        .unwrap();
    assert_eq!(visible, DiffStat { added: 10, deleted: 2 });

    assert_eq!(
        store.get_repo_diff_stat(&Actor::User(alice.id), public.id).await.unwrap(),
        Some(DiffStat { added: 10, deleted: 2 })
    );
    assert_eq!(
        store.get_repo_diff_stat(&Actor::User(alice.id), secret.id).await.unwrap(),
        None
    );
}
