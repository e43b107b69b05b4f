mod common;

use batch_changes::db::{GetResolutionJobOpts, ListResolutionJobsOpts};
use batch_changes::model::{BatchSpecResolutionJob, JobState};
use batch_changes::namespace::Namespace;
use batch_changes::worker::{Disposition, QueueRecord, WorkerStoreOptions};
use batch_changes::StoreError;
use common::{batch_spec, setup_store, start_time};

#[tokio::test]
async fn one_job_per_batch_spec() {
    let (store, _clock) = setup_store().await;
    let alice = store.create_user("alice", false).await.unwrap();
    let spec = batch_spec(&store, Namespace::User(alice.id), alice.id).await;

    let mut job = BatchSpecResolutionJob::new(spec.id, alice.id);
    store.create_batch_spec_resolution_job(&mut job).await.unwrap();
    assert!(job.id > 0);
    assert_eq!(job.queued_at, Some(start_time()));

    let mut again = BatchSpecResolutionJob::new(spec.id, alice.id);
    let err = store
        .create_batch_spec_resolution_job(&mut again)
        .await
        .unwrap_err();
    match err {
        StoreError::DuplicateResolutionJob { batch_spec_id } => assert_eq!(batch_spec_id, spec.id),
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn get_and_list_jobs() {
    let (store, _clock) = setup_store().await;
    let alice = store.create_user("alice", false).await.unwrap();
    let first = batch_spec(&store, Namespace::User(alice.id), alice.id).await;
    let second = batch_spec(&store, Namespace::User(alice.id), alice.id).await;

    let mut queued = BatchSpecResolutionJob::new(first.id, alice.id);
    store.create_batch_spec_resolution_job(&mut queued).await.unwrap();
    let mut done = BatchSpecResolutionJob::new(second.id, alice.id);
    done.state = JobState::Completed;
    store.create_batch_spec_resolution_job(&mut done).await.unwrap();

    let got = store
        .get_batch_spec_resolution_job(&GetResolutionJobOpts {
            batch_spec_id: Some(second.id),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(got, done);

    let err = store
        .get_batch_spec_resolution_job(&GetResolutionJobOpts {
            id: Some(done.id + 10),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound));

    let all = store
        .list_batch_spec_resolution_jobs(&ListResolutionJobsOpts::default())
        .await
        .unwrap();
    assert_eq!(all.iter().map(|j| j.id).collect::<Vec<_>>(), vec![queued.id, done.id]);

    let pending = store
        .list_batch_spec_resolution_jobs(&ListResolutionJobsOpts {
            state: Some(JobState::Queued),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, queued.id);
}

#[tokio::test]
async fn worker_columns_scan_into_jobs() {
    let (store, _clock) = setup_store().await;
    let alice = store.create_user("alice", false).await.unwrap();
    let spec = batch_spec(&store, Namespace::User(alice.id), alice.id).await;
    let mut job = BatchSpecResolutionJob::new(spec.id, alice.id);
    store.create_batch_spec_resolution_job(&mut job).await.unwrap();

    sqlx::query(
        "UPDATE batch_spec_resolution_jobs SET state = 'processing', worker_hostname = 'worker-1', \
         last_heartbeat_at = ?, execution_logs = ? WHERE id = ?",
    )
    .bind(start_time())
    .bind(
        r#"[{"key":"resolve","command":["src","batch","resolve"],"startTime":"2024-06-01T12:00:00Z","exitCode":0,"out":"ok","durationMs":1200}]"#,
    )
    .bind(job.id)
    .execute(store.pool())
    .await
    .unwrap();

    let opts = WorkerStoreOptions::batch_spec_resolution();
    let sql = format!(
        "SELECT {} FROM {} ORDER BY {}",
        opts.column_expressions.join(", "),
        opts.table_name,
        opts.order_by_expression
    );
    let row = sqlx::query(&sql).fetch_one(store.pool()).await.unwrap();
    let scanned = BatchSpecResolutionJob::from_row(&row).unwrap();
    assert_eq!(scanned.record_id(), job.id);
    assert_eq!(scanned.job_state(), JobState::Processing);
    assert_eq!(scanned.worker_hostname, "worker-1");
    assert_eq!(scanned.execution_logs.len(), 1);
    assert_eq!(scanned.execution_logs[0].exit_code, Some(0));
    assert_eq!(scanned.execution_logs[0].command, vec!["src", "batch", "resolve"]);

    let now = start_time() + chrono::Duration::seconds(30);
    assert_eq!(scanned.disposition(&opts, now), Disposition::Leased);
    let later = start_time() + chrono::Duration::seconds(120);
    assert_eq!(scanned.disposition(&opts, later), Disposition::Stalled);
}
