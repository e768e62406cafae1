use bundle_worker_core::contract::{
    Artifact, BuildState, CredentialStore, JobStatus, JobStore, NewBuildJob, SourceCoordinates,
};
use bundle_worker_core::credentials::TokenCipher;
use bundle_worker_core::error::StoreError;
use bundle_worker_core::store::SqliteStore;
use tempfile::tempdir;

const KEY: &[u8; 32] = b"0123456789abcdef0123456789abcdef";

fn new_job(version: &str) -> NewBuildJob {
    NewBuildJob {
        component_id: "cmp-1".into(),
        component: "btn".into(),
        version: version.into(),
        owner_id: "user-1".into(),
        source: SourceCoordinates {
            owner: "acme".into(),
            repo: "ui".into(),
            path: "packages/button".into(),
            reference: "main".into(),
            commit: String::new(),
        },
    }
}

#[tokio::test]
async fn enqueue_then_get() {
    let store = SqliteStore::in_memory().await.unwrap();
    let job = store.enqueue(new_job("1.0.0")).await.unwrap();

    assert_eq!(job.status, JobStatus::Queued);
    assert!(job.started_at.is_none());
    assert!(job.artifact.is_none());

    let fetched = store.get(&job.id).await.unwrap().unwrap();
    assert_eq!(fetched, job);
    assert_eq!(fetched.source.path, "packages/button");
    assert!(store.get("missing").await.unwrap().is_none());
}

#[tokio::test]
async fn claim_is_fifo_and_drains() {
    let store = SqliteStore::in_memory().await.unwrap();
    let first = store.enqueue(new_job("1.0.0")).await.unwrap();
    let second = store.enqueue(new_job("1.0.1")).await.unwrap();
    assert_eq!(store.count_queued().await.unwrap(), 2);

    let claimed = store.claim_next().await.unwrap().unwrap();
    assert_eq!(claimed.id, first.id);
    assert_eq!(claimed.status, JobStatus::Running);
    assert!(claimed.started_at.is_some());

    assert_eq!(store.claim_next().await.unwrap().unwrap().id, second.id);
    assert!(store.claim_next().await.unwrap().is_none());
    assert_eq!(store.count_queued().await.unwrap(), 0);
}

#[tokio::test]
async fn two_workers_never_claim_the_same_job() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("jobs.db");
    let a = SqliteStore::open_file(&path).await.unwrap();
    let b = SqliteStore::open_file(&path).await.unwrap();
    a.enqueue(new_job("1.0.0")).await.unwrap();

    let (left, right) = tokio::join!(a.claim_next(), b.claim_next());
    let claims: Vec<_> = [left.unwrap(), right.unwrap()]
        .into_iter()
        .flatten()
        .collect();
    assert_eq!(claims.len(), 1);
}

#[tokio::test]
async fn terminal_transitions_only_from_running() {
    let store = SqliteStore::in_memory().await.unwrap();
    let job = store.enqueue(new_job("1.0.0")).await.unwrap();

    let artifact = Artifact {
        bundle_url: "https://cdn.test/components/btn/1.0.0/index.html".into(),
    };
    let err = store.complete(&job.id, artifact.clone()).await.unwrap_err();
    assert!(matches!(err, StoreError::Transition { .. }), "{err}");

    store.claim_next().await.unwrap().unwrap();
    store.complete(&job.id, artifact.clone()).await.unwrap();

    let err = store.fail(&job.id).await.unwrap_err();
    assert!(matches!(err, StoreError::Transition { .. }), "{err}");

    let done = store.get(&job.id).await.unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Success);
    assert_eq!(done.artifact, Some(artifact));
    assert!(done.ended_at.is_some());
}

#[tokio::test]
async fn failed_job_has_no_artifact() {
    let store = SqliteStore::in_memory().await.unwrap();
    let job = store.enqueue(new_job("1.0.0")).await.unwrap();
    store.claim_next().await.unwrap().unwrap();
    store.fail(&job.id).await.unwrap();

    let done = store.get(&job.id).await.unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Error);
    assert!(done.artifact.is_none());
    assert!(done.ended_at.is_some());
}

#[tokio::test]
async fn log_lines_keep_append_order() {
    let store = SqliteStore::in_memory().await.unwrap();
    let job = store.enqueue(new_job("1.0.0")).await.unwrap();
    for i in 0..20 {
        store.append_log(&job.id, &format!("line {i}")).await.unwrap();
    }

    let logs = store.get(&job.id).await.unwrap().unwrap().logs;
    let expected: Vec<String> = (0..20).map(|i| format!("line {i}")).collect();
    assert_eq!(logs, expected);
}

#[tokio::test]
async fn version_state_keeps_preview_url() {
    let store = SqliteStore::in_memory().await.unwrap();
    assert!(store.version("cmp-1", "1.0.0").await.unwrap().is_none());

    store
        .set_version_state("cmp-1", "1.0.0", BuildState::Ready, Some("https://u".into()))
        .await
        .unwrap();
    store
        .set_version_state("cmp-1", "1.0.0", BuildState::Running, None)
        .await
        .unwrap();

    let record = store.version("cmp-1", "1.0.0").await.unwrap().unwrap();
    assert_eq!(record.build_state, BuildState::Running);
    assert_eq!(record.preview_url.as_deref(), Some("https://u"));
}

#[tokio::test]
async fn stored_tokens_are_encrypted_and_recovered() {
    let store = SqliteStore::in_memory().await.unwrap();
    let credentials = store.credentials(Some(TokenCipher::from_key(KEY).unwrap()));
    credentials.put_user_token("user-1", "ghp_secret").await.unwrap();

    assert_eq!(
        credentials.access_token("user-1").await.unwrap().as_deref(),
        Some("ghp_secret")
    );
    assert_eq!(credentials.access_token("user-2").await.unwrap(), None);

    // Without the key the token is unusable, not an error.
    let keyless = store.credentials(None);
    assert_eq!(keyless.access_token("user-1").await.unwrap(), None);
    let err = keyless.put_user_token("user-1", "x").await.unwrap_err();
    assert!(matches!(err, StoreError::MissingKey));

    // A different key cannot decrypt it either.
    let other = store.credentials(Some(
        TokenCipher::from_key(b"ffffffffffffffffffffffffffffffff").unwrap(),
    ));
    assert_eq!(other.access_token("user-1").await.unwrap(), None);
}

#[tokio::test]
async fn reopening_a_file_database_keeps_jobs() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("jobs.db");
    let id = {
        let store = SqliteStore::open_file(&path).await.unwrap();
        store.enqueue(new_job("1.0.0")).await.unwrap().id
    };

    let store = SqliteStore::open_file(&path).await.unwrap();
    assert_eq!(store.get(&id).await.unwrap().unwrap().status, JobStatus::Queued);
}
