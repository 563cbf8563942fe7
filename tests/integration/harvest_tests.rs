//! Integration tests for the harvester
//!
//! These tests use wiremock to stand in for the feed API and run whole
//! tasks end-to-end against an on-disk SQLite database.

use qa_harvester::config::{parse_config, Config};
use qa_harvester::crawler::{HttpFeedSource, TaskOutcome};
use qa_harvester::credentials::PoolSettings;
use qa_harvester::state::{ResumeStrategy, StageState};
use qa_harvester::storage::{lock_storage, EntityKind, SqliteStorage, Storage};
use qa_harvester::{CredentialBundle, CredentialPool, Orchestrator};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn create_test_config(base_url: &str, db_path: &str) -> Config {
    parse_config(&format!(
        r#"
[crawler]
max-concurrency = 2
page-size = 2
inter-request-delay-min-ms = 0
inter-request-delay-max-ms = 0
replenish-wait-secs = 0

[api]
search-url = "{base}/search"
children-url = "{base}/questions/{{parent_id}}/feeds"
parent-page-url = "{base}/question/{{parent_id}}"
request-timeout-secs = 5

[retry]
max-attempts = 0
initial-delay-ms = 1
max-delay-ms = 1

[output]
database-path = "{db}"
"#,
        base = base_url,
        db = db_path
    ))
    .expect("Failed to parse test config")
}

fn question(id: &str) -> Value {
    json!({"type": "search_result", "object": {"type": "question", "id": id, "title": format!("<em>Question</em> {}", id)}})
}

fn answer(parent_id: &str, id: &str, content: &str) -> Value {
    json!({
        "target_type": "answer",
        "target": {
            "id": id,
            "content": content,
            "voteup_count": 3,
            "author": {"name": "someone"},
            "question": {"id": parent_id, "title": format!("Full {}", parent_id), "follower_count": 7}
        }
    })
}

fn feed_page(items: Vec<Value>, next: Option<String>, is_end: bool) -> Value {
    json!({
        "data": items,
        "paging": {"is_end": is_end, "next": next, "totals": 3}
    })
}

async fn mount_children(server: &MockServer, parent_id: &str, items: Vec<Value>) {
    Mock::given(method("GET"))
        .and(path(format!("/questions/{}/feeds", parent_id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(feed_page(items, None, true)))
        .mount(server)
        .await;
}

async fn mount_second_search_page(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/search"))
        .and(query_param("offset", "2"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(feed_page(vec![question("q3")], None, true)),
        )
        .mount(server)
        .await;
}

async fn mount_all_children(server: &MockServer) {
    mount_children(
        server,
        "q1",
        vec![answer("q1", "a1", "first answer"), answer("q1", "a2", "shared text")],
    )
    .await;
    mount_children(server, "q2", vec![answer("q2", "a3", "shared text")]).await;
    mount_children(
        server,
        "q3",
        vec![answer("q3", "a4", "third answer"), answer("q3", "a5", "fourth answer")],
    )
    .await;
}

fn seeded_pool(sessions: &[&str]) -> Arc<CredentialPool> {
    let pool = Arc::new(CredentialPool::new(PoolSettings::default()));
    let now = chrono::Utc::now();
    // Later entries are newer and win ties
    for (i, session) in sessions.iter().enumerate() {
        pool.add_at(
            CredentialBundle::new()
                .with_header("x-session", *session)
                .with_session_id(*session),
            now - chrono::Duration::seconds((sessions.len() - i) as i64),
        );
    }
    pool
}

fn build_orchestrator(
    config: Config,
    storage: Arc<Mutex<SqliteStorage>>,
    pool: Arc<CredentialPool>,
) -> Orchestrator<SqliteStorage> {
    let feed = HttpFeedSource::from_config(&config).expect("Failed to build feed source");
    Orchestrator::new(config, storage, pool, Arc::new(feed))
}

fn open(dir: &TempDir) -> (String, Arc<Mutex<SqliteStorage>>) {
    let db_path = dir.path().join("harvest.db");
    let storage = SqliteStorage::new(&db_path).expect("Failed to open storage");
    (
        db_path.to_string_lossy().into_owned(),
        Arc::new(Mutex::new(storage)),
    )
}

#[tokio::test]
async fn test_full_harvest_two_stages() {
    let server = MockServer::start().await;
    let base_url = server.uri();

    Mock::given(method("GET"))
        .and(path("/search"))
        .and(query_param("q", "rust"))
        .and(query_param("offset", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(feed_page(
            vec![question("q1"), question("q2")],
            Some(format!("{}/search?q=rust&limit=2&offset=2", base_url)),
            false,
        )))
        .expect(1)
        .mount(&server)
        .await;
    mount_second_search_page(&server).await;
    mount_all_children(&server).await;

    let dir = TempDir::new().unwrap();
    let (db_path, storage) = open(&dir);
    let config = create_test_config(&base_url, &db_path);
    let orchestrator = build_orchestrator(config, storage.clone(), seeded_pool(&["good"]));

    let task = orchestrator.create_task("rust", None, None).unwrap();
    let summary = orchestrator
        .run_task(&task.id, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.outcome, TaskOutcome::Completed);
    assert_eq!(summary.progress.discovered, 3);
    assert_eq!(summary.progress.parents, 3);
    assert_eq!(summary.progress.parents_processed, 3);
    // "shared text" is stored once per task
    assert_eq!(summary.progress.children, 4);
    assert_eq!(summary.progress.unique_children, 4);

    let stored = lock_storage(&storage).get_task(&task.id).unwrap().unwrap();
    assert_eq!(stored.discovery_state, StageState::Completed);
    assert_eq!(stored.content_state, StageState::Completed);
    assert_eq!(stored.discovery_checkpoint.page_index, 2);
    assert_eq!(stored.total_parents, 3);
    assert!(lock_storage(&storage)
        .list_unprocessed(EntityKind::Parent, &task.id, 10)
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_rejected_credential_is_rotated() {
    let server = MockServer::start().await;
    let base_url = server.uri();

    Mock::given(method("GET"))
        .and(header("x-session", "bad"))
        .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .and(header("x-session", "good"))
        .and(query_param("offset", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(feed_page(
            vec![question("q1")],
            None,
            true,
        )))
        .mount(&server)
        .await;
    mount_children(&server, "q1", vec![answer("q1", "a1", "only answer")]).await;

    let dir = TempDir::new().unwrap();
    let (db_path, storage) = open(&dir);
    let config = create_test_config(&base_url, &db_path);
    // "bad" is newest, so it is tried first
    let pool = seeded_pool(&["good", "bad"]);
    let orchestrator = build_orchestrator(config, storage.clone(), pool.clone());

    let task = orchestrator.create_task("rust", None, None).unwrap();
    let summary = orchestrator
        .run_task(&task.id, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.outcome, TaskOutcome::Completed);
    assert_eq!(summary.progress.children, 1);

    let detections = lock_storage(&storage).detection_summary(&task.id).unwrap();
    assert_eq!(detections, vec![("ip_block".to_string(), 1)]);
    assert!(orchestrator.tracker().stats().failed_requests >= 1);
}

#[tokio::test]
async fn test_exhausted_pool_fails_stage() {
    let server = MockServer::start().await;
    let base_url = server.uri();

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let (db_path, storage) = open(&dir);
    let config = create_test_config(&base_url, &db_path);
    let orchestrator = build_orchestrator(config, storage.clone(), seeded_pool(&["expired"]));

    let task = orchestrator.create_task("rust", None, None).unwrap();
    let summary = orchestrator
        .run_task(&task.id, &CancellationToken::new())
        .await
        .unwrap();

    assert!(matches!(summary.outcome, TaskOutcome::Failed { .. }));
    let stored = lock_storage(&storage).get_task(&task.id).unwrap().unwrap();
    assert_eq!(stored.discovery_state, StageState::Failed);
    assert!(stored.last_error.is_some());
    assert_eq!(
        lock_storage(&storage).detection_summary(&task.id).unwrap(),
        vec![("session_expired".to_string(), 1)]
    );
}

#[tokio::test]
async fn test_resume_continues_from_checkpoint() {
    let server = MockServer::start().await;
    let base_url = server.uri();

    let first_page = || {
        Mock::given(method("GET"))
            .and(path("/search"))
            .and(query_param("offset", "0"))
    };
    first_page()
        .respond_with(ResponseTemplate::new(200).set_body_json(feed_page(
            vec![question("q1"), question("q2")],
            Some(format!("{}/search?limit=2&offset=2", base_url)),
            false,
        )))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .and(query_param("offset", "2"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let (db_path, storage) = open(&dir);
    let config = create_test_config(&base_url, &db_path);
    let orchestrator = build_orchestrator(config.clone(), storage.clone(), seeded_pool(&["s1"]));

    let task = orchestrator.create_task("rust", None, None).unwrap();
    let summary = orchestrator
        .run_task(&task.id, &CancellationToken::new())
        .await
        .unwrap();
    assert!(matches!(summary.outcome, TaskOutcome::Failed { .. }));

    let stored = lock_storage(&storage).get_task(&task.id).unwrap().unwrap();
    assert_eq!(stored.discovery_checkpoint.page_index, 1);
    assert_eq!(stored.discovery_checkpoint.offset, 2);
    assert_eq!(summary.progress.discovered, 2);

    // The service recovers; the first page must not be fetched again
    server.reset().await;
    first_page()
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;
    mount_second_search_page(&server).await;
    mount_all_children(&server).await;

    let resumed = build_orchestrator(config, storage.clone(), seeded_pool(&["s2"]));
    let summaries = resumed
        .resume_interrupted(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].strategy, ResumeStrategy::ResumeDiscovery);
    assert_eq!(summaries[0].outcome, TaskOutcome::Completed);
    assert_eq!(summaries[0].progress.discovered, 3);
    assert_eq!(summaries[0].progress.children, 4);
    assert!(lock_storage(&storage)
        .list_interrupted_tasks()
        .unwrap()
        .is_empty());
}
