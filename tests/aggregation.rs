//! End-to-end aggregation tests against a local stub of the management API.
//!
//! The stub is a real axum server bound to an ephemeral port, so fetches,
//! probes and fan-out behavior are exercised over actual HTTP.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};

use opstower::fanout::FanoutAggregator;
use opstower::models::DataKind;
use opstower::orchestrator::CacheFirstOrchestrator;
use opstower::registry::{ServerDescriptor, ServerRegistry};
use opstower::remote_client::{AttemptOutcome, AuthVerdict, RemoteClient, ServerStatus};
use opstower::snapshot_store::{SnapshotOrigin, SnapshotStore};

#[derive(Default)]
struct StubState {
    /// Authenticated data requests served
    data_hits: AtomicU64,
    /// Requests to "/" (reachability probe target)
    root_hits: AtomicU64,
    /// Delay applied to the first "/" request only, for probe-retry tests
    first_root_delay_ms: AtomicU64,
    /// Currently executing data requests, and the high-water mark
    in_flight: AtomicI64,
    max_in_flight: AtomicI64,
    /// When set, authenticated endpoints answer 401
    reject_auth: AtomicBool,
}

async fn root(State(s): State<Arc<StubState>>) -> StatusCode {
    let n = s.root_hits.fetch_add(1, Ordering::SeqCst);
    if n == 0 {
        let delay = s.first_root_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }
    StatusCode::OK
}

async fn version_manifest() -> impl IntoResponse {
    let mut headers = HeaderMap::new();
    headers.insert(
        "X-MongoDB-Service-Version",
        "gitHash=abc123; versionString=7.0.11.500".parse().unwrap(),
    );
    (headers, Json(json!({})))
}

async fn orgs(State(s): State<Arc<StubState>>) -> impl IntoResponse {
    if s.reject_auth.load(Ordering::SeqCst) {
        return (StatusCode::UNAUTHORIZED, Json(json!({}))).into_response();
    }
    Json(json!({
        "results": [
            {"id": "org1", "name": "Org One", "isDeleted": false},
            {"id": "org2", "name": "Gone Org", "isDeleted": true}
        ]
    }))
    .into_response()
}

async fn org_groups() -> Json<Value> {
    Json(json!({"results": [{"id": "proj1", "name": "Project One"}]}))
}

async fn clusters() -> Json<Value> {
    Json(json!({
        "results": [
            {
                "id": "c1",
                "replicaSetName": "rs0",
                "lastHeartbeat": (Utc::now() - ChronoDuration::minutes(2)).to_rfc3339()
            },
            {"id": "c2", "clusterName": "shardedC", "shardName": "sh0"}
        ]
    }))
}

async fn backup_config() -> Json<Value> {
    Json(json!({
        "username": "backup-user",
        "statusName": "STARTED",
        "encryptionEnabled": true,
        "sslEnabled": false
    }))
}

async fn cluster_hosts() -> Json<Value> {
    Json(json!({"results": [{"id": "h1"}, {"id": "h2"}]}))
}

async fn host_detail(
    axum::extract::Path((_group, host_id)): axum::extract::Path<(String, String)>,
) -> Json<Value> {
    let (hostname, rs) = match host_id.as_str() {
        "h1" => ("db1.local", "rs0"),
        _ => ("db2.local", "rs0-shadow"),
    };
    Json(json!({
        "hostname": hostname,
        "port": 27017,
        "username": "mms-monitoring",
        "replicaSetName": rs,
        "lastPing": (Utc::now() - ChronoDuration::minutes(1)).to_rfc3339()
    }))
}

/// Data endpoint used by fan-out tests; counts hits and tracks the
/// in-flight high-water mark
async fn oplog_configs(State(s): State<Arc<StubState>>) -> Json<Value> {
    s.data_hits.fetch_add(1, Ordering::SeqCst);
    let now = s.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    s.max_in_flight.fetch_max(now, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(100)).await;
    s.in_flight.fetch_sub(1, Ordering::SeqCst);

    Json(json!({
        "results": [{"id": "oplog-1", "uri": "mongodb://oplog.local:27017"}]
    }))
}

/// Spawn the stub API on an ephemeral port; returns its base url
async fn spawn_stub() -> (String, Arc<StubState>) {
    let state = Arc::new(StubState::default());

    let app = Router::new()
        .route("/", get(root))
        .route("/api/public/v1.0/unauth/versionManifest", get(version_manifest))
        .route("/api/public/v1.0/orgs", get(orgs))
        .route("/api/public/v1.0/orgs/{org}/groups", get(org_groups))
        .route("/api/public/v1.0/groups/{group}/clusters", get(clusters))
        .route(
            "/api/public/v1.0/groups/{group}/backupConfigs/{cluster}",
            get(backup_config),
        )
        .route("/api/public/v1.0/groups/{group}/hosts", get(cluster_hosts))
        .route(
            "/api/public/v1.0/groups/{group}/hosts/{host}",
            get(host_detail),
        )
        .route(
            "/api/public/v1.0/admin/backup/oplog/mongoConfigs",
            get(oplog_configs),
        )
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{}", addr), state)
}

/// A base url that refuses connections immediately
async fn dead_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

fn descriptor(name: &str, url: &str) -> ServerDescriptor {
    ServerDescriptor {
        name: name.to_string(),
        url: url.to_string(),
        public_key: "pk".to_string(),
        private_key: "sk".to_string(),
        region: Some("us-east-1".to_string()),
        environment: Some("test".to_string()),
    }
}

async fn orchestrator_for(
    servers: Vec<ServerDescriptor>,
    cache_dir: &std::path::Path,
    freshness: Duration,
) -> CacheFirstOrchestrator {
    let registry = Arc::new(ServerRegistry::from_descriptors(servers).unwrap());
    let store = Arc::new(SnapshotStore::new(cache_dir.to_path_buf()).await.unwrap());
    let client = Arc::new(RemoteClient::new());
    let fanout = FanoutAggregator::new(client.clone(), store.clone())
        .with_fanout_timeout(Duration::from_secs(10));

    CacheFirstOrchestrator::new(registry, store, client, fanout).with_freshness(freshness)
}

#[tokio::test]
async fn partial_failure_isolates_the_dead_server() {
    let (stub_url, _state) = spawn_stub().await;
    let dead = dead_url().await;
    let dir = tempfile::tempdir().unwrap();

    let orchestrator = orchestrator_for(
        vec![
            descriptor("om-a", &stub_url),
            descriptor("om-b", &dead),
            descriptor("om-c", &stub_url),
        ],
        dir.path(),
        Duration::from_secs(300),
    )
    .await;

    let result = orchestrator.get_aggregate(DataKind::OplogStore, false).await;

    // Exactly one entry per server, no duplicates, no omissions
    assert_eq!(result.server_count(), 3);
    let mut succeeded: Vec<_> = result.succeeded.iter().map(|p| p.server.as_str()).collect();
    succeeded.sort();
    assert_eq!(succeeded, vec!["om-a", "om-c"]);

    assert_eq!(result.failed.len(), 1);
    assert_eq!(result.failed[0].server, "om-b");
    // The dead server's failure is typed, not an empty success
    assert!(!result.failed[0].message.is_empty());

    for payload in &result.succeeded {
        assert_eq!(payload.origin, SnapshotOrigin::LiveFetch);
        assert!(!payload.stale);
        assert_eq!(payload.records.len(), 1);
    }
}

#[tokio::test]
async fn fresh_cache_serves_without_network_calls() {
    let (stub_url, state) = spawn_stub().await;
    let dir = tempfile::tempdir().unwrap();

    let orchestrator = orchestrator_for(
        vec![
            descriptor("om-a", &stub_url),
            descriptor("om-b", &stub_url),
        ],
        dir.path(),
        Duration::from_secs(300),
    )
    .await;

    let first = orchestrator.get_aggregate(DataKind::OplogStore, false).await;
    assert_eq!(first.succeeded.len(), 2);
    let hits_after_first = state.data_hits.load(Ordering::SeqCst);
    assert_eq!(hits_after_first, 2);

    let second = orchestrator.get_aggregate(DataKind::OplogStore, false).await;
    assert_eq!(second.succeeded.len(), 2);
    assert_eq!(second.failed.len(), 0);

    // Idempotent: zero additional fetches on the second call
    assert_eq!(state.data_hits.load(Ordering::SeqCst), hits_after_first);
    for payload in &second.succeeded {
        assert_eq!(payload.origin, SnapshotOrigin::CachedCopy);
        assert!(!payload.stale);
    }
    assert_eq!(second.from_cache, 2);
    assert_eq!(second.fetched, 0);
}

#[tokio::test]
async fn force_refresh_bypasses_fresh_cache() {
    let (stub_url, state) = spawn_stub().await;
    let dir = tempfile::tempdir().unwrap();

    let orchestrator = orchestrator_for(
        vec![descriptor("om-a", &stub_url)],
        dir.path(),
        Duration::from_secs(300),
    )
    .await;

    orchestrator.get_aggregate(DataKind::OplogStore, false).await;
    let result = orchestrator.get_aggregate(DataKind::OplogStore, true).await;

    assert_eq!(state.data_hits.load(Ordering::SeqCst), 2);
    assert_eq!(result.succeeded.len(), 1);
    assert_eq!(result.succeeded[0].origin, SnapshotOrigin::LiveFetch);
}

#[tokio::test]
async fn failed_refresh_falls_back_to_stale_cache() {
    let (stub_url, _state) = spawn_stub().await;
    let dir = tempfile::tempdir().unwrap();

    // Seed the cache from the live stub, then point every descriptor at a
    // dead address and force a refresh.
    let seed = orchestrator_for(
        vec![
            descriptor("om-a", &stub_url),
            descriptor("om-b", &stub_url),
            descriptor("om-c", &stub_url),
        ],
        dir.path(),
        Duration::from_secs(300),
    )
    .await;
    let seeded = seed.get_aggregate(DataKind::OplogStore, false).await;
    assert_eq!(seeded.succeeded.len(), 3);

    let dead = dead_url().await;
    let broken = orchestrator_for(
        vec![
            descriptor("om-a", &dead),
            descriptor("om-b", &dead),
            descriptor("om-c", &dead),
        ],
        dir.path(),
        Duration::from_secs(300),
    )
    .await;

    let result = broken.get_aggregate(DataKind::OplogStore, true).await;

    // Stale data tagged as stale beats an empty result
    assert_eq!(result.succeeded.len(), 3);
    assert_eq!(result.failed.len(), 0);
    for payload in &result.succeeded {
        assert!(payload.stale);
        assert_eq!(payload.origin, SnapshotOrigin::CachedCopy);
        assert!(payload.refresh_error.is_some());
        assert_eq!(payload.records.len(), 1);
    }
}

#[tokio::test]
async fn all_failures_without_cache_enumerate_every_server() {
    let dead = dead_url().await;
    let dir = tempfile::tempdir().unwrap();

    let orchestrator = orchestrator_for(
        vec![
            descriptor("om-a", &dead),
            descriptor("om-b", &dead),
        ],
        dir.path(),
        Duration::from_secs(300),
    )
    .await;

    let result = orchestrator.get_aggregate(DataKind::OplogStore, false).await;

    assert_eq!(result.succeeded.len(), 0);
    assert_eq!(result.failed.len(), 2);
    let mut failed: Vec<_> = result.failed.iter().map(|f| f.server.as_str()).collect();
    failed.sort();
    assert_eq!(failed, vec!["om-a", "om-b"]);
    for failure in &result.failed {
        assert!(!failure.message.is_empty());
    }
}

#[tokio::test]
async fn fanout_concurrency_stays_bounded() {
    let (stub_url, state) = spawn_stub().await;
    let dir = tempfile::tempdir().unwrap();

    let servers: Vec<ServerDescriptor> = (0..25)
        .map(|i| descriptor(&format!("om-{:02}", i), &stub_url))
        .collect();

    let store = Arc::new(SnapshotStore::new(dir.path().to_path_buf()).await.unwrap());
    let client = Arc::new(RemoteClient::new());
    let fanout = FanoutAggregator::new(client, store)
        .with_fanout_timeout(Duration::from_secs(30));

    let result = fanout.refresh(&servers, DataKind::OplogStore).await;

    assert_eq!(result.server_count(), 25);
    assert_eq!(result.succeeded.len(), 25);
    assert_eq!(state.data_hits.load(Ordering::SeqCst), 25);

    let max = state.max_in_flight.load(Ordering::SeqCst);
    assert!(max <= 10, "observed {} concurrent fetches", max);
    // Sanity: the pool actually ran in parallel
    assert!(max > 1, "fetches never overlapped");
}

#[tokio::test]
async fn reachability_retry_recovers_on_second_attempt() {
    let (stub_url, state) = spawn_stub().await;

    // Scaled-down long-then-short pair: the first attempt times out against
    // the delayed first response, the second succeeds immediately.
    state.first_root_delay_ms.store(800, Ordering::SeqCst);
    let client = RemoteClient::new()
        .with_probe_timeouts(Duration::from_millis(500), Duration::from_millis(400));

    let probe = client
        .probe_reachability(&descriptor("om-slow", &stub_url))
        .await;

    assert!(probe.reachable);
    assert_eq!(probe.attempts.len(), 2);
    assert_eq!(probe.attempts[0].outcome, AttemptOutcome::Timeout);
    assert!(matches!(
        probe.attempts[1].outcome,
        AttemptOutcome::Success { http_status: 200 }
    ));
}

#[tokio::test]
async fn unreachable_server_records_both_attempts() {
    let dead = dead_url().await;
    let client = RemoteClient::new()
        .with_probe_timeouts(Duration::from_millis(500), Duration::from_millis(400));

    let probe = client
        .probe_reachability(&descriptor("om-dead", &dead))
        .await;

    assert!(!probe.reachable);
    assert_eq!(probe.attempts.len(), 2);
    assert_eq!(probe.attempts[0].attempt, 1);
    assert_eq!(probe.attempts[1].attempt, 2);
}

#[tokio::test]
async fn status_probe_distinguishes_rejected_credentials() {
    let (stub_url, state) = spawn_stub().await;
    state.reject_auth.store(true, Ordering::SeqCst);

    let client = RemoteClient::new();
    let probe = client.probe_status(&descriptor("om-noauth", &stub_url)).await;

    // Reached but rejected is not the same as unreachable
    assert!(probe.reachability.reachable);
    assert_eq!(probe.authentication.verdict, AuthVerdict::Rejected);
    assert_eq!(probe.status, ServerStatus::Unauthenticated);
}

#[tokio::test]
async fn status_probe_healthy_server_reports_version() {
    let (stub_url, _state) = spawn_stub().await;

    let client = RemoteClient::new();
    let probe = client.probe_status(&descriptor("om-ok", &stub_url)).await;

    assert_eq!(probe.status, ServerStatus::Healthy);
    assert_eq!(probe.authentication.verdict, AuthVerdict::Authenticated);
    assert_eq!(probe.version.as_deref(), Some("7.0.11.500"));
}

#[tokio::test]
async fn unreachable_server_skips_auth_probe() {
    let dead = dead_url().await;
    let client = RemoteClient::new()
        .with_probe_timeouts(Duration::from_millis(500), Duration::from_millis(400));

    let probe = client.probe_status(&descriptor("om-dead", &dead)).await;

    assert_eq!(probe.status, ServerStatus::Unreachable);
    assert_eq!(probe.authentication.verdict, AuthVerdict::NotChecked);
    assert!(probe.version.is_none());
}

#[tokio::test]
async fn backup_fetch_flattens_the_project_traversal() {
    let (stub_url, _state) = spawn_stub().await;
    let client = RemoteClient::new();

    let records = client
        .fetch(
            &descriptor("om-a", &stub_url),
            DataKind::Backup,
            Duration::from_secs(10),
        )
        .await
        .unwrap();

    // One row for the replica set; the shard member and the deleted org
    // contribute nothing
    assert_eq!(records.len(), 1);
    let row = &records[0];
    assert_eq!(row["Project"], json!("Project One"));
    assert_eq!(row["Replica Set Name"], json!("rs0"));
    assert_eq!(row["Username"], json!("backup-user"));
    assert_eq!(row["Backup Status"], json!("STARTED"));
    assert_eq!(row["Last Ping"], json!("2 minutes"));
}

#[tokio::test]
async fn monitoring_fetch_emits_one_row_per_host() {
    let (stub_url, _state) = spawn_stub().await;
    let client = RemoteClient::new();

    let records = client
        .fetch(
            &descriptor("om-a", &stub_url),
            DataKind::Monitoring,
            Duration::from_secs(10),
        )
        .await
        .unwrap();

    assert_eq!(records.len(), 2);
    let mut host_ports: Vec<_> = records
        .iter()
        .map(|r| r["Hostname:Port"].as_str().unwrap().to_string())
        .collect();
    host_ports.sort();
    assert_eq!(host_ports, vec!["db1.local:27017", "db2.local:27017"]);

    // The host whose replica set name disagrees with the cluster's gets
    // the merged form
    assert!(records
        .iter()
        .any(|r| r["Replica Set Name"] == json!("rs0-rs0-shadow")));
}

#[tokio::test]
async fn auth_failure_is_typed_not_empty() {
    let (stub_url, state) = spawn_stub().await;
    state.reject_auth.store(true, Ordering::SeqCst);

    let client = RemoteClient::new();
    let err = client
        .fetch(
            &descriptor("om-a", &stub_url),
            DataKind::Backup,
            Duration::from_secs(10),
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind, opstower::remote_client::FetchErrorKind::Auth);
    assert_eq!(err.status_code, Some(401));
}

#[tokio::test]
async fn cache_age_and_invalidate_round_trip() {
    let (stub_url, _state) = spawn_stub().await;
    let dir = tempfile::tempdir().unwrap();

    let orchestrator = orchestrator_for(
        vec![descriptor("om-a", &stub_url)],
        dir.path(),
        Duration::from_secs(300),
    )
    .await;

    assert!(orchestrator.get_cache_age(DataKind::OplogStore).await.is_none());

    let before = Utc::now();
    orchestrator.get_aggregate(DataKind::OplogStore, false).await;

    let age = orchestrator.get_cache_age(DataKind::OplogStore).await.unwrap();
    assert!(age >= before);

    orchestrator.invalidate(DataKind::OplogStore).await.unwrap();
    assert!(orchestrator.get_cache_age(DataKind::OplogStore).await.is_none());
}
