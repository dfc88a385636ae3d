use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::json;

use casesync_api::app::services::{AppServices, Backends};
use casesync_core::{CaseId, TokenId};
use casesync_infra::cases::{CaseRecord, InMemoryCaseRepository};
use casesync_infra::config::{JitterRange, StaticSettings, SyncSettings};
use casesync_infra::jobs::InMemoryJobStore;
use casesync_infra::sync::{CronSecret, InMemorySyncLog};
use casesync_infra::tokens::InMemorySessionTokenRepository;
use casesync_infra::external::{
    CourtSyncClient, CourtSyncRequest, CourtSyncResponse, ExternalCallError, RenewalError,
    RenewedToken, TokenRenewalService,
};

const SECRET: &str = "test-cron-secret";

#[derive(Default)]
struct StubCourt {
    requests: Mutex<Vec<CourtSyncRequest>>,
}

#[async_trait]
impl CourtSyncClient for StubCourt {
    async fn sync_case(&self, request: &CourtSyncRequest) -> Result<CourtSyncResponse, ExternalCallError> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(CourtSyncResponse::unchanged())
    }
}

struct StubRenewal;

#[async_trait]
impl TokenRenewalService for StubRenewal {
    async fn renew(&self, token_id: TokenId) -> Result<RenewedToken, RenewalError> {
        Ok(RenewedToken {
            token_id,
            expires_at: None,
        })
    }
}

struct TestServer {
    base_url: String,
    court: Arc<StubCourt>,
    cases: Arc<InMemoryCaseRepository>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn(settings: SyncSettings) -> Self {
        let court = Arc::new(StubCourt::default());
        let cases = InMemoryCaseRepository::arc();
        let backends = Backends {
            settings: Arc::new(StaticSettings(settings)),
            jobs: InMemoryJobStore::arc(),
            cases: cases.clone(),
            tokens: Arc::new(InMemorySessionTokenRepository::new()),
            log: Arc::new(InMemorySyncLog::new()),
            court: court.clone(),
            renewal: Arc::new(StubRenewal),
        };
        let services = AppServices::new(CronSecret::new(SECRET), backends);

        // Same router as prod, bound to an ephemeral port.
        let app = casesync_api::app::build_app(services);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            court,
            cases,
            handle,
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn quiet_settings() -> SyncSettings {
    SyncSettings {
        request_jitter_ms: JitterRange::none(),
        rate_limit_per_minute: None,
        ..Default::default()
    }
}

async fn enqueue(client: &reqwest::Client, srv: &TestServer, body: serde_json::Value) -> reqwest::Response {
    client
        .post(format!("{}/jobs", srv.base_url))
        .bearer_auth(SECRET)
        .json(&body)
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn health_is_unauthenticated() {
    let srv = TestServer::spawn(quiet_settings()).await;
    let res = reqwest::get(format!("{}/health", srv.base_url)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn triggers_reject_missing_or_wrong_secret() {
    let srv = TestServer::spawn(quiet_settings()).await;
    let client = reqwest::Client::new();

    for path in ["/cron/sync-worker", "/cron/sync-scheduler", "/queue/status"] {
        let res = client.get(format!("{}{}", srv.base_url, path)).send().await.unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED, "{path}");
        let body: serde_json::Value = res.json().await.unwrap();
        assert_eq!(body["error"], "unauthorized");

        let res = client
            .get(format!("{}{}?secret=wrong", srv.base_url, path))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED, "{path}");
    }

    let res = client
        .post(format!("{}/jobs", srv.base_url))
        .json(&json!({ "syncType": "progress" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn enqueue_is_idempotent_per_dedup_key() {
    let srv = TestServer::spawn(quiet_settings()).await;
    let client = reqwest::Client::new();
    let case_id = CaseId::new();
    let body = json!({ "caseId": case_id, "syncType": "general", "dedupKey": "general:manual-1" });

    let first = enqueue(&client, &srv, body.clone()).await;
    assert_eq!(first.status(), StatusCode::CREATED);
    let first: serde_json::Value = first.json().await.unwrap();
    assert_eq!(first["inserted"], true);

    let second = enqueue(&client, &srv, body).await;
    assert_eq!(second.status(), StatusCode::OK);
    let second: serde_json::Value = second.json().await.unwrap();
    assert_eq!(second["inserted"], false);
    assert_eq!(second["jobId"], first["jobId"]);
}

#[tokio::test]
async fn enqueue_rejects_unknown_sync_type() {
    let srv = TestServer::spawn(quiet_settings()).await;
    let client = reqwest::Client::new();
    let res = enqueue(&client, &srv, json!({ "syncType": "everything" })).await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn worker_drains_enqueued_job() {
    let srv = TestServer::spawn(quiet_settings()).await;
    let client = reqwest::Client::new();

    let case = CaseRecord::new(CaseId::new(), "2024가합100").linked("enc", "wmonid");
    srv.cases.insert(case.clone()).unwrap();

    let res = enqueue(
        &client,
        &srv,
        json!({ "caseId": case.id, "syncType": "progress", "payload": { "triggerSource": "manual" } }),
    )
    .await;
    assert_eq!(res.status(), StatusCode::CREATED);

    let res = client
        .post(format!("{}/cron/sync-worker?secret={}", srv.base_url, SECRET))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let report: serde_json::Value = res.json().await.unwrap();
    assert_eq!(report["success"], true);
    assert_eq!(report["processed"], 1);
    assert!(report["durationMs"].is_u64());

    let requests = srv.court.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].force_refresh);

    let status: serde_json::Value = client
        .get(format!("{}/queue/status", srv.base_url))
        .bearer_auth(SECRET)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["stats"]["success"], 1);
    assert_eq!(status["recent"].as_array().unwrap().len(), 1);
    assert_eq!(status["settings"]["workerConcurrency"], 2);
}

#[tokio::test]
async fn disabled_sync_short_circuits_worker() {
    let srv = TestServer::spawn(SyncSettings {
        auto_sync_enabled: false,
        ..quiet_settings()
    })
    .await;
    let client = reqwest::Client::new();

    let res = client
        .get(format!("{}/cron/sync-worker", srv.base_url))
        .bearer_auth(SECRET)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let report: serde_json::Value = res.json().await.unwrap();
    assert_eq!(report["success"], true);
    assert_eq!(report["processed"], 0);
    assert_eq!(report["message"], "auto sync disabled");
}

#[tokio::test]
async fn scheduler_initializes_new_cases() {
    let srv = TestServer::spawn(quiet_settings()).await;
    let client = reqwest::Client::new();
    srv.cases
        .insert(CaseRecord::new(CaseId::new(), "2024가단7").linked("enc", "wmonid"))
        .unwrap();

    let res = client
        .post(format!("{}/cron/sync-scheduler", srv.base_url))
        .bearer_auth(SECRET)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let report: serde_json::Value = res.json().await.unwrap();
    assert_eq!(report["success"], true);
    assert_eq!(report["initializedCases"], 1);
    assert_eq!(report["scheduledJobs"], 0);
}
