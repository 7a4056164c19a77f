//! Axum endpoints for queue-driven CSV imports and A/B test completion scheduling.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use linkport_core::{ImportJob, TestSchedule, TestVariant};
use linkport_import::signature::{self, SIGNATURE_HEADER};
use linkport_import::{
    BatchOutcome, ImportRequest, ImportRuntime, TestCompletionMessage, COMPLETE_TESTS_PATH, IMPORT_CSV_PATH,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "linkport-web";

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<ImportRuntime>,
}

impl AppState {
    pub fn new(runtime: ImportRuntime) -> Self {
        Self {
            runtime: Arc::new(runtime),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct TestConfig {
    #[serde(default)]
    test_variants: Vec<TestVariant>,
    #[serde(default)]
    test_completed_at: Option<DateTime<Utc>>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route(IMPORT_CSV_PATH, post(import_batch_handler))
        .route("/api/workspaces/{workspace_id}/import/csv", post(start_import_handler))
        .route("/api/links/{link_id}/tests", put(schedule_test_handler))
        .route(COMPLETE_TESTS_PATH, post(complete_tests_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let runtime = ImportRuntime::from_env().await?;
    let port = runtime.config.web_port;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "linkport web listening");
    axum::serve(listener, app(AppState::new(runtime))).await?;
    Ok(())
}

async fn import_batch_handler(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    if let Err(resp) = verify_signature(&state, &headers, &body) {
        return resp;
    }
    let job: ImportJob = match decode_json(&body) {
        Ok(job) => job,
        Err(resp) => return resp,
    };

    match state.runtime.pipeline.process(&job).await {
        Ok(BatchOutcome::Continued { cursor, .. }) => {
            info!(job_id = %job.id, cursor, "import batch done; more rows remain");
            success()
        }
        Ok(BatchOutcome::Finished { summary, .. }) => {
            info!(job_id = %job.id, count = summary.count, "import job finished");
            success()
        }
        Err(err) => server_error(err),
    }
}

async fn start_import_handler(
    State(state): State<Arc<AppState>>,
    Path(workspace_id): Path<String>,
    body: Bytes,
) -> Response {
    let request: ImportRequest = match decode_json(&body) {
        Ok(request) => request,
        Err(resp) => return resp,
    };
    match state.runtime.start_import(&workspace_id, request).await {
        Ok(job) => (StatusCode::ACCEPTED, Json(json!({ "id": job.id }))).into_response(),
        Err(err) => server_error(err),
    }
}

async fn schedule_test_handler(
    State(state): State<Arc<AppState>>,
    Path(link_id): Path<String>,
    body: Bytes,
) -> Response {
    let config: TestConfig = match decode_json(&body) {
        Ok(config) => config,
        Err(resp) => return resp,
    };
    let schedule = TestSchedule {
        link_id,
        test_variants: config.test_variants,
        test_completed_at: config.test_completed_at,
    };
    match state.runtime.scheduler.schedule(&schedule, Utc::now()).await {
        Ok(scheduled) => Json(scheduled).into_response(),
        Err(err) => server_error(err),
    }
}

async fn complete_tests_handler(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    if let Err(resp) = verify_signature(&state, &headers, &body) {
        return resp;
    }
    let message: TestCompletionMessage = match decode_json(&body) {
        Ok(message) => message,
        Err(resp) => return resp,
    };
    match state.runtime.scheduler.mark_fired(&message.link_id).await {
        Ok(_) => success(),
        Err(err) => server_error(err),
    }
}

fn verify_signature(state: &AppState, headers: &HeaderMap, body: &[u8]) -> Result<(), Response> {
    let Some(secret) = state.runtime.config.signing_secret.as_deref() else {
        error!("no signing secret configured; rejecting queue message");
        return Err(error_response(StatusCode::UNAUTHORIZED, "signing secret not configured".to_string()));
    };
    let provided = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    signature::verify(secret, body, provided).map_err(|err| {
        warn!(error = %err, "rejected queue message");
        error_response(StatusCode::UNAUTHORIZED, err.to_string())
    })
}

fn decode_json<T: DeserializeOwned>(body: &[u8]) -> Result<T, Response> {
    serde_json::from_slice(body)
        .map_err(|err| error_response(StatusCode::BAD_REQUEST, format!("invalid request body: {err}")))
}

fn success() -> Response {
    Json(json!({ "response": "success" })).into_response()
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = ?err, "request failed");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use linkport_core::{ColumnMapping, TestScheduleState};
    use linkport_import::{
        Collaborators, ImportConfig, MemoryNotifier, MemoryQueue, NoopDomainRegistrar, StandardLinkValidator,
    };
    use linkport_storage::{FsObjectStore, MemoryCursorStore, MemoryLinkRepository, ScheduleStore};
    use tower::ServiceExt;

    const SECRET: &str = "test-secret";

    struct TestApp {
        _dir: tempfile::TempDir,
        router: Router,
        uploads: FsObjectStore,
        links: Arc<MemoryLinkRepository>,
        schedules: Arc<MemoryCursorStore>,
        queue: Arc<MemoryQueue>,
        notifier: Arc<MemoryNotifier>,
    }

    fn test_app() -> TestApp {
        test_app_with_secret(Some(SECRET))
    }

    fn test_app_with_secret(secret: Option<&str>) -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let uploads = FsObjectStore::new(dir.path());
        let links = Arc::new(MemoryLinkRepository::new());
        let schedules = Arc::new(MemoryCursorStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let notifier = Arc::new(MemoryNotifier::new());

        let mut config = ImportConfig::from_env();
        config.signing_secret = secret.map(str::to_string);
        config.app_base_url = "http://localhost:8888".to_string();
        let runtime = ImportRuntime::from_parts(
            config,
            Collaborators {
                objects: Arc::new(uploads.clone()),
                cursors: schedules.clone(),
                links: links.clone(),
                registrar: Arc::new(NoopDomainRegistrar),
                validator: Arc::new(StandardLinkValidator::new(Vec::new())),
                queue: queue.clone(),
                notifier: notifier.clone(),
            },
            schedules.clone(),
            Vec::new(),
        );

        TestApp {
            _dir: dir,
            router: app(AppState::new(runtime)),
            uploads,
            links,
            schedules,
            queue,
            notifier,
        }
    }

    fn request(method: &str, uri: &str, body: Vec<u8>, signature: Option<String>) -> axum::http::Request<Body> {
        let mut builder = axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(signature) = signature {
            builder = builder.header(SIGNATURE_HEADER, signature);
        }
        builder.body(Body::from(body)).unwrap()
    }

    fn signed(uri: &str, body: Vec<u8>) -> axum::http::Request<Body> {
        let sig = signature::sign(SECRET, &body);
        request("POST", uri, body, Some(sig))
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn job_for(app: &TestApp, csv: &str) -> ImportJob {
        let stored = app.uploads.store_bytes("ws_1", "csv", csv.as_bytes()).await.unwrap();
        ImportJob {
            id: "job_web".into(),
            workspace_id: "ws_1".into(),
            user_id: "u1".into(),
            folder_id: None,
            url: stored.location,
            mapping: ColumnMapping::new("link", "url"),
        }
    }

    #[tokio::test]
    async fn unsigned_batch_is_rejected() {
        let app = test_app();
        let job = job_for(&app, "link,url\nacme.link/a,https://example.com\n").await;
        let body = serde_json::to_vec(&job).unwrap();

        let resp = app
            .router
            .clone()
            .oneshot(request("POST", IMPORT_CSV_PATH, body.clone(), None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = app
            .router
            .clone()
            .oneshot(request("POST", IMPORT_CSV_PATH, body, Some("00".repeat(32))))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(app.links.links().await.is_empty());
    }

    #[tokio::test]
    async fn queue_endpoints_fail_closed_without_a_secret() {
        let app = test_app_with_secret(None);
        let job = job_for(&app, "link,url\nacme.link/a,https://example.com\n").await;

        let resp = app
            .router
            .clone()
            .oneshot(signed(IMPORT_CSV_PATH, serde_json::to_vec(&job).unwrap()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(app.links.links().await.is_empty());
    }

    #[tokio::test]
    async fn signed_batch_runs_the_import() {
        let app = test_app();
        let job = job_for(
            &app,
            "link,url\nacme.link/a,https://example.com/a\nacme.link/b,https://example.com/b\n",
        )
        .await;

        let resp = app
            .router
            .clone()
            .oneshot(signed(IMPORT_CSV_PATH, serde_json::to_vec(&job).unwrap()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await, json!({ "response": "success" }));

        let sent = app.notifier.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].count, 2);
        // Two links plus the placeholder root for the newly seen domain.
        assert_eq!(app.links.links().await.len(), 3);
    }

    #[tokio::test]
    async fn malformed_payload_is_a_bad_request() {
        let app = test_app();
        let resp = app
            .router
            .clone()
            .oneshot(signed(IMPORT_CSV_PATH, b"{\"id\":".to_vec()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(json_body(resp).await["error"].is_string());
    }

    #[tokio::test]
    async fn missing_source_file_is_a_server_error() {
        let app = test_app();
        let mut job = job_for(&app, "link,url\n").await;
        job.url = "imports/ws_1/gone.csv".into();

        let resp = app
            .router
            .clone()
            .oneshot(signed(IMPORT_CSV_PATH, serde_json::to_vec(&job).unwrap()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(json_body(resp).await["error"].is_string());
    }

    #[tokio::test]
    async fn kickoff_enqueues_first_batch() {
        let app = test_app();
        let body = json!({
            "userId": "u1",
            "url": "imports/ws_1/upload.csv",
            "mapping": { "link": "Short Link", "url": "Destination" }
        });

        let resp = app
            .router
            .clone()
            .oneshot(request(
                "POST",
                "/api/workspaces/ws_1/import/csv",
                serde_json::to_vec(&body).unwrap(),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let id = json_body(resp).await["id"].as_str().unwrap().to_string();

        let published = app.queue.published().await;
        assert_eq!(published.len(), 1);
        assert!(published[0].message.destination.ends_with(IMPORT_CSV_PATH));
        let job: ImportJob = published[0].message.decode().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.workspace_id, "ws_1");
        assert!(published[0].message.delay.is_zero());
    }

    #[tokio::test]
    async fn scheduling_and_completing_a_test() {
        let app = test_app();
        let body = json!({
            "testVariants": [
                { "url": "https://a.example.com", "percentage": 50.0 },
                { "url": "https://b.example.com", "percentage": 50.0 }
            ],
            "testCompletedAt": (Utc::now() + chrono::Duration::days(1)).to_rfc3339(),
        });

        let resp = app
            .router
            .clone()
            .oneshot(request(
                "PUT",
                "/api/links/link_1/tests",
                serde_json::to_vec(&body).unwrap(),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let state: TestScheduleState = serde_json::from_value(json_body(resp).await).unwrap();
        assert!(matches!(state, TestScheduleState::Scheduled { .. }));
        assert!(app.schedules.scheduled_message("link_1").await.unwrap().is_some());

        let resp = app
            .router
            .clone()
            .oneshot(signed(
                COMPLETE_TESTS_PATH,
                serde_json::to_vec(&json!({ "linkId": "link_1" })).unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(app.schedules.scheduled_message("link_1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clearing_a_test_reports_no_schedule() {
        let app = test_app();
        let resp = app
            .router
            .clone()
            .oneshot(request("PUT", "/api/links/link_1/tests", b"{}".to_vec(), None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await, json!({ "state": "no-schedule" }));
        assert!(app.queue.published().await.is_empty());
    }
}
