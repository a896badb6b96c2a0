//! Axum JSON API consumed by the browser-capture collaborator and the
//! tracking UI: capture, lifecycle transitions, deletion, and the
//! connectivity probe.

use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{NaiveDate, Utc};
use jobscout_core::{JobRecord, JobStatus, StatusError};
use jobscout_pipeline::{capture, CaptureError, CapturePayload, Settings};
use jobscout_score::Scorer;
use jobscout_store::{JobFilter, JobStore};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobscout-api";

pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub scorer: Arc<Scorer>,
    pub settings: Arc<Settings>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(status_handler))
        .route("/api/capture", post(capture_handler))
        .route("/api/jobs", get(list_jobs_handler))
        .route("/api/jobs/{id}", get(get_job_handler).delete(delete_job_handler))
        .route("/api/jobs/{id}/status", post(update_status_handler))
        .route("/api/jobs/{id}/notes", post(update_notes_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(addr: (&str, u16), state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

enum ApiError {
    NotFound(&'static str),
    BadRequest(String),
    IllegalTransition(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(what) => (StatusCode::NOT_FOUND, format!("{what} not found")),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::IllegalTransition(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            ApiError::Internal(msg) => {
                warn!(%msg, "internal error surfaced to API caller");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<jobscout_store::StoreError> for ApiError {
    fn from(err: jobscout_store::StoreError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

/// Record plus its read-time derivations.
#[derive(Debug, Serialize)]
struct JobView {
    #[serde(flatten)]
    record: JobRecord,
    days_listed: i64,
    follow_up_1_due: Option<NaiveDate>,
    follow_up_2_due: Option<NaiveDate>,
    effective_ghost_risk: jobscout_core::GhostRisk,
}

impl JobView {
    fn from_record(record: JobRecord) -> Self {
        let today = Utc::now().date_naive();
        Self {
            days_listed: record.days_listed(today),
            follow_up_1_due: record.follow_up_1_due(),
            follow_up_2_due: record.follow_up_2_due(),
            effective_ghost_risk: record.effective_ghost_risk(today),
            record,
        }
    }
}

#[derive(Debug, Serialize)]
struct CaptureResponse {
    id: Uuid,
    score: Option<u8>,
    pros: Vec<String>,
    cons: Vec<String>,
    fit_summary: Option<String>,
    detail_url: String,
    duplicate: bool,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn status_handler(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let jobs = state.store.count().await?;
    Ok(Json(serde_json::json!({
        "ok": true,
        "jobs": jobs,
        "high_score_threshold": state.settings.high_score_threshold,
    }))
    .into_response())
}

async fn capture_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CapturePayload>,
) -> Result<Response, ApiError> {
    let outcome = capture(
        state.store.as_ref(),
        &state.scorer,
        &state.settings.profile,
        payload,
    )
    .await
    .map_err(|err| match err {
        CaptureError::CouldNotExtract(_) => ApiError::BadRequest(err.to_string()),
        CaptureError::Store(err) => ApiError::Internal(err.to_string()),
    })?;

    let record = outcome.record;
    Ok(Json(CaptureResponse {
        id: record.id,
        score: record.score,
        pros: record.pros.clone(),
        cons: record.cons.clone(),
        fit_summary: record.fit_summary.clone(),
        detail_url: format!("/api/jobs/{}", record.id),
        duplicate: outcome.duplicate,
    })
    .into_response())
}

#[derive(Debug, Default, Deserialize)]
struct JobsQuery {
    status: Option<String>,
    source: Option<String>,
    min_score: Option<u8>,
    limit: Option<usize>,
    #[serde(default)]
    offset: usize,
}

async fn list_jobs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<JobsQuery>,
) -> Result<Response, ApiError> {
    let status = match &query.status {
        Some(raw) => Some(
            JobStatus::from_str(raw).map_err(|err| ApiError::BadRequest(err.to_string()))?,
        ),
        None => None,
    };
    let records = state
        .store
        .list(JobFilter {
            status,
            source: query.source.clone(),
            min_score: query.min_score,
            limit: Some(query.limit.unwrap_or(100)),
            offset: query.offset,
        })
        .await?;
    let views: Vec<JobView> = records.into_iter().map(JobView::from_record).collect();
    Ok(Json(views).into_response())
}

async fn get_job_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let record = state
        .store
        .get(id)
        .await?
        .ok_or(ApiError::NotFound("job"))?;
    Ok(Json(JobView::from_record(record)).into_response())
}

async fn delete_job_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    // Deleting an id that is already gone is indistinguishable from success
    // for the caller.
    let existed = state.store.delete(id).await?;
    Ok(Json(serde_json::json!({ "ok": true, "existed": existed })).into_response())
}

#[derive(Debug, Deserialize)]
struct StatusUpdate {
    status: String,
}

async fn update_status_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<StatusUpdate>,
) -> Result<Response, ApiError> {
    let to = JobStatus::from_str(&body.status)
        .map_err(|err| ApiError::BadRequest(err.to_string()))?;
    let mut record = state
        .store
        .get(id)
        .await?
        .ok_or(ApiError::NotFound("job"))?;

    record.transition(to, Utc::now()).map_err(|err| match err {
        StatusError::IllegalTransition { .. } => ApiError::IllegalTransition(err.to_string()),
        StatusError::Unknown(_) => ApiError::BadRequest(err.to_string()),
    })?;
    state.store.update(&record).await?;
    Ok(Json(JobView::from_record(record)).into_response())
}

#[derive(Debug, Deserialize)]
struct NotesUpdate {
    notes: String,
}

async fn update_notes_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<NotesUpdate>,
) -> Result<Response, ApiError> {
    let mut record = state
        .store
        .get(id)
        .await?
        .ok_or(ApiError::NotFound("job"))?;
    record.notes = if body.notes.trim().is_empty() {
        None
    } else {
        Some(body.notes)
    };
    record.updated_at = Utc::now();
    state.store.update(&record).await?;
    Ok(Json(JobView::from_record(record)).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use jobscout_core::{CandidateProfile, WorkHistoryEntry};
    use jobscout_score::testing::ScriptedOracle;
    use jobscout_score::ScoringConfig;
    use jobscout_store::FileStore;
    use serde_json::Value;
    use std::time::Duration;
    use tempfile::tempdir;
    use tower::ServiceExt;

    const VALID_OUTPUT: &str = r#"{
        "score": 66,
        "pros": ["Near home"],
        "cons": ["Below target pay"],
        "fit_summary": "Acceptable fallback.",
        "summary": "Swing-shift supervision of the packaging line. Reports to ops director.",
        "ghost_risk": "medium",
        "keyword_match": [],
        "gaps": [],
        "salary_estimate": null
    }"#;

    fn profile() -> CandidateProfile {
        CandidateProfile {
            name: "Sam".into(),
            work_history: vec![WorkHistoryEntry {
                title: "Supervisor".into(),
                company: "Initech".into(),
                duration: "2021-2025".into(),
            }],
            skills: vec!["Scheduling".into()],
            location: "OKC".into(),
            target_roles: vec!["Supervisor".into()],
            ..CandidateProfile::default()
        }
    }

    async fn test_app(responses: Vec<&str>) -> (Router, Arc<FileStore>, tempfile::TempDir) {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(FileStore::open(dir.path()).await.expect("open"));
        let scorer = Scorer::new(
            Box::new(ScriptedOracle::new(responses)),
            ScoringConfig {
                requests_per_minute: 6_000,
                per_call_timeout: Duration::from_secs(2),
                capture_timeout: Duration::from_secs(2),
                ..ScoringConfig::default()
            },
        );
        let settings = Settings {
            profile: profile(),
            ..Settings::default()
        };
        let app = app(AppState {
            store: store.clone(),
            scorer: Arc::new(scorer),
            settings: Arc::new(settings),
        });
        (app, store, dir)
    }

    async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.expect("body").to_bytes();
        serde_json::from_slice(&bytes).expect("json body")
    }

    fn capture_request(title: &str, source: &str) -> Request<Body> {
        let payload = serde_json::json!({
            "source": source,
            "url": format!("https://{source}.example/{title}"),
            "title": title,
            "company": "Acme",
            "location": "OKC",
            "description": "Supervise the line."
        });
        Request::builder()
            .method("POST")
            .uri("/api/capture")
            .header("content-type", "application/json")
            .body(Body::from(payload.to_string()))
            .expect("request")
    }

    #[tokio::test]
    async fn probe_reports_record_count() {
        let (app, _store, _dir) = test_app(vec![VALID_OUTPUT]).await;

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/api/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["ok"], true);
        assert_eq!(json["jobs"], 0);
        assert_eq!(json["high_score_threshold"], 80);

        app.clone()
            .oneshot(capture_request("Line Supervisor", "capture"))
            .await
            .unwrap();

        let response = app
            .oneshot(Request::builder().uri("/api/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(response).await["jobs"], 1);
    }

    #[tokio::test]
    async fn capture_returns_inline_score_and_flags_duplicate() {
        let (app, _store, _dir) = test_app(vec![VALID_OUTPUT, VALID_OUTPUT]).await;

        let response = app
            .clone()
            .oneshot(capture_request("Line Supervisor", "capture"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["score"], 66);
        assert_eq!(json["duplicate"], false);
        assert_eq!(json["pros"][0], "Near home");
        let detail_url = json["detail_url"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(capture_request("Line Supervisor", "capture"))
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["duplicate"], true);
        assert_eq!(
            format!("/api/jobs/{}", json["id"].as_str().unwrap()),
            detail_url
        );
    }

    #[tokio::test]
    async fn capture_without_usable_payload_is_typed_error() {
        let (app, _store, _dir) = test_app(vec![]).await;
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/capture")
                    .header("content-type", "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert!(json["error"].as_str().unwrap().contains("Could not extract"));
    }

    #[tokio::test]
    async fn status_transitions_enforce_the_state_machine() {
        let (app, _store, _dir) = test_app(vec![VALID_OUTPUT]).await;

        let response = app
            .clone()
            .oneshot(capture_request("Line Supervisor", "capture"))
            .await
            .unwrap();
        let id = body_json(response).await["id"].as_str().unwrap().to_string();

        let transition = |status: &str| {
            Request::builder()
                .method("POST")
                .uri(format!("/api/jobs/{id}/status"))
                .header("content-type", "application/json")
                .body(Body::from(format!("{{\"status\": \"{status}\"}}")))
                .unwrap()
        };

        let response = app.clone().oneshot(transition("applied")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "applied");
        // Applying derives both follow-up dates.
        assert!(json["follow_up_1_due"].is_string());
        assert!(json["follow_up_2_due"].is_string());

        // Backward move is rejected with a typed 422.
        let response = app.clone().oneshot(transition("interested")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        // Unknown status is a 400.
        let response = app.oneshot(transition("maybe")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn delete_is_idempotent_for_the_caller() {
        let (app, _store, _dir) = test_app(vec![VALID_OUTPUT]).await;

        let response = app
            .clone()
            .oneshot(capture_request("Line Supervisor", "capture"))
            .await
            .unwrap();
        let id = body_json(response).await["id"].as_str().unwrap().to_string();

        let delete_request = || {
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/jobs/{id}"))
                .body(Body::empty())
                .unwrap()
        };

        let response = app.clone().oneshot(delete_request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["existed"], true);

        let response = app.clone().oneshot(delete_request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["existed"], false);

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/jobs/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn listing_filters_by_status() {
        let (app, _store, _dir) = test_app(vec![VALID_OUTPUT, VALID_OUTPUT]).await;

        app.clone()
            .oneshot(capture_request("Line Supervisor", "capture"))
            .await
            .unwrap();
        app.clone()
            .oneshot(capture_request("Dock Lead", "other-capture"))
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/api/jobs").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json.as_array().unwrap().len(), 2);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/jobs?status=applied")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json.as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn notes_update_round_trips() {
        let (app, _store, _dir) = test_app(vec![VALID_OUTPUT]).await;

        let response = app
            .clone()
            .oneshot(capture_request("Line Supervisor", "capture"))
            .await
            .unwrap();
        let id = body_json(response).await["id"].as_str().unwrap().to_string();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/api/jobs/{id}/notes"))
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"notes": "Phone screen Friday"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["notes"], "Phone screen Friday");
    }
}
