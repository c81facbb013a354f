//! JSON job API over HTTP.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tracing::warn;
use uuid::Uuid;

use crate::engines::{ExecuteError, Executor};
use crate::graph::render_result;
use crate::jobs::{Job, JobStatus};

#[derive(Clone)]
pub struct AppState {
    pub executor: Executor,
}

#[derive(Debug, Deserialize)]
struct CreateJob {
    job_type: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Deserialize)]
struct ResultsQuery {
    format: Option<String>,
}

pub fn router(executor: Executor) -> Router {
    Router::new()
        .route("/ready", get(ok))
        .route("/health", get(ok))
        .route("/jobs", get(list_engines).post(create_job))
        .route("/jobs/:id", get(job_status))
        .route("/jobs/:id/results", get(job_results))
        .layer(CorsLayer::permissive())
        .with_state(AppState { executor })
}

fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "status": "error", "message": message.into() }))).into_response()
}

fn not_found() -> Response {
    error(StatusCode::NOT_FOUND, "Job not found")
}

fn lookup(state: &AppState, id: &str) -> Option<std::sync::Arc<Job>> {
    let uuid = Uuid::parse_str(id).ok()?;
    state.executor.jobs().get(&uuid)
}

async fn ok() -> &'static str {
    "OK"
}

async fn list_engines(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "engines": state.executor.engines().names() }))
}

async fn create_job(State(state): State<AppState>, Json(req): Json<CreateJob>) -> Response {
    match state.executor.execute_named(&req.job_type, req.args, None) {
        Ok(uuid) => (
            StatusCode::ACCEPTED,
            Json(json!({ "status": "created", "time": Utc::now(), "uuid": uuid })),
        )
            .into_response(),
        Err(ExecuteError::UnknownEngine(name)) => {
            error(StatusCode::NOT_FOUND, format!("Engine not found: {name}"))
        }
        Err(ExecuteError::Invalid(err)) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "status": "error", "field": err.field, "message": err.message })),
        )
            .into_response(),
        Err(e) => {
            warn!("Failed to start {} job: {e}", req.job_type);
            error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn job_status(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(job) = lookup(&state, &id) else {
        return not_found();
    };
    Json(json!({
        "status": job.status(),
        "time": Utc::now(),
        "type": job.kind(),
        "uuid": job.uuid(),
    }))
    .into_response()
}

async fn job_results(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ResultsQuery>,
) -> Response {
    let format = query.format.as_deref().unwrap_or("json");
    if format != "json" && format != "graphviz" {
        return error(StatusCode::BAD_REQUEST, "Invalid format");
    }
    let Some(job) = lookup(&state, &id) else {
        return not_found();
    };

    match job.status() {
        JobStatus::Running => Json(json!({ "status": "running", "message": "Job is still processing" })).into_response(),
        JobStatus::Failed => Json(json!({
            "status": "failed",
            "type": job.kind(),
            "uuid": job.uuid(),
            "error": job.error(),
        }))
        .into_response(),
        JobStatus::Finished => {
            let Some(result) = job.result() else {
                return error(StatusCode::INTERNAL_SERVER_ERROR, "Result missing");
            };
            if format == "graphviz" {
                return match render_result(&result) {
                    Some(dot) => Json(json!({ "results": dot })).into_response(),
                    None => error(
                        StatusCode::BAD_REQUEST,
                        format!("No graph form for {} jobs", job.kind()),
                    ),
                };
            }
            Json(json!({
                "results": result,
                "status": job.status(),
                "type": job.kind(),
                "uuid": job.uuid(),
            }))
            .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::engines::testing::{fixture_executor, tx};

    async fn call(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    fn post_job(body: Value) -> Request<Body> {
        Request::post("/jobs")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn executor() -> Executor {
        fixture_executor(vec![tx("t1", 100, &["a", "b"], &["c"])])
    }

    #[tokio::test]
    async fn health_and_ready() {
        let app = router(executor());
        let response = app.clone().oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = app.oneshot(get("/ready")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn lists_engines() {
        let (status, body) = call(router(executor()), get("/jobs")).await;
        assert_eq!(status, StatusCode::OK);
        let engines = body["engines"].as_array().unwrap();
        assert_eq!(engines.len(), 7);
        assert!(engines.contains(&json!("TIMED_BALANCE")));
    }

    #[tokio::test]
    async fn unknown_engine_is_404() {
        let (status, body) = call(
            router(executor()),
            post_job(json!({ "job_type": "teleport", "args": {} })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["status"], "error");
    }

    #[tokio::test]
    async fn invalid_args_are_400() {
        let (status, body) = call(
            router(executor()),
            post_job(json!({ "job_type": "related", "args": {} })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["field"], "needle_address");
        assert_eq!(body["status"], "error");
    }

    #[tokio::test]
    async fn unknown_job_and_format() {
        let app = router(executor());
        let (status, _) = call(app.clone(), get(&format!("/jobs/{}", Uuid::new_v4()))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(app.clone(), get("/jobs/not-a-uuid/results")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(app, get(&format!("/jobs/{}/results?format=xml", Uuid::new_v4()))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn job_lifecycle_over_http() {
        let executor = executor();
        let app = router(executor.clone());

        let (status, body) = call(
            app.clone(),
            post_job(json!({ "job_type": "RELATED", "args": { "needle_address": "a" } })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "created");
        let uuid: Uuid = body["uuid"].as_str().unwrap().parse().unwrap();

        executor.jobs().get(&uuid).unwrap().wait_for_results().await.unwrap();

        let (_, body) = call(app.clone(), get(&format!("/jobs/{uuid}"))).await;
        assert_eq!(body["status"], "finished");
        assert_eq!(body["type"], "RELATED");

        let (_, body) = call(app.clone(), get(&format!("/jobs/{uuid}/results"))).await;
        assert_eq!(body["status"], "finished");
        assert_eq!(body["results"]["addresses"].as_array().unwrap().len(), 2);
        assert_eq!(body["results"]["edges"][0]["isChange"], false);

        let (_, body) = call(app, get(&format!("/jobs/{uuid}/results?format=graphviz"))).await;
        let dot = body["results"].as_str().unwrap();
        assert!(dot.starts_with("digraph G {"));
        assert!(dot.contains("\"a\" -> \"b\" [ label = \"t1\" ]"));
    }

    #[tokio::test]
    async fn metric_jobs_have_no_graphviz_form() {
        let executor = executor();
        let app = router(executor.clone());
        let (_, body) = call(
            app.clone(),
            post_job(json!({ "job_type": "balance", "args": { "needle_address": "a" } })),
        )
        .await;
        let uuid: Uuid = body["uuid"].as_str().unwrap().parse().unwrap();
        executor.jobs().get(&uuid).unwrap().wait_for_results().await.unwrap();

        let (status, _) = call(app, get(&format!("/jobs/{uuid}/results?format=graphviz"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
