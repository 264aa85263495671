use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::master::{CrawlReport, Master};

#[derive(Clone)]
pub struct AppState {
    master: Arc<Master>,
    crawls: Arc<RwLock<HashMap<String, CrawlStatus>>>, // job id -> progress of crawls started over the API
}

impl AppState {
    pub fn new(master: Arc<Master>) -> Self {
        Self {
            master,
            crawls: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CrawlStatus {
    pub job_id: String,
    pub state: String, // "running" | "done" | "failed"
    pub report: Option<CrawlReport>,
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CrawlRequest {
    pub scans: Vec<String>,
    pub targets: Vec<String>,
    pub ports: Vec<u32>,
    #[serde(default)]
    pub job_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    pub job: Option<String>,
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/stats", get(get_stats))
        .route("/jobs", get(get_jobs))
        .route("/crawl", post(post_crawl))
        .route("/crawl/{job_id}", get(get_crawl))
        .with_state(state);

    Router::new()
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
}

pub async fn spawn_server(bind: &str, state: AppState) -> Result<()> {
    let app = router(state);
    info!("serving API on http://{}", bind);
    axum::serve(tokio::net::TcpListener::bind(bind).await?, app).await?;
    Ok(())
}

async fn get_stats(State(app): State<AppState>, Query(q): Query<StatsQuery>) -> impl IntoResponse {
    let stats = match q.job.as_deref() {
        Some(job) => app.master.get_job_stats(job).await,
        None => app.master.get_stats().await,
    };
    match stats {
        Ok(s) => (StatusCode::OK, Json(s)).into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

async fn get_jobs(State(app): State<AppState>) -> impl IntoResponse {
    match app.master.list_jobs().await {
        Ok(jobs) => (StatusCode::OK, Json(jobs)).into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

async fn get_crawl(State(app): State<AppState>, Path(job_id): Path<String>) -> impl IntoResponse {
    match app.crawls.read().await.get(&job_id) {
        Some(status) => (StatusCode::OK, Json(status.clone())).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn post_crawl(State(app): State<AppState>, Json(req): Json<CrawlRequest>) -> impl IntoResponse {
    // Reject bad requests synchronously, before anything is created.
    if let Err(e) = app
        .master
        .validate_with_targets(&req.scans, &req.targets, &req.ports)
    {
        return (StatusCode::BAD_REQUEST, Json(e)).into_response();
    }

    let job_id = req.job_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    {
        let mut crawls = app.crawls.write().await;
        if crawls.get(&job_id).is_some_and(|c| c.state == "running") {
            return (StatusCode::CONFLICT, format!("job {job_id} is already running")).into_response();
        }
        crawls.insert(
            job_id.clone(),
            CrawlStatus {
                job_id: job_id.clone(),
                state: "running".into(),
                report: None,
                error: None,
            },
        );
    }

    let app2 = app.clone();
    let id = job_id.clone();
    tokio::spawn(async move {
        let res = app2
            .master
            .crawl_specs(&req.scans, &req.targets, &req.ports, &id)
            .await;
        let mut crawls = app2.crawls.write().await;
        if let Some(status) = crawls.get_mut(&id) {
            match res {
                Ok(report) => {
                    status.state = "done".into();
                    status.report = Some(report);
                }
                Err(e) => {
                    status.state = "failed".into();
                    status.error = Some(e.to_string());
                }
            }
        }
    });

    let status = CrawlStatus {
        job_id,
        state: "running".into(),
        report: None,
        error: None,
    };
    (StatusCode::ACCEPTED, Json(status)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::InMemoryOrchestrationProvider;
    use crate::persistence::InMemoryPersistenceProvider;
    use crate::scans::ScanRegistry;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;
    use tracing::Span;

    fn app() -> Router {
        let master = Master::new(
            "api-test",
            Arc::new(InMemoryOrchestrationProvider::new()),
            Arc::new(InMemoryPersistenceProvider::new()),
            ScanRegistry::with_defaults(),
            Span::none(),
        );
        router(AppState::new(Arc::new(master)))
    }

    async fn json(resp: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn invalid_crawl_is_rejected_with_details() {
        let body = r#"{"scans":["bogus_scan"],"targets":["10.0.0.1","10.0.0.999"],"ports":[0,443]}"#;
        let resp = app()
            .oneshot(
                Request::post("/api/crawl")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let v = json(resp).await;
        assert_eq!(v["invalid_scans"], serde_json::json!(["bogus_scan"]));
        assert_eq!(v["invalid_ports"], serde_json::json!([0]));
        assert_eq!(v["invalid_targets"], serde_json::json!(["10.0.0.999"]));
    }

    #[tokio::test]
    async fn stats_start_empty() {
        let resp = app()
            .oneshot(Request::get("/api/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let v = json(resp).await;
        assert_eq!(v["total_tasks"], 0);
        assert_eq!(v["finished_tasks"], 0);
    }

    #[tokio::test]
    async fn unknown_crawl_is_404() {
        let resp = app()
            .oneshot(Request::get("/api/crawl/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
