//! Admin HTTP surface: resource metrics, manual triggers, task lookup and
//! a websocket feed of update events, plus liveness and metrics routes
//! under `/health`.

use std::future::Future;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::core::orchestrator::{Orchestrator, OrchestratorStatus};
use crate::core::registry::{QueryParams, SourceDescriptor};
use crate::core::resources::Metric;
use crate::core::task::{Admission, TaskId, TriggerKind, TriggerOutcome};
use crate::core::throttle::ThrottleLevel;
use crate::error::TriggerError;
use crate::UpdateEvent;

#[derive(Clone)]
pub struct AdminState {
    pub orchestrator: Arc<Orchestrator>,
    pub updates: broadcast::Sender<UpdateEvent>,
}

/// Level is reported as its integer wire value (NORMAL=0 .. PAUSE=3).
#[derive(Debug, Serialize)]
pub struct MetricsReport {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_free_percent: f64,
    pub disk_free_gb: f64,
    pub is_healthy: bool,
    pub throttle_level: u8,
    /// Times the throttle has escalated since start.
    pub throttle_events_total: u64,
    pub sampled_at: DateTime<Utc>,
    pub stale: Vec<Metric>,
}

impl MetricsReport {
    fn current(orchestrator: &Orchestrator) -> Self {
        let throttle = orchestrator.throttle();
        let current = throttle.state();
        let snapshot = &current.snapshot;
        Self {
            cpu_percent: snapshot.cpu_percent,
            memory_percent: snapshot.memory_percent,
            disk_free_percent: snapshot.disk_free_percent,
            disk_free_gb: snapshot.disk_free_gb,
            is_healthy: current.level == ThrottleLevel::Normal,
            throttle_level: current.level.as_u8(),
            throttle_events_total: throttle.escalations(),
            sampled_at: snapshot.sampled_at,
            stale: snapshot.stale.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    #[serde(flatten)]
    pub orchestrator: OrchestratorStatus,
    pub fail_safe: bool,
    pub decided_at: DateTime<Utc>,
    pub escalations: u64,
}

#[derive(Debug, Default, Deserialize)]
pub struct ScrapeParams {
    pub query: Option<String>,
    pub max_results: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CleanupParams {
    pub retention_days: Option<u32>,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/resources", get(resources))
        .route("/admin/status", get(status))
        .route("/admin/sources", get(sources))
        .route("/admin/tasks/{id}", get(task))
        .route("/admin/scraper/trigger/{source}", post(trigger_scrape))
        .route("/admin/cleanup/trigger", post(trigger_cleanup))
        .route("/ws/updates", get(ws_upgrade))
        .nest("/health", health_router())
        .with_state(state)
}

fn health_router() -> Router<AdminState> {
    Router::new()
        .route("/live", get(live))
        .route("/metrics", get(resources))
}

/// Serves the admin API on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AdminState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn live() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn resources(State(state): State<AdminState>) -> Json<MetricsReport> {
    Json(MetricsReport::current(&state.orchestrator))
}

async fn status(State(state): State<AdminState>) -> Json<StatusReport> {
    let throttle = state.orchestrator.throttle();
    let current = throttle.state();
    Json(StatusReport {
        orchestrator: state.orchestrator.status(),
        fail_safe: current.fail_safe,
        decided_at: current.decided_at,
        escalations: throttle.escalations(),
    })
}

async fn sources(State(state): State<AdminState>) -> Json<Vec<SourceDescriptor>> {
    Json(state.orchestrator.registry().list())
}

async fn task(State(state): State<AdminState>, Path(id): Path<TaskId>) -> Response {
    match state.orchestrator.task(id) {
        Some(record) => Json(record).into_response(),
        None => {
            let body = json!({"error": "unknown_task", "task_id": id});
            (StatusCode::NOT_FOUND, Json(body)).into_response()
        }
    }
}

async fn trigger_scrape(
    State(state): State<AdminState>,
    Path(source): Path<String>,
    Query(params): Query<ScrapeParams>,
) -> Response {
    let query = QueryParams {
        queries: params.query.into_iter().collect(),
        max_results: params.max_results,
    };
    match state
        .orchestrator
        .request_scrape(&source, TriggerKind::Manual, query)
        .await
    {
        Ok(outcome) => trigger_response(outcome),
        Err(e) => error_response(e),
    }
}

async fn trigger_cleanup(
    State(state): State<AdminState>,
    Query(params): Query<CleanupParams>,
) -> Response {
    match state
        .orchestrator
        .request_cleanup(TriggerKind::Manual, params.retention_days)
        .await
    {
        Ok(outcome) => trigger_response(outcome),
        Err(e) => error_response(e),
    }
}

fn trigger_response(outcome: TriggerOutcome) -> Response {
    match outcome.admission {
        Admission::Admitted { degraded, .. } => (
            StatusCode::ACCEPTED,
            Json(json!({"task_id": outcome.task_id, "degraded": degraded})),
        )
            .into_response(),
        Admission::Rejected { reason } => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "rejected", "reason": reason, "task_id": outcome.task_id})),
        )
            .into_response(),
    }
}

fn error_response(err: TriggerError) -> Response {
    let (status, body) = match err {
        TriggerError::UnknownSource(e) => (
            StatusCode::NOT_FOUND,
            json!({"error": "unknown_source", "source": e.name}),
        ),
        TriggerError::InvalidRetentionDays => (
            StatusCode::BAD_REQUEST,
            json!({
                "error": "invalid_retention_days",
                "detail": TriggerError::InvalidRetentionDays.to_string(),
            }),
        ),
        TriggerError::Queue(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            json!({"error": "queue_unavailable", "detail": e.to_string()}),
        ),
    };
    (status, Json(body)).into_response()
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AdminState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| forward_updates(socket, state.updates.subscribe()))
}

async fn forward_updates(socket: WebSocket, mut rx: broadcast::Receiver<UpdateEvent>) {
    let (mut sender, mut receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let Ok(text) = serde_json::to_string(&event) else {
                        continue;
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!("Websocket client lagged by {} events", n)
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Drain pings and close frames; content is ignored.
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::core::orchestrator::tests::{registry, throttle_at, CollectingSink, RecordingQueue};

    fn app(cpu: f64, mem: f64, disk: f64) -> Router {
        let orchestrator = Orchestrator::new(
            throttle_at(cpu, mem, disk),
            registry(),
            Arc::new(RecordingQueue::default()),
            Arc::new(CollectingSink::default()),
        );
        let (updates, _) = broadcast::channel(4);
        router(AdminState {
            orchestrator: Arc::new(orchestrator),
            updates,
        })
    }

    async fn call(app: &Router, method: &str, uri: &str) -> (StatusCode, Value) {
        let response = app
            .clone()
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    #[tokio::test]
    async fn test_resources_reports_integer_level() {
        let app = app(90.0, 40.0, 50.0);
        let (status, body) = call(&app, "GET", "/admin/resources").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["throttle_level"], 2);
        assert_eq!(body["cpu_percent"], 90.0);
        assert_eq!(body["disk_free_percent"], 50.0);
        assert_eq!(body["disk_free_gb"], 0.0);
        assert_eq!(body["is_healthy"], false);
        assert_eq!(body["throttle_events_total"], 0);
        assert!(body["stale"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_health_routes() {
        let app = app(10.0, 10.0, 80.0);
        let (status, body) = call(&app, "GET", "/health/live").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "ok"}));

        let (status, body) = call(&app, "GET", "/health/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["throttle_level"], 0);
        assert_eq!(body["is_healthy"], true);
        assert_eq!(body["disk_free_percent"], 80.0);
    }

    #[tokio::test]
    async fn test_manual_trigger_returns_task_id() {
        let app = app(90.0, 40.0, 50.0);
        let (status, body) = call(&app, "POST", "/admin/scraper/trigger/remoteok").await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["degraded"], true);
        let task_id = body["task_id"].as_str().unwrap().to_string();

        let (status, record) = call(&app, "GET", &format!("/admin/tasks/{}", task_id)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(record["source"], "remoteok");
        assert_eq!(record["outcome"], "PENDING");

        let (status, body) = call(&app, "POST", "/admin/scraper/trigger/remoteok").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["reason"], "CONCURRENCY_LIMIT");
    }

    #[tokio::test]
    async fn test_paused_trigger_is_rejected_with_reason() {
        let app = app(20.0, 20.0, 10.0);
        let (status, body) = call(&app, "POST", "/admin/scraper/trigger/tavily").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "rejected");
        assert_eq!(body["reason"], "PAUSED");
        assert!(body["task_id"].is_string());

        let (status, body) = call(&app, "POST", "/admin/cleanup/trigger?retention_days=7").await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(body["task_id"].is_string());
    }

    #[tokio::test]
    async fn test_unknown_source_is_404() {
        let app = app(10.0, 10.0, 80.0);
        let (status, body) = call(&app, "POST", "/admin/scraper/trigger/glassdoor").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, json!({"error": "unknown_source", "source": "glassdoor"}));

        let (_, status_body) = call(&app, "GET", "/admin/status").await;
        assert_eq!(status_body["admitted_total"], 0);
        assert_eq!(status_body["rejected_total"], 0);
    }

    #[tokio::test]
    async fn test_out_of_range_cleanup_is_bad_request() {
        let app = app(10.0, 10.0, 80.0);
        let (status, body) = call(&app, "POST", "/admin/cleanup/trigger?retention_days=0").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_retention_days");

        let uri = "/admin/cleanup/trigger?retention_days=4294967295";
        let (status, body) = call(&app, "POST", uri).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_retention_days");
    }

    #[tokio::test]
    async fn test_sources_and_missing_task() {
        let app = app(10.0, 10.0, 80.0);
        let (status, body) = call(&app, "GET", "/admin/sources").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["name"], "tavily");
        assert_eq!(body[2]["priority"], "LOW");

        let uri = format!("/admin/tasks/{}", uuid::Uuid::new_v4());
        let (status, _) = call(&app, "GET", &uri).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_status_lists_running_per_source() {
        let app = app(10.0, 10.0, 80.0);
        call(&app, "POST", "/admin/scraper/trigger/tavily").await;
        let (status, body) = call(&app, "GET", "/admin/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["level"], "NORMAL");
        assert_eq!(body["running"]["tavily"], 1);
        assert_eq!(body["running"]["remoteok"], 0);
        assert_eq!(body["scrapes"]["tavily"], json!({"succeeded": 0, "failed": 0, "listings": 0}));
        assert_eq!(body["fail_safe"], false);
    }
}
