// src/main.rs
use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

mod pms_client;
mod reconcile;
mod scheduler;
mod store;
mod submit;
mod workdays;

mod submit_tests;

use pms_client::{PmsClient, PmsError, PortalApi, DEFAULT_PORTAL_BASE_URL};
use scheduler::{RunRequest, Scheduler, SchedulerConfig};
use store::{ConfigPatch, Store, StoreError, WorkConfig};
use workdays::HolidayCalendar;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
const DEFAULT_PORT: u16 = 9667;

#[derive(Error, Debug)]
enum AppError {
    #[error("store failure")]
    Store(#[from] StoreError),

    #[error("{0}")]
    Portal(#[from] PmsError),

    #[error("a run is already in progress")]
    Busy,

    #[error("{0}")]
    BadRequest(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error!("request failed: {}", self);
        let status = match &self {
            AppError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Portal(PmsError::LoginRejected { .. }) => StatusCode::UNAUTHORIZED,
            AppError::Portal(_) => StatusCode::BAD_GATEWAY,
            AppError::Busy => StatusCode::CONFLICT,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
        };
        (status, Json(envelope_err(&self.to_string()))).into_response()
    }
}

// Reply envelope the frontend expects: {code, msg, data}.
fn envelope<T: Serialize>(data: T) -> Value {
    serde_json::json!({ "code": 200, "msg": "success", "data": data })
}

fn envelope_err(msg: &str) -> Value {
    serde_json::json!({ "msg": msg })
}

#[derive(Clone)]
struct AppState {
    store: Arc<Store>,
    portal: Arc<dyn PortalApi>,
    scheduler: Arc<Scheduler>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Setting tracing subscriber failed")?;

    let port = env::var("PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_PORT);
    let data_dir = PathBuf::from(env::var("DATA_DIR").unwrap_or_else(|_| "./data".to_string()));
    let portal_base_url =
        env::var("PORTAL_BASE_URL").unwrap_or_else(|_| DEFAULT_PORTAL_BASE_URL.to_string());
    let frontend_dir =
        PathBuf::from(env::var("FRONTEND_DIR").unwrap_or_else(|_| "./frontend/dist".to_string()));

    let store = Arc::new(Store::open(&data_dir).context("Opening config store failed")?);
    // A crash mid-run can strand the persisted busy marker; no run can be
    // in flight before the scheduler starts.
    store.clear_stale_running()?;

    let portal: Arc<dyn PortalApi> =
        Arc::new(PmsClient::new(&portal_base_url).context("Building portal client failed")?);
    let calendar = Arc::new(HolidayCalendar::new());

    let scheduler = Scheduler::new(
        store.clone(),
        portal.clone(),
        calendar,
        SchedulerConfig::default(),
    );
    scheduler.start();

    let state = AppState {
        store,
        portal,
        scheduler: scheduler.clone(),
    };

    let api_routes = Router::new()
        .route("/", get(handle_root))
        .route("/version", get(handle_version))
        .route("/config", get(handle_get_config).post(handle_save_config))
        .route("/taskStatus", get(handle_task_status))
        .route("/fetchProjects", post(handle_fetch_projects))
        .route("/AutoWorkTime", post(handle_auto_work_time));

    let app = Router::new()
        .nest("/api", api_routes)
        .fallback_service(ServeDir::new(frontend_dir))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Binding listen address failed")?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(scheduler))
        .await
        .context("HTTP server failed")?;

    Ok(())
}

async fn shutdown_signal(scheduler: Arc<Scheduler>) {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown signal received");
        // Cancels future ticks only; an in-flight run finishes on its own.
        scheduler.stop();
    }
}

// --- Handlers ---

async fn handle_root() -> Json<Value> {
    Json(envelope(format!("connected, version {}", VERSION)))
}

async fn handle_version() -> Json<Value> {
    Json(envelope(serde_json::json!({ "webVersion": VERSION })))
}

async fn handle_get_config(State(state): State<AppState>) -> Json<Value> {
    Json(envelope(state.store.config()))
}

async fn handle_save_config(
    State(state): State<AppState>,
    Json(patch): Json<ConfigPatch>,
) -> Result<Json<Value>, AppError> {
    let merged = state.store.update_config(patch)?;
    info!("configuration updated");
    Ok(Json(envelope(merged)))
}

async fn handle_task_status(State(state): State<AppState>) -> Json<Value> {
    Json(envelope(state.store.task_status()))
}

#[derive(Deserialize)]
struct CredentialsBody {
    username: String,
    password: String,
}

/// Logs in with the supplied credentials and returns the raw timesheet
/// payload; the UI reads its project/task listing from it.
async fn handle_fetch_projects(
    State(state): State<AppState>,
    Json(body): Json<CredentialsBody>,
) -> Result<Json<Value>, AppError> {
    let session = state.portal.login(&body.username, &body.password).await?;
    let data = state.portal.fetch_ts_data(&session).await?;
    Ok(Json(envelope(data)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AutoWorkTimeBody {
    username: String,
    password: String,
    work_config: WorkConfig,
    #[serde(default)]
    desc_list: Vec<String>,
    #[serde(default)]
    work_list: Option<Vec<String>>,
}

/// Manual trigger: runs the pipeline now with the supplied configuration.
/// Bypasses the cadence policy, honors mutual exclusion (409 while busy).
async fn handle_auto_work_time(
    State(state): State<AppState>,
    Json(body): Json<AutoWorkTimeBody>,
) -> Result<Json<Value>, AppError> {
    let explicit_dates = match &body.work_list {
        Some(list) if !list.is_empty() => Some(parse_work_list(list)?),
        _ => None,
    };
    let request = RunRequest::new(
        body.username,
        body.password,
        body.work_config,
        body.desc_list,
        explicit_dates,
    )
    .map_err(|e| AppError::BadRequest(e.to_string()))?;

    let report = state
        .scheduler
        .run_manual(request)
        .await
        .map_err(|_| AppError::Busy)?;
    Ok(Json(envelope(report)))
}

fn parse_work_list(dates: &[String]) -> Result<Vec<NaiveDate>, AppError> {
    dates
        .iter()
        .map(|s| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map_err(|_| AppError::BadRequest(format!("invalid date '{}' in workList", s)))
        })
        .collect()
}
