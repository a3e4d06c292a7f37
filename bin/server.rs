// Trust Reconciliation - API Server
// REST surface over the reconciliation core, built with Axum

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use trust_reconciliation::{
    audit, db, logging, AppConfig, EventRange, ExceptionAction, ExceptionStatus, ExportFormat,
    MatchingCoordinator, ReconError, Settings,
};

/// Shared application state
#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Connection>>,
    settings: Arc<Settings>,
    actor_id: String,
}

impl AppState {
    fn conn(&self) -> Result<MutexGuard<'_, Connection>, ApiError> {
        self.db
            .lock()
            .map_err(|_| ApiError::internal("database lock poisoned"))
    }
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn internal(message: &str) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.to_string(),
        }
    }
}

impl From<ReconError> for ApiError {
    fn from(err: ReconError) -> Self {
        let status = match &err {
            ReconError::Validation(_) => StatusCode::BAD_REQUEST,
            ReconError::NotFound { .. } => StatusCode::NOT_FOUND,
            ReconError::StateConflict { .. } => StatusCode::CONFLICT,
            ReconError::TransientProvider(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(kind = err.kind(), error = %err, "Request failed");
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body: ApiResponse<()> = ApiResponse {
            success: false,
            data: None,
            error: Some(self.message),
        };
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

#[derive(Deserialize)]
struct ExceptionQuery {
    status: Option<String>,
}

#[derive(Deserialize)]
struct ExportQuery {
    format: Option<String>,
}

#[derive(Deserialize)]
struct BulkRequest {
    exception_ids: Vec<String>,
    #[serde(flatten)]
    action: ExceptionAction,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok(trust_reconciliation::VERSION))
}

/// POST /api/companies/:company/runs - Run the matching pipeline
async fn run_matching(
    State(state): State<AppState>,
    Path(company_id): Path<String>,
) -> ApiResult<trust_reconciliation::MatchingReport> {
    let conn = state.conn()?;
    let report = MatchingCoordinator::new(&conn, (*state.settings).clone())
        .with_actor(&state.actor_id)
        .run_matching(&company_id)?;
    Ok(Json(ApiResponse::ok(report)))
}

/// GET /api/companies/:company/exceptions?status= - List exceptions, most severe first
async fn list_exceptions(
    State(state): State<AppState>,
    Path(company_id): Path<String>,
    Query(query): Query<ExceptionQuery>,
) -> ApiResult<Vec<trust_reconciliation::Exception>> {
    let status = match query.status.as_deref() {
        None | Some("all") => None,
        Some(s) => Some(s.parse::<ExceptionStatus>()?),
    };
    let conn = state.conn()?;
    let list = db::get_exceptions(&conn, &company_id, status)?;
    Ok(Json(ApiResponse::ok(list)))
}

/// GET /api/exceptions/:id
async fn get_exception(
    State(state): State<AppState>,
    Path(exception_id): Path<String>,
) -> ApiResult<trust_reconciliation::Exception> {
    let conn = state.conn()?;
    let exception = db::get_exception(&conn, &exception_id)?;
    Ok(Json(ApiResponse::ok(exception)))
}

/// POST /api/exceptions/:id/transition - `{"action":"resolve"}` or `{"action":"ignore"}`
async fn transition_exception(
    State(state): State<AppState>,
    Path(exception_id): Path<String>,
    Json(action): Json<ExceptionAction>,
) -> ApiResult<trust_reconciliation::TransitionOutcome> {
    let conn = state.conn()?;
    let outcome = trust_reconciliation::transition(&conn, &exception_id, &action, &state.actor_id)?;
    Ok(Json(ApiResponse::ok(outcome)))
}

/// POST /api/exceptions/bulk - Per-item results; one failure never aborts the rest
async fn bulk_transition(
    State(state): State<AppState>,
    Json(request): Json<BulkRequest>,
) -> ApiResult<trust_reconciliation::BulkTransitionReport> {
    let conn = state.conn()?;
    let report = trust_reconciliation::bulk_transition(
        &conn,
        &request.exception_ids,
        &request.action,
        &state.actor_id,
    );
    Ok(Json(ApiResponse::ok(report)))
}

/// GET /api/companies/:company/audit/verify
async fn verify_audit(
    State(state): State<AppState>,
    Path(company_id): Path<String>,
) -> ApiResult<trust_reconciliation::IntegrityReport> {
    let conn = state.conn()?;
    let report = audit::verify_integrity(&conn, &company_id)?;
    Ok(Json(ApiResponse::ok(report)))
}

/// GET /api/companies/:company/audit/export?format=json|csv
async fn export_audit(
    State(state): State<AppState>,
    Path(company_id): Path<String>,
    Query(query): Query<ExportQuery>,
) -> Result<Response, ApiError> {
    let format: ExportFormat = query.format.as_deref().unwrap_or("json").parse()?;
    let conn = state.conn()?;
    let body = audit::export_audit_trail(&conn, &company_id, format, &EventRange::all())?;

    let content_type = match format {
        ExportFormat::Json => "application/json",
        ExportFormat::Csv => "text/csv",
    };
    Ok(([(axum::http::header::CONTENT_TYPE, content_type)], body).into_response())
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    logging::init(&config.log_level, config.log_json)?;

    println!("🌐 Trust Reconciliation - API Server");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let settings = config.load_settings()?;
    let conn = db::open(&config.db_path)?;
    println!("✓ Database opened: {:?}", config.db_path);

    let state = AppState {
        db: Arc::new(Mutex::new(conn)),
        settings: Arc::new(settings),
        actor_id: config.actor_id.clone(),
    };

    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/companies/:company/runs", post(run_matching))
        .route("/companies/:company/exceptions", get(list_exceptions))
        .route("/companies/:company/audit/verify", get(verify_audit))
        .route("/companies/:company/audit/export", get(export_audit))
        .route("/exceptions/bulk", post(bulk_transition))
        .route("/exceptions/:id", get(get_exception))
        .route("/exceptions/:id/transition", post(transition_exception))
        .with_state(state);

    let app = Router::new()
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, "API server listening");

    println!("\n🚀 Server running on http://{}", config.bind_addr);
    println!("   API: http://{}/api/health", config.bind_addr);
    println!("\n   Press Ctrl+C to stop\n");

    axum::serve(listener, app).await?;
    Ok(())
}
