// Visit Ledger - Read-only JSON API
// Axum over the same SQLite ledger the CLI writes

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::NaiveDate;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use visit_ledger::aggregate::{select_records, summarize, summarize_by};
use visit_ledger::store;
use visit_ledger::{
    audit, AttendanceRule, CampaignPeriod, CustomerVisitCounter, DateAxis, GroupDimension,
    GroupSummary, IntegrityReport, LedgerConfig, RecordView, ReportOptions, Snapshot, Summary,
};

/// Shared application state
#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Connection>>,
    config: Arc<LedgerConfig>,
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
    fn bad_request(message: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        tracing::error!("request failed: {:#}", e);
        ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: e.to_string(),
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

/// Query string shared by the record and summary endpoints
#[derive(Debug, Default, Deserialize)]
struct ReportQuery {
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
    axis: Option<DateAxis>,
    rule: Option<AttendanceRule>,
    collapse: Option<bool>,
}

impl ReportQuery {
    fn axis(&self) -> DateAxis {
        self.axis.unwrap_or_default()
    }

    fn options(&self, config: &LedgerConfig) -> ReportOptions {
        let period = match (self.from, self.to) {
            (None, None) => None,
            (from, to) => Some(CampaignPeriod::new(
                from.unwrap_or(NaiveDate::MIN),
                to.unwrap_or(NaiveDate::MAX),
                self.axis(),
            )),
        };

        let mut options = config.report_options(period);
        if let Some(rule) = self.rule {
            options.rule = rule;
        }
        if let Some(collapse) = self.collapse {
            options.collapse_same_day = collapse;
        }
        options
    }
}

fn snapshot(state: &AppState) -> Result<Snapshot, ApiError> {
    let conn = state
        .db
        .lock()
        .map_err(|_| anyhow::anyhow!("database lock poisoned"))?;
    Ok(store::load_snapshot(&conn)?)
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// GET /api/records - Flattened bookings for the selected period
async fn get_records(
    State(state): State<AppState>,
    Query(query): Query<ReportQuery>,
) -> ApiResult<Vec<RecordView>> {
    let snapshot = snapshot(&state)?;
    let records = select_records(&snapshot.history, &query.options(&state.config));
    Ok(Json(ApiResponse::ok(records.into_iter().map(RecordView::from).collect())))
}

/// GET /api/summary
async fn get_summary(
    State(state): State<AppState>,
    Query(query): Query<ReportQuery>,
) -> ApiResult<Summary> {
    let snapshot = snapshot(&state)?;
    let options = query.options(&state.config);
    let records = select_records(&snapshot.history, &options);
    Ok(Json(ApiResponse::ok(summarize(&records, options.rule))))
}

/// GET /api/groups/:dimension - day | month | staff | course | customer
async fn get_groups(
    State(state): State<AppState>,
    Path(dimension): Path<String>,
    Query(query): Query<ReportQuery>,
) -> ApiResult<Vec<GroupSummary>> {
    let dimension: GroupDimension = dimension.parse().map_err(ApiError::bad_request)?;
    let snapshot = snapshot(&state)?;
    let options = query.options(&state.config);
    let records = select_records(&snapshot.history, &options);
    Ok(Json(ApiResponse::ok(summarize_by(&records, options.rule, dimension, query.axis()))))
}

#[derive(Serialize)]
struct CustomerVisits {
    counter: Option<CustomerVisitCounter>,
    visits: Vec<RecordView>,
}

/// GET /api/customers/:id/visits
async fn get_customer_visits(
    State(state): State<AppState>,
    Path(customer_id): Path<String>,
) -> ApiResult<CustomerVisits> {
    let snapshot = snapshot(&state)?;
    let visits: Vec<RecordView> = snapshot
        .records_for_customer(&customer_id)
        .into_iter()
        .map(RecordView::from)
        .collect();

    if visits.is_empty() {
        return Err(ApiError::not_found(format!("no bookings for customer {}", customer_id)));
    }

    Ok(Json(ApiResponse::ok(CustomerVisits {
        counter: snapshot.counter(&customer_id).cloned(),
        visits,
    })))
}

/// GET /api/audit - Integrity report
async fn get_audit(State(state): State<AppState>) -> ApiResult<IntegrityReport> {
    let snapshot = snapshot(&state)?;
    Ok(Json(ApiResponse::ok(audit(&snapshot))))
}

fn router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/records", get(get_records))
        .route("/summary", get(get_summary))
        .route("/groups/:dimension", get(get_groups))
        .route("/customers/:id/visits", get(get_customer_visits))
        .route("/audit", get(get_audit))
        .with_state(state);

    Router::new()
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive())
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var("VISIT_LEDGER_CONFIG").ok().map(std::path::PathBuf::from);
    let config = LedgerConfig::load(config_path.as_deref())?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("visit_ledger={},tower_http=debug", config.log_level))
    });
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting visit-ledger server v{}", visit_ledger::VERSION);

    let conn = store::open(&config.database_path)?;
    tracing::info!("Database opened: {:?}", config.database_path);

    let state = AppState {
        db: Arc::new(Mutex::new(conn)),
        config: Arc::new(config),
    };

    let addr = std::env::var("VISIT_LEDGER_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server running on http://{}", addr);
    axum::serve(listener, router(state)).await?;

    Ok(())
}
