// Portfolio Orchestrator - Web Server
// Read-only REST API over the persisted snapshots, for dashboards

use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;

use portfolio_orchestrator::{AggregateSnapshot, RunRecord, SnapshotQuery, SnapshotStore, SqliteStore};

#[derive(Parser, Debug)]
#[command(name = "portfolio-server")]
#[command(about = "Read-only API over orchestrator snapshots")]
#[command(version)]
struct Args {
    /// SQLite database written by `portfolio-orchestrator run --db`
    #[arg(long, env = "PORTFOLIO_DB")]
    db: PathBuf,

    #[arg(long, default_value = "0.0.0.0:3000")]
    addr: String,
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    store: Arc<SqliteStore>,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Response {
        (
            StatusCode::OK,
            Json(Self {
                success: true,
                data: Some(data),
                error: None,
            }),
        )
            .into_response()
    }

    fn not_found(message: String) -> Response {
        (
            StatusCode::NOT_FOUND,
            Json(Self {
                success: false,
                data: None,
                error: Some(message),
            }),
        )
            .into_response()
    }
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    ApiResponse::ok("OK")
}

/// GET /api/snapshot - Latest completed cycle
async fn latest_snapshot(State(state): State<AppState>) -> Response {
    match state.store.get_latest_snapshot() {
        Some(snapshot) => ApiResponse::ok(snapshot),
        None => ApiResponse::<AggregateSnapshot>::not_found("no completed cycle yet".to_string()),
    }
}

/// GET /api/cycles/:id/snapshot
async fn cycle_snapshot(State(state): State<AppState>, Path(cycle_id): Path<u64>) -> Response {
    match state.store.load_snapshot(cycle_id) {
        Ok(Some(snapshot)) => ApiResponse::ok(snapshot),
        Ok(None) => ApiResponse::<AggregateSnapshot>::not_found(format!(
            "no snapshot for cycle {}",
            cycle_id
        )),
        Err(e) => internal_error(e),
    }
}

/// GET /api/cycles/:id/records
async fn cycle_records(State(state): State<AppState>, Path(cycle_id): Path<u64>) -> Response {
    match state.store.get_run_records(cycle_id) {
        Some(records) => ApiResponse::ok(records),
        None => ApiResponse::<Vec<RunRecord>>::not_found(format!(
            "no run records for cycle {}",
            cycle_id
        )),
    }
}

/// GET /api/cycles - Most recent cycle ids with a snapshot
async fn list_cycles(State(state): State<AppState>) -> Response {
    match state.store.list_cycles(100) {
        Ok(ids) => ApiResponse::ok(ids),
        Err(e) => internal_error(e),
    }
}

fn internal_error(e: anyhow::Error) -> Response {
    tracing::error!(error = %e, "Store query failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(e.to_string()),
        }),
    )
        .into_response()
}

fn router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/snapshot", get(latest_snapshot))
        .route("/cycles", get(list_cycles))
        .route("/cycles/:id/snapshot", get(cycle_snapshot))
        .route("/cycles/:id/records", get(cycle_records))
        .with_state(state);

    Router::new()
        .nest("/api", api_routes)
        .layer(ServiceBuilder::new().layer(CorsLayer::permissive()))
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    println!("🌐 Portfolio Orchestrator - Web Server");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    if !args.db.exists() {
        eprintln!("❌ Database not found at {:?}", args.db);
        eprintln!("   Run: portfolio-orchestrator run --registry <file> --db {:?}", args.db);
        eprintln!("   to produce a snapshot first.");
        std::process::exit(1);
    }

    let store = SqliteStore::open(&args.db)?;
    println!("✓ Database opened: {:?}", args.db);

    let app = router(AppState {
        store: Arc::new(store),
    });

    let listener = tokio::net::TcpListener::bind(&args.addr)
        .await
        .with_context(|| format!("Failed to bind to {}", args.addr))?;

    println!("\n🚀 Server running on http://{}", args.addr);
    println!("   API: http://{}/api/snapshot", args.addr);
    println!("\n   Press Ctrl+C to stop\n");

    axum::serve(listener, app)
        .await
        .context("Server terminated")?;

    Ok(())
}
