//! ReceiptGate service binary: env configuration, store startup, and the
//! axum front-end exposing `POST /mcp` (JSON-RPC tools) and `GET /health`.
//!
//! Exit codes: 0 clean shutdown, 1 configuration error, 2 migration failure,
//! 3 fatal runtime error.

mod auth;
mod config;
mod rpc;

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde_json::{json, Value};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use receiptgate_store::open_store;

use crate::auth::require_api_key;
use crate::config::Config;
use crate::rpc::{envelope_error, handle_rpc, health_payload, rpc_error, AppState, RpcRequest};

#[derive(Debug, Parser)]
#[command(name = "receiptgate")]
#[command(about = "Append-only, content-addressed receipt ledger")]
struct Args {
    /// Override RECEIPTGATE_BIND.
    #[arg(long)]
    bind: Option<SocketAddr>,
    /// Override RECEIPTGATE_DATABASE_URL.
    #[arg(long)]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!("configuration error: {err:#}");
            return ExitCode::from(1);
        }
    };
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if let Some(database_url) = args.database_url {
        config.database_url = database_url;
    }

    let store = match open_store(&config.database_url, config.store_options()).await {
        Ok(store) => store,
        Err(err) => {
            error!("failed to open store: {err}");
            return ExitCode::from(3);
        }
    };

    if config.auto_migrate_on_startup {
        match store.migrate().await {
            Ok(report) if report.applied.is_empty() => info!("schema is up to date"),
            Ok(report) => info!(applied = ?report.applied, "schema migrations applied"),
            Err(err) => {
                error!("migration failure: {err}");
                return ExitCode::from(2);
            }
        }
    }

    let bind = config.bind;
    let state = AppState {
        config: Arc::new(config),
        store,
    };

    let listener = match tokio::net::TcpListener::bind(bind).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(%bind, "failed to bind: {err}");
            return ExitCode::from(3);
        }
    };
    info!(%bind, "receiptgate listening");

    if let Err(err) = axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("server error: {err}");
        return ExitCode::from(3);
    }
    info!("clean shutdown");
    ExitCode::SUCCESS
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/mcp", post(mcp))
        .with_state(state)
}

/// Unauthenticated liveness probe: 200 when the database answers, 503
/// otherwise, same payload shape as the `receiptgate.health` tool.
async fn health(State(state): State<AppState>) -> Response {
    match state.store.ping().await {
        Ok(()) => (StatusCode::OK, Json(health_payload(&state.config))).into_response(),
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "unavailable",
                "service": "ReceiptGate",
                "version": env!("CARGO_PKG_VERSION"),
                "instance_id": state.config.service_name,
                "detail": err.to_string(),
            })),
        )
            .into_response(),
    }
}

async fn mcp(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<Value>, JsonRejection>,
) -> Response {
    if let Err(err) = require_api_key(&headers, &state.config) {
        let status = StatusCode::from_u16(err.http_hint()).unwrap_or(StatusCode::UNAUTHORIZED);
        return (status, Json(rpc_error(Value::Null, &err))).into_response();
    }

    let Json(value) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            return Json(envelope_error(
                Value::Null,
                -32700,
                &format!("parse error: {rejection}"),
            ))
            .into_response();
        }
    };
    let request: RpcRequest = match serde_json::from_value(value) {
        Ok(request) => request,
        Err(err) => {
            return Json(envelope_error(
                Value::Null,
                -32600,
                &format!("invalid request: {err}"),
            ))
            .into_response();
        }
    };

    Json(handle_rpc(&state, request).await).into_response()
}
