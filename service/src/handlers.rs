use axum::{
    extract::{Query, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use common::{EtlRunRequest, JobRunRequest, RunKind, RunRecord};
use runner::{run_etl, JobRunner};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::auth::{self, AuthMode};
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/echo", get(echo))
        .route("/etl/run", post(etl_run))
        .route("/job/run", post(job_run))
        .route("/mcp/models", get(mcp_models))
        .route("/mcp/chat", post(mcp_chat))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_auth));

    Router::new()
        .route("/health", get(health))
        .route("/token", post(token))
        .merge(protected)
        .layer(middleware::from_fn_with_state(state.clone(), log_requests))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/* ---------------- middleware ---------------- */

// método + URL y status de cada pedido al log del servicio
async fn log_requests(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let resp = next.run(req).await;
    state
        .request_log
        .info(&format!("{method} {uri} -> {}", resp.status().as_u16()));
    resp
}

fn error_body(status: StatusCode, error: impl Into<String>) -> Response {
    (status, Json(json!({"ok": false, "error": error.into()}))).into_response()
}

fn record_run(state: &AppState, record: RunRecord) {
    if let Err(e) = state.store.append_run(record) {
        warn!("no se pudo guardar el run en el proyecto: {e}");
        state.request_log.warn(&format!("no se pudo guardar el run: {e}"));
    }
}

/* ---------------- handlers HTTP ---------------- */

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({"status": "ok", "service": state.service.id}))
}

#[derive(Debug, Deserialize)]
struct EchoQuery {
    lang: Option<String>,
}

async fn echo(State(state): State<AppState>, Query(q): Query<EchoQuery>) -> Json<Value> {
    let lang = q.lang.filter(|l| !l.trim().is_empty()).unwrap_or_else(|| state.lang());
    Json(json!({"ok": true, "lang": lang, "service": state.service.id}))
}

// Emite un JWT a cambio de credenciales Basic
async fn token(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(secret) = state.service.jwt_secret.clone() else {
        return error_body(StatusCode::NOT_FOUND, "este servicio no emite tokens (sin jwt_secret)");
    };
    let (Some(user), Some(pass)) = (&state.service.basic_user, &state.service.basic_pass) else {
        return auth::unauthorized(&common::EtlError::Auth("el servicio no tiene credenciales Basic".into()));
    };
    let basic = AuthMode::Basic { user: user.clone(), pass: pass.clone() };
    if let Err(e) = auth::check(&basic, &headers) {
        return auth::unauthorized(&e);
    }
    match auth::issue_token(&secret, user) {
        Ok(token) => Json(json!({
            "access_token": token,
            "token_type": "bearer",
            "expires_in": auth::TOKEN_TTL_SECS,
        }))
        .into_response(),
        Err(e) => error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn etl_run(State(state): State<AppState>, Json(req): Json<EtlRunRequest>) -> Response {
    let Some(etl) = state.store.etl(&req.etl_id) else {
        return error_body(StatusCode::NOT_FOUND, format!("ETL '{}' no existe", req.etl_id));
    };
    if !state.service.exposes_etl(&etl.id) {
        return error_body(StatusCode::NOT_FOUND, format!("ETL '{}' no expuesto por este servicio", req.etl_id));
    }
    let log_name = if etl.name.trim().is_empty() { &etl.id } else { &etl.name };
    let log = match state.store.logs().etl_log(log_name) {
        Ok(log) => log,
        Err(e) => return error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };
    let log_path = log.path_string();
    info!("POST /etl/run '{}' -> {log_path}", etl.name);

    let result = run_etl(
        &etl,
        &req.overrides,
        &state.store.base_dir(),
        log,
        state.stop.child_token(),
    )
    .await;

    let ok = result.is_ok();
    record_run(&state, RunRecord::now(RunKind::Etl, &etl.id, &etl.name, ok, log_path.clone()));
    match result {
        Ok(_) => Json(json!({"ok": true, "log_path": log_path})).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"ok": false, "error": e.to_string(), "log_path": log_path})),
        )
            .into_response(),
    }
}

async fn job_run(State(state): State<AppState>, Json(req): Json<JobRunRequest>) -> Response {
    let Some(job) = state.store.job(&req.job_id) else {
        return error_body(StatusCode::NOT_FOUND, format!("job '{}' no existe", req.job_id));
    };
    if !state.service.exposes_job(&job.id) {
        return error_body(StatusCode::NOT_FOUND, format!("job '{}' no expuesto por este servicio", req.job_id));
    }

    let mut runner = JobRunner::new(state.store.clone()).with_stop(state.stop.child_token());
    if let Some(services) = &state.services {
        runner = runner.with_services(services.clone());
    }
    match runner.run(&job).await {
        Ok(outcome) => {
            record_run(
                &state,
                RunRecord::now(RunKind::Job, &job.id, &job.name, outcome.success, outcome.log_path.clone()),
            );
            Json(json!({"ok": outcome.success, "log_path": outcome.log_path, "errors": outcome.errors}))
                .into_response()
        }
        Err(e) => error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/* ---------------- MCP: pass-through a Ollama ---------------- */

async fn forward(resp: reqwest::Result<reqwest::Response>) -> Response {
    let resp = match resp {
        Ok(r) => r,
        Err(e) => return error_body(StatusCode::BAD_GATEWAY, format!("LLM no disponible: {e}")),
    };
    let status = StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    match resp.json::<Value>().await {
        Ok(body) => (status, Json(body)).into_response(),
        Err(e) => error_body(StatusCode::BAD_GATEWAY, format!("respuesta del LLM inválida: {e}")),
    }
}

async fn mcp_models(State(state): State<AppState>) -> Response {
    let url = format!("{}/api/tags", state.ollama_base_url());
    forward(state.http.get(&url).send().await).await
}

async fn mcp_chat(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let url = format!("{}/api/chat", state.ollama_base_url());
    forward(state.http.post(&url).json(&body).send().await).await
}
