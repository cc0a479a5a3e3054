//! Admin route handlers.

use std::time::Duration;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use super::state::AppState;
use crate::dispatch::AlertDispatcher;
use crate::evaluator::{chrono_span, MatchEvent};
use crate::rules::duration::format_duration;
use crate::search::{Record, TimeWindow};

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/rules", get(list_rules))
        .route("/status", get(rule_status))
        .route("/leader", get(leader))
        .route("/alert/preview", post(preview_alert))
}

fn meta() -> Value {
    json!({
        "timestamp": Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

fn error(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message, "meta": meta() }))).into_response()
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let leader = state.controller.leader_state();
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "leader": leader.is_leader
        },
        "meta": meta()
    }))
}

pub async fn reload(State(state): State<AppState>) -> Response {
    if state.controller.reload_rules().await {
        (
            StatusCode::ACCEPTED,
            Json(json!({ "data": { "reload": "queued" }, "meta": meta() })),
        )
            .into_response()
    } else {
        error(StatusCode::SERVICE_UNAVAILABLE, "controller is not running".to_string())
    }
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    if !state.exporter_enabled {
        return (StatusCode::NOT_FOUND, "not found").into_response();
    }
    match state.controller.status().render_prometheus() {
        Ok(text) => ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], text).into_response(),
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn list_rules(State(state): State<AppState>) -> Json<Value> {
    let rules = state.controller.rules();
    let active: Vec<Value> = rules
        .current()
        .iter()
        .map(|r| {
            json!({
                "name": r.name,
                "kind": r.kind.as_str(),
                "index": r.index,
                "run_every": format_duration(r.run_every),
                "realert": format_duration(r.realert),
                "destinations": r.destinations,
                "source": r.source.display().to_string(),
            })
        })
        .collect();
    let errors: Vec<String> = rules.errors().iter().map(|e| e.to_string()).collect();

    Json(json!({
        "data": { "rules": active, "errors": errors },
        "meta": { "total": active.len(), "invalid": errors.len() }
    }))
}

async fn rule_status(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.controller.status().snapshot();
    Json(json!({
        "data": snapshot,
        "meta": { "total": snapshot.len() }
    }))
}

async fn leader(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "data": state.controller.leader_state(), "meta": meta() }))
}

#[derive(Debug, Deserialize)]
pub struct PreviewRequest {
    pub rule: String,
    #[serde(default)]
    pub key: Option<String>,
    pub record: PreviewRecord,
}

#[derive(Debug, Deserialize)]
pub struct PreviewRecord {
    #[serde(default = "preview_id")]
    pub id: String,
    #[serde(default)]
    pub index: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub source: Value,
}

fn preview_id() -> String {
    "preview".to_string()
}

/// Render the alert a rule would send for one sample document.
async fn preview_alert(
    State(state): State<AppState>,
    Json(req): Json<PreviewRequest>,
) -> Response {
    let rules = state.controller.rules().current();
    let Some(rule) = rules.get(&req.rule) else {
        return error(StatusCode::NOT_FOUND, format!("unknown rule '{}'", req.rule));
    };

    let now = Utc::now();
    let start = now
        .checked_sub_signed(chrono_span(rule.run_every))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    let record = Record {
        id: req.record.id,
        index: req.record.index.unwrap_or_else(|| rule.index.clone()),
        timestamp: req.record.timestamp.or(Some(now)),
        source: req.record.source,
    };
    let event = MatchEvent::new(rule, TimeWindow::new(start, now), req.key)
        .with_records(std::iter::once(&record), state.controller.status().max_ids())
        .with_count(1);

    match AlertDispatcher::new(1, Duration::ZERO).render(&event, rule) {
        Ok(message) => Json(json!({ "data": message, "meta": meta() })).into_response(),
        Err(e) => error(StatusCode::UNPROCESSABLE_ENTITY, e.to_string()),
    }
}
