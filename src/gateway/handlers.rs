//! Request handlers for the HTTP surface.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use super::AppState;
use crate::state::{self, AgentState, RoundRecord};
use crate::utils::{now_ms, preview};

/// `GET /health`
pub(crate) async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

#[derive(Deserialize)]
pub(crate) struct PostMessageBody {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    metadata: Option<Value>,
}

/// `POST /message` — enqueue an inbound message for the executor.
pub(crate) async fn post_message(
    State(app): State<AppState>,
    Json(body): Json<PostMessageBody>,
) -> impl IntoResponse {
    let content = match body.content {
        Some(c) if !c.trim().is_empty() => c,
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "content is required" })),
            )
                .into_response();
        }
    };
    let source = body
        .source
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| format!("http:{}", now_ms()));

    let id = app.queue.push(content, source, body.metadata);
    Json(json!({ "messageId": id })).into_response()
}

/// `GET /status` — loop state plus live `agent.json` fields.
pub(crate) async fn get_status(State(app): State<AppState>) -> impl IntoResponse {
    let status = app.status.read().await;
    let mut body = json!({ "status": status.state.as_str() });
    if let Some(ref err) = status.error {
        body["error"] = serde_json::to_value(err).unwrap_or(Value::Null);
    }
    drop(status);

    match AgentState::load(&app.workspace).await {
        Ok(agent) => {
            body["round"] = json!(agent.round);
            body["provider"] = json!(agent.provider);
            if let Some(model) = agent.model {
                body["model"] = json!(model);
            }
        }
        Err(e) => {
            body["round"] = json!(0);
            body["provider"] = Value::Null;
            body["stateError"] = json!(format!("{e:#}"));
        }
    }
    Json(body).into_response()
}

/// `POST /repair-signal` — drop the sentinel the error-state poller watches.
pub(crate) async fn post_repair_signal(State(app): State<AppState>) -> impl IntoResponse {
    match tokio::fs::write(app.workspace.join(".repair-signal"), "").await {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": format!("{e}") })),
        )
            .into_response(),
    }
}

/// `GET /outbox` — every undelivered reply.
pub(crate) async fn get_outbox(State(app): State<AppState>) -> impl IntoResponse {
    match state::list_outbox(&app.workspace).await {
        Ok(messages) => Json(json!(messages)).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": format!("{e:#}") })),
        )
            .into_response(),
    }
}

/// `DELETE /outbox/:id`
pub(crate) async fn delete_outbox_entry(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state::delete_outbox(&app.workspace, &id).await {
        Ok(true) => Json(json!({ "ok": true })).into_response(),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "no such outbox entry", "id": id })),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": format!("{e:#}") })),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
pub(crate) struct HistoryQuery {
    #[serde(default)]
    offset: usize,
    #[serde(default)]
    limit: Option<usize>,
}

const HISTORY_DEFAULT_LIMIT: usize = 20;
const HISTORY_MAX_LIMIT: usize = 100;

/// `GET /history?offset=&limit=` — newest-first round summaries.
pub(crate) async fn get_history(
    State(app): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    let limit = query
        .limit
        .unwrap_or(HISTORY_DEFAULT_LIMIT)
        .min(HISTORY_MAX_LIMIT);

    let mut rounds = match state::list_rounds(&app.workspace).await {
        Ok(r) => r,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": format!("{e:#}") })),
            )
                .into_response();
        }
    };
    let total = rounds.len();
    rounds.reverse();

    let mut summaries = Vec::new();
    for round in rounds.into_iter().skip(query.offset).take(limit) {
        if let Ok(Some(record)) = state::load_round(&app.workspace, round).await {
            summaries.push(summarise(&record));
        }
    }

    Json(json!({ "total": total, "rounds": summaries })).into_response()
}

/// `GET /history/:round` — full round record.
pub(crate) async fn get_history_round(
    State(app): State<AppState>,
    Path(round): Path<u64>,
) -> impl IntoResponse {
    match state::load_round(&app.workspace, round).await {
        Ok(Some(record)) => Json(json!(record)).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "no such round", "round": round })),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": format!("{e:#}") })),
        )
            .into_response(),
    }
}

/// Condense a round record for the history listing.
fn summarise(record: &RoundRecord) -> Value {
    let calls = record.response.tool_calls.as_deref().unwrap_or_default();

    let mut tool_names: Vec<&str> = calls.iter().map(|c| c.name.as_str()).collect();
    tool_names.sort_unstable();
    tool_names.dedup();

    let call_summaries: Vec<Value> = calls
        .iter()
        .map(|c| {
            json!({
                "name": c.name,
                "argsSummary": preview(&c.args.to_string(), 200),
            })
        })
        .collect();

    let user_preview = record
        .messages
        .iter()
        .find(|m| m.role == "user")
        .and_then(|m| m.content.as_deref())
        .map(|c| preview(c, 120));
    let assistant_preview = record
        .messages
        .iter()
        .find(|m| m.role == "assistant")
        .and_then(|m| m.content.as_deref())
        .map(|c| preview(c, 200));

    json!({
        "round": record.round,
        "timestamp": record.timestamp,
        "provider": record.provider,
        "model": record.model,
        "messageCount": record.messages.len(),
        "toolCallCount": calls.len(),
        "toolNames": tool_names,
        "toolCalls": call_summaries,
        "userPreview": user_preview,
        "assistantPreview": assistant_preview,
        "usage": record.response.usage,
    })
}
