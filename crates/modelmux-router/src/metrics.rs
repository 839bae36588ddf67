use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tracing::error;

use modelmux_provider::from_config;

use crate::proxy::RouterState;

const TOP_N: usize = 5;

#[derive(Debug, Clone, Serialize)]
struct Count {
    #[serde(rename = "model")]
    label: String,
    calls: i64,
}

#[derive(Debug, Clone, Serialize)]
struct ProjectCount {
    project: String,
    calls: i64,
}

/// Read-only observability surface plus the provider catalog proxy.
pub fn api_router(state: RouterState) -> Router {
    Router::new()
        .route("/api/metrics/daily/{days}", get(daily))
        .route("/api/metrics/hourly/{hours}", get(hourly))
        .route("/api/metrics/counts", get(counts))
        .route("/api/metrics/projects", get(projects))
        .route("/api/providers/{id}/models", get(provider_models))
        .with_state(state)
}

async fn daily(State(state): State<RouterState>, Path(days): Path<i64>) -> Response {
    if days < 0 {
        return (StatusCode::BAD_REQUEST, "invalid days parameter").into_response();
    }
    match state.engine.store().daily_metrics(days).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => {
            error!(error = %err, "daily metrics query failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn hourly(State(state): State<RouterState>, Path(hours): Path<i64>) -> Response {
    if hours < 0 {
        return (StatusCode::BAD_REQUEST, "invalid hours parameter").into_response();
    }
    match state.engine.store().hourly_metrics(hours).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => {
            error!(error = %err, "hourly metrics query failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn counts(State(state): State<RouterState>) -> Response {
    match state.engine.store().model_counts().await {
        Ok(rows) => {
            let rolled = rollup(
                rows.into_iter().map(|row| (row.model, row.calls)).collect(),
                "others",
            );
            Json(rolled).into_response()
        }
        Err(err) => {
            error!(error = %err, "model counts query failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn projects(State(state): State<RouterState>) -> Response {
    let store = state.engine.store();
    let rows = match store.project_counts().await {
        Ok(rows) => rows,
        Err(err) => {
            error!(error = %err, "project counts query failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let keys = match store.list_auth_keys().await {
        Ok(keys) => keys,
        Err(err) => {
            error!(error = %err, "auth key list failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let names: std::collections::HashMap<i64, String> = keys
        .into_iter()
        .map(|key| (key.id, key.name.trim().to_string()))
        .collect();

    // Calls recorded without a key belong to the admin surface; keys that
    // have since been deleted fall into a dash bucket.
    let mut by_project: std::collections::HashMap<String, i64> = std::collections::HashMap::new();
    for row in rows {
        let project = if row.auth_key_id == 0 {
            "admin".to_string()
        } else {
            names
                .get(&row.auth_key_id)
                .filter(|name| !name.is_empty())
                .cloned()
                .unwrap_or_else(|| "-".to_string())
        };
        *by_project.entry(project).or_insert(0) += row.calls;
    }

    let mut rows: Vec<(String, i64)> = by_project.into_iter().collect();
    rows.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let rolled: Vec<ProjectCount> = rollup(rows, "others")
        .into_iter()
        .map(|count| ProjectCount {
            project: count.label,
            calls: count.calls,
        })
        .collect();
    Json(rolled).into_response()
}

async fn provider_models(State(state): State<RouterState>, Path(id): Path<i64>) -> Response {
    let provider = match state.engine.store().find_provider(id).await {
        Ok(Some(provider)) => provider,
        Ok(None) => return (StatusCode::NOT_FOUND, "provider not found").into_response(),
        Err(err) => {
            error!(error = %err, "provider lookup failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let adapter = match from_config(&provider.kind, &provider.config_json) {
        Ok(adapter) => adapter,
        Err(err) => {
            error!(error = %err, provider = %provider.name, "provider config rejected");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    match adapter.list_models(state.engine.cache()).await {
        Ok(models) => Json(models).into_response(),
        Err(err) => (
            StatusCode::BAD_GATEWAY,
            Json(serde_json::json!({"error": err.to_string()})),
        )
            .into_response(),
    }
}

fn rollup(rows: Vec<(String, i64)>, other_label: &str) -> Vec<Count> {
    let mut out: Vec<Count> = rows
        .iter()
        .take(TOP_N)
        .map(|(label, calls)| Count {
            label: label.clone(),
            calls: *calls,
        })
        .collect();
    if rows.len() > TOP_N {
        let others: i64 = rows[TOP_N..].iter().map(|(_, calls)| calls).sum();
        out.push(Count {
            label: other_label.to_string(),
            calls: others,
        });
    }
    out
}
