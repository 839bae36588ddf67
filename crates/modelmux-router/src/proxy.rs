use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use modelmux_core::engine::build_headers;
use modelmux_core::types::{STYLE_ANTHROPIC, STYLE_OPENAI};
use modelmux_core::{route_plan, ChatRequest, Engine, RequestMeta, RouteError};
use modelmux_provider::{Anthropic, DEFAULT_MODELS_TIMEOUT};
use modelmux_storage::{CapabilityFilter, ChatUsage, Store, CONFIG_ANTHROPIC_COUNT_TOKENS};

const MAX_LOG_BODY_BYTES: usize = 4 * 1024 * 1024;

#[derive(Clone)]
pub struct RouterState {
    pub engine: Engine,
}

/// Auth-key id resolved by the middleware; 0 is reserved for admin use.
#[derive(Debug, Clone, Copy)]
struct AuthKeyId(i64);

pub fn proxy_router(state: RouterState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(openai_chat))
        .route("/v1/messages", post(anthropic_messages))
        .route("/v1/messages/count_tokens", post(count_tokens))
        .route("/v1/models", get(list_models))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state)
}

async fn require_auth(
    State(state): State<RouterState>,
    mut req: axum::http::Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(key) = extract_auth_key(req.headers()) else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let found = state
        .engine
        .store()
        .find_auth_key(&key)
        .await
        .map_err(|err| {
            error!(error = %err, "auth key lookup failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    let Some(found) = found else {
        return Err(StatusCode::UNAUTHORIZED);
    };

    let trace_id = uuid::Uuid::now_v7().to_string();
    info!(
        event = "request",
        trace_id = %trace_id,
        method = %req.method(),
        path = %req.uri().path(),
        auth_key_id = found.id,
    );
    req.extensions_mut().insert(AuthKeyId(found.id));
    Ok(next.run(req).await)
}

fn extract_auth_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(header::AUTHORIZATION)
        && let Ok(value) = value.to_str()
    {
        let value = value.trim();
        let prefix = "Bearer ";
        if value.len() > prefix.len() && value[..prefix.len()].eq_ignore_ascii_case(prefix) {
            let token = value[prefix.len()..].trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }

    headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

async fn openai_chat(
    State(state): State<RouterState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    auth: axum::Extension<AuthKeyId>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_chat(state, auth.0, addr, headers, body, STYLE_OPENAI).await
}

async fn anthropic_messages(
    State(state): State<RouterState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    auth: axum::Extension<AuthKeyId>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_chat(state, auth.0, addr, headers, body, STYLE_ANTHROPIC).await
}

async fn handle_chat(
    state: RouterState,
    auth: AuthKeyId,
    addr: SocketAddr,
    headers: HeaderMap,
    body: Bytes,
    style: &str,
) -> Response {
    let start = Instant::now();

    let request = match parse_chat_request(style, body) {
        Ok(request) => request,
        Err(message) => {
            return (StatusCode::BAD_REQUEST, Json(serde_json::json!({"error": message})))
                .into_response();
        }
    };

    let meta = RequestMeta {
        user_agent: header_str(&headers, header::USER_AGENT.as_str()),
        remote_ip: Some(remote_ip(&headers, addr)),
        headers,
    };

    let plan = match route_plan(state.engine.store(), style, &request).await {
        Ok(plan) => plan,
        Err(err) => return route_error_response(err),
    };
    let io_log = plan.io_log;

    // Dropping the handler (client disconnect) trips the token, which in
    // turn aborts any in-flight upstream attempt.
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let (upstream, log) = match state
        .engine
        .balance_chat(&cancel, start, style, &request, plan, &meta, auth.0)
        .await
    {
        Ok(outcome) => outcome,
        Err(err) => return route_error_response(err),
    };

    let log_id = match state.engine.store().insert_chat_log(log).await {
        Ok(id) => id,
        Err(err) => {
            error!(error = %err, "persist success log failed");
            0
        }
    };

    relay_response(
        state.engine.store().clone(),
        log_id,
        io_log,
        request,
        start,
        upstream,
    )
}

/// Stream the upstream body back to the client while teeing it to the
/// background finalizer, which fills in usage and timing once the stream
/// ends.
fn relay_response(
    store: Store,
    log_id: i64,
    io_log: bool,
    request: ChatRequest,
    start: Instant,
    upstream: wreq::Response,
) -> Response {
    let status =
        StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    let mut is_sse = false;

    if let Some(headers) = builder.headers_mut() {
        for (name, value) in upstream.headers() {
            if is_hop_by_hop_or_framing_header(name.as_str()) {
                continue;
            }
            let Ok(value_str) = value.to_str() else {
                continue;
            };
            if name.as_str().eq_ignore_ascii_case("content-type")
                && value_str.to_ascii_lowercase().contains("text/event-stream")
            {
                is_sse = true;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_str().as_bytes()),
                HeaderValue::from_str(value_str),
            ) {
                headers.append(name, value);
            }
        }
        if is_sse {
            headers
                .entry(header::CACHE_CONTROL)
                .or_insert(HeaderValue::from_static("no-cache"));
            headers
                .entry(HeaderName::from_static("x-accel-buffering"))
                .or_insert(HeaderValue::from_static("no"));
        }
    }

    let (tx, rx) = mpsc::channel::<Bytes>(32);
    tokio::spawn(finalize_stream(store, log_id, io_log, request, start, upstream, tx));

    let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
    builder
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn finalize_stream(
    store: Store,
    log_id: i64,
    io_log: bool,
    request: ChatRequest,
    start: Instant,
    upstream: wreq::Response,
    tx: mpsc::Sender<Bytes>,
) {
    let mut stream = upstream.bytes_stream();
    let mut body = Vec::new();
    let mut first_chunk_ms = None;

    while let Some(item) = stream.next().await {
        let chunk = match item {
            Ok(chunk) => chunk,
            Err(err) => {
                warn!(error = %err, "upstream body read failed mid-stream");
                break;
            }
        };
        if first_chunk_ms.is_none() {
            first_chunk_ms = Some(start.elapsed().as_millis() as i64);
        }
        append_capped(&mut body, &chunk, MAX_LOG_BODY_BYTES);
        if tx.send(chunk).await.is_err() {
            break;
        }
    }

    let usage = parse_usage(&body, request.stream);
    let outcome = store
        .finalize_chat_log(
            log_id,
            ChatUsage {
                prompt_tokens: usage.prompt,
                completion_tokens: usage.completion,
                total_tokens: usage.total,
                first_chunk_ms,
                total_time_ms: Some(start.elapsed().as_millis() as i64),
            },
        )
        .await;
    if let Err(err) = outcome {
        error!(error = %err, log_id, "finalize chat log failed");
    }

    if io_log {
        let input = String::from_utf8_lossy(&request.raw).to_string();
        let output = String::from_utf8_lossy(&body).to_string();
        if let Err(err) = store.insert_chat_io(log_id, input, output).await {
            error!(error = %err, log_id, "persist chat io failed");
        }
    }
}

fn append_capped(buf: &mut Vec<u8>, chunk: &[u8], cap: usize) {
    if buf.len() >= cap {
        return;
    }
    let take = (cap - buf.len()).min(chunk.len());
    buf.extend_from_slice(&chunk[..take]);
}

#[derive(Debug, Default, PartialEq)]
struct Usage {
    prompt: Option<i64>,
    completion: Option<i64>,
    total: Option<i64>,
}

/// Best-effort usage extraction: the final JSON body for buffered
/// responses, the last `usage`-bearing SSE event for streams. Absent usage
/// leaves the log's token fields null.
fn parse_usage(body: &[u8], stream: bool) -> Usage {
    if !stream {
        return serde_json::from_slice::<serde_json::Value>(body)
            .ok()
            .and_then(|value| usage_from_value(&value))
            .unwrap_or_default();
    }

    let mut usage = Usage::default();
    for line in body.split(|byte| *byte == b'\n') {
        let Some(payload) = line.strip_prefix(b"data: ") else {
            continue;
        };
        if payload.starts_with(b"[DONE]") {
            continue;
        }
        if let Ok(value) = serde_json::from_slice::<serde_json::Value>(payload)
            && let Some(found) = usage_from_value(&value)
        {
            usage = found;
        }
    }
    usage
}

fn usage_from_value(value: &serde_json::Value) -> Option<Usage> {
    let usage = value.get("usage")?.as_object()?;
    let grab = |keys: [&str; 2]| {
        keys.iter()
            .find_map(|key| usage.get(*key).and_then(|v| v.as_i64()))
    };
    let prompt = grab(["prompt_tokens", "input_tokens"]);
    let completion = grab(["completion_tokens", "output_tokens"]);
    let total = usage
        .get("total_tokens")
        .and_then(|v| v.as_i64())
        .or(match (prompt, completion) {
            (Some(prompt), Some(completion)) => Some(prompt + completion),
            _ => None,
        });
    if prompt.is_none() && completion.is_none() && total.is_none() {
        return None;
    }
    Some(Usage {
        prompt,
        completion,
        total,
    })
}

/// Probe the raw body for the routing facts the engine needs: logical
/// model, stream flag, and capability requirements. The body itself is
/// forwarded untouched.
fn parse_chat_request(style: &str, body: Bytes) -> Result<ChatRequest, String> {
    let value: serde_json::Value =
        serde_json::from_slice(&body).map_err(|err| format!("invalid JSON body: {err}"))?;

    let model = value
        .get("model")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| "missing model".to_string())?
        .to_string();

    let stream = value.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);
    let tool_call = value
        .get("tools")
        .and_then(|v| v.as_array())
        .map(|tools| !tools.is_empty())
        .unwrap_or(false);

    Ok(ChatRequest {
        model,
        stream,
        capabilities: CapabilityFilter {
            tool_call,
            structured_output: probe_structured_output(style, &value),
            image: probe_image_content(style, &value),
        },
        raw: body,
    })
}

fn probe_structured_output(style: &str, value: &serde_json::Value) -> bool {
    match style {
        STYLE_ANTHROPIC => value.get("output_format").is_some(),
        _ => matches!(
            value.pointer("/response_format/type").and_then(|v| v.as_str()),
            Some("json_schema") | Some("json_object")
        ),
    }
}

fn probe_image_content(style: &str, value: &serde_json::Value) -> bool {
    let part_type = if style == STYLE_ANTHROPIC { "image" } else { "image_url" };
    let Some(messages) = value.get("messages").and_then(|v| v.as_array()) else {
        return false;
    };
    messages.iter().any(|message| {
        message
            .get("content")
            .and_then(|content| content.as_array())
            .map(|parts| {
                parts.iter().any(|part| {
                    part.get("type").and_then(|v| v.as_str()) == Some(part_type)
                })
            })
            .unwrap_or(false)
    })
}

fn route_error_response(err: RouteError) -> Response {
    let status = match &err {
        RouteError::ModelNotFound(_) | RouteError::NoProviderForModel(_) => StatusCode::NOT_FOUND,
        RouteError::InvalidPolicy | RouteError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_GATEWAY,
    };
    info!(event = "route_failed", error = %err, status = status.as_u16());
    (status, Json(serde_json::json!({"error": err.to_string()}))).into_response()
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn remote_ip(headers: &HeaderMap, addr: SocketAddr) -> String {
    header_str(headers, "x-forwarded-for")
        .and_then(|value| value.split(',').next().map(|ip| ip.trim().to_string()))
        .unwrap_or_else(|| addr.ip().to_string())
}

// ---- count-tokens passthrough ----

async fn count_tokens(
    State(state): State<RouterState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let config = match state
        .engine
        .store()
        .config_value(CONFIG_ANTHROPIC_COUNT_TOKENS)
        .await
    {
        Ok(Some(config)) => config,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({"error": "count tokens config not found"})),
            )
                .into_response();
        }
        Err(err) => {
            error!(error = %err, "load count tokens config failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let anthropic: Anthropic = match serde_json::from_str(&config) {
        Ok(anthropic) => anthropic,
        Err(err) => {
            error!(error = %err, "parse count tokens config failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let outbound_headers = build_headers(&headers, true, &HashMap::new(), false);
    let request = match anthropic.build_count_tokens(outbound_headers, body) {
        Ok(request) => request,
        Err(err) => {
            error!(error = %err, "build count tokens request failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let client = match state
        .engine
        .cache()
        .get(DEFAULT_MODELS_TIMEOUT, &anthropic.proxy)
    {
        Ok(client) => client,
        Err(err) => {
            error!(error = %err, "count tokens client unavailable");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    let response = match client.execute(request, &CancellationToken::new()).await {
        Ok(response) => response,
        Err(err) => {
            warn!(error = %err, "count tokens upstream failed");
            return (
                StatusCode::BAD_GATEWAY,
                Json(serde_json::json!({"error": err.to_string()})),
            )
                .into_response();
        }
    };

    let status =
        StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    if let Some(out) = builder.headers_mut() {
        for (name, value) in response.headers() {
            if is_hop_by_hop_or_framing_header(name.as_str()) {
                continue;
            }
            let Ok(value_str) = value.to_str() else {
                continue;
            };
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_str().as_bytes()),
                HeaderValue::from_str(value_str),
            ) {
                out.append(name, value);
            }
        }
    }

    let body = response.bytes().await.unwrap_or_default();
    builder
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

// ---- models listing ----

async fn list_models(State(state): State<RouterState>) -> Response {
    match state.engine.store().list_models().await {
        Ok(models) => {
            let data: Vec<serde_json::Value> = models
                .into_iter()
                .map(|model| serde_json::json!({"id": model.name, "object": "model"}))
                .collect();
            Json(serde_json::json!({"object": "list", "data": data})).into_response()
        }
        Err(err) => {
            error!(error = %err, "list models failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn is_hop_by_hop_or_framing_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("content-length")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("keep-alive")
        || name.eq_ignore_ascii_case("proxy-authenticate")
        || name.eq_ignore_ascii_case("proxy-authorization")
        || name.eq_ignore_ascii_case("te")
        || name.eq_ignore_ascii_case("trailer")
        || name.eq_ignore_ascii_case("upgrade")
}
