use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, AUTHORIZATION};
use http::HeaderMap;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use modelmux_provider::{from_config, ClientCache, DispatchError};
use modelmux_storage::{NewChatLog, Store, STATUS_SUCCESS};

use crate::balance;
use crate::error::RouteError;
use crate::types::{BindingRow, ChatRequest, RequestMeta, RoutePlan};

const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

/// Streaming requests get a tighter header budget so an SSE upstream that
/// stalls before its first byte is abandoned early.
pub fn effective_header_timeout(timeout_secs: i32, stream: bool) -> Duration {
    let secs = if stream { timeout_secs / 3 } else { timeout_secs };
    Duration::from_secs(secs.max(0) as u64)
}

/// The routing engine: owns the shared client cache and the store handle
/// used to persist attempt logs.
#[derive(Clone)]
pub struct Engine {
    cache: Arc<ClientCache>,
    store: Store,
}

impl Engine {
    pub fn new(cache: Arc<ClientCache>, store: Store) -> Self {
        Self { cache, store }
    }

    pub fn cache(&self) -> &ClientCache {
        &self.cache
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Dispatch one chat request across the plan's candidates until a 2xx
    /// response, exhaustion, the global deadline, or cancellation.
    ///
    /// On success the response is still open: the caller streams its body
    /// and finalizes the returned log row afterwards. Every failed attempt
    /// has already been queued for persistence when this returns.
    #[allow(clippy::too_many_arguments)]
    pub async fn balance_chat(
        &self,
        cancel: &CancellationToken,
        start: std::time::Instant,
        style: &str,
        request: &ChatRequest,
        mut plan: RoutePlan,
        meta: &RequestMeta,
        auth_key_id: i64,
    ) -> Result<(wreq::Response, NewChatLog), RouteError> {
        if plan.max_retry < 1 || plan.timeout_secs < 1 {
            return Err(RouteError::InvalidPolicy);
        }

        info!(
            event = "route",
            model = %request.model,
            style,
            stream = request.stream,
            tool_call = request.capabilities.tool_call,
            structured_output = request.capabilities.structured_output,
            image = request.capabilities.image,
            candidates = plan.weights.len(),
        );

        // Failed attempts stream to a background recorder; the channel is
        // sized to the retry budget so sends never block in practice.
        let (attempt_tx, attempt_rx) = mpsc::channel(plan.max_retry as usize);
        tokio::spawn(record_attempts(self.store.clone(), attempt_rx));

        let weights = std::mem::take(&mut plan.weights);
        let mut balancer = balance::for_strategy(&plan.strategy, weights, plan.breaker);

        let header_timeout = effective_header_timeout(plan.timeout_secs, request.stream);
        // One deadline bounds the whole multi-attempt loop, decoupled from
        // the per-attempt header timeout.
        let deadline = Instant::now() + Duration::from_secs(plan.timeout_secs as u64);

        let mut retry: i32 = 0;
        while retry < plan.max_retry {
            if cancel.is_cancelled() {
                return Err(RouteError::Cancelled);
            }
            if Instant::now() >= deadline {
                return Err(RouteError::RetryTimeout);
            }

            let id = balancer.pick()?;

            let Some(binding) = plan.bindings.get(&id) else {
                // The weight map and binding map disagree; drop the stale
                // id without spending an attempt. The balancer only
                // shrinks, so this still terminates.
                balancer.delete(id);
                continue;
            };
            let Some(provider) = plan.providers.get(&binding.provider_id) else {
                balancer.delete(id);
                continue;
            };

            let adapter = from_config(&provider.kind, &provider.config_json)?;
            let client = self.cache.get(header_timeout, adapter.proxy_url())?;

            info!(
                event = "attempt",
                provider = %provider.name,
                api = adapter.kind(),
                model = %binding.provider_model,
                retry,
            );

            let log = NewChatLog {
                name: request.model.clone(),
                provider_model: Some(binding.provider_model.clone()),
                provider_name: Some(provider.name.clone()),
                status: STATUS_SUCCESS.to_string(),
                style: style.to_string(),
                user_agent: meta.user_agent.clone(),
                remote_ip: meta.remote_ip.clone(),
                auth_key_id,
                chat_io: plan.io_log,
                retry,
                proxy_time_ms: start.elapsed().as_millis() as i64,
                error: None,
            };

            let headers = build_headers(
                &meta.headers,
                binding.with_header.unwrap_or(false),
                &custom_headers(binding),
                request.stream,
            );

            let outbound = match adapter.build_chat(
                headers,
                &binding.provider_model,
                &request.raw,
                request.stream,
            ) {
                Ok(outbound) => outbound,
                Err(err) => {
                    let _ = attempt_tx.send(log.with_error(err.to_string())).await;
                    balancer.delete(id);
                    retry += 1;
                    continue;
                }
            };

            let response = match client.execute(outbound, cancel).await {
                Ok(response) => response,
                Err(DispatchError::Cancelled) => return Err(RouteError::Cancelled),
                Err(err) => {
                    let _ = attempt_tx.send(log.with_error(err.to_string())).await;
                    balancer.delete(id);
                    retry += 1;
                    continue;
                }
            };

            let status = response.status().as_u16();
            if (200..300).contains(&status) {
                balancer.success(id);
                return Ok((response, log));
            }

            let body = match response.bytes().await {
                Ok(body) => body,
                Err(err) => {
                    error!(error = %err, "read upstream error body failed");
                    Bytes::new()
                }
            };
            let _ = attempt_tx
                .send(log.with_error(format!(
                    "status: {status}, body: {}",
                    String::from_utf8_lossy(&body)
                )))
                .await;

            if status == 429 {
                // Rate limited: keep the candidate but shrink its share.
                balancer.reduce(id);
            } else {
                balancer.delete(id);
            }
            retry += 1;
        }

        Err(RouteError::MaxRetries)
    }
}

async fn record_attempts(store: Store, mut rx: mpsc::Receiver<NewChatLog>) {
    while let Some(entry) = rx.recv().await {
        if let Err(err) = store.insert_chat_log(entry).await {
            error!(error = %err, "persist attempt log failed");
        }
    }
}

/// Assemble the outbound header set: optionally start from the inbound
/// headers, never forward downstream auth material, hint proxies not to
/// buffer streams, and let the binding's custom headers win.
pub fn build_headers(
    source: &HeaderMap,
    with_header: bool,
    custom: &HashMap<String, String>,
    stream: bool,
) -> HeaderMap {
    let mut headers = if with_header {
        source.clone()
    } else {
        HeaderMap::new()
    };

    headers.remove(AUTHORIZATION);
    headers.remove("x-api-key");
    headers.remove("x-goog-api-key");

    if stream {
        headers.insert(X_ACCEL_BUFFERING, HeaderValue::from_static("no"));
    }

    for (key, value) in custom {
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(key.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            headers.insert(name, value);
        }
    }

    headers
}

fn custom_headers(binding: &BindingRow) -> HashMap<String, String> {
    binding
        .custom_headers
        .as_ref()
        .and_then(|value| serde_json::from_value(value.clone()).ok())
        .unwrap_or_default()
}
