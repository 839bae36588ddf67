use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use httpmock::prelude::*;
use tokio_util::sync::CancellationToken;

use modelmux_core::{route_plan, ChatRequest, Engine, RequestMeta, RouteError};
use modelmux_provider::ClientCache;
use modelmux_storage::{
    BindingInput, CapabilityFilter, ModelInput, ProviderInput, Store, STATUS_ERROR,
};

const STYLE: &str = "openai";

struct Harness {
    _dir: tempfile::TempDir,
    store: Store,
    engine: Engine,
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let dsn = format!(
        "sqlite://{}?mode=rwc",
        dir.path().join("engine.db").display()
    );
    let store = Store::connect(&dsn).await.expect("connect");
    store.sync().await.expect("sync");
    let engine = Engine::new(Arc::new(ClientCache::new()), store.clone());
    Harness {
        _dir: dir,
        store,
        engine,
    }
}

async fn seed_model(store: &Store, strategy: &str, max_retry: i32, time_out: i32) {
    store
        .upsert_model(ModelInput {
            name: "gpt-test".to_string(),
            max_retry,
            time_out,
            io_log: false,
            strategy: strategy.to_string(),
            breaker: false,
        })
        .await
        .expect("seed model");
}

async fn seed_upstream(store: &Store, name: &str, base_url: &str, api_key: &str, weight: i32) {
    let model = store
        .find_model_by_name("gpt-test")
        .await
        .expect("query")
        .expect("model seeded");
    let provider_id = store
        .upsert_provider(ProviderInput {
            name: name.to_string(),
            kind: STYLE.to_string(),
            config_json: serde_json::json!({"base_url": base_url, "api_key": api_key}),
            enabled: true,
        })
        .await
        .expect("seed provider");
    store
        .insert_binding(BindingInput {
            model_id: model.id,
            provider_id,
            provider_model: format!("{name}-model"),
            weight,
            enabled: true,
            tool_call: false,
            structured_output: false,
            image: false,
            with_header: None,
            custom_headers: None,
        })
        .await
        .expect("seed binding");
}

fn chat_request(stream: bool) -> ChatRequest {
    ChatRequest {
        model: "gpt-test".to_string(),
        stream,
        capabilities: CapabilityFilter::default(),
        raw: Bytes::from_static(br#"{"model":"gpt-test","messages":[{"role":"user","content":"hi"}]}"#),
    }
}

async fn error_logs(store: &Store) -> Vec<modelmux_storage::entities::chat_logs::Model> {
    // The attempt recorder runs on its own task; give it a beat to flush.
    tokio::time::sleep(Duration::from_millis(200)).await;
    store
        .list_chat_logs()
        .await
        .expect("list logs")
        .into_iter()
        .filter(|log| log.status == STATUS_ERROR)
        .collect()
}

#[tokio::test]
async fn happy_path_dispatches_once() {
    let h = harness().await;
    seed_model(&h.store, "lottery", 3, 30).await;

    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST).path("/chat/completions");
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"id":"ok","usage":{"total_tokens":5}}"#);
    });
    seed_upstream(&h.store, "solo", &upstream.base_url(), "key-solo", 10).await;

    let request = chat_request(false);
    let plan = route_plan(&h.store, STYLE, &request).await.expect("plan");
    let cancel = CancellationToken::new();
    let (response, log) = h
        .engine
        .balance_chat(
            &cancel,
            Instant::now(),
            STYLE,
            &request,
            plan,
            &RequestMeta::default(),
            0,
        )
        .await
        .expect("success");

    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(log.provider_name.as_deref(), Some("solo"));
    assert_eq!(log.provider_model.as_deref(), Some("solo-model"));
    assert_eq!(log.retry, 0);

    let body = response.bytes().await.expect("body");
    assert!(body.starts_with(br#"{"id":"ok""#));

    mock.assert_hits(1);
    assert!(error_logs(&h.store).await.is_empty());
}

#[tokio::test]
async fn outbound_body_carries_the_provider_side_model() {
    let h = harness().await;
    seed_model(&h.store, "lottery", 3, 30).await;

    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST)
            .path("/chat/completions")
            .header("authorization", "Bearer key-solo")
            .json_body_partial(r#"{"model":"solo-model"}"#);
        then.status(200).body("{}");
    });
    seed_upstream(&h.store, "solo", &upstream.base_url(), "key-solo", 10).await;

    let request = chat_request(false);
    let plan = route_plan(&h.store, STYLE, &request).await.expect("plan");
    h.engine
        .balance_chat(
            &CancellationToken::new(),
            Instant::now(),
            STYLE,
            &request,
            plan,
            &RequestMeta::default(),
            0,
        )
        .await
        .expect("success");

    mock.assert_hits(1);
}

#[tokio::test]
async fn rate_limited_candidate_is_reduced_and_rescued() {
    let h = harness().await;
    // Equal weights under the rotor: the first-inserted binding is tried
    // first, deterministically.
    seed_model(&h.store, "rotor", 3, 30).await;

    let first = MockServer::start();
    let limited = first.mock(|when, then| {
        when.method(POST).path("/chat/completions");
        then.status(429).body(r#"{"error":"slow down"}"#);
    });
    let second = MockServer::start();
    let healthy = second.mock(|when, then| {
        when.method(POST).path("/chat/completions");
        then.status(200).body(r#"{"id":"rescued"}"#);
    });
    seed_upstream(&h.store, "a", &first.base_url(), "key-a", 10).await;
    seed_upstream(&h.store, "b", &second.base_url(), "key-b", 10).await;

    let request = chat_request(false);
    let plan = route_plan(&h.store, STYLE, &request).await.expect("plan");
    let (response, log) = h
        .engine
        .balance_chat(
            &CancellationToken::new(),
            Instant::now(),
            STYLE,
            &request,
            plan,
            &RequestMeta::default(),
            0,
        )
        .await
        .expect("rescued");

    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(log.provider_name.as_deref(), Some("b"));
    assert_eq!(log.retry, 1);

    limited.assert_hits(1);
    healthy.assert_hits(1);

    let errors = error_logs(&h.store).await;
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].provider_name.as_deref(), Some("a"));
    assert!(errors[0]
        .error
        .as_deref()
        .expect("error message")
        .contains("status: 429"));
}

#[tokio::test]
async fn exhausting_the_retry_budget_stops_the_loop() {
    let h = harness().await;
    seed_model(&h.store, "rotor", 2, 30).await;

    let first = MockServer::start();
    let a = first.mock(|when, then| {
        when.method(POST).path("/chat/completions");
        then.status(500).body("boom");
    });
    let second = MockServer::start();
    let b = second.mock(|when, then| {
        when.method(POST).path("/chat/completions");
        then.status(500).body("boom");
    });
    seed_upstream(&h.store, "a", &first.base_url(), "key-a", 10).await;
    seed_upstream(&h.store, "b", &second.base_url(), "key-b", 10).await;

    let request = chat_request(false);
    let plan = route_plan(&h.store, STYLE, &request).await.expect("plan");
    let err = h
        .engine
        .balance_chat(
            &CancellationToken::new(),
            Instant::now(),
            STYLE,
            &request,
            plan,
            &RequestMeta::default(),
            0,
        )
        .await
        .expect_err("must exhaust");

    assert!(matches!(err, RouteError::MaxRetries));
    assert_eq!(err.to_string(), "maximum retry attempts reached");
    assert_eq!(a.hits() + b.hits(), 2);

    let errors = error_logs(&h.store).await;
    assert_eq!(errors.len(), 2);
    assert!(errors
        .iter()
        .all(|log| log.error.as_deref().unwrap_or_default().contains("status: 500")));
}

#[tokio::test]
async fn global_deadline_cuts_off_slow_upstreams() {
    let h = harness().await;
    seed_model(&h.store, "lottery", 5, 1).await;

    let upstream = MockServer::start();
    upstream.mock(|when, then| {
        when.method(POST).path("/chat/completions");
        then.status(200).delay(Duration::from_secs(2)).body("{}");
    });
    seed_upstream(&h.store, "slow", &upstream.base_url(), "key-slow", 10).await;

    let request = chat_request(false);
    let plan = route_plan(&h.store, STYLE, &request).await.expect("plan");
    let started = Instant::now();
    let err = h
        .engine
        .balance_chat(
            &CancellationToken::new(),
            Instant::now(),
            STYLE,
            &request,
            plan,
            &RequestMeta::default(),
            0,
        )
        .await
        .expect_err("must time out");

    assert!(matches!(err, RouteError::RetryTimeout));
    assert_eq!(err.to_string(), "retry time out");
    // Header timeout (1s) fails the attempt, then the deadline fires.
    assert!(started.elapsed() < Duration::from_secs(2));

    let errors = error_logs(&h.store).await;
    assert_eq!(errors.len(), 1);
}

#[tokio::test]
async fn cancellation_aborts_the_in_flight_attempt() {
    let h = harness().await;
    seed_model(&h.store, "lottery", 3, 30).await;

    let upstream = MockServer::start();
    upstream.mock(|when, then| {
        when.method(POST).path("/chat/completions");
        then.status(200).delay(Duration::from_secs(5)).body("{}");
    });
    seed_upstream(&h.store, "hang", &upstream.base_url(), "key-hang", 10).await;

    let request = chat_request(false);
    let plan = route_plan(&h.store, STYLE, &request).await.expect("plan");
    let cancel = CancellationToken::new();

    let engine = h.engine.clone();
    let canceller = cancel.clone();
    let task = tokio::spawn(async move {
        engine
            .balance_chat(
                &canceller,
                Instant::now(),
                STYLE,
                &request,
                plan,
                &RequestMeta::default(),
                0,
            )
            .await
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    let cancelled_at = Instant::now();
    cancel.cancel();

    let err = task.await.expect("join").expect_err("must cancel");
    assert!(matches!(err, RouteError::Cancelled));
    assert!(
        cancelled_at.elapsed() < Duration::from_secs(1),
        "cancellation must land promptly, not after the upstream delay"
    );
}

#[tokio::test]
async fn stale_candidates_do_not_consume_attempts() {
    let h = harness().await;
    seed_model(&h.store, "rotor", 1, 30).await;

    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST).path("/chat/completions");
        then.status(200).body("{}");
    });
    seed_upstream(&h.store, "ghost", &upstream.base_url(), "key-ghost", 10).await;
    seed_upstream(&h.store, "real", &upstream.base_url(), "key-real", 10).await;

    let request = chat_request(false);
    let mut plan = route_plan(&h.store, STYLE, &request).await.expect("plan");

    // Make the first candidate stale: it keeps its weight but loses its
    // binding row, as if the maps were assembled against racing admin
    // edits.
    let ghost_id = *plan
        .bindings
        .iter()
        .find(|(_, binding)| binding.provider_model == "ghost-model")
        .map(|(id, _)| id)
        .expect("ghost binding");
    plan.bindings.remove(&ghost_id);

    // A single retry slot still reaches the surviving candidate.
    let (_, log) = h
        .engine
        .balance_chat(
            &CancellationToken::new(),
            Instant::now(),
            STYLE,
            &request,
            plan,
            &RequestMeta::default(),
            0,
        )
        .await
        .expect("must succeed through the real candidate");

    assert_eq!(log.provider_model.as_deref(), Some("real-model"));
    mock.assert_hits(1);
}

#[tokio::test]
async fn invalid_policy_is_rejected_up_front() {
    let h = harness().await;
    seed_model(&h.store, "lottery", 0, 30).await;

    let upstream = MockServer::start();
    seed_upstream(&h.store, "solo", &upstream.base_url(), "key", 10).await;

    let request = chat_request(false);
    let plan = route_plan(&h.store, STYLE, &request).await.expect("plan");
    let err = h
        .engine
        .balance_chat(
            &CancellationToken::new(),
            Instant::now(),
            STYLE,
            &request,
            plan,
            &RequestMeta::default(),
            0,
        )
        .await
        .expect_err("must reject");
    assert!(matches!(err, RouteError::InvalidPolicy));
}

#[tokio::test]
async fn broken_provider_config_is_fatal() {
    let h = harness().await;
    seed_model(&h.store, "lottery", 3, 30).await;

    let model = h
        .store
        .find_model_by_name("gpt-test")
        .await
        .expect("query")
        .expect("model");
    let provider_id = h
        .store
        .upsert_provider(ProviderInput {
            name: "mystery".to_string(),
            kind: "mystery-api".to_string(),
            config_json: serde_json::json!({}),
            enabled: true,
        })
        .await
        .expect("provider");
    h.store
        .insert_binding(BindingInput {
            model_id: model.id,
            provider_id,
            provider_model: "m".to_string(),
            weight: 10,
            enabled: true,
            tool_call: false,
            structured_output: false,
            image: false,
            with_header: None,
            custom_headers: None,
        })
        .await
        .expect("binding");

    let request = chat_request(false);
    let plan = route_plan(&h.store, "mystery-api", &request)
        .await
        .expect("plan");
    let err = h
        .engine
        .balance_chat(
            &CancellationToken::new(),
            Instant::now(),
            "mystery-api",
            &request,
            plan,
            &RequestMeta::default(),
            0,
        )
        .await
        .expect_err("must fail fast");
    assert!(matches!(err, RouteError::Adapter(_)));
}

#[tokio::test]
async fn missing_model_writes_an_error_log() {
    let h = harness().await;

    let request = chat_request(false);
    let err = route_plan(&h.store, STYLE, &request)
        .await
        .expect_err("unknown model");
    assert_eq!(err.to_string(), "not found model gpt-test");

    let logs = h.store.list_chat_logs().await.expect("logs");
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, STATUS_ERROR);
}

#[tokio::test]
async fn capability_filters_exclude_unfit_bindings() {
    let h = harness().await;
    seed_model(&h.store, "lottery", 3, 30).await;

    let upstream = MockServer::start();
    seed_upstream(&h.store, "plain", &upstream.base_url(), "key", 10).await;

    let mut request = chat_request(false);
    request.capabilities.tool_call = true;

    let err = route_plan(&h.store, STYLE, &request)
        .await
        .expect_err("no tool-call binding");
    assert_eq!(err.to_string(), "not provider for model gpt-test");
}
