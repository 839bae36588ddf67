use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use httpmock::prelude::*;

use modelmux_core::Engine;
use modelmux_provider::ClientCache;
use modelmux_router::{api_router, proxy_router, RouterState};
use modelmux_storage::{
    AuthKeyInput, BindingInput, ModelInput, ProviderInput, Store, CONFIG_ANTHROPIC_COUNT_TOKENS,
    STATUS_SUCCESS,
};

struct App {
    _dir: tempfile::TempDir,
    store: Store,
    addr: SocketAddr,
}

async fn spawn_app() -> App {
    let dir = tempfile::tempdir().expect("tempdir");
    let dsn = format!(
        "sqlite://{}?mode=rwc",
        dir.path().join("http.db").display()
    );
    let store = Store::connect(&dsn).await.expect("connect");
    store.sync().await.expect("sync");

    let engine = Engine::new(Arc::new(ClientCache::new()), store.clone());
    let state = RouterState { engine };
    let app = axum::Router::new()
        .merge(proxy_router(state.clone()))
        .merge(api_router(state));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .expect("serve");
    });

    App {
        _dir: dir,
        store,
        addr,
    }
}

async fn seed_gateway(app: &App, upstream_base: &str, io_log: bool) {
    app.store
        .insert_auth_key(AuthKeyInput {
            name: "team".to_string(),
            key_value: "sk-gateway".to_string(),
            enabled: true,
        })
        .await
        .expect("auth key");

    let model_id = app
        .store
        .upsert_model(ModelInput {
            name: "gpt-test".to_string(),
            max_retry: 3,
            time_out: 30,
            io_log,
            strategy: "lottery".to_string(),
            breaker: false,
        })
        .await
        .expect("model");
    let provider_id = app
        .store
        .upsert_provider(ProviderInput {
            name: "mock".to_string(),
            kind: "openai".to_string(),
            config_json: serde_json::json!({"base_url": upstream_base, "api_key": "up-key"}),
            enabled: true,
        })
        .await
        .expect("provider");
    app.store
        .insert_binding(BindingInput {
            model_id,
            provider_id,
            provider_model: "gpt-upstream".to_string(),
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
}

fn client() -> wreq::Client {
    wreq::Client::new()
}

#[tokio::test]
async fn chat_requires_an_auth_key() {
    let app = spawn_app().await;

    let response = client()
        .request(
            wreq::Method::POST,
            format!("http://{}/v1/chat/completions", app.addr),
        )
        .header("content-type", "application/json")
        .body(r#"{"model":"gpt-test","messages":[]}"#)
        .send()
        .await
        .expect("send");
    assert_eq!(response.status().as_u16(), 401);

    let response = client()
        .request(
            wreq::Method::POST,
            format!("http://{}/v1/chat/completions", app.addr),
        )
        .header("authorization", "Bearer wrong")
        .body(r#"{"model":"gpt-test","messages":[]}"#)
        .send()
        .await
        .expect("send");
    assert_eq!(response.status().as_u16(), 401);
}

#[tokio::test]
async fn chat_round_trip_records_usage_and_io() {
    let app = spawn_app().await;
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST)
            .path("/chat/completions")
            .header("authorization", "Bearer up-key");
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"id":"done","usage":{"prompt_tokens":3,"completion_tokens":4,"total_tokens":7}}"#);
    });
    seed_gateway(&app, &upstream.base_url(), true).await;

    let response = client()
        .request(
            wreq::Method::POST,
            format!("http://{}/v1/chat/completions", app.addr),
        )
        .header("authorization", "Bearer sk-gateway")
        .header("content-type", "application/json")
        .body(r#"{"model":"gpt-test","messages":[{"role":"user","content":"hi"}]}"#)
        .send()
        .await
        .expect("send");

    assert_eq!(response.status().as_u16(), 200);
    let body = response.text().await.expect("body");
    assert!(body.contains(r#""id":"done""#));
    mock.assert_hits(1);

    // The finalizer runs after the client has the body.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let logs = app.store.list_chat_logs().await.expect("logs");
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, STATUS_SUCCESS);
    assert_eq!(logs[0].name, "gpt-test");
    assert_eq!(logs[0].provider_model.as_deref(), Some("gpt-upstream"));
    assert_eq!(logs[0].total_tokens, Some(7));
    assert!(logs[0].total_time_ms.is_some());
}

#[tokio::test]
async fn unknown_models_return_not_found() {
    let app = spawn_app().await;
    app.store
        .insert_auth_key(AuthKeyInput {
            name: "team".to_string(),
            key_value: "sk-gateway".to_string(),
            enabled: true,
        })
        .await
        .expect("auth key");

    let response = client()
        .request(
            wreq::Method::POST,
            format!("http://{}/v1/chat/completions", app.addr),
        )
        .header("authorization", "Bearer sk-gateway")
        .body(r#"{"model":"ghost","messages":[]}"#)
        .send()
        .await
        .expect("send");
    assert_eq!(response.status().as_u16(), 404);
    let body = response.text().await.expect("body");
    assert!(body.contains("not found model ghost"));
}

#[tokio::test]
async fn count_tokens_passthrough_uses_the_stored_config() {
    let app = spawn_app().await;
    app.store
        .insert_auth_key(AuthKeyInput {
            name: "team".to_string(),
            key_value: "sk-gateway".to_string(),
            enabled: true,
        })
        .await
        .expect("auth key");

    let url = format!("http://{}/v1/messages/count_tokens", app.addr);

    // No config yet.
    let response = client()
        .request(wreq::Method::POST, &url)
        .header("authorization", "Bearer sk-gateway")
        .body("{}")
        .send()
        .await
        .expect("send");
    assert_eq!(response.status().as_u16(), 404);

    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST)
            .path("/v1/messages/count_tokens")
            .header("x-api-key", "ak-count");
        then.status(200).body(r#"{"input_tokens":42}"#);
    });
    app.store
        .set_config(
            CONFIG_ANTHROPIC_COUNT_TOKENS,
            &serde_json::json!({
                "base_url": upstream.base_url(),
                "api_key": "ak-count",
                "version": "2023-06-01",
            })
            .to_string(),
        )
        .await
        .expect("config");

    let response = client()
        .request(wreq::Method::POST, &url)
        .header("authorization", "Bearer sk-gateway")
        .body(r#"{"model":"claude","messages":[]}"#)
        .send()
        .await
        .expect("send");
    assert_eq!(response.status().as_u16(), 200);
    let body = response.text().await.expect("body");
    assert!(body.contains("42"));
    mock.assert_hits(1);
}

#[tokio::test]
async fn models_and_metrics_endpoints_respond() {
    let app = spawn_app().await;
    let upstream = MockServer::start();
    seed_gateway(&app, &upstream.base_url(), false).await;

    let response = client()
        .request(
            wreq::Method::GET,
            format!("http://{}/v1/models", app.addr),
        )
        .header("authorization", "Bearer sk-gateway")
        .send()
        .await
        .expect("send");
    assert_eq!(response.status().as_u16(), 200);
    let body = response.text().await.expect("body");
    assert!(body.contains("gpt-test"));

    for path in [
        "/api/metrics/daily/7",
        "/api/metrics/hourly/24",
        "/api/metrics/counts",
        "/api/metrics/projects",
    ] {
        let response = client()
            .request(wreq::Method::GET, format!("http://{}{path}", app.addr))
            .send()
            .await
            .expect("send");
        assert_eq!(response.status().as_u16(), 200, "{path}");
    }
}

#[tokio::test]
async fn provider_catalog_is_proxied() {
    let app = spawn_app().await;
    let upstream = MockServer::start();
    upstream.mock(|when, then| {
        when.method(GET).path("/models");
        then.status(200)
            .body(r#"{"object":"list","data":[{"id":"gpt-upstream"}]}"#);
    });
    seed_gateway(&app, &upstream.base_url(), false).await;

    let provider = app
        .store
        .providers_by_kind(&[1, 2, 3, 4], "openai")
        .await
        .expect("providers")
        .pop()
        .expect("seeded provider");

    let response = client()
        .request(
            wreq::Method::GET,
            format!("http://{}/api/providers/{}/models", app.addr, provider.id),
        )
        .send()
        .await
        .expect("send");
    assert_eq!(response.status().as_u16(), 200);
    let body = response.text().await.expect("body");
    assert!(body.contains("gpt-upstream"));
}
