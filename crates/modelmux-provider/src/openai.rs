use async_trait::async_trait;
use http::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use http::HeaderMap;
use serde::Deserialize;

use crate::adapter::{
    fetch_catalog_bytes, join_url, override_model, Adapter, AdapterError, AdapterResult,
    CatalogModel, HttpMethod, UpstreamRequest,
};
use crate::client::ClientCache;

/// OpenAI-compatible upstream: bearer auth, `model` carried in the body.
#[derive(Debug, Clone, Deserialize)]
pub struct OpenAi {
    pub base_url: String,
    pub api_key: String,
    #[serde(default)]
    pub proxy: String,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

#[async_trait]
impl Adapter for OpenAi {
    fn kind(&self) -> &'static str {
        "openai"
    }

    fn build_chat(
        &self,
        mut headers: HeaderMap,
        model: &str,
        raw: &[u8],
        _stream: bool,
    ) -> AdapterResult<UpstreamRequest> {
        let body = override_model(raw, model)?;
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(AUTHORIZATION, self.bearer()?);
        Ok(UpstreamRequest {
            method: HttpMethod::Post,
            url: join_url(&self.base_url, "chat/completions"),
            headers,
            body: Some(body),
        })
    }

    fn proxy_url(&self) -> &str {
        &self.proxy
    }

    async fn list_models(&self, cache: &ClientCache) -> AdapterResult<Vec<CatalogModel>> {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, self.bearer()?);
        let req = UpstreamRequest {
            method: HttpMethod::Get,
            url: join_url(&self.base_url, "models"),
            headers,
            body: None,
        };
        let bytes = fetch_catalog_bytes(cache, &self.proxy, req).await?;
        let list: ModelList =
            serde_json::from_slice(&bytes).map_err(AdapterError::CatalogDecode)?;
        Ok(list
            .data
            .into_iter()
            .map(|entry| CatalogModel {
                id: entry.id,
                display_name: None,
            })
            .collect())
    }
}

impl OpenAi {
    fn bearer(&self) -> AdapterResult<HeaderValue> {
        HeaderValue::try_from(format!("Bearer {}", self.api_key))
            .map_err(|_| AdapterError::InvalidHeader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> OpenAi {
        OpenAi {
            base_url: "https://api.example.com/v1/".to_string(),
            api_key: "sk-key".to_string(),
            proxy: String::new(),
        }
    }

    #[test]
    fn chat_request_targets_chat_completions() {
        let req = adapter()
            .build_chat(HeaderMap::new(), "gpt-x", br#"{"model":"logical"}"#, false)
            .expect("build");

        assert_eq!(req.method, HttpMethod::Post);
        assert_eq!(req.url, "https://api.example.com/v1/chat/completions");
        assert_eq!(
            req.headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()),
            Some("Bearer sk-key")
        );
        assert_eq!(
            req.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()),
            Some("application/json")
        );

        let body: serde_json::Value =
            serde_json::from_slice(&req.body.expect("body")).expect("json");
        assert_eq!(body["model"], "gpt-x");
    }

    #[test]
    fn inbound_headers_are_kept_but_auth_is_ours() {
        let mut inbound = HeaderMap::new();
        inbound.insert("x-custom", HeaderValue::from_static("yes"));
        inbound.insert(AUTHORIZATION, HeaderValue::from_static("Bearer stale"));

        let req = adapter()
            .build_chat(inbound, "gpt-x", br#"{"model":"a"}"#, false)
            .expect("build");
        assert_eq!(
            req.headers.get("x-custom").and_then(|v| v.to_str().ok()),
            Some("yes")
        );
        assert_eq!(
            req.headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()),
            Some("Bearer sk-key")
        );
    }

    #[test]
    fn header_build_is_deterministic() {
        let first = adapter()
            .build_chat(HeaderMap::new(), "m", br#"{"model":"a"}"#, true)
            .expect("build");
        let second = adapter()
            .build_chat(HeaderMap::new(), "m", br#"{"model":"a"}"#, true)
            .expect("build");
        assert_eq!(first.headers, second.headers);
        assert_eq!(first.url, second.url);
    }
}
