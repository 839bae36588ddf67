use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use http::HeaderMap;
use serde::Deserialize;

use crate::adapter::{
    fetch_catalog_bytes, join_url, Adapter, AdapterError, AdapterResult, CatalogModel, HttpMethod,
    UpstreamRequest,
};
use crate::client::ClientCache;

const X_GOOG_API_KEY: HeaderName = HeaderName::from_static("x-goog-api-key");

/// Gemini-style upstream. The model is addressed in the URL path rather
/// than the body, and streaming selects a different action.
#[derive(Debug, Clone, Deserialize)]
pub struct Gemini {
    pub base_url: String,
    pub api_key: String,
    #[serde(default)]
    pub proxy: String,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    models: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    name: String,
    #[serde(default, rename = "displayName")]
    display_name: Option<String>,
}

#[async_trait]
impl Adapter for Gemini {
    fn kind(&self) -> &'static str {
        "gemini"
    }

    fn build_chat(
        &self,
        mut headers: HeaderMap,
        model: &str,
        raw: &[u8],
        stream: bool,
    ) -> AdapterResult<UpstreamRequest> {
        // The body carries no model field; validate it is JSON and pass it
        // through untouched.
        if serde_json::from_slice::<serde_json::Value>(raw).is_err() {
            return Err(AdapterError::InvalidBody(
                "expected a JSON body".to_string(),
            ));
        }
        let action = if stream {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(X_GOOG_API_KEY, self.key_header()?);
        Ok(UpstreamRequest {
            method: HttpMethod::Post,
            url: join_url(
                &self.base_url,
                &format!("v1beta/models/{model}:{action}"),
            ),
            headers,
            body: Some(Bytes::copy_from_slice(raw)),
        })
    }

    fn proxy_url(&self) -> &str {
        &self.proxy
    }

    async fn list_models(&self, cache: &ClientCache) -> AdapterResult<Vec<CatalogModel>> {
        let mut headers = HeaderMap::new();
        headers.insert(X_GOOG_API_KEY, self.key_header()?);
        let req = UpstreamRequest {
            method: HttpMethod::Get,
            url: join_url(&self.base_url, "v1beta/models"),
            headers,
            body: None,
        };
        let bytes = fetch_catalog_bytes(cache, &self.proxy, req).await?;
        let list: ModelList =
            serde_json::from_slice(&bytes).map_err(AdapterError::CatalogDecode)?;
        Ok(list
            .models
            .into_iter()
            .map(|entry| CatalogModel {
                id: entry
                    .name
                    .strip_prefix("models/")
                    .unwrap_or(&entry.name)
                    .to_string(),
                display_name: entry.display_name,
            })
            .collect())
    }
}

impl Gemini {
    fn key_header(&self) -> AdapterResult<HeaderValue> {
        HeaderValue::try_from(self.api_key.as_str()).map_err(|_| AdapterError::InvalidHeader)
    }
}
