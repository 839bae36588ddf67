use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use http::HeaderMap;
use serde::Deserialize;

use crate::adapter::{
    fetch_catalog_bytes, join_url, override_model, Adapter, AdapterError, AdapterResult,
    CatalogModel, HttpMethod, UpstreamRequest,
};
use crate::client::ClientCache;

const X_API_KEY: HeaderName = HeaderName::from_static("x-api-key");
const ANTHROPIC_VERSION: HeaderName = HeaderName::from_static("anthropic-version");

/// Anthropic-compatible upstream: `x-api-key` auth plus a pinned
/// `anthropic-version`, `model` carried in the body.
#[derive(Debug, Clone, Deserialize)]
pub struct Anthropic {
    pub base_url: String,
    pub api_key: String,
    pub version: String,
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
    #[serde(default)]
    display_name: Option<String>,
}

#[async_trait]
impl Adapter for Anthropic {
    fn kind(&self) -> &'static str {
        "anthropic"
    }

    fn build_chat(
        &self,
        mut headers: HeaderMap,
        model: &str,
        raw: &[u8],
        _stream: bool,
    ) -> AdapterResult<UpstreamRequest> {
        let body = override_model(raw, model)?;
        self.apply_auth(&mut headers)?;
        Ok(UpstreamRequest {
            method: HttpMethod::Post,
            url: join_url(&self.base_url, "v1/messages"),
            headers,
            body: Some(body),
        })
    }

    fn proxy_url(&self) -> &str {
        &self.proxy
    }

    async fn list_models(&self, cache: &ClientCache) -> AdapterResult<Vec<CatalogModel>> {
        let mut headers = HeaderMap::new();
        self.apply_auth(&mut headers)?;
        let req = UpstreamRequest {
            method: HttpMethod::Get,
            url: join_url(&self.base_url, "v1/models"),
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
                display_name: entry.display_name,
            })
            .collect())
    }
}

impl Anthropic {
    /// Count-tokens passthrough: same auth scheme, body forwarded verbatim.
    pub fn build_count_tokens(
        &self,
        mut headers: HeaderMap,
        raw: Bytes,
    ) -> AdapterResult<UpstreamRequest> {
        self.apply_auth(&mut headers)?;
        Ok(UpstreamRequest {
            method: HttpMethod::Post,
            url: join_url(&self.base_url, "v1/messages/count_tokens"),
            headers,
            body: Some(raw),
        })
    }

    fn apply_auth(&self, headers: &mut HeaderMap) -> AdapterResult<()> {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            X_API_KEY,
            HeaderValue::try_from(self.api_key.as_str()).map_err(|_| AdapterError::InvalidHeader)?,
        );
        headers.insert(
            ANTHROPIC_VERSION,
            HeaderValue::try_from(self.version.as_str()).map_err(|_| AdapterError::InvalidHeader)?,
        );
        Ok(())
    }
}
