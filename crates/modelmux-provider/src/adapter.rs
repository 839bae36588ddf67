use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::anthropic::Anthropic;
use crate::client::{ClientCache, DispatchError, DEFAULT_MODELS_TIMEOUT};
use crate::gemini::Gemini;
use crate::openai::OpenAi;

pub type AdapterResult<T> = Result<T, AdapterError>;

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("unknown provider kind: {0}")]
    UnknownKind(String),
    #[error("invalid provider config: {0}")]
    InvalidConfig(serde_json::Error),
    #[error("invalid request body: {0}")]
    InvalidBody(String),
    #[error("invalid header value")]
    InvalidHeader,
    #[error("catalog request failed with status {0}")]
    CatalogStatus(u16),
    #[error("catalog decode failed: {0}")]
    CatalogDecode(serde_json::Error),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// A fully-described outbound request. Adapters build these; the client
/// layer dispatches them.
#[derive(Debug)]
pub struct UpstreamRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

/// One entry of a provider's model catalog, normalized across API flavors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogModel {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// The per-provider capability set: build the outbound chat request,
/// declare the egress proxy, list the upstream's models.
#[async_trait]
pub trait Adapter: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Construct the outbound chat request. `headers` is the starting
    /// header set (already sanitized by the caller); the provider-side
    /// model name replaces whatever the inbound body carried.
    fn build_chat(
        &self,
        headers: HeaderMap,
        model: &str,
        raw: &[u8],
        stream: bool,
    ) -> AdapterResult<UpstreamRequest>;

    /// Egress proxy URL for this provider, empty for direct dialing. The
    /// routing engine keys its client-cache lookup on this value.
    fn proxy_url(&self) -> &str;

    /// Fetch and decode the provider's model catalog.
    async fn list_models(&self, cache: &ClientCache) -> AdapterResult<Vec<CatalogModel>>;
}

/// Factory over the provider type tag. An unknown tag or a malformed config
/// blob is a configuration error, fatal for the request that hit it.
pub fn from_config(kind: &str, config: &serde_json::Value) -> AdapterResult<Box<dyn Adapter>> {
    match kind {
        "openai" => Ok(Box::new(
            serde_json::from_value::<OpenAi>(config.clone()).map_err(AdapterError::InvalidConfig)?,
        )),
        "anthropic" => Ok(Box::new(
            serde_json::from_value::<Anthropic>(config.clone())
                .map_err(AdapterError::InvalidConfig)?,
        )),
        "gemini" => Ok(Box::new(
            serde_json::from_value::<Gemini>(config.clone()).map_err(AdapterError::InvalidConfig)?,
        )),
        other => Err(AdapterError::UnknownKind(other.to_string())),
    }
}

/// Overwrite the top-level `model` field of a JSON object body, leaving
/// every other byte of meaning intact.
pub(crate) fn override_model(raw: &[u8], model: &str) -> AdapterResult<Bytes> {
    let mut value: serde_json::Value =
        serde_json::from_slice(raw).map_err(|err| AdapterError::InvalidBody(err.to_string()))?;
    let Some(object) = value.as_object_mut() else {
        return Err(AdapterError::InvalidBody(
            "expected a JSON object body".to_string(),
        ));
    };
    object.insert(
        "model".to_string(),
        serde_json::Value::String(model.to_string()),
    );
    let body = serde_json::to_vec(&value).map_err(|err| AdapterError::InvalidBody(err.to_string()))?;
    Ok(Bytes::from(body))
}

pub(crate) fn join_url(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Shared catalog fetch: 30s header timeout, provider proxy, 2xx or error.
pub(crate) async fn fetch_catalog_bytes(
    cache: &ClientCache,
    proxy: &str,
    req: UpstreamRequest,
) -> AdapterResult<Bytes> {
    let client = cache.get(DEFAULT_MODELS_TIMEOUT, proxy)?;
    let cancel = CancellationToken::new();
    let response = client.execute(req, &cancel).await?;
    let status = response.status().as_u16();
    if !(200..300).contains(&status) {
        return Err(AdapterError::CatalogStatus(status));
    }
    response
        .bytes()
        .await
        .map_err(|err| AdapterError::Dispatch(DispatchError::Send(err)))
}
