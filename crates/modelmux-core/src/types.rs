use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use http::HeaderMap;
use modelmux_storage::CapabilityFilter;

pub const STYLE_OPENAI: &str = "openai";
pub const STYLE_ANTHROPIC: &str = "anthropic";
pub const STYLE_GEMINI: &str = "gemini";

pub type BindingRow = modelmux_storage::entities::model_providers::Model;
pub type ProviderRow = modelmux_storage::entities::providers::Model;

/// One inbound chat request, normalized by the front-end. The raw body is
/// already in the upstream wire shape; the adapter overwrites its `model`
/// field at dispatch time.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub stream: bool,
    pub capabilities: CapabilityFilter,
    pub raw: Bytes,
}

/// Observability fields captured from the inbound request.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub headers: HeaderMap,
    pub user_agent: Option<String>,
    pub remote_ip: Option<String>,
}

/// Per-request routing context. Built fresh by the assembler, mutated only
/// through the balancer during the request, and discarded afterwards. The
/// key domain of `bindings` and `weights` is the binding (candidate) id.
#[derive(Debug, Clone)]
pub struct RoutePlan {
    pub bindings: HashMap<i64, BindingRow>,
    pub weights: BTreeMap<i64, u32>,
    pub providers: HashMap<i64, ProviderRow>,
    pub max_retry: i32,
    pub timeout_secs: i32,
    pub io_log: bool,
    pub strategy: String,
    pub breaker: bool,
}
