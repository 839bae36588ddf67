//! Provider adapters and the shared upstream HTTP client cache.
//!
//! Adapters construct [`UpstreamRequest`] values; the client layer performs
//! IO. An adapter is built per request from a provider's type tag and its
//! JSON config blob, and holds no mutable state.

pub mod adapter;
pub mod anthropic;
pub mod client;
pub mod gemini;
pub mod openai;

pub use adapter::{
    from_config, Adapter, AdapterError, AdapterResult, CatalogModel, HttpMethod, UpstreamRequest,
};
pub use anthropic::Anthropic;
pub use client::{ClientCache, DispatchError, UpstreamClient, DEFAULT_MODELS_TIMEOUT};
pub use gemini::Gemini;
pub use openai::OpenAi;
