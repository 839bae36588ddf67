use modelmux_provider::{AdapterError, DispatchError};

use crate::balance::NoCandidates;

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("not found model {0}")]
    ModelNotFound(String),
    #[error("not provider for model {0}")]
    NoProviderForModel(String),
    #[error("max_retry and timeout must be at least 1")]
    InvalidPolicy,
    #[error(transparent)]
    NoCandidates(#[from] NoCandidates),
    #[error("retry time out")]
    RetryTimeout,
    #[error("maximum retry attempts reached")]
    MaxRetries,
    #[error("request cancelled")]
    Cancelled,
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Client(#[from] DispatchError),
    #[error(transparent)]
    Storage(#[from] sea_orm::DbErr),
}
