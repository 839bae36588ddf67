use std::collections::{BTreeMap, HashMap};

use modelmux_storage::{NewChatLog, Store};

use crate::error::RouteError;
use crate::types::{ChatRequest, ProviderRow, RoutePlan};

/// Resolve the per-request routing context for a logical model: the
/// enabled bindings matching the request's capability requirements, the
/// providers that speak the request's API flavor, and the model's routing
/// policy fields.
pub async fn route_plan(
    store: &Store,
    style: &str,
    request: &ChatRequest,
) -> Result<RoutePlan, RouteError> {
    let Some(model) = store.find_model_by_name(&request.model).await? else {
        let message = format!("not found model {}", request.model);
        store
            .insert_chat_log(NewChatLog::error_row(&request.model, style, message))
            .await?;
        return Err(RouteError::ModelNotFound(request.model.clone()));
    };

    let bindings = store
        .bindings_for_model(model.id, request.capabilities)
        .await?;
    if bindings.is_empty() {
        return Err(RouteError::NoProviderForModel(request.model.clone()));
    }

    let provider_ids: Vec<i64> = bindings.iter().map(|binding| binding.provider_id).collect();
    let providers: HashMap<i64, ProviderRow> = store
        .providers_by_kind(&provider_ids, style)
        .await?
        .into_iter()
        .map(|provider| (provider.id, provider))
        .collect();

    // Bindings whose provider does not speak this style are silently
    // dropped from the weight map; they stay out of selection entirely.
    let mut weights = BTreeMap::new();
    for binding in &bindings {
        if !providers.contains_key(&binding.provider_id) {
            continue;
        }
        weights.insert(binding.id, binding.weight.max(0) as u32);
    }

    Ok(RoutePlan {
        bindings: bindings.into_iter().map(|binding| (binding.id, binding)).collect(),
        weights,
        providers,
        max_retry: model.max_retry,
        timeout_secs: model.time_out,
        io_log: model.io_log,
        strategy: model.strategy,
        breaker: model.breaker,
    })
}
