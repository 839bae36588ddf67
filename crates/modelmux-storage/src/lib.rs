pub mod entities;
pub mod store;

pub use store::{
    AuthKeyInput, BindingInput, CapabilityFilter, ChatUsage, DailyMetric, HourlyMetric,
    ModelCalls, ModelInput, NewChatLog, ProjectCalls, ProviderInput, Store,
    CONFIG_ANTHROPIC_COUNT_TOKENS, STATUS_ERROR, STATUS_SUCCESS,
};
