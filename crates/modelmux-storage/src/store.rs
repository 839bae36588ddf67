#![allow(clippy::needless_update)]

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ActiveValue, ColumnTrait, Database, DatabaseConnection, DbErr, EntityTrait, ExprTrait,
    FromQueryResult, QueryFilter, QueryOrder, QuerySelect, Schema,
};
use time::OffsetDateTime;

use crate::entities;

// One pooled connection per DSN, held for the life of the process so every
// Store handle built from the same DSN shares a pool.
static CONNECTIONS: OnceLock<Mutex<HashMap<String, DatabaseConnection>>> = OnceLock::new();

fn cached_connection(database_url: &str) -> Option<DatabaseConnection> {
    let pool = CONNECTIONS.get_or_init(|| Mutex::new(HashMap::new()));
    pool.lock().ok()?.get(database_url).cloned()
}

pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_ERROR: &str = "error";

/// `configs` key holding the Anthropic count-tokens passthrough blob.
pub const CONFIG_ANTHROPIC_COUNT_TOKENS: &str = "anthropic_count_tokens";

/// One chat attempt, as recorded by the routing engine. Success rows are
/// finalized later with usage and timing via [`Store::finalize_chat_log`].
#[derive(Debug, Clone)]
pub struct NewChatLog {
    pub name: String,
    pub provider_model: Option<String>,
    pub provider_name: Option<String>,
    pub status: String,
    pub style: String,
    pub user_agent: Option<String>,
    pub remote_ip: Option<String>,
    pub auth_key_id: i64,
    pub chat_io: bool,
    pub retry: i32,
    pub proxy_time_ms: i64,
    pub error: Option<String>,
}

impl NewChatLog {
    pub fn error_row(name: &str, style: &str, error: String) -> Self {
        Self {
            name: name.to_string(),
            provider_model: None,
            provider_name: None,
            status: STATUS_ERROR.to_string(),
            style: style.to_string(),
            user_agent: None,
            remote_ip: None,
            auth_key_id: 0,
            chat_io: false,
            retry: 0,
            proxy_time_ms: 0,
            error: Some(error),
        }
    }

    pub fn with_error(mut self, error: String) -> Self {
        self.status = STATUS_ERROR.to_string();
        self.error = Some(error);
        self
    }
}

/// Post-stream finalization payload for a successful attempt.
#[derive(Debug, Clone, Default)]
pub struct ChatUsage {
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
    pub first_chunk_ms: Option<i64>,
    pub total_time_ms: Option<i64>,
}

/// Capability requirements extracted from the inbound request. A `true`
/// field becomes an equality filter on the binding rows.
#[derive(Debug, Clone, Copy, Default)]
pub struct CapabilityFilter {
    pub tool_call: bool,
    pub structured_output: bool,
    pub image: bool,
}

#[derive(Debug, Clone)]
pub struct ModelInput {
    pub name: String,
    pub max_retry: i32,
    pub time_out: i32,
    pub io_log: bool,
    pub strategy: String,
    pub breaker: bool,
}

#[derive(Debug, Clone)]
pub struct ProviderInput {
    pub name: String,
    pub kind: String,
    pub config_json: serde_json::Value,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct BindingInput {
    pub model_id: i64,
    pub provider_id: i64,
    pub provider_model: String,
    pub weight: i32,
    pub enabled: bool,
    pub tool_call: bool,
    pub structured_output: bool,
    pub image: bool,
    pub with_header: Option<bool>,
    pub custom_headers: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct AuthKeyInput {
    pub name: String,
    pub key_value: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, FromQueryResult)]
pub struct DailyMetric {
    pub date: String,
    pub reqs: i64,
    pub tokens: i64,
}

#[derive(Debug, Clone, FromQueryResult)]
pub struct HourlyMetric {
    pub hour: String,
    pub reqs: i64,
    pub tokens: i64,
}

#[derive(Debug, Clone, FromQueryResult)]
pub struct ModelCalls {
    pub model: String,
    pub calls: i64,
}

#[derive(Debug, Clone, FromQueryResult)]
pub struct ProjectCalls {
    pub auth_key_id: i64,
    pub calls: i64,
}

#[derive(Clone)]
pub struct Store {
    db: DatabaseConnection,
}

impl Store {
    pub async fn connect(database_url: &str) -> Result<Self, DbErr> {
        if let Some(db) = cached_connection(database_url) {
            return Ok(Self { db });
        }

        let db = Database::connect(database_url).await?;
        let pool = CONNECTIONS.get_or_init(|| Mutex::new(HashMap::new()));
        if let Ok(mut guard) = pool.lock() {
            // A racing connect may have landed first; its pool wins and the
            // fresh one is dropped.
            if let Some(existing) = guard.get(database_url) {
                return Ok(Self {
                    db: existing.clone(),
                });
            }
            guard.insert(database_url.to_string(), db.clone());
        }
        Ok(Self { db })
    }

    pub fn from_connection(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Entity-first schema sync. Run once at bootstrap.
    pub async fn sync(&self) -> Result<(), DbErr> {
        Schema::new(self.db.get_database_backend())
            .builder()
            .register(entities::Models)
            .register(entities::Providers)
            .register(entities::ModelProviders)
            .register(entities::ChatLogs)
            .register(entities::ChatIos)
            .register(entities::Configs)
            .register(entities::AuthKeys)
            .sync(&self.db)
            .await
    }

    // ---- route metadata reads ----

    pub async fn find_model_by_name(
        &self,
        name: &str,
    ) -> Result<Option<entities::models::Model>, DbErr> {
        entities::Models::find()
            .filter(entities::models::Column::Name.eq(name))
            .one(&self.db)
            .await
    }

    pub async fn list_models(&self) -> Result<Vec<entities::models::Model>, DbErr> {
        entities::Models::find()
            .order_by_asc(entities::models::Column::Name)
            .all(&self.db)
            .await
    }

    pub async fn bindings_for_model(
        &self,
        model_id: i64,
        caps: CapabilityFilter,
    ) -> Result<Vec<entities::model_providers::Model>, DbErr> {
        use entities::model_providers::Column;

        let mut query = entities::ModelProviders::find()
            .filter(Column::ModelId.eq(model_id))
            .filter(Column::Enabled.eq(true));
        if caps.tool_call {
            query = query.filter(Column::ToolCall.eq(true));
        }
        if caps.structured_output {
            query = query.filter(Column::StructuredOutput.eq(true));
        }
        if caps.image {
            query = query.filter(Column::Image.eq(true));
        }
        query.all(&self.db).await
    }

    pub async fn providers_by_kind(
        &self,
        ids: &[i64],
        kind: &str,
    ) -> Result<Vec<entities::providers::Model>, DbErr> {
        use entities::providers::Column;

        entities::Providers::find()
            .filter(Column::Id.is_in(ids.iter().copied()))
            .filter(Column::Kind.eq(kind))
            .filter(Column::Enabled.eq(true))
            .all(&self.db)
            .await
    }

    pub async fn find_provider(
        &self,
        id: i64,
    ) -> Result<Option<entities::providers::Model>, DbErr> {
        entities::Providers::find_by_id(id).one(&self.db).await
    }

    // ---- auth / config ----

    pub async fn find_auth_key(
        &self,
        key_value: &str,
    ) -> Result<Option<entities::auth_keys::Model>, DbErr> {
        use entities::auth_keys::Column;

        entities::AuthKeys::find()
            .filter(Column::KeyValue.eq(key_value))
            .filter(Column::Enabled.eq(true))
            .one(&self.db)
            .await
    }

    pub async fn list_auth_keys(&self) -> Result<Vec<entities::auth_keys::Model>, DbErr> {
        entities::AuthKeys::find().all(&self.db).await
    }

    pub async fn config_value(&self, key: &str) -> Result<Option<String>, DbErr> {
        Ok(entities::Configs::find()
            .filter(entities::configs::Column::Key.eq(key))
            .one(&self.db)
            .await?
            .map(|row| row.value))
    }

    // ---- chat log writes ----

    pub async fn insert_chat_log(&self, log: NewChatLog) -> Result<i64, DbErr> {
        let active = entities::chat_logs::ActiveModel {
            id: ActiveValue::NotSet,
            created_at: ActiveValue::Set(OffsetDateTime::now_utc()),
            name: ActiveValue::Set(log.name),
            provider_model: ActiveValue::Set(log.provider_model),
            provider_name: ActiveValue::Set(log.provider_name),
            status: ActiveValue::Set(log.status),
            style: ActiveValue::Set(log.style),
            user_agent: ActiveValue::Set(log.user_agent),
            remote_ip: ActiveValue::Set(log.remote_ip),
            auth_key_id: ActiveValue::Set(log.auth_key_id),
            chat_io: ActiveValue::Set(log.chat_io),
            retry: ActiveValue::Set(log.retry),
            proxy_time_ms: ActiveValue::Set(log.proxy_time_ms),
            error: ActiveValue::Set(log.error),
            ..Default::default()
        };
        let result = entities::ChatLogs::insert(active).exec(&self.db).await?;
        Ok(result.last_insert_id)
    }

    pub async fn finalize_chat_log(&self, log_id: i64, usage: ChatUsage) -> Result<(), DbErr> {
        let active = entities::chat_logs::ActiveModel {
            id: ActiveValue::Set(log_id),
            prompt_tokens: ActiveValue::Set(usage.prompt_tokens),
            completion_tokens: ActiveValue::Set(usage.completion_tokens),
            total_tokens: ActiveValue::Set(usage.total_tokens),
            first_chunk_ms: ActiveValue::Set(usage.first_chunk_ms),
            total_time_ms: ActiveValue::Set(usage.total_time_ms),
            ..Default::default()
        };
        entities::ChatLogs::update(active).exec(&self.db).await?;
        Ok(())
    }

    pub async fn insert_chat_io(
        &self,
        log_id: i64,
        input: String,
        output: String,
    ) -> Result<(), DbErr> {
        let active = entities::chat_ios::ActiveModel {
            id: ActiveValue::NotSet,
            log_id: ActiveValue::Set(log_id),
            created_at: ActiveValue::Set(OffsetDateTime::now_utc()),
            input: ActiveValue::Set(input),
            output: ActiveValue::Set(output),
            ..Default::default()
        };
        entities::ChatIos::insert(active).exec(&self.db).await?;
        Ok(())
    }

    pub async fn list_chat_logs(&self) -> Result<Vec<entities::chat_logs::Model>, DbErr> {
        entities::ChatLogs::find()
            .order_by_asc(entities::chat_logs::Column::Id)
            .all(&self.db)
            .await
    }

    // ---- metrics aggregations (SQLite date functions, as deployed) ----

    pub async fn daily_metrics(&self, days: i64) -> Result<Vec<DailyMetric>, DbErr> {
        use entities::chat_logs::Column;

        let now = OffsetDateTime::now_utc();
        let start = now.date().midnight().assume_utc() - time::Duration::days(days);
        entities::ChatLogs::find()
            .select_only()
            .column_as(Expr::cust("DATE(created_at)"), "date")
            .column_as(Expr::col(Column::Id).count(), "reqs")
            .column_as(Expr::cust("COALESCE(SUM(total_tokens), 0)"), "tokens")
            .filter(Column::CreatedAt.gte(start))
            .group_by(Expr::cust("DATE(created_at)"))
            .order_by_asc(Expr::cust("DATE(created_at)"))
            .into_model::<DailyMetric>()
            .all(&self.db)
            .await
    }

    pub async fn hourly_metrics(&self, hours: i64) -> Result<Vec<HourlyMetric>, DbErr> {
        use entities::chat_logs::Column;

        let start = OffsetDateTime::now_utc() - time::Duration::hours(hours);
        entities::ChatLogs::find()
            .select_only()
            .column_as(
                Expr::cust("strftime('%Y-%m-%d %H:00:00', created_at)"),
                "hour",
            )
            .column_as(Expr::col(Column::Id).count(), "reqs")
            .column_as(Expr::cust("COALESCE(SUM(total_tokens), 0)"), "tokens")
            .filter(Column::CreatedAt.gte(start))
            .group_by(Expr::cust("strftime('%Y-%m-%d %H:00:00', created_at)"))
            .order_by_asc(Expr::cust("strftime('%Y-%m-%d %H:00:00', created_at)"))
            .into_model::<HourlyMetric>()
            .all(&self.db)
            .await
    }

    pub async fn model_counts(&self) -> Result<Vec<ModelCalls>, DbErr> {
        use entities::chat_logs::Column;

        entities::ChatLogs::find()
            .select_only()
            .column_as(Expr::col(Column::Name), "model")
            .column_as(Expr::col(Column::Id).count(), "calls")
            .group_by(Expr::col(Column::Name))
            .order_by_desc(Expr::col(Column::Id).count())
            .into_model::<ModelCalls>()
            .all(&self.db)
            .await
    }

    pub async fn project_counts(&self) -> Result<Vec<ProjectCalls>, DbErr> {
        use entities::chat_logs::Column;

        entities::ChatLogs::find()
            .select_only()
            .column_as(Expr::col(Column::AuthKeyId), "auth_key_id")
            .column_as(Expr::col(Column::Id).count(), "calls")
            .group_by(Expr::col(Column::AuthKeyId))
            .order_by_desc(Expr::col(Column::Id).count())
            .into_model::<ProjectCalls>()
            .all(&self.db)
            .await
    }

    // ---- admin / seed writes ----

    pub async fn upsert_model(&self, input: ModelInput) -> Result<i64, DbErr> {
        use entities::models::Column;

        let now = OffsetDateTime::now_utc();
        let active = entities::models::ActiveModel {
            id: ActiveValue::NotSet,
            name: ActiveValue::Set(input.name),
            max_retry: ActiveValue::Set(input.max_retry),
            time_out: ActiveValue::Set(input.time_out),
            io_log: ActiveValue::Set(input.io_log),
            strategy: ActiveValue::Set(input.strategy),
            breaker: ActiveValue::Set(input.breaker),
            created_at: ActiveValue::Set(now),
            updated_at: ActiveValue::Set(now),
            ..Default::default()
        };
        let result = entities::Models::insert(active)
            .on_conflict(
                OnConflict::column(Column::Name)
                    .update_columns([
                        Column::MaxRetry,
                        Column::TimeOut,
                        Column::IoLog,
                        Column::Strategy,
                        Column::Breaker,
                        Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;
        Ok(result.last_insert_id)
    }

    pub async fn upsert_provider(&self, input: ProviderInput) -> Result<i64, DbErr> {
        use entities::providers::Column;

        let now = OffsetDateTime::now_utc();
        let active = entities::providers::ActiveModel {
            id: ActiveValue::NotSet,
            name: ActiveValue::Set(input.name),
            kind: ActiveValue::Set(input.kind),
            config_json: ActiveValue::Set(input.config_json),
            enabled: ActiveValue::Set(input.enabled),
            created_at: ActiveValue::Set(now),
            updated_at: ActiveValue::Set(now),
            ..Default::default()
        };
        let result = entities::Providers::insert(active)
            .on_conflict(
                OnConflict::column(Column::Name)
                    .update_columns([
                        Column::Kind,
                        Column::ConfigJson,
                        Column::Enabled,
                        Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;
        Ok(result.last_insert_id)
    }

    pub async fn insert_binding(&self, input: BindingInput) -> Result<i64, DbErr> {
        let now = OffsetDateTime::now_utc();
        let active = entities::model_providers::ActiveModel {
            id: ActiveValue::NotSet,
            model_id: ActiveValue::Set(input.model_id),
            provider_id: ActiveValue::Set(input.provider_id),
            provider_model: ActiveValue::Set(input.provider_model),
            weight: ActiveValue::Set(input.weight),
            enabled: ActiveValue::Set(input.enabled),
            tool_call: ActiveValue::Set(input.tool_call),
            structured_output: ActiveValue::Set(input.structured_output),
            image: ActiveValue::Set(input.image),
            with_header: ActiveValue::Set(input.with_header),
            custom_headers: ActiveValue::Set(input.custom_headers),
            created_at: ActiveValue::Set(now),
            updated_at: ActiveValue::Set(now),
            ..Default::default()
        };
        let result = entities::ModelProviders::insert(active).exec(&self.db).await?;
        Ok(result.last_insert_id)
    }

    pub async fn insert_auth_key(&self, input: AuthKeyInput) -> Result<i64, DbErr> {
        let active = entities::auth_keys::ActiveModel {
            id: ActiveValue::NotSet,
            name: ActiveValue::Set(input.name),
            key_value: ActiveValue::Set(input.key_value),
            enabled: ActiveValue::Set(input.enabled),
            created_at: ActiveValue::Set(OffsetDateTime::now_utc()),
            ..Default::default()
        };
        let result = entities::AuthKeys::insert(active).exec(&self.db).await?;
        Ok(result.last_insert_id)
    }

    pub async fn set_config(&self, key: &str, value: &str) -> Result<(), DbErr> {
        use entities::configs::Column;

        let active = entities::configs::ActiveModel {
            id: ActiveValue::NotSet,
            key: ActiveValue::Set(key.to_string()),
            value: ActiveValue::Set(value.to_string()),
            updated_at: ActiveValue::Set(OffsetDateTime::now_utc()),
            ..Default::default()
        };
        entities::Configs::insert(active)
            .on_conflict(
                OnConflict::column(Column::Key)
                    .update_columns([Column::Value, Column::UpdatedAt])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;
        Ok(())
    }
}
