use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "chat_logs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub created_at: OffsetDateTime,
    /// Logical model name the client asked for.
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
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
    pub first_chunk_ms: Option<i64>,
    pub total_time_ms: Option<i64>,
}

impl ActiveModelBehavior for ActiveModel {}
