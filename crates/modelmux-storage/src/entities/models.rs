use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "models")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "model_name")]
    pub name: String,
    pub max_retry: i32,
    pub time_out: i32,
    pub io_log: bool,
    pub strategy: String,
    pub breaker: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    #[sea_orm(has_many)]
    pub bindings: HasMany<super::model_providers::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
