use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "chat_ios")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub log_id: i64,
    pub created_at: OffsetDateTime,
    pub input: String,
    pub output: String,
    #[sea_orm(belongs_to, from = "log_id", to = "id", on_delete = "Cascade")]
    pub log: HasOne<super::chat_logs::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
