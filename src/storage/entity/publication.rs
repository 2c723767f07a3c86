use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "publications")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    #[sea_orm(nullable)]
    pub journal_id: Option<i32>,
    pub title: String,
    #[sea_orm(unique)]
    pub slug: String,
    #[sea_orm(column_type = "Text")]
    pub description: String,
    pub publisher: String,
    #[sea_orm(nullable)]
    pub issued: Option<Date>,
    #[sea_orm(nullable)]
    pub issued_year: Option<i32>,
    pub resource_type: String,
    pub resource_format: String,
    #[sea_orm(column_type = "Text")]
    pub rights: String,
    // only set for harvested records; (journal_id, oai_identifier) is the upsert key
    #[sea_orm(nullable)]
    pub oai_identifier: Option<String>,
    #[sea_orm(nullable)]
    pub oai_datestamp: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::journal::Entity",
        from = "Column::JournalId",
        to = "super::journal::Column::Id"
    )]
    Journal,
    #[sea_orm(has_many = "super::publication_metadata::Entity")]
    Metadata,
}

impl Related<super::journal::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Journal.def()
    }
}

impl Related<super::publication_metadata::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Metadata.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
