use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "journals")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    #[sea_orm(unique)]
    pub slug: String,
    pub name: String,
    pub oai_url: String,
    // newest upserted datestamp, used as the incremental `from` window
    #[sea_orm(nullable)]
    pub last_harvested_at: Option<i64>,
    pub is_active: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::harvest_run::Entity")]
    HarvestRun,
    #[sea_orm(has_many = "super::publication::Entity")]
    Publication,
}

impl Related<super::harvest_run::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::HarvestRun.def()
    }
}

impl Related<super::publication::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Publication.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
