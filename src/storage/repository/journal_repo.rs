use crate::storage::entity::journal::{
    self, ActiveModel as JournalActiveModel, Entity as Journal, Model as JournalModel,
};
use crate::storage::slug::{slugify, unique_slug};
use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set,
};

pub struct JournalRepository;

impl JournalRepository {
    pub async fn create(
        db: &DatabaseConnection,
        name: &str,
        oai_url: &str,
    ) -> Result<JournalModel, sea_orm::DbErr> {
        let base = slugify(name, "journal");
        let slug = unique_slug::<Journal, _>(db, journal::Column::Slug, &base).await?;

        let now = Utc::now().timestamp();
        JournalActiveModel {
            slug: Set(slug),
            name: Set(name.trim().to_string()),
            oai_url: Set(oai_url.trim().to_string()),
            last_harvested_at: Set(None),
            is_active: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(db)
        .await
    }

    pub async fn find_by_id(
        db: &DatabaseConnection,
        id: i32,
    ) -> Result<Option<JournalModel>, sea_orm::DbErr> {
        Journal::find_by_id(id).one(db).await
    }

    pub async fn find_by_slug(
        db: &DatabaseConnection,
        slug: &str,
    ) -> Result<Option<JournalModel>, sea_orm::DbErr> {
        Journal::find()
            .filter(journal::Column::Slug.eq(slug))
            .one(db)
            .await
    }

    /// Active journals with a non-empty OAI URL, by name.
    pub async fn list_harvestable(
        db: &DatabaseConnection,
    ) -> Result<Vec<JournalModel>, sea_orm::DbErr> {
        Journal::find()
            .filter(journal::Column::IsActive.eq(true))
            .filter(
                Condition::all()
                    .add(journal::Column::OaiUrl.is_not_null())
                    .add(journal::Column::OaiUrl.ne("")),
            )
            .order_by_asc(journal::Column::Name)
            .all(db)
            .await
    }

    /// Moves `last_harvested_at` forward to `datestamp`; never backwards.
    pub async fn advance_last_harvested(
        db: &DatabaseConnection,
        id: i32,
        datestamp: i64,
    ) -> Result<bool, sea_orm::DbErr> {
        let res = Journal::update_many()
            .col_expr(journal::Column::LastHarvestedAt, Expr::value(datestamp))
            .col_expr(
                journal::Column::UpdatedAt,
                Expr::value(Utc::now().timestamp()),
            )
            .filter(journal::Column::Id.eq(id))
            .filter(
                Condition::any()
                    .add(journal::Column::LastHarvestedAt.is_null())
                    .add(journal::Column::LastHarvestedAt.lt(datestamp)),
            )
            .exec(db)
            .await?;
        Ok(res.rows_affected > 0)
    }
}
