use crate::mapper::{MappedRecord, DC_SCHEMA};
use crate::storage::entity::journal::{self, Entity as Journal, Model as JournalModel};
use crate::storage::entity::publication::{
    self, ActiveModel as PublicationActiveModel, Entity as Publication, Model as PublicationModel,
};
use crate::storage::entity::publication_metadata::{
    self, ActiveModel as MetadataActiveModel, Entity as PublicationMetadata,
    Model as MetadataModel,
};
use crate::storage::slug::{slugify, unique_slug};
use chrono::{NaiveDate, Utc};
use sea_orm::sea_query::{Expr, Func, LikeExpr, SelectStatement, SimpleExpr};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, DatabaseConnection, DbErr,
    EntityTrait, FromQueryResult, JoinType, Order, PaginatorTrait, QueryFilter, QueryOrder,
    QuerySelect, QueryTrait, RelationTrait, Set, TransactionTrait,
};
use std::collections::HashMap;

/// Structured predicates of a publication list request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublicationFilter {
    pub search: Option<String>,
    pub journal_slug: Option<String>,
    pub issued_from: Option<NaiveDate>,
    pub issued_to: Option<NaiveDate>,
    pub subjects: Vec<String>,
    pub authors: Vec<String>,
    pub issued_years: Vec<i32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OrderField {
    #[default]
    Title,
    Issued,
    CreatedAt,
    UpdatedAt,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublicationOrdering {
    pub field: OrderField,
    pub descending: bool,
}

impl PublicationOrdering {
    fn column(&self) -> publication::Column {
        match self.field {
            OrderField::Title => publication::Column::Title,
            OrderField::Issued => publication::Column::Issued,
            OrderField::CreatedAt => publication::Column::CreatedAt,
            OrderField::UpdatedAt => publication::Column::UpdatedAt,
        }
    }

    fn order(&self) -> Order {
        if self.descending {
            Order::Desc
        } else {
            Order::Asc
        }
    }
}

/// Escapes `%`, `_` and `\` so the term matches literally inside a LIKE pattern.
pub fn escape_like(term: &str) -> String {
    let mut out = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Case-insensitive (ASCII) substring match with the term taken literally.
fn contains_literal<C: ColumnTrait>(column: C, term: &str) -> SimpleExpr {
    column.like(LikeExpr::new(format!("%{}%", escape_like(term))).escape('\\'))
}

fn metadata_publication_ids(element: &str, condition: Condition) -> SelectStatement {
    PublicationMetadata::find()
        .select_only()
        .column(publication_metadata::Column::PublicationId)
        .filter(publication_metadata::Column::Schema.eq(DC_SCHEMA))
        .filter(publication_metadata::Column::Element.eq(element))
        .filter(condition)
        .into_query()
}

impl PublicationFilter {
    pub fn search_term(&self) -> Option<&str> {
        self.search.as_deref().map(str::trim).filter(|t| !t.is_empty())
    }

    /// True when anything beyond the free-text term narrows the result set.
    pub fn has_structured_filters(&self) -> bool {
        self.journal_slug.is_some()
            || self.issued_from.is_some()
            || self.issued_to.is_some()
            || !self.subjects.is_empty()
            || !self.authors.is_empty()
            || !self.issued_years.is_empty()
    }

    pub fn condition(&self) -> Condition {
        let mut cond = Condition::all();

        if let Some(term) = self.search_term() {
            let any_value = PublicationMetadata::find()
                .select_only()
                .column(publication_metadata::Column::PublicationId)
                .filter(contains_literal(publication_metadata::Column::Value, term))
                .into_query();
            cond = cond.add(
                Condition::any()
                    .add(contains_literal(publication::Column::Title, term))
                    .add(contains_literal(publication::Column::Description, term))
                    .add(contains_literal(publication::Column::Publisher, term))
                    .add(publication::Column::Id.in_subquery(any_value)),
            );
        }

        if let Some(slug) = &self.journal_slug {
            let journal_ids = Journal::find()
                .select_only()
                .column(journal::Column::Id)
                .filter(journal::Column::Slug.eq(slug.as_str()))
                .into_query();
            cond = cond.add(publication::Column::JournalId.in_subquery(journal_ids));
        }

        if let Some(from) = self.issued_from {
            cond = cond.add(publication::Column::Issued.gte(from));
        }
        if let Some(to) = self.issued_to {
            cond = cond.add(publication::Column::Issued.lte(to));
        }
        if !self.issued_years.is_empty() {
            cond = cond.add(publication::Column::IssuedYear.is_in(self.issued_years.clone()));
        }

        if !self.subjects.is_empty() {
            let any_subject = self.subjects.iter().fold(Condition::any(), |c, s| {
                c.add(contains_literal(publication_metadata::Column::Value, s))
            });
            cond = cond.add(
                publication::Column::Id.in_subquery(metadata_publication_ids("subject", any_subject)),
            );
        }

        if !self.authors.is_empty() {
            let lowered: Vec<String> = self.authors.iter().map(|a| a.to_lowercase()).collect();
            let exact = Condition::all().add(
                Expr::expr(Func::lower(Expr::col(publication_metadata::Column::Value)))
                    .is_in(lowered),
            );
            cond = cond.add(
                publication::Column::Id.in_subquery(metadata_publication_ids("creator", exact)),
            );
        }

        cond
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub id: i32,
    pub created: bool,
}

/// A publication with everything the index and the list envelope need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicationBundle {
    pub publication: PublicationModel,
    pub journal: Option<JournalModel>,
    pub metadata: Vec<MetadataModel>,
}

#[derive(Debug, Clone, PartialEq, Eq, FromQueryResult)]
pub struct FacetRow {
    pub facet_key: String,
    pub label: String,
    pub count: i64,
}

#[derive(Debug, Clone, FromQueryResult)]
struct CountRow {
    count: i64,
}

/// Facet dimensions the relational store can group by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacetDimension {
    Authors,
    Subjects,
    Journals,
    IssuedYears,
}

pub struct PublicationRepository;

impl PublicationRepository {
    pub async fn find_by_oai_key(
        db: &DatabaseConnection,
        journal_id: i32,
        oai_identifier: &str,
    ) -> Result<Option<PublicationModel>, DbErr> {
        Publication::find()
            .filter(publication::Column::JournalId.eq(journal_id))
            .filter(publication::Column::OaiIdentifier.eq(oai_identifier))
            .one(db)
            .await
    }

    /// Creates or updates the publication keyed by (journal, oai_identifier) and
    /// replaces its metadata entries, all in one transaction.
    pub async fn upsert_harvested(
        db: &DatabaseConnection,
        journal_id: i32,
        record: &MappedRecord,
    ) -> Result<UpsertOutcome, DbErr> {
        let txn = db.begin().await?;
        let now = Utc::now().timestamp();
        let fields = &record.fields;
        let datestamp = record.oai_datestamp.timestamp();

        let existing = Publication::find()
            .filter(publication::Column::JournalId.eq(journal_id))
            .filter(publication::Column::OaiIdentifier.eq(record.oai_identifier.as_str()))
            .one(&txn)
            .await?;

        let outcome = match existing {
            Some(model) => {
                let id = model.id;
                let mut active: PublicationActiveModel = model.into();
                active.title = Set(fields.title.clone());
                active.description = Set(fields.description.clone());
                active.publisher = Set(fields.publisher.clone());
                active.issued = Set(fields.issued);
                active.issued_year = Set(fields.issued_year());
                active.resource_type = Set(fields.resource_type.clone());
                active.resource_format = Set(fields.resource_format.clone());
                active.rights = Set(fields.rights.clone());
                active.oai_datestamp = Set(Some(datestamp));
                active.updated_at = Set(now);
                active.update(&txn).await?;

                PublicationMetadata::delete_many()
                    .filter(publication_metadata::Column::PublicationId.eq(id))
                    .exec(&txn)
                    .await?;
                UpsertOutcome { id, created: false }
            }
            None => {
                let base = slugify(&fields.title, "publication");
                let slug =
                    unique_slug::<Publication, _>(&txn, publication::Column::Slug, &base).await?;
                let inserted = PublicationActiveModel {
                    journal_id: Set(Some(journal_id)),
                    title: Set(fields.title.clone()),
                    slug: Set(slug),
                    description: Set(fields.description.clone()),
                    publisher: Set(fields.publisher.clone()),
                    issued: Set(fields.issued),
                    issued_year: Set(fields.issued_year()),
                    resource_type: Set(fields.resource_type.clone()),
                    resource_format: Set(fields.resource_format.clone()),
                    rights: Set(fields.rights.clone()),
                    oai_identifier: Set(Some(record.oai_identifier.clone())),
                    oai_datestamp: Set(Some(datestamp)),
                    created_at: Set(now),
                    updated_at: Set(now),
                    ..Default::default()
                }
                .insert(&txn)
                .await?;
                UpsertOutcome {
                    id: inserted.id,
                    created: true,
                }
            }
        };

        if !record.metadata.is_empty() {
            let rows = record.metadata.iter().map(|entry| MetadataActiveModel {
                publication_id: Set(outcome.id),
                schema: Set(entry.schema.clone()),
                element: Set(entry.element.clone()),
                qualifier: Set(entry.qualifier.clone().unwrap_or_default()),
                value: Set(entry.value.clone()),
                language: Set(entry.language.clone().unwrap_or_default()),
                position: Set(entry.position),
                ..Default::default()
            });
            PublicationMetadata::insert_many(rows).exec(&txn).await?;
        }

        txn.commit().await?;
        Ok(outcome)
    }

    pub async fn metadata_for(
        db: &DatabaseConnection,
        publication_id: i32,
    ) -> Result<Vec<MetadataModel>, DbErr> {
        PublicationMetadata::find()
            .filter(publication_metadata::Column::PublicationId.eq(publication_id))
            .order_by_asc(publication_metadata::Column::Position)
            .order_by_asc(publication_metadata::Column::Id)
            .all(db)
            .await
    }

    /// Loads bundles for `ids`, returned in the order of `ids`; unknown ids are dropped.
    pub async fn load_bundles(
        db: &DatabaseConnection,
        ids: &[i32],
    ) -> Result<Vec<PublicationBundle>, DbErr> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows = Publication::find()
            .find_also_related(Journal)
            .filter(publication::Column::Id.is_in(ids.to_vec()))
            .all(db)
            .await?;

        let mut metadata: HashMap<i32, Vec<MetadataModel>> = HashMap::new();
        for entry in PublicationMetadata::find()
            .filter(publication_metadata::Column::PublicationId.is_in(ids.to_vec()))
            .order_by_asc(publication_metadata::Column::PublicationId)
            .order_by_asc(publication_metadata::Column::Position)
            .order_by_asc(publication_metadata::Column::Id)
            .all(db)
            .await?
        {
            metadata.entry(entry.publication_id).or_default().push(entry);
        }

        let mut by_id: HashMap<i32, PublicationBundle> = rows
            .into_iter()
            .map(|(publication, journal)| {
                let id = publication.id;
                let bundle = PublicationBundle {
                    metadata: metadata.remove(&id).unwrap_or_default(),
                    publication,
                    journal,
                };
                (id, bundle)
            })
            .collect();

        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    /// Ids greater than `after`, ascending, at most `limit`.
    pub async fn ids_after(
        db: &DatabaseConnection,
        after: i32,
        limit: u64,
    ) -> Result<Vec<i32>, DbErr> {
        Publication::find()
            .select_only()
            .column(publication::Column::Id)
            .filter(publication::Column::Id.gt(after))
            .order_by_asc(publication::Column::Id)
            .limit(limit)
            .into_tuple::<i32>()
            .all(db)
            .await
    }

    pub async fn existing_ids(db: &DatabaseConnection, ids: &[i32]) -> Result<Vec<i32>, DbErr> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        Publication::find()
            .select_only()
            .column(publication::Column::Id)
            .filter(publication::Column::Id.is_in(ids.to_vec()))
            .into_tuple::<i32>()
            .all(db)
            .await
    }

    /// One page of filtered publications plus the total match count. `page` is 1-based.
    pub async fn list_page(
        db: &DatabaseConnection,
        filter: &PublicationFilter,
        ordering: PublicationOrdering,
        page: u64,
        page_size: u64,
    ) -> Result<(Vec<PublicationModel>, u64), DbErr> {
        let paginator = Publication::find()
            .filter(filter.condition())
            .order_by(ordering.column(), ordering.order())
            .order_by_asc(publication::Column::Id)
            .paginate(db, page_size.max(1));
        let total = paginator.num_items().await?;
        let rows = paginator.fetch_page(page.saturating_sub(1)).await?;
        Ok((rows, total))
    }

    pub async fn count(db: &DatabaseConnection, filter: &PublicationFilter) -> Result<u64, DbErr> {
        Publication::find().filter(filter.condition()).count(db).await
    }

    /// Grouped facet rows for one dimension, already ordered, plus the number of
    /// distinct values overall.
    pub async fn facet_rows(
        db: &DatabaseConnection,
        filter: &PublicationFilter,
        dimension: FacetDimension,
        offset: u64,
        limit: u64,
    ) -> Result<(Vec<FacetRow>, u64), DbErr> {
        match dimension {
            FacetDimension::Authors => metadata_facet(db, filter, "creator", offset, limit).await,
            FacetDimension::Subjects => metadata_facet(db, filter, "subject", offset, limit).await,
            FacetDimension::Journals => journal_facet(db, filter, offset, limit).await,
            FacetDimension::IssuedYears => year_facet(db, filter, offset, limit).await,
        }
    }
}

async fn scalar_count<C: ConnectionTrait>(
    db: &C,
    query: sea_orm::Select<impl EntityTrait>,
) -> Result<u64, DbErr> {
    let row = query.into_model::<CountRow>().one(db).await?;
    Ok(row.map(|r| r.count.max(0) as u64).unwrap_or(0))
}

async fn metadata_facet(
    db: &DatabaseConnection,
    filter: &PublicationFilter,
    element: &str,
    offset: u64,
    limit: u64,
) -> Result<(Vec<FacetRow>, u64), DbErr> {
    let matching = Publication::find()
        .select_only()
        .column(publication::Column::Id)
        .filter(filter.condition())
        .into_query();
    let base = PublicationMetadata::find()
        .select_only()
        .filter(publication_metadata::Column::Schema.eq(DC_SCHEMA))
        .filter(publication_metadata::Column::Element.eq(element))
        .filter(Expr::cust(r#"TRIM("value") <> ''"#))
        .filter(publication_metadata::Column::PublicationId.in_subquery(matching));

    let total = scalar_count(
        db,
        base.clone()
            .column_as(Expr::cust(r#"COUNT(DISTINCT LOWER(TRIM("value")))"#), "count"),
    )
    .await?;

    let rows = base
        .column_as(Expr::cust(r#"LOWER(TRIM("value"))"#), "facet_key")
        .column_as(Expr::cust(r#"MIN(TRIM("value"))"#), "label")
        .column_as(Expr::cust(r#"COUNT(DISTINCT "publication_id")"#), "count")
        .group_by(Expr::cust(r#"LOWER(TRIM("value"))"#))
        .order_by(Expr::cust(r#""count""#), Order::Desc)
        .order_by(Expr::cust(r#""label""#), Order::Asc)
        .offset(offset)
        .limit(limit)
        .into_model::<FacetRow>()
        .all(db)
        .await?;
    Ok((rows, total))
}

async fn journal_facet(
    db: &DatabaseConnection,
    filter: &PublicationFilter,
    offset: u64,
    limit: u64,
) -> Result<(Vec<FacetRow>, u64), DbErr> {
    let base = Publication::find()
        .select_only()
        .join(JoinType::InnerJoin, publication::Relation::Journal.def())
        .filter(filter.condition());

    let total = scalar_count(
        db,
        base.clone().column_as(
            Expr::cust(r#"COUNT(DISTINCT "publications"."journal_id")"#),
            "count",
        ),
    )
    .await?;

    let rows = base
        .column_as(journal::Column::Slug, "facet_key")
        .column_as(journal::Column::Name, "label")
        .column_as(Expr::cust(r#"COUNT(DISTINCT "publications"."id")"#), "count")
        .group_by(journal::Column::Slug)
        .group_by(journal::Column::Name)
        .order_by(Expr::cust(r#""count""#), Order::Desc)
        .order_by(Expr::cust(r#""label""#), Order::Asc)
        .offset(offset)
        .limit(limit)
        .into_model::<FacetRow>()
        .all(db)
        .await?;
    Ok((rows, total))
}

async fn year_facet(
    db: &DatabaseConnection,
    filter: &PublicationFilter,
    offset: u64,
    limit: u64,
) -> Result<(Vec<FacetRow>, u64), DbErr> {
    let base = Publication::find()
        .select_only()
        .filter(filter.condition())
        .filter(publication::Column::IssuedYear.is_not_null());

    let total = scalar_count(
        db,
        base.clone().column_as(
            Expr::cust(r#"COUNT(DISTINCT "publications"."issued_year")"#),
            "count",
        ),
    )
    .await?;

    let rows = base
        .column_as(
            Expr::cust(r#"CAST("publications"."issued_year" AS TEXT)"#),
            "facet_key",
        )
        .column_as(
            Expr::cust(r#"CAST("publications"."issued_year" AS TEXT)"#),
            "label",
        )
        .column_as(Expr::cust(r#"COUNT(DISTINCT "publications"."id")"#), "count")
        .group_by(publication::Column::IssuedYear)
        .order_by(Expr::cust(r#""count""#), Order::Desc)
        .order_by(publication::Column::IssuedYear, Order::Desc)
        .offset(offset)
        .limit(limit)
        .into_model::<FacetRow>()
        .all(db)
        .await?;
    Ok((rows, total))
}
