use crate::harvest::model::HarvestStatus;
use crate::storage::entity::harvest_run::{
    self, ActiveModel as HarvestRunActiveModel, Entity as HarvestRun, Model as HarvestRunModel,
};
use crate::storage::entity::journal::{self, Entity as Journal};
use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, Set, SqlErr, TransactionTrait,
};
use serde::Serialize;

pub const MAX_ERROR_MESSAGE_CHARS: usize = 2000;

/// One harvest-log row as shown to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HarvestLogRow {
    pub id: i32,
    pub journal_id: i32,
    pub journal_slug: String,
    pub journal_name: String,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub endpoint: String,
    pub status: String,
    pub record_count: i32,
    pub error_message: String,
}

#[derive(Debug, Clone, Default)]
pub struct HarvestLogFilter {
    pub journal_slug: Option<String>,
    pub status: Option<HarvestStatus>,
}

pub fn truncate_message(message: &str) -> String {
    if message.chars().count() <= MAX_ERROR_MESSAGE_CHARS {
        return message.to_string();
    }
    let mut out: String = message.chars().take(MAX_ERROR_MESSAGE_CHARS - 3).collect();
    out.push_str("...");
    out
}

pub struct HarvestRepository;

impl HarvestRepository {
    pub async fn find_by_id(
        db: &DatabaseConnection,
        id: i32,
    ) -> Result<Option<HarvestRunModel>, DbErr> {
        HarvestRun::find_by_id(id).one(db).await
    }

    pub async fn find_running(
        db: &DatabaseConnection,
        journal_id: i32,
    ) -> Result<Option<HarvestRunModel>, DbErr> {
        HarvestRun::find()
            .filter(harvest_run::Column::JournalId.eq(journal_id))
            .filter(harvest_run::Column::Status.eq(HarvestStatus::Running.as_str()))
            .one(db)
            .await
    }

    /// Opens a running row for the journal.
    /// Returns `Ok(None)` when one is already running; the partial unique index
    /// on running rows catches the race the check cannot.
    pub async fn open_run(
        db: &DatabaseConnection,
        journal_id: i32,
        endpoint: &str,
    ) -> Result<Option<HarvestRunModel>, DbErr> {
        let txn = db.begin().await?;

        let running = HarvestRun::find()
            .filter(harvest_run::Column::JournalId.eq(journal_id))
            .filter(harvest_run::Column::Status.eq(HarvestStatus::Running.as_str()))
            .one(&txn)
            .await?;
        if running.is_some() {
            txn.rollback().await?;
            return Ok(None);
        }

        let inserted = HarvestRunActiveModel {
            journal_id: Set(journal_id),
            started_at: Set(Utc::now().timestamp()),
            finished_at: Set(None),
            endpoint: Set(endpoint.to_string()),
            status: Set(HarvestStatus::Running.as_str().to_string()),
            record_count: Set(0),
            error_message: Set(String::new()),
            ..Default::default()
        }
        .insert(&txn)
        .await;

        match inserted {
            Ok(run) => {
                txn.commit().await?;
                Ok(Some(run))
            }
            Err(err) if matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
                txn.rollback().await?;
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Raises record_count while the run is still running; never lowers it.
    /// Returns false once the row has been closed, e.g. by another process.
    pub async fn update_progress(
        db: &DatabaseConnection,
        id: i32,
        record_count: i32,
    ) -> Result<bool, DbErr> {
        let res = HarvestRun::update_many()
            .col_expr(
                harvest_run::Column::RecordCount,
                Expr::cust_with_values("MAX(record_count, ?)", [record_count]),
            )
            .filter(harvest_run::Column::Id.eq(id))
            .filter(harvest_run::Column::Status.eq(HarvestStatus::Running.as_str()))
            .exec(db)
            .await?;
        Ok(res.rows_affected > 0)
    }

    /// Closes a running run. Returns false when the run was already closed.
    pub async fn finish(
        db: &DatabaseConnection,
        id: i32,
        status: HarvestStatus,
        record_count: i32,
        error_message: &str,
    ) -> Result<bool, DbErr> {
        let res = HarvestRun::update_many()
            .col_expr(harvest_run::Column::Status, Expr::value(status.as_str()))
            .col_expr(
                harvest_run::Column::FinishedAt,
                Expr::value(Some(Utc::now().timestamp())),
            )
            .col_expr(
                harvest_run::Column::RecordCount,
                Expr::cust_with_values("MAX(record_count, ?)", [record_count]),
            )
            .col_expr(
                harvest_run::Column::ErrorMessage,
                Expr::value(truncate_message(error_message)),
            )
            .filter(harvest_run::Column::Id.eq(id))
            .filter(harvest_run::Column::Status.eq(HarvestStatus::Running.as_str()))
            .exec(db)
            .await?;
        Ok(res.rows_affected > 0)
    }

    pub async fn mark_success(
        db: &DatabaseConnection,
        id: i32,
        record_count: i32,
        warning: &str,
    ) -> Result<bool, DbErr> {
        Self::finish(db, id, HarvestStatus::Success, record_count, warning).await
    }

    pub async fn mark_failed(
        db: &DatabaseConnection,
        id: i32,
        record_count: i32,
        error_message: &str,
    ) -> Result<bool, DbErr> {
        Self::finish(db, id, HarvestStatus::Failed, record_count, error_message).await
    }

    /// Appends a line to a closed run's error_message.
    pub async fn append_message(
        db: &DatabaseConnection,
        id: i32,
        message: &str,
    ) -> Result<(), DbErr> {
        let Some(run) = HarvestRun::find_by_id(id).one(db).await? else {
            return Ok(());
        };
        let combined = if run.error_message.is_empty() {
            message.to_string()
        } else {
            format!("{}\n{}", run.error_message, message)
        };
        HarvestRunActiveModel {
            id: Set(id),
            error_message: Set(truncate_message(&combined)),
            ..Default::default()
        }
        .update(db)
        .await?;
        Ok(())
    }

    /// Fails every run still marked running, e.g. left behind by a dead process.
    pub async fn reset_stale(db: &DatabaseConnection, message: &str) -> Result<u64, DbErr> {
        let res = HarvestRun::update_many()
            .col_expr(
                harvest_run::Column::Status,
                Expr::value(HarvestStatus::Failed.as_str()),
            )
            .col_expr(
                harvest_run::Column::FinishedAt,
                Expr::value(Some(Utc::now().timestamp())),
            )
            .col_expr(
                harvest_run::Column::ErrorMessage,
                Expr::value(truncate_message(message)),
            )
            .filter(harvest_run::Column::Status.eq(HarvestStatus::Running.as_str()))
            .exec(db)
            .await?;
        Ok(res.rows_affected)
    }

    /// Newest first. `page` is 1-based.
    pub async fn list(
        db: &DatabaseConnection,
        filter: &HarvestLogFilter,
        page: u64,
        page_size: u64,
    ) -> Result<(Vec<HarvestLogRow>, u64), DbErr> {
        let mut query = HarvestRun::find().find_also_related(Journal);
        if let Some(slug) = &filter.journal_slug {
            query = query.filter(journal::Column::Slug.eq(slug.as_str()));
        }
        if let Some(status) = filter.status {
            query = query.filter(harvest_run::Column::Status.eq(status.as_str()));
        }

        let paginator = query
            .order_by_desc(harvest_run::Column::StartedAt)
            .order_by_desc(harvest_run::Column::Id)
            .paginate(db, page_size.max(1));
        let total = paginator.num_items().await?;
        let rows = paginator.fetch_page(page.saturating_sub(1)).await?;

        Ok((
            rows.into_iter()
                .map(|(run, journal)| {
                    let (journal_slug, journal_name) = journal
                        .map(|j| (j.slug, j.name))
                        .unwrap_or_default();
                    HarvestLogRow {
                        id: run.id,
                        journal_id: run.journal_id,
                        journal_slug,
                        journal_name,
                        started_at: run.started_at,
                        finished_at: run.finished_at,
                        endpoint: run.endpoint,
                        status: run.status,
                        record_count: run.record_count,
                        error_message: run.error_message,
                    }
                })
                .collect(),
            total,
        ))
    }
}
