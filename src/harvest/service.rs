use crate::config::HarvestConfig;
use crate::error::{HarvestError, OaiError};
use crate::harvest::model::{
    HarvestOptions, HarvestReport, HarvestStatus, HarvestSummary, CANCELLED_MESSAGE,
    INTERRUPTED_MESSAGE,
};
use crate::mapper::{map_record, Mapped, MappedRecord};
use crate::oai::{OaiClient, RawRecord};
use crate::search::sync::{IndexOp, IndexSynchronizer};
use crate::storage::entity::harvest_run::Model as HarvestRunModel;
use crate::storage::entity::journal::Model as JournalModel;
use crate::storage::repository::{
    HarvestRepository, JournalRepository, PublicationRepository, UpsertOutcome,
};
use chrono::DateTime;
use futures::stream::{self, StreamExt};
use log::{debug, error, info, warn};
use sea_orm::{DatabaseConnection, DbErr};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Failure messages kept verbatim in a partial-success warning.
const MAX_REPORTED_FAILURES: usize = 5;

const CLOSE_RETRY_DELAY: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The run's task in this process was told to stop.
    Signalled,
    /// No task in this process owned the run; the row was closed directly.
    /// A live task elsewhere stops at its next checkpoint.
    ClosedOrphan,
    NotRunning(HarvestStatus),
}

/// Why a run stopped early.
enum RunAbort {
    Cancelled,
    Oai(OaiError),
    BudgetExceeded { failed: usize, budget: usize, last: String },
}

impl From<OaiError> for RunAbort {
    fn from(err: OaiError) -> Self {
        RunAbort::Oai(err)
    }
}

impl RunAbort {
    fn message(&self) -> String {
        match self {
            RunAbort::Cancelled => CANCELLED_MESSAGE.to_string(),
            RunAbort::Oai(err) => err.to_string(),
            RunAbort::BudgetExceeded {
                failed,
                budget,
                last,
            } => format!(
                "Aborted after {} record failure(s), budget is {}. Last failure: {}",
                failed, budget, last
            ),
        }
    }
}

#[derive(Default)]
struct RunProgress {
    summary: HarvestSummary,
    processed: usize,
    touched: Vec<i32>,
    newest_datestamp: Option<i64>,
    failures: Vec<String>,
}

impl RunProgress {
    fn record_count(&self) -> i32 {
        i32::try_from(self.summary.harvested()).unwrap_or(i32::MAX)
    }

    fn record_upsert(&mut self, outcome: UpsertOutcome, datestamp: i64) {
        if outcome.created {
            self.summary.created += 1;
        } else {
            self.summary.updated += 1;
        }
        self.touched.push(outcome.id);
        self.newest_datestamp = Some(self.newest_datestamp.map_or(datestamp, |d| d.max(datestamp)));
    }

    fn record_failure(&mut self, message: String) {
        self.summary.failed += 1;
        if self.failures.len() < MAX_REPORTED_FAILURES {
            self.failures.push(message);
        }
    }

    fn warning(&self) -> String {
        if self.summary.failed == 0 {
            return String::new();
        }
        format!(
            "{} record(s) failed: {}",
            self.summary.failed,
            self.failures.join("; ")
        )
    }
}

struct OpenedRun {
    run: HarvestRunModel,
    journal: JournalModel,
    token: CancellationToken,
}

enum Stored {
    Unchanged,
    Upserted(UpsertOutcome),
}

fn join_messages(first: &str, second: &str) -> String {
    if first.is_empty() {
        second.to_string()
    } else {
        format!("{}\n{}", first, second)
    }
}

/// Drives harvest runs: one OAI feed per journal into the relational store,
/// then the touched publications into the search index.
#[derive(Clone)]
pub struct HarvestService {
    db: Arc<DatabaseConnection>,
    client: Arc<OaiClient>,
    synchronizer: Arc<IndexSynchronizer>,
    config: HarvestConfig,
    running: Arc<Mutex<HashMap<i32, CancellationToken>>>,
}

impl HarvestService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        client: Arc<OaiClient>,
        synchronizer: Arc<IndexSynchronizer>,
        config: HarvestConfig,
    ) -> Self {
        Self {
            db,
            client,
            synchronizer,
            config,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn resolve_journal(&self, slug: &str) -> Result<JournalModel, HarvestError> {
        JournalRepository::find_by_slug(&self.db, slug)
            .await?
            .ok_or_else(|| HarvestError::JournalNotFound(slug.to_string()))
    }

    /// Closes runs a dead process left running.
    pub async fn recover_stale(&self) -> Result<u64, HarvestError> {
        let closed = HarvestRepository::reset_stale(&self.db, INTERRUPTED_MESSAGE).await?;
        if closed > 0 {
            warn!("Closed {} stale harvest run(s) as interrupted.", closed);
        }
        Ok(closed)
    }

    /// Opens a run and drives it on a spawned task. The run id is available
    /// immediately; the handle resolves to the terminal report.
    pub async fn trigger(
        &self,
        journal_id: i32,
        options: HarvestOptions,
    ) -> Result<(i32, JoinHandle<HarvestReport>), HarvestError> {
        let opened = self.open(journal_id).await?;
        let run_id = opened.run.id;
        let service = self.clone();
        let handle = tokio::spawn(async move { service.drive(opened, options).await });
        Ok((run_id, handle))
    }

    /// Opens a run and drives it to completion on the current task.
    pub async fn run_journal(
        &self,
        journal_id: i32,
        options: HarvestOptions,
    ) -> Result<HarvestReport, HarvestError> {
        let opened = self.open(journal_id).await?;
        Ok(self.drive(opened, options).await)
    }

    /// Harvests every harvestable journal, `concurrency` at a time.
    /// A journal that cannot start never stops the others.
    pub async fn harvest_all(
        &self,
        options: HarvestOptions,
    ) -> Result<Vec<(String, Result<HarvestReport, HarvestError>)>, HarvestError> {
        let journals = JournalRepository::list_harvestable(&self.db).await?;
        info!("Harvesting {} journal(s).", journals.len());

        let results: Vec<_> = stream::iter(journals)
            .map(|journal| {
                let service = self.clone();
                async move {
                    let result = service.run_journal(journal.id, options).await;
                    if let Err(e) = &result {
                        warn!("Harvest of '{}' did not start: {}", journal.slug, e);
                    }
                    (journal.slug, result)
                }
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;
        Ok(results)
    }

    pub async fn cancel(&self, run_id: i32) -> Result<CancelOutcome, HarvestError> {
        if let Some(token) = self.running.lock().await.get(&run_id) {
            token.cancel();
            info!("Cancellation requested for harvest run {}.", run_id);
            return Ok(CancelOutcome::Signalled);
        }

        let run = HarvestRepository::find_by_id(&self.db, run_id)
            .await?
            .ok_or(HarvestError::RunNotFound(run_id))?;
        let status = run.status.parse().unwrap_or(HarvestStatus::Failed);
        if status != HarvestStatus::Running {
            return Ok(CancelOutcome::NotRunning(status));
        }

        if HarvestRepository::mark_failed(&self.db, run_id, run.record_count, CANCELLED_MESSAGE)
            .await?
        {
            warn!("Harvest run {} had no live task; closed as cancelled.", run_id);
            Ok(CancelOutcome::ClosedOrphan)
        } else {
            // closed between the read and the update
            Ok(CancelOutcome::NotRunning(HarvestStatus::Failed))
        }
    }

    async fn open(&self, journal_id: i32) -> Result<OpenedRun, HarvestError> {
        let journal = JournalRepository::find_by_id(&self.db, journal_id)
            .await?
            .ok_or_else(|| HarvestError::JournalNotFound(journal_id.to_string()))?;
        if journal.oai_url.trim().is_empty() {
            return Err(HarvestError::MissingEndpoint(journal.slug));
        }

        let Some(run) = HarvestRepository::open_run(&self.db, journal.id, &journal.oai_url).await?
        else {
            let run_id = HarvestRepository::find_running(&self.db, journal.id)
                .await?
                .map(|r| r.id)
                .unwrap_or_default();
            return Err(HarvestError::ConcurrentRun { journal_id, run_id });
        };

        let token = CancellationToken::new();
        self.running.lock().await.insert(run.id, token.clone());
        info!(
            "Harvest run {} opened for '{}' at {}",
            run.id, journal.slug, journal.oai_url
        );
        Ok(OpenedRun {
            run,
            journal,
            token,
        })
    }

    async fn drive(&self, opened: OpenedRun, options: HarvestOptions) -> HarvestReport {
        let OpenedRun {
            run,
            journal,
            token,
        } = opened;
        let mut progress = RunProgress::default();
        let outcome = self
            .consume(&journal, run.id, &token, options, &mut progress)
            .await;
        self.running.lock().await.remove(&run.id);

        let record_count = progress.record_count();
        let (mut status, mut error_message) = match &outcome {
            Ok(()) => (HarvestStatus::Success, progress.warning()),
            Err(abort) => (HarvestStatus::Failed, abort.message()),
        };

        match self.close(run.id, status, record_count, &error_message).await {
            Ok(true) => match status {
                HarvestStatus::Success => {
                    self.advance_window(&journal, &progress).await;
                    info!(
                        "Harvest run {} for '{}' succeeded: {} created, {} updated, {} unchanged, {} skipped, {} failed",
                        run.id,
                        journal.slug,
                        progress.summary.created,
                        progress.summary.updated,
                        progress.summary.unchanged,
                        progress.summary.skipped,
                        progress.summary.failed
                    )
                }
                _ => warn!(
                    "Harvest run {} for '{}' failed after {} record(s): {}",
                    run.id, journal.slug, record_count, error_message
                ),
            },
            Ok(false) => {
                // someone else closed the row, e.g. an operator cancel from another process
                if let Ok(Some(closed)) = HarvestRepository::find_by_id(&self.db, run.id).await {
                    status = closed.status.parse().unwrap_or(HarvestStatus::Failed);
                    error_message = closed.error_message;
                }
                warn!(
                    "Harvest run {} was closed elsewhere with status {}.",
                    run.id, status
                );
            }
            Err(e) => {
                error!("Could not close harvest run {}: {}", run.id, e);
                // the row is still running; stale recovery or an operator cancel closes it
                status = HarvestStatus::Running;
                let failure = format!("Run could not be closed: {}", e);
                error_message = join_messages(&error_message, &failure);
            }
        }

        if let Some(warning) = self.sync_index(&progress.touched).await {
            if let Err(e) = HarvestRepository::append_message(&self.db, run.id, &warning).await {
                error!("Could not record index warning on run {}: {}", run.id, e);
            }
            error_message = join_messages(&error_message, &warning);
        }

        HarvestReport {
            run_id: run.id,
            journal_id: journal.id,
            journal_slug: journal.slug,
            status,
            record_count: progress.summary.harvested(),
            summary: progress.summary,
            error_message,
        }
    }

    /// Writes the terminal status, retrying once on a database error.
    async fn close(
        &self,
        run_id: i32,
        status: HarvestStatus,
        record_count: i32,
        message: &str,
    ) -> Result<bool, DbErr> {
        let attempt = move || async move {
            match status {
                HarvestStatus::Success => {
                    HarvestRepository::mark_success(&self.db, run_id, record_count, message).await
                }
                _ => HarvestRepository::mark_failed(&self.db, run_id, record_count, message).await,
            }
        };
        match attempt().await {
            Err(e) => {
                warn!("Closing harvest run {} failed ({}); retrying once.", run_id, e);
                tokio::time::sleep(CLOSE_RETRY_DELAY).await;
                attempt().await
            }
            closed => closed,
        }
    }

    async fn advance_window(&self, journal: &JournalModel, progress: &RunProgress) {
        let Some(newest) = progress.newest_datestamp else {
            return;
        };
        match JournalRepository::advance_last_harvested(&self.db, journal.id, newest).await {
            Ok(true) => debug!("'{}' last harvested datestamp is now {}", journal.slug, newest),
            Ok(false) => {}
            Err(e) => error!(
                "Could not advance last harvested datestamp of '{}': {}",
                journal.slug, e
            ),
        }
    }

    /// Flushes record_count and confirms the row is still running.
    /// A row closed elsewhere stops the run as cancelled.
    async fn checkpoint(&self, run_id: i32, progress: &RunProgress) -> Result<(), RunAbort> {
        match HarvestRepository::update_progress(&self.db, run_id, progress.record_count()).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                warn!("Harvest run {} was closed elsewhere; stopping.", run_id);
                Err(RunAbort::Cancelled)
            }
            Err(e) => {
                warn!("Could not flush progress of run {}: {}", run_id, e);
                Ok(())
            }
        }
    }

    async fn consume(
        &self,
        journal: &JournalModel,
        run_id: i32,
        token: &CancellationToken,
        options: HarvestOptions,
        progress: &mut RunProgress,
    ) -> Result<(), RunAbort> {
        let from = options.from_date.or_else(|| {
            journal
                .last_harvested_at
                .and_then(|ts| DateTime::from_timestamp(ts, 0))
        });
        let mut pages = self.client.list_pages(&journal.oai_url, from)?;
        let flush_every = self.config.progress_every.max(1);
        let mut remaining = options.limit;

        while remaining != Some(0) {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(RunAbort::Cancelled),
                next = pages.next() => next,
            };
            let Some(page) = next else {
                break;
            };
            let records = page?;
            self.checkpoint(run_id, progress).await?;

            for raw in records.iter().take(remaining.unwrap_or(usize::MAX)) {
                if token.is_cancelled() {
                    return Err(RunAbort::Cancelled);
                }
                self.process(journal.id, raw, progress).await;
                progress.processed += 1;
                if let Some(n) = remaining.as_mut() {
                    *n -= 1;
                }

                if progress.summary.failed > self.config.error_budget {
                    return Err(RunAbort::BudgetExceeded {
                        failed: progress.summary.failed,
                        budget: self.config.error_budget,
                        last: progress.failures.last().cloned().unwrap_or_default(),
                    });
                }
                if progress.processed % flush_every == 0 {
                    self.checkpoint(run_id, progress).await?;
                    info!(
                        "Harvest run {} for '{}': {} processed, {} harvested",
                        run_id,
                        journal.slug,
                        progress.processed,
                        progress.summary.harvested()
                    );
                }
            }
            self.checkpoint(run_id, progress).await?;
        }
        Ok(())
    }

    async fn process(&self, journal_id: i32, raw: &RawRecord, progress: &mut RunProgress) {
        let record = match map_record(raw) {
            Ok(Mapped::Record(record)) => record,
            Ok(Mapped::Skip { identifier, reason }) => {
                debug!(
                    "Skipping record {}: {}",
                    identifier.as_deref().unwrap_or("<no identifier>"),
                    reason.as_str()
                );
                progress.summary.skipped += 1;
                return;
            }
            Err(e) => {
                warn!("{}", e);
                progress.record_failure(e.to_string());
                return;
            }
        };

        match self.store(journal_id, &record).await {
            Ok(Stored::Unchanged) => progress.summary.unchanged += 1,
            Ok(Stored::Upserted(outcome)) => {
                progress.record_upsert(outcome, record.oai_datestamp.timestamp())
            }
            Err(e) => {
                warn!("Could not store record {}: {}", record.oai_identifier, e);
                progress.record_failure(format!("{}: {}", record.oai_identifier, e));
            }
        }
    }

    async fn store(&self, journal_id: i32, record: &MappedRecord) -> Result<Stored, DbErr> {
        let existing =
            PublicationRepository::find_by_oai_key(&self.db, journal_id, &record.oai_identifier)
                .await?;
        let incoming = record.oai_datestamp.timestamp();
        if let Some(stored) = existing.and_then(|p| p.oai_datestamp) {
            if incoming <= stored {
                return Ok(Stored::Unchanged);
            }
        }
        let outcome = PublicationRepository::upsert_harvested(&self.db, journal_id, record).await?;
        Ok(Stored::Upserted(outcome))
    }

    async fn sync_index(&self, touched: &[i32]) -> Option<String> {
        if touched.is_empty() {
            return None;
        }
        let ops: Vec<IndexOp> = touched.iter().copied().map(IndexOp::Upsert).collect();
        let report = self.synchronizer.sync(&ops).await;
        debug!(
            "Index sync: {} upserted, {} deleted",
            report.upserted, report.deleted
        );
        report.warning
    }
}
