use crate::error::IndexSyncError;
use crate::search::index::{IndexDocument, IndexHealth, SearchIndex};
use crate::storage::repository::PublicationRepository;
use log::{info, warn};
use sea_orm::DatabaseConnection;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// Publications pushed per bulk request and loaded per rebuild page.
pub const SYNC_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOp {
    Upsert(i32),
    Delete(i32),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub upserted: usize,
    pub deleted: usize,
    /// Set when the index could not be updated; the relational write stands.
    pub warning: Option<String>,
}

/// Propagates publication changes to the external index, best effort.
pub struct IndexSynchronizer {
    db: Arc<DatabaseConnection>,
    index: Arc<dyn SearchIndex>,
}

impl IndexSynchronizer {
    pub fn new(db: Arc<DatabaseConnection>, index: Arc<dyn SearchIndex>) -> Self {
        Self { db, index }
    }

    pub fn index(&self) -> Arc<dyn SearchIndex> {
        self.index.clone()
    }

    /// Applies a batch of operations. The last operation per publication wins;
    /// upserts for publications that no longer exist become deletes.
    /// Never fails: index trouble comes back as `SyncReport::warning`.
    pub async fn sync(&self, ops: &[IndexOp]) -> SyncReport {
        if ops.is_empty() {
            return SyncReport::default();
        }

        let mut latest: BTreeMap<i32, IndexOp> = BTreeMap::new();
        for op in ops {
            let id = match op {
                IndexOp::Upsert(id) | IndexOp::Delete(id) => *id,
            };
            latest.insert(id, *op);
        }

        let mut report = SyncReport::default();
        if let Err(e) = self.apply(&latest, &mut report).await {
            warn!("Search index sync failed after {} upsert(s): {}", report.upserted, e);
            report.warning = Some(format!("Search index update failed: {}", e));
        }
        report
    }

    async fn apply(
        &self,
        latest: &BTreeMap<i32, IndexOp>,
        report: &mut SyncReport,
    ) -> Result<(), IndexSyncError> {
        let upserts: Vec<i32> = latest
            .values()
            .filter_map(|op| match op {
                IndexOp::Upsert(id) => Some(*id),
                IndexOp::Delete(_) => None,
            })
            .collect();
        let mut deletes: Vec<i32> = latest
            .values()
            .filter_map(|op| match op {
                IndexOp::Delete(id) => Some(*id),
                IndexOp::Upsert(_) => None,
            })
            .collect();

        for chunk in upserts.chunks(SYNC_BATCH_SIZE) {
            let bundles = PublicationRepository::load_bundles(&self.db, chunk).await?;
            let found: HashSet<i32> = bundles.iter().map(|b| b.publication.id).collect();
            deletes.extend(chunk.iter().filter(|id| !found.contains(*id)));

            let docs: Vec<IndexDocument> = bundles.iter().map(IndexDocument::from_bundle).collect();
            self.index.upsert(&docs).await?;
            report.upserted += docs.len();
        }

        for chunk in deletes.chunks(SYNC_BATCH_SIZE) {
            self.index.delete(chunk).await?;
            report.deleted += chunk.len();
        }
        Ok(())
    }

    /// Re-indexes every publication. Safe to repeat: documents are keyed by id.
    pub async fn rebuild(&self) -> Result<SyncReport, IndexSyncError> {
        self.index.ensure_index().await?;

        let mut report = SyncReport::default();
        let mut after = 0;
        loop {
            let ids =
                PublicationRepository::ids_after(&self.db, after, SYNC_BATCH_SIZE as u64).await?;
            let Some(last) = ids.last().copied() else {
                break;
            };
            let bundles = PublicationRepository::load_bundles(&self.db, &ids).await?;
            let docs: Vec<IndexDocument> = bundles.iter().map(IndexDocument::from_bundle).collect();
            self.index.upsert(&docs).await?;
            report.upserted += docs.len();
            after = last;
        }

        info!("Search index rebuilt: {} publication(s) indexed.", report.upserted);
        Ok(report)
    }

    pub async fn health(&self) -> Result<IndexHealth, IndexSyncError> {
        self.index.health().await
    }
}
