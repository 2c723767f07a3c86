#![allow(dead_code)]

use async_trait::async_trait;
use journal_harvester::config::{DbConfig, HarvestConfig};
use journal_harvester::error::{IndexSyncError, OaiError};
use journal_harvester::harvest::HarvestService;
use journal_harvester::mapper::{map_record, Mapped};
use journal_harvester::oai::{FieldNamespace, OaiClient, OaiTransport, RawField, RawRecord};
use journal_harvester::search::index::{IndexDocument, IndexHealth, IndexQuery, IndexResponse};
use journal_harvester::search::{IndexSynchronizer, SearchIndex};
use journal_harvester::storage::entity::journal::Model as JournalModel;
use journal_harvester::storage::establish_connection;
use journal_harvester::storage::repository::{JournalRepository, PublicationRepository};
use sea_orm::DatabaseConnection;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

pub async fn setup_db() -> Arc<DatabaseConnection> {
    let config = DbConfig {
        url: "sqlite::memory:".to_string(),
        max_connections: 1,
    };
    Arc::new(establish_connection(&config).await.unwrap())
}

pub async fn add_journal(db: &DatabaseConnection, name: &str, oai_url: &str) -> JournalModel {
    JournalRepository::create(db, name, oai_url).await.unwrap()
}

/// One scripted answer of the OAI source.
pub enum Step {
    Page(String),
    Fail(OaiError),
    /// Never answers; only cancellation ends the run.
    Hang,
    /// Answers with the page once the gate is notified.
    Gate(Arc<Notify>, String),
}

/// OAI transport answering from per-endpoint scripts. An exhausted script
/// answers with an empty final page.
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: Mutex<Vec<(String, Vec<(String, String)>)>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, base_url: &str, steps: Vec<Step>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(base_url.to_string())
            .or_default()
            .extend(steps);
    }

    pub fn calls(&self) -> Vec<(String, Vec<(String, String)>)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

/// Polls until the transport has answered or is answering `calls` requests.
pub async fn wait_for_calls(transport: &ScriptedTransport, calls: usize) {
    for _ in 0..500 {
        if transport.call_count() >= calls {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("transport saw {} call(s), expected {}", transport.call_count(), calls);
}

pub fn param<'a>(params: &'a [(String, String)], key: &str) -> Option<&'a str> {
    params.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
}

#[async_trait]
impl OaiTransport for ScriptedTransport {
    async fn fetch(
        &self,
        base_url: &str,
        params: &[(String, String)],
        _timeout: Duration,
    ) -> Result<String, OaiError> {
        self.calls
            .lock()
            .unwrap()
            .push((base_url.to_string(), params.to_vec()));
        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(base_url)
            .and_then(|steps| steps.pop_front());
        match step {
            Some(Step::Page(xml)) => Ok(xml),
            Some(Step::Fail(err)) => Err(err),
            Some(Step::Hang) => futures::future::pending().await,
            Some(Step::Gate(gate, xml)) => {
                gate.notified().await;
                Ok(xml)
            }
            None => Ok(list_records(&[], None)),
        }
    }
}

/// Search index fake that remembers what it was sent.
#[derive(Default)]
pub struct RecordingIndex {
    pub fail: bool,
    upserted: Mutex<Vec<i32>>,
    deleted: Mutex<Vec<i32>>,
}

impl RecordingIndex {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Default::default()
        })
    }

    pub fn upserted(&self) -> Vec<i32> {
        self.upserted.lock().unwrap().clone()
    }

    pub fn deleted(&self) -> Vec<i32> {
        self.deleted.lock().unwrap().clone()
    }

    fn check(&self) -> Result<(), IndexSyncError> {
        if self.fail {
            Err(IndexSyncError::Unreachable("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SearchIndex for RecordingIndex {
    async fn ensure_index(&self) -> Result<(), IndexSyncError> {
        self.check()
    }

    async fn upsert(&self, documents: &[IndexDocument]) -> Result<(), IndexSyncError> {
        self.check()?;
        self.upserted
            .lock()
            .unwrap()
            .extend(documents.iter().map(|d| d.id));
        Ok(())
    }

    async fn delete(&self, ids: &[i32]) -> Result<(), IndexSyncError> {
        self.check()?;
        self.deleted.lock().unwrap().extend_from_slice(ids);
        Ok(())
    }

    async fn search(&self, _query: &IndexQuery) -> Result<IndexResponse, IndexSyncError> {
        self.check()?;
        Ok(IndexResponse::default())
    }

    async fn health(&self) -> Result<IndexHealth, IndexSyncError> {
        self.check()?;
        Ok(IndexHealth {
            cluster_status: "green".to_string(),
            healthy: true,
        })
    }
}

pub fn harvest_service(
    db: Arc<DatabaseConnection>,
    transport: Arc<ScriptedTransport>,
    index: Arc<dyn SearchIndex>,
    config: HarvestConfig,
) -> HarvestService {
    let client = Arc::new(OaiClient::new(
        transport,
        Duration::from_secs(5),
        Duration::from_secs(5),
    ));
    let synchronizer = Arc::new(IndexSynchronizer::new(db.clone(), index));
    HarvestService::new(db, client, synchronizer, config)
}

/// A live record with Dublin Core elements given as (element, value).
pub fn record_xml(identifier: &str, datestamp: &str, fields: &[(&str, &str)]) -> String {
    let dc: String = fields
        .iter()
        .map(|(element, value)| format!("<dc:{element}>{value}</dc:{element}>"))
        .collect();
    format!(
        r#"<record><header><identifier>{identifier}</identifier><datestamp>{datestamp}</datestamp></header><metadata><oai_dc:dc xmlns:oai_dc="http://www.openarchives.org/OAI/2.0/oai_dc/" xmlns:dc="http://purl.org/dc/elements/1.1/" xmlns:dcterms="http://purl.org/dc/terms/">{dc}</oai_dc:dc></metadata></record>"#
    )
}

pub fn deleted_xml(identifier: &str, datestamp: &str) -> String {
    format!(
        r#"<record><header status="deleted"><identifier>{identifier}</identifier><datestamp>{datestamp}</datestamp></header></record>"#
    )
}

pub fn list_records(records: &[String], token: Option<&str>) -> String {
    let token = token
        .map(|t| format!("<resumptionToken>{t}</resumptionToken>"))
        .unwrap_or_default();
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/"><responseDate>2024-06-01T00:00:00Z</responseDate><ListRecords>{}{token}</ListRecords></OAI-PMH>"#,
        records.concat()
    )
}

pub fn dc(name: &str, value: &str) -> RawField {
    RawField {
        namespace: FieldNamespace::Elements,
        name: name.to_string(),
        value: value.to_string(),
        language: None,
    }
}

/// Maps and stores one publication directly, bypassing the OAI feed.
pub async fn seed_publication(
    db: &DatabaseConnection,
    journal_id: i32,
    identifier: &str,
    fields: Vec<RawField>,
) -> i32 {
    let raw = RawRecord {
        identifier: Some(identifier.to_string()),
        datestamp: Some("2024-01-01T00:00:00Z".to_string()),
        fields: Some(fields),
        ..Default::default()
    };
    let Mapped::Record(record) = map_record(&raw).unwrap() else {
        panic!("{identifier} should map to a publication");
    };
    PublicationRepository::upsert_harvested(db, journal_id, &record)
        .await
        .unwrap()
        .id
}
