mod common;

use common::*;
use journal_harvester::config::HarvestConfig;
use journal_harvester::error::{HarvestError, OaiError};
use journal_harvester::harvest::{CancelOutcome, HarvestOptions, HarvestStatus};
use journal_harvester::mapper::{dc_view, map_record, Mapped};
use journal_harvester::oai::parser::parse_list_records;
use journal_harvester::storage::entity::journal::Entity as Journal;
use journal_harvester::storage::entity::publication_metadata::Entity as PublicationMetadata;
use journal_harvester::storage::entity::HarvestRun;
use journal_harvester::storage::repository::{
    HarvestLogFilter, HarvestRepository, JournalRepository, PublicationRepository,
};
use sea_orm::{ConnectionTrait, EntityTrait, PaginatorTrait};
use std::sync::Arc;
use tokio::sync::Notify;

const AGRO: &str = "https://agro.example.org/oai";

fn three_record_feed() -> String {
    list_records(
        &[
            record_xml(
                "oai:agro:1",
                "2024-01-10T08:00:00Z",
                &[("title", "Maize yields"), ("creator", "Doe, Jane"), ("date", "2020-03-01")],
            ),
            deleted_xml("oai:agro:2", "2024-01-11T08:00:00Z"),
            record_xml(
                "oai:agro:3",
                "2024-01-12T08:00:00Z",
                &[("title", "Soil carbon"), ("subject", "soil")],
            ),
        ],
        None,
    )
}

#[tokio::test]
async fn test_deleted_records_are_skipped() {
    let db = setup_db().await;
    let journal = add_journal(&db, "Agro Journal", AGRO).await;
    let transport = ScriptedTransport::new();
    transport.script(AGRO, vec![Step::Page(three_record_feed())]);
    let index = RecordingIndex::new();
    let service = harvest_service(db.clone(), transport, index.clone(), HarvestConfig::default());

    let report = service
        .run_journal(journal.id, HarvestOptions::default())
        .await
        .unwrap();

    assert_eq!(report.status, HarvestStatus::Success);
    assert_eq!(report.record_count, 2);
    assert_eq!(report.summary.skipped, 1);
    assert_eq!(report.error_message, "");

    let run = HarvestRepository::find_by_id(&db, report.run_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.status, "success");
    assert_eq!(run.record_count, 2);
    assert!(run.finished_at.is_some());
    assert_eq!(run.endpoint, AGRO);

    assert!(PublicationRepository::find_by_oai_key(&db, journal.id, "oai:agro:2")
        .await
        .unwrap()
        .is_none());
    assert!(PublicationRepository::find_by_oai_key(&db, journal.id, "oai:agro:1")
        .await
        .unwrap()
        .is_some());
    assert_eq!(index.upserted().len(), 2);
}

#[tokio::test]
async fn test_transport_failure_on_second_page_fails_run() {
    let db = setup_db().await;
    let journal = add_journal(&db, "Agro Journal", AGRO).await;
    let transport = ScriptedTransport::new();
    let page_one = list_records(
        &[
            record_xml("oai:agro:1", "2024-01-10", &[("title", "First")]),
            record_xml("oai:agro:2", "2024-01-10", &[("title", "Second")]),
        ],
        Some("page-2"),
    );
    transport.script(
        AGRO,
        vec![
            Step::Page(page_one),
            Step::Fail(OaiError::transport(AGRO, "request timed out after 5s")),
        ],
    );
    let service = harvest_service(
        db.clone(),
        transport.clone(),
        RecordingIndex::new(),
        HarvestConfig::default(),
    );

    let report = service
        .run_journal(journal.id, HarvestOptions::default())
        .await
        .unwrap();

    assert_eq!(report.status, HarvestStatus::Failed);
    assert_eq!(report.record_count, 2);
    let run = HarvestRepository::find_by_id(&db, report.run_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.status, "failed");
    assert_eq!(run.record_count, 2);
    assert!(run.error_message.contains("Transport"), "{}", run.error_message);

    let calls = transport.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(param(&calls[1].1, "resumptionToken"), Some("page-2"));
    assert_eq!(param(&calls[1].1, "metadataPrefix"), None);

    // failed runs never move the incremental window
    let stored = Journal::find_by_id(journal.id).one(db.as_ref()).await.unwrap().unwrap();
    assert_eq!(stored.last_harvested_at, None);
}

#[tokio::test]
async fn test_second_harvest_of_unchanged_source_is_idempotent() {
    let db = setup_db().await;
    let journal = add_journal(&db, "Agro Journal", AGRO).await;
    let transport = ScriptedTransport::new();
    transport.script(
        AGRO,
        vec![Step::Page(three_record_feed()), Step::Page(three_record_feed())],
    );
    let service = harvest_service(
        db.clone(),
        transport.clone(),
        RecordingIndex::new(),
        HarvestConfig::default(),
    );

    let first = service
        .run_journal(journal.id, HarvestOptions::default())
        .await
        .unwrap();
    let metadata_after_first = PublicationMetadata::find().count(db.as_ref()).await.unwrap();

    let second = service
        .run_journal(journal.id, HarvestOptions::default())
        .await
        .unwrap();

    assert_eq!(first.record_count, 2);
    assert_eq!(second.status, HarvestStatus::Success);
    assert_eq!(second.record_count, 0);
    assert_eq!(second.summary.unchanged, 2);
    assert_eq!(
        PublicationMetadata::find().count(db.as_ref()).await.unwrap(),
        metadata_after_first
    );

    // the second request starts from the newest datestamp of the first run
    let calls = transport.calls();
    assert_eq!(param(&calls[0].1, "from"), None);
    assert_eq!(param(&calls[1].1, "from"), Some("2024-01-12T08:00:00Z"));
}

#[tokio::test]
async fn test_newer_datestamp_updates_publication() {
    let db = setup_db().await;
    let journal = add_journal(&db, "Agro Journal", AGRO).await;
    let transport = ScriptedTransport::new();
    transport.script(
        AGRO,
        vec![
            Step::Page(list_records(
                &[record_xml("oai:agro:1", "2024-01-10", &[("title", "Draft title")])],
                None,
            )),
            Step::Page(list_records(
                &[record_xml(
                    "oai:agro:1",
                    "2024-02-10",
                    &[("title", "Final title"), ("subject", "maize")],
                )],
                None,
            )),
        ],
    );
    let service = harvest_service(db.clone(), transport, RecordingIndex::new(), HarvestConfig::default());

    service.run_journal(journal.id, HarvestOptions::default()).await.unwrap();
    let before = PublicationRepository::find_by_oai_key(&db, journal.id, "oai:agro:1")
        .await
        .unwrap()
        .unwrap();
    let report = service.run_journal(journal.id, HarvestOptions::default()).await.unwrap();
    let after = PublicationRepository::find_by_oai_key(&db, journal.id, "oai:agro:1")
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.summary.updated, 1);
    assert_eq!(after.id, before.id);
    assert_eq!(after.slug, before.slug);
    assert_eq!(after.title, "Final title");
    let metadata = PublicationRepository::metadata_for(&db, after.id).await.unwrap();
    assert_eq!(metadata.len(), 2);
}

#[tokio::test]
async fn test_concurrent_run_is_rejected_without_new_row() {
    let db = setup_db().await;
    let journal = add_journal(&db, "Agro Journal", AGRO).await;
    let running = HarvestRepository::open_run(&db, journal.id, AGRO)
        .await
        .unwrap()
        .unwrap();
    let service = harvest_service(
        db.clone(),
        ScriptedTransport::new(),
        RecordingIndex::new(),
        HarvestConfig::default(),
    );

    let err = service
        .run_journal(journal.id, HarvestOptions::default())
        .await
        .unwrap_err();

    match err {
        HarvestError::ConcurrentRun { journal_id, run_id } => {
            assert_eq!(journal_id, journal.id);
            assert_eq!(run_id, running.id);
        }
        other => panic!("expected ConcurrentRun, got {other:?}"),
    }
    assert_eq!(HarvestRun::find().count(db.as_ref()).await.unwrap(), 1);
}

#[tokio::test]
async fn test_journal_without_endpoint_is_rejected() {
    let db = setup_db().await;
    let journal = add_journal(&db, "Print Only", "").await;
    let service = harvest_service(
        db.clone(),
        ScriptedTransport::new(),
        RecordingIndex::new(),
        HarvestConfig::default(),
    );

    let err = service
        .run_journal(journal.id, HarvestOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, HarvestError::MissingEndpoint(slug) if slug == "print-only"));
    assert!(matches!(
        service.resolve_journal("nope").await,
        Err(HarvestError::JournalNotFound(_))
    ));
    assert_eq!(HarvestRun::find().count(db.as_ref()).await.unwrap(), 0);
}

fn feed_with_untitled(untitled: usize) -> String {
    let mut records = vec![record_xml("oai:agro:ok", "2024-01-10", &[("title", "Good")])];
    for i in 0..untitled {
        records.push(record_xml(
            &format!("oai:agro:bad{i}"),
            "2024-01-10",
            &[("creator", "Nobody")],
        ));
    }
    list_records(&records, None)
}

#[tokio::test]
async fn test_failures_within_budget_still_succeed() {
    let db = setup_db().await;
    let journal = add_journal(&db, "Agro Journal", AGRO).await;
    let transport = ScriptedTransport::new();
    transport.script(AGRO, vec![Step::Page(feed_with_untitled(2))]);
    let config = HarvestConfig {
        error_budget: 5,
        ..Default::default()
    };
    let service = harvest_service(db.clone(), transport, RecordingIndex::new(), config);

    let report = service
        .run_journal(journal.id, HarvestOptions::default())
        .await
        .unwrap();

    assert_eq!(report.status, HarvestStatus::Success);
    assert_eq!(report.record_count, 1);
    assert_eq!(report.summary.failed, 2);
    assert!(report.error_message.starts_with("2 record(s) failed"), "{}", report.error_message);
    assert!(report.error_message.contains("oai:agro:bad0"));
}

#[tokio::test]
async fn test_exceeding_error_budget_fails_run() {
    let db = setup_db().await;
    let journal = add_journal(&db, "Agro Journal", AGRO).await;
    let transport = ScriptedTransport::new();
    transport.script(AGRO, vec![Step::Page(feed_with_untitled(3))]);
    let config = HarvestConfig {
        error_budget: 1,
        ..Default::default()
    };
    let service = harvest_service(db.clone(), transport, RecordingIndex::new(), config);

    let report = service
        .run_journal(journal.id, HarvestOptions::default())
        .await
        .unwrap();

    assert_eq!(report.status, HarvestStatus::Failed);
    assert_eq!(report.record_count, 1);
    assert_eq!(report.summary.failed, 2);
    assert!(report.error_message.contains("budget is 1"), "{}", report.error_message);
}

#[tokio::test]
async fn test_limit_and_from_date_options() {
    let db = setup_db().await;
    let journal = add_journal(&db, "Agro Journal", AGRO).await;
    let transport = ScriptedTransport::new();
    transport.script(AGRO, vec![Step::Page(three_record_feed())]);
    let service = harvest_service(
        db.clone(),
        transport.clone(),
        RecordingIndex::new(),
        HarvestConfig::default(),
    );
    let options = HarvestOptions {
        from_date: chrono::DateTime::from_timestamp(1_700_000_000, 0),
        limit: Some(1),
    };

    let report = service.run_journal(journal.id, options).await.unwrap();

    assert_eq!(report.record_count, 1);
    assert_eq!(
        param(&transport.calls()[0].1, "from"),
        Some("2023-11-14T22:13:20Z")
    );
}

#[tokio::test]
async fn test_cancel_running_task() {
    let db = setup_db().await;
    let journal = add_journal(&db, "Agro Journal", AGRO).await;
    let transport = ScriptedTransport::new();
    let page_one = list_records(
        &[record_xml("oai:agro:1", "2024-01-10", &[("title", "First")])],
        Some("page-2"),
    );
    transport.script(AGRO, vec![Step::Page(page_one), Step::Hang]);
    let service = harvest_service(
        db.clone(),
        transport.clone(),
        RecordingIndex::new(),
        HarvestConfig::default(),
    );

    let (run_id, handle) = service
        .trigger(journal.id, HarvestOptions::default())
        .await
        .unwrap();
    wait_for_calls(&transport, 2).await;
    assert_eq!(transport.call_count(), 2);

    assert_eq!(service.cancel(run_id).await.unwrap(), CancelOutcome::Signalled);
    let report = handle.await.unwrap();

    assert_eq!(report.run_id, run_id);
    assert_eq!(report.status, HarvestStatus::Failed);
    assert_eq!(report.error_message, "cancelled");
    assert_eq!(report.record_count, 1);
    let run = HarvestRepository::find_by_id(&db, run_id).await.unwrap().unwrap();
    assert_eq!(run.status, "failed");
    assert_eq!(run.error_message, "cancelled");
    // committed records stay
    assert!(PublicationRepository::find_by_oai_key(&db, journal.id, "oai:agro:1")
        .await
        .unwrap()
        .is_some());
}

fn two_record_page(next: Option<&str>) -> String {
    list_records(
        &[
            record_xml("oai:agro:1", "2024-01-10", &[("title", "First")]),
            record_xml("oai:agro:2", "2024-01-11", &[("title", "Second")]),
        ],
        next,
    )
}

#[tokio::test]
async fn test_progress_is_flushed_while_running() {
    let db = setup_db().await;
    let journal = add_journal(&db, "Agro Journal", AGRO).await;
    let transport = ScriptedTransport::new();
    transport.script(AGRO, vec![Step::Page(two_record_page(Some("page-2"))), Step::Hang]);
    let config = HarvestConfig {
        progress_every: 1,
        ..Default::default()
    };
    let service = harvest_service(db.clone(), transport.clone(), RecordingIndex::new(), config);

    let (run_id, handle) = service
        .trigger(journal.id, HarvestOptions::default())
        .await
        .unwrap();
    wait_for_calls(&transport, 2).await;

    let run = HarvestRepository::find_by_id(&db, run_id).await.unwrap().unwrap();
    assert_eq!(run.status, "running");
    assert_eq!(run.record_count, 2);

    // a lower count never lowers the stored one
    assert!(HarvestRepository::update_progress(&db, run_id, 1).await.unwrap());
    let run = HarvestRepository::find_by_id(&db, run_id).await.unwrap().unwrap();
    assert_eq!(run.record_count, 2);

    assert_eq!(service.cancel(run_id).await.unwrap(), CancelOutcome::Signalled);
    let report = handle.await.unwrap();
    assert_eq!(report.record_count, 2);

    // closed rows no longer take progress
    assert!(!HarvestRepository::update_progress(&db, run_id, 5).await.unwrap());
    let run = HarvestRepository::find_by_id(&db, run_id).await.unwrap().unwrap();
    assert_eq!(run.status, "failed");
    assert_eq!(run.record_count, 2);
}

#[tokio::test]
async fn test_cancel_from_another_process_stops_the_live_run() {
    let db = setup_db().await;
    let journal = add_journal(&db, "Agro Journal", AGRO).await;
    let gate = Arc::new(Notify::new());
    let transport = ScriptedTransport::new();
    transport.script(
        AGRO,
        vec![
            Step::Page(two_record_page(Some("page-2"))),
            Step::Gate(
                gate.clone(),
                list_records(
                    &[record_xml("oai:agro:3", "2024-01-12", &[("title", "Third")])],
                    None,
                ),
            ),
        ],
    );
    let owner = harvest_service(
        db.clone(),
        transport.clone(),
        RecordingIndex::new(),
        HarvestConfig::default(),
    );
    // shares the database only, like a second CLI process
    let operator = harvest_service(
        db.clone(),
        ScriptedTransport::new(),
        RecordingIndex::new(),
        HarvestConfig::default(),
    );

    let (run_id, handle) = owner
        .trigger(journal.id, HarvestOptions::default())
        .await
        .unwrap();
    wait_for_calls(&transport, 2).await;

    assert!(matches!(
        operator.run_journal(journal.id, HarvestOptions::default()).await,
        Err(HarvestError::ConcurrentRun { run_id: id, .. }) if id == run_id
    ));
    assert_eq!(operator.cancel(run_id).await.unwrap(), CancelOutcome::ClosedOrphan);
    gate.notify_one();
    let report = handle.await.unwrap();

    assert_eq!(report.status, HarvestStatus::Failed);
    assert_eq!(report.error_message, "cancelled");
    assert_eq!(report.record_count, 2);
    assert_eq!(transport.call_count(), 2);
    assert!(PublicationRepository::find_by_oai_key(&db, journal.id, "oai:agro:3")
        .await
        .unwrap()
        .is_none());

    let run = HarvestRepository::find_by_id(&db, run_id).await.unwrap().unwrap();
    assert_eq!(run.status, "failed");
    assert_eq!(run.error_message, "cancelled");
    assert_eq!(run.record_count, 2);
    let stored = Journal::find_by_id(journal.id).one(db.as_ref()).await.unwrap().unwrap();
    assert_eq!(stored.last_harvested_at, None);
}

#[tokio::test]
async fn test_unclosable_run_is_reported_as_running() {
    let db = setup_db().await;
    let journal = add_journal(&db, "Agro Journal", AGRO).await;
    let gate = Arc::new(Notify::new());
    let transport = ScriptedTransport::new();
    transport.script(
        AGRO,
        vec![
            Step::Page(two_record_page(Some("page-2"))),
            Step::Gate(gate.clone(), list_records(&[], None)),
        ],
    );
    let service = harvest_service(
        db.clone(),
        transport.clone(),
        RecordingIndex::new(),
        HarvestConfig::default(),
    );

    let (_, handle) = service
        .trigger(journal.id, HarvestOptions::default())
        .await
        .unwrap();
    wait_for_calls(&transport, 2).await;
    db.execute_unprepared("DROP TABLE harvest_runs").await.unwrap();
    gate.notify_one();
    let report = handle.await.unwrap();

    assert_eq!(report.status, HarvestStatus::Running);
    assert_eq!(report.record_count, 2);
    assert!(
        report.error_message.contains("Run could not be closed"),
        "{}",
        report.error_message
    );
}

#[tokio::test]
async fn test_cancel_orphaned_and_closed_runs() {
    let db = setup_db().await;
    let journal = add_journal(&db, "Agro Journal", AGRO).await;
    let orphan = HarvestRepository::open_run(&db, journal.id, AGRO)
        .await
        .unwrap()
        .unwrap();
    let service = harvest_service(
        db.clone(),
        ScriptedTransport::new(),
        RecordingIndex::new(),
        HarvestConfig::default(),
    );

    assert_eq!(service.cancel(orphan.id).await.unwrap(), CancelOutcome::ClosedOrphan);
    let run = HarvestRepository::find_by_id(&db, orphan.id).await.unwrap().unwrap();
    assert_eq!(run.status, "failed");
    assert_eq!(run.error_message, "cancelled");

    assert_eq!(
        service.cancel(orphan.id).await.unwrap(),
        CancelOutcome::NotRunning(HarvestStatus::Failed)
    );
    assert!(matches!(
        service.cancel(9999).await,
        Err(HarvestError::RunNotFound(9999))
    ));
}

#[tokio::test]
async fn test_stale_runs_are_closed_as_interrupted() {
    let db = setup_db().await;
    let journal = add_journal(&db, "Agro Journal", AGRO).await;
    let stale = HarvestRepository::open_run(&db, journal.id, AGRO)
        .await
        .unwrap()
        .unwrap();
    let service = harvest_service(
        db.clone(),
        ScriptedTransport::new(),
        RecordingIndex::new(),
        HarvestConfig::default(),
    );

    assert_eq!(service.recover_stale().await.unwrap(), 1);
    let run = HarvestRepository::find_by_id(&db, stale.id).await.unwrap().unwrap();
    assert_eq!(run.status, "failed");
    assert_eq!(run.error_message, "interrupted");
    assert!(run.finished_at.is_some());

    // the journal can be harvested again
    let report = service
        .run_journal(journal.id, HarvestOptions::default())
        .await
        .unwrap();
    assert_eq!(report.status, HarvestStatus::Success);
}

#[tokio::test]
async fn test_index_failure_is_a_warning_only() {
    let db = setup_db().await;
    let journal = add_journal(&db, "Agro Journal", AGRO).await;
    let transport = ScriptedTransport::new();
    transport.script(AGRO, vec![Step::Page(three_record_feed())]);
    let service = harvest_service(
        db.clone(),
        transport,
        RecordingIndex::failing(),
        HarvestConfig::default(),
    );

    let report = service
        .run_journal(journal.id, HarvestOptions::default())
        .await
        .unwrap();

    assert_eq!(report.status, HarvestStatus::Success);
    assert_eq!(report.record_count, 2);
    let run = HarvestRepository::find_by_id(&db, report.run_id).await.unwrap().unwrap();
    assert_eq!(run.status, "success");
    assert!(
        run.error_message.contains("Search index update failed"),
        "{}",
        run.error_message
    );
}

#[tokio::test]
async fn test_harvest_all_isolates_failing_journals() {
    let db = setup_db().await;
    let good = add_journal(&db, "Agro Journal", AGRO).await;
    let broken_url = "https://broken.example.org/oai";
    let broken = add_journal(&db, "Broken Journal", broken_url).await;
    add_journal(&db, "Print Only", "").await;

    let transport = ScriptedTransport::new();
    transport.script(AGRO, vec![Step::Page(three_record_feed())]);
    transport.script(
        broken_url,
        vec![Step::Page("<html>maintenance</html>".to_string())],
    );
    let service = harvest_service(
        db.clone(),
        transport,
        RecordingIndex::new(),
        HarvestConfig {
            concurrency: 2,
            ..Default::default()
        },
    );

    let mut results = service.harvest_all(HarvestOptions::default()).await.unwrap();
    results.sort_by(|a, b| a.0.cmp(&b.0));

    assert_eq!(results.len(), 2);
    let (slug, agro) = &results[0];
    assert_eq!(slug, "agro-journal");
    assert_eq!(agro.as_ref().unwrap().status, HarvestStatus::Success);
    let (slug, broken_report) = &results[1];
    assert_eq!(slug, "broken-journal");
    assert_eq!(broken_report.as_ref().unwrap().status, HarvestStatus::Failed);

    let (rows, total) = HarvestRepository::list(
        &db,
        &HarvestLogFilter {
            journal_slug: Some("broken-journal".into()),
            status: Some(HarvestStatus::Failed),
        },
        1,
        25,
    )
    .await
    .unwrap();
    assert_eq!(total, 1);
    assert_eq!(rows[0].journal_id, broken.id);
    assert_eq!(rows[0].journal_name, "Broken Journal");
    assert!(rows[0].error_message.contains("Protocol"), "{}", rows[0].error_message);

    let refreshed = JournalRepository::find_by_id(&db, good.id).await.unwrap().unwrap();
    assert!(refreshed.last_harvested_at.is_some());
}

#[tokio::test]
async fn test_stored_metadata_matches_mapped_view() {
    let db = setup_db().await;
    let journal = add_journal(&db, "Agro Journal", AGRO).await;
    let xml = list_records(
        &[record_xml(
            "oai:agro:7",
            "2024-01-10",
            &[
                ("title", "Cover crops"),
                ("creator", "Doe, Jane"),
                ("creator", "Roe, Rick"),
                ("subject", "soil"),
                ("date", "2021-05"),
            ],
        )],
        None,
    );
    let transport = ScriptedTransport::new();
    transport.script(AGRO, vec![Step::Page(xml.clone())]);
    let service = harvest_service(db.clone(), transport, RecordingIndex::new(), HarvestConfig::default());
    service.run_journal(journal.id, HarvestOptions::default()).await.unwrap();

    let page = parse_list_records(&xml).unwrap();
    let Mapped::Record(mapped) = map_record(&page.records[0]).unwrap() else {
        panic!("record should map");
    };
    let publication = PublicationRepository::find_by_oai_key(&db, journal.id, "oai:agro:7")
        .await
        .unwrap()
        .unwrap();
    let stored: Vec<(String, Option<String>, String)> =
        PublicationRepository::metadata_for(&db, publication.id)
            .await
            .unwrap()
            .into_iter()
            .map(|m| {
                let qualifier = (!m.qualifier.is_empty()).then_some(m.qualifier);
                (m.element, qualifier, m.value)
            })
            .collect();

    assert_eq!(stored, dc_view(&mapped.metadata));
    assert_eq!(publication.issued_year, Some(2021));
}
