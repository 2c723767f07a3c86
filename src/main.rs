use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use dotenv::dotenv;
use journal_harvester::config::AppConfig;
use journal_harvester::harvest::{run_schedule, HarvestOptions, HarvestService, HarvestStatus};
use journal_harvester::oai::{build_http_client, OaiClient, ReqwestTransport};
use journal_harvester::search::{
    HttpSearchIndex, IndexSynchronizer, ListRequest, QueryPlanner, SearchIndex,
};
use journal_harvester::storage::establish_connection;
use journal_harvester::storage::repository::{
    HarvestLogFilter, HarvestRepository, JournalRepository,
};
use log::info;
use sea_orm::DatabaseConnection;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const LOG_PAGE_SIZE_DEFAULT: u64 = 25;
const LOG_PAGE_SIZE_MAX: u64 = 100;

#[derive(Parser)]
#[clap(
    name = "journal-harvester",
    version,
    about = "Harvest OAI-PMH journals, keep the search index in sync and query publications"
)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a journal
    AddJournal {
        #[clap(long)]
        name: String,
        #[clap(long)]
        oai_url: String,
    },
    /// Harvest one journal, or every harvestable journal when no slug is given
    Harvest {
        slug: Option<String>,
        /// Overrides the journal's last harvest date (YYYY-MM-DD or RFC 3339)
        #[clap(long)]
        from_date: Option<String>,
        /// Stop after this many records
        #[clap(long)]
        limit: Option<usize>,
    },
    /// Start a run, print its id, then wait for the result
    Trigger { slug: String },
    /// Harvest every journal periodically until interrupted
    Schedule {
        #[clap(long, default_value_t = 60)]
        every_minutes: u64,
    },
    /// Cancel a running harvest
    Cancel { run_id: i32 },
    /// List harvest runs, newest first
    Logs {
        #[clap(long)]
        journal: Option<String>,
        #[clap(long)]
        status: Option<String>,
        #[clap(long, default_value_t = 1)]
        page: u64,
        #[clap(long, default_value_t = LOG_PAGE_SIZE_DEFAULT)]
        page_size: u64,
    },
    /// Check that a URL answers OAI-PMH Identify
    Validate { url: String },
    /// Rebuild the search index from the database
    Reindex,
    /// Report the search cluster status
    SearchHealth,
    /// List or search publications
    Search {
        #[clap(flatten)]
        filters: FilterArgs,
        #[clap(long)]
        ordering: Option<String>,
        #[clap(long)]
        page: Option<u64>,
        #[clap(long)]
        page_size: Option<u64>,
    },
    /// Page through every value of one facet
    Facets {
        /// author, subject, journal or issued_year
        facet: String,
        #[clap(flatten)]
        filters: FilterArgs,
        #[clap(long)]
        page: Option<u64>,
        #[clap(long)]
        page_size: Option<u64>,
    },
}

#[derive(Args)]
struct FilterArgs {
    /// Free-text query
    #[clap(long, short)]
    q: Option<String>,
    #[clap(long)]
    journal: Option<String>,
    /// Comma-separated subjects
    #[clap(long)]
    subject: Option<String>,
    #[clap(long)]
    author: Vec<String>,
    #[clap(long)]
    issued_year: Vec<String>,
    #[clap(long)]
    issued_from: Option<String>,
    #[clap(long)]
    issued_to: Option<String>,
}

impl FilterArgs {
    fn into_request(self) -> ListRequest {
        ListRequest {
            search: self.q,
            journal: self.journal,
            subject: self.subject,
            author: self.author,
            issued_year: self.issued_year,
            issued_from: self.issued_from,
            issued_to: self.issued_to,
            ..Default::default()
        }
    }
}

struct AppContext {
    config: AppConfig,
    db: Arc<DatabaseConnection>,
    index: Arc<dyn SearchIndex>,
}

impl AppContext {
    fn oai_client(&self) -> Result<Arc<OaiClient>> {
        let http = build_http_client(self.config.http.proxy.as_deref())
            .context("building the OAI HTTP client")?;
        let transport = ReqwestTransport::new(http, self.config.http.user_agent.clone());
        Ok(Arc::new(OaiClient::new(
            Arc::new(transport),
            self.config.http.oai_timeout,
            self.config.http.validate_timeout,
        )))
    }

    fn synchronizer(&self) -> Arc<IndexSynchronizer> {
        Arc::new(IndexSynchronizer::new(self.db.clone(), self.index.clone()))
    }

    fn harvest_service(&self) -> Result<HarvestService> {
        Ok(HarvestService::new(
            self.db.clone(),
            self.oai_client()?,
            self.synchronizer(),
            self.config.harvest.clone(),
        ))
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_from_date(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|_| anyhow!("--from-date must be YYYY-MM-DD or RFC 3339, got '{}'", value))?;
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
        .ok_or_else(|| anyhow!("invalid --from-date '{}'", value))
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    dotenv().ok();
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Warn)
        .filter_module("journal_harvester", log::LevelFilter::Info)
        .filter_module("sqlx", log::LevelFilter::Error)
        .filter_module("sea_orm", log::LevelFilter::Error)
        .parse_default_env()
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_env();
    let db = Arc::new(
        establish_connection(&config.db)
            .await
            .with_context(|| format!("connecting to {}", config.db.url))?,
    );
    let index: Arc<dyn SearchIndex> = Arc::new(HttpSearchIndex::new(&config.search)?);
    let ctx = AppContext { config, db, index };

    run(cli.command, &ctx).await
}

async fn run(command: Commands, ctx: &AppContext) -> Result<()> {
    match command {
        Commands::AddJournal { name, oai_url } => {
            let journal = JournalRepository::create(&ctx.db, &name, &oai_url).await?;
            print_json(&journal)
        }
        Commands::Harvest {
            slug,
            from_date,
            limit,
        } => {
            let options = HarvestOptions {
                from_date: from_date.as_deref().map(parse_from_date).transpose()?,
                limit,
            };
            let service = ctx.harvest_service()?;
            match slug {
                Some(slug) => {
                    let journal = service.resolve_journal(&slug).await?;
                    let report = service.run_journal(journal.id, options).await?;
                    print_json(&report)
                }
                None => {
                    let results = service.harvest_all(options).await?;
                    let rows: Vec<serde_json::Value> = results
                        .into_iter()
                        .map(|(slug, result)| match result {
                            Ok(report) => serde_json::json!({ "journal": slug, "report": report }),
                            Err(e) => serde_json::json!({ "journal": slug, "error": e.to_string() }),
                        })
                        .collect();
                    print_json(&rows)
                }
            }
        }
        Commands::Trigger { slug } => {
            let service = ctx.harvest_service()?;
            let journal = service.resolve_journal(&slug).await?;
            let (run_id, handle) = service
                .trigger(journal.id, HarvestOptions::default())
                .await?;
            print_json(&serde_json::json!({ "run_id": run_id }))?;
            let report = handle.await.context("harvest task panicked")?;
            print_json(&report)
        }
        Commands::Schedule { every_minutes } => {
            let service = ctx.harvest_service()?;
            service.recover_stale().await?;
            let shutdown = CancellationToken::new();
            let signal = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Interrupt received, stopping after the current pass.");
                }
                signal.cancel();
            });
            run_schedule(
                service,
                Duration::from_secs(every_minutes.max(1) * 60),
                shutdown,
            )
            .await;
            Ok(())
        }
        Commands::Cancel { run_id } => {
            let outcome = ctx.harvest_service()?.cancel(run_id).await?;
            println!("{:?}", outcome);
            Ok(())
        }
        Commands::Logs {
            journal,
            status,
            page,
            page_size,
        } => {
            let status = status
                .as_deref()
                .map(str::parse::<HarvestStatus>)
                .transpose()
                .map_err(|e| anyhow!(e))?;
            let filter = HarvestLogFilter {
                journal_slug: journal,
                status,
            };
            let page_size = page_size.clamp(1, LOG_PAGE_SIZE_MAX);
            let (rows, count) =
                HarvestRepository::list(&ctx.db, &filter, page.max(1), page_size).await?;
            print_json(&serde_json::json!({
                "count": count,
                "page": page.max(1),
                "page_size": page_size,
                "results": rows,
            }))
        }
        Commands::Validate { url } => {
            let report = ctx.oai_client()?.validate_endpoint(&url).await;
            print_json(&report)
        }
        Commands::Reindex => {
            let report = ctx.synchronizer().rebuild().await?;
            print_json(&report)
        }
        Commands::SearchHealth => {
            let health = ctx.index.health().await?;
            print_json(&health)
        }
        Commands::Search {
            filters,
            ordering,
            page,
            page_size,
        } => {
            let request = ListRequest {
                ordering,
                page,
                page_size,
                ..filters.into_request()
            };
            let envelope = QueryPlanner::new(ctx.db.clone(), ctx.index.clone())
                .list(&request)
                .await?;
            print_json(&envelope)
        }
        Commands::Facets {
            facet,
            filters,
            page,
            page_size,
        } => {
            let request = filters.into_request();
            let facet_page = QueryPlanner::new(ctx.db.clone(), ctx.index.clone())
                .facet_page(&facet, &request, page, page_size)
                .await?;
            print_json(&facet_page)
        }
    }
}
