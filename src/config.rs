use std::str::FromStr;
use std::time::Duration;

/// Database connection pool configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://journals.db?mode=rwc".to_string(),
            max_connections: 10,
        }
    }
}

impl DbConfig {
    pub fn is_in_memory(&self) -> bool {
        self.url.contains(":memory:")
    }
}

/// HTTP configuration for calls to OAI sources.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub oai_timeout: Duration,
    pub validate_timeout: Duration,
    pub proxy: Option<String>,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            oai_timeout: Duration::from_secs(60),
            validate_timeout: Duration::from_secs(30),
            proxy: None,
            user_agent: format!("journal-harvester/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Harvest run configuration.
#[derive(Debug, Clone)]
pub struct HarvestConfig {
    /// Per-record failures tolerated before a run is failed.
    pub error_budget: usize,
    /// Journals harvested in parallel by `harvest_all`.
    pub concurrency: usize,
    /// Records between record_count flushes to the run row.
    pub progress_every: usize,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            error_budget: 10,
            concurrency: 4,
            progress_every: 25,
        }
    }
}

/// External search index configuration.
#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub url: String,
    pub index: String,
    pub timeout: Duration,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9200".to_string(),
            index: "publications".to_string(),
            timeout: Duration::from_secs(5),
            username: None,
            password: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub db: DbConfig,
    pub http: HttpConfig,
    pub harvest: HarvestConfig,
    pub search: SearchConfig,
}

impl AppConfig {
    /// Reads configuration from the process environment (after `.env` is loaded).
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let mut config = AppConfig::default();

        if let Some(url) = get("DATABASE_URL") {
            config.db.url = url;
        }
        config.db.max_connections = parse_or(get("DB_MAX_CONNECTIONS"), config.db.max_connections);

        config.http.oai_timeout = Duration::from_secs(parse_or(
            get("OAI_TIMEOUT_SECS"),
            config.http.oai_timeout.as_secs(),
        ));
        config.http.validate_timeout = Duration::from_secs(parse_or(
            get("OAI_VALIDATE_TIMEOUT_SECS"),
            config.http.validate_timeout.as_secs(),
        ));
        config.http.proxy = get("HARVEST_PROXY");

        config.harvest.error_budget =
            parse_or(get("HARVEST_ERROR_BUDGET"), config.harvest.error_budget);
        config.harvest.concurrency =
            parse_or(get("HARVEST_CONCURRENCY"), config.harvest.concurrency).max(1);
        config.harvest.progress_every =
            parse_or(get("HARVEST_PROGRESS_EVERY"), config.harvest.progress_every).max(1);

        if let Some(url) = get("SEARCH_URL") {
            config.search.url = url;
        }
        if let Some(index) = get("SEARCH_INDEX") {
            config.search.index = index;
        }
        config.search.timeout = Duration::from_secs(parse_or(
            get("SEARCH_TIMEOUT_SECS"),
            config.search.timeout.as_secs(),
        ));
        config.search.username = get("SEARCH_USERNAME");
        config.search.password = get("SEARCH_PASSWORD");

        config
    }
}

fn parse_or<T: FromStr>(raw: Option<String>, default: T) -> T {
    raw.and_then(|v| v.parse().ok()).unwrap_or(default)
}
