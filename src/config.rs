// =============================================================================
// config.rs — KNOBS, DIALS AND DATABASE CREDENTIALS
// =============================================================================
//
// Two kinds of configuration live here, and they are loaded differently on
// purpose:
//
// 1. Engine knobs (`Config`): base URL, timeouts, concurrency, schedule
//    times, backend choice. Read once at startup from DSE_SCRAPER_*
//    environment variables, with defaults that work out of the box.
//
// 2. Database credentials (`SettingsProvider`): DB_SERVER, DB_NAME,
//    DB_USERNAME, DB_PASSWORD. Read fresh every time a connection is opened,
//    so editing the .env file takes effect on the next run without a
//    restart. Missing values are a ConfigError for that run, not a crash.
// =============================================================================

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, warn};

use crate::error::ConfigError;

/// The browser identity every request goes out with. The exchange serves a
/// stripped-down page to anything that looks like a bot.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

/// The data domains this engine knows how to scrape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScrapeDomain {
    CompanyListing,
    SectorListing,
    SectorCompanies,
    ShareHolding,
    PeRatio,
}

impl ScrapeDomain {
    pub const ALL: [ScrapeDomain; 5] = [
        ScrapeDomain::CompanyListing,
        ScrapeDomain::SectorListing,
        ScrapeDomain::SectorCompanies,
        ScrapeDomain::ShareHolding,
        ScrapeDomain::PeRatio,
    ];

    /// Short machine name, used in env var names, logs and metrics.
    pub fn key(&self) -> &'static str {
        match self {
            ScrapeDomain::CompanyListing => "company_listing",
            ScrapeDomain::SectorListing => "sector_listing",
            ScrapeDomain::SectorCompanies => "sector_companies",
            ScrapeDomain::ShareHolding => "share_holding",
            ScrapeDomain::PeRatio => "pe_ratio",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        let key = key.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|d| d.key() == key)
    }
}

impl fmt::Display for ScrapeDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Which storage backend the daemon wires up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// The real thing.
    Postgres,
    /// In-process tables. Nothing survives a restart; handy for dry runs.
    Memory,
}

/// Every tunable parameter of the engine.
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // SOURCE SITE
    // =========================================================================

    /// Root of the exchange's public site. Every page URL is joined onto it.
    /// Default: https://www.dsebd.org
    pub base_url: String,

    /// User-Agent header sent with every request.
    pub user_agent: String,

    /// Timeout for whole-page sources (listings, PE table). Default: 30 s.
    pub page_timeout: Duration,

    /// Timeout for per-unit sources (one sector, one company). Default: 10 s.
    pub unit_timeout: Duration,

    /// Maximum in-flight unit fetches per run. Default: 10.
    pub fetch_concurrency: usize,

    // =========================================================================
    // SCHEDULING
    // =========================================================================

    /// Domains that get an engine at all. Default: all of them.
    pub enabled_domains: Vec<ScrapeDomain>,

    /// Daily "HH:MM" trigger per domain. A domain without an entry is only
    /// run manually (or at startup). Default: every domain at 15:00.
    pub schedule_times: HashMap<ScrapeDomain, String>,

    /// How often the scheduler checks the wall clock. Default: 1 s.
    pub scheduler_poll_interval: Duration,

    /// Kick off every enabled engine once at startup. Default: false.
    pub run_on_start: bool,

    // =========================================================================
    // STORAGE
    // =========================================================================

    pub storage_backend: StorageBackend,

    /// Path of the dotenv file holding the DB_* credentials.
    pub settings_file: PathBuf,

    /// Issue CREATE TABLE IF NOT EXISTS for every destination at startup.
    pub create_tables: bool,

    // =========================================================================
    // CIRCUIT BREAKER PARAMETERS
    // Because the exchange's site goes down right when the market closes.
    // =========================================================================

    /// Consecutive failures before an adapter's breaker trips. Default: 5.
    pub circuit_breaker_failure_threshold: u32,

    /// How long a tripped breaker stays open. Default: 60 s.
    pub circuit_breaker_reset_timeout: Duration,

    /// Half-open successes needed to close again. Default: 2.
    pub circuit_breaker_success_threshold: u32,

    // =========================================================================
    // METRICS SERVER
    // =========================================================================

    /// Port for the JSON metrics endpoint. 0 disables it. Default: 9090.
    pub metrics_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            base_url: "https://www.dsebd.org".to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            page_timeout: Duration::from_secs(30),
            unit_timeout: Duration::from_secs(10),
            fetch_concurrency: 10,
            enabled_domains: ScrapeDomain::ALL.to_vec(),
            schedule_times: ScrapeDomain::ALL
                .into_iter()
                .map(|d| (d, "15:00".to_string()))
                .collect(),
            scheduler_poll_interval: Duration::from_secs(1),
            run_on_start: false,
            storage_backend: StorageBackend::Postgres,
            settings_file: PathBuf::from(".env"),
            create_tables: false,
            circuit_breaker_failure_threshold: 5,
            circuit_breaker_reset_timeout: Duration::from_secs(60),
            circuit_breaker_success_threshold: 2,
            metrics_port: 9090,
        }
    }
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// Every parameter can be overridden via a variable prefixed with
    /// `DSE_SCRAPER_`. Per-domain schedules use
    /// `DSE_SCRAPER_SCHEDULE_<DOMAIN>` (e.g. `DSE_SCRAPER_SCHEDULE_PE_RATIO`);
    /// an empty value disables that domain's schedule.
    pub fn from_env() -> Self {
        // Missing .env is fine; the defaults carry us.
        let _ = dotenvy::dotenv();

        let defaults = Config::default();

        let enabled_domains = match env::var("DSE_SCRAPER_DOMAINS") {
            Ok(list) => parse_domain_list(&list),
            Err(_) => defaults.enabled_domains.clone(),
        };

        let default_time = env_or_default("DSE_SCRAPER_SCHEDULE_TIME", "15:00");
        let schedule_times = ScrapeDomain::ALL
            .into_iter()
            .filter_map(|domain| {
                let key = format!("DSE_SCRAPER_SCHEDULE_{}", domain.key().to_ascii_uppercase());
                let time = env_or_default(&key, &default_time);
                let time = time.trim();
                (!time.is_empty()).then(|| (domain, time.to_string()))
            })
            .collect();

        let storage_backend = match env_or_default("DSE_SCRAPER_STORAGE", "postgres")
            .to_ascii_lowercase()
            .as_str()
        {
            "memory" => StorageBackend::Memory,
            "postgres" | "postgresql" => StorageBackend::Postgres,
            other => {
                warn!(backend = other, "Unknown storage backend, falling back to postgres");
                StorageBackend::Postgres
            }
        };

        Config {
            base_url: env_or_default("DSE_SCRAPER_BASE_URL", &defaults.base_url),
            user_agent: env_or_default("DSE_SCRAPER_USER_AGENT", DEFAULT_USER_AGENT),
            page_timeout: Duration::from_secs(
                env_or_default("DSE_SCRAPER_PAGE_TIMEOUT_SECS", "30").parse().unwrap_or(30),
            ),
            unit_timeout: Duration::from_secs(
                env_or_default("DSE_SCRAPER_UNIT_TIMEOUT_SECS", "10").parse().unwrap_or(10),
            ),
            fetch_concurrency: env_or_default("DSE_SCRAPER_FETCH_CONCURRENCY", "10")
                .parse::<usize>()
                .unwrap_or(10)
                .max(1),

            enabled_domains,
            schedule_times,
            scheduler_poll_interval: Duration::from_millis(
                env_or_default("DSE_SCRAPER_SCHEDULER_POLL_MS", "1000")
                    .parse::<u64>()
                    .unwrap_or(1000)
                    .max(10),
            ),
            run_on_start: parse_flag(&env_or_default("DSE_SCRAPER_RUN_ON_START", "false")),

            storage_backend,
            settings_file: PathBuf::from(env_or_default("DSE_SCRAPER_SETTINGS_FILE", ".env")),
            create_tables: parse_flag(&env_or_default("DSE_SCRAPER_CREATE_TABLES", "false")),

            circuit_breaker_failure_threshold: env_or_default(
                "DSE_SCRAPER_CB_FAILURE_THRESHOLD", "5"
            ).parse().unwrap_or(5),
            circuit_breaker_reset_timeout: Duration::from_secs(
                env_or_default("DSE_SCRAPER_CB_RESET_TIMEOUT_SECS", "60").parse().unwrap_or(60),
            ),
            circuit_breaker_success_threshold: env_or_default(
                "DSE_SCRAPER_CB_SUCCESS_THRESHOLD", "2"
            ).parse().unwrap_or(2),

            metrics_port: env_or_default("DSE_SCRAPER_METRICS_PORT", "9090")
                .parse()
                .unwrap_or(9090),
        }
    }

    pub fn is_enabled(&self, domain: ScrapeDomain) -> bool {
        self.enabled_domains.contains(&domain)
    }

    pub fn schedule_for(&self, domain: ScrapeDomain) -> Option<&str> {
        self.schedule_times.get(&domain).map(String::as_str)
    }
}

/// Helper function to read an environment variable with a default fallback.
fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_domain_list(list: &str) -> Vec<ScrapeDomain> {
    list.split(',')
        .filter(|s| !s.trim().is_empty())
        .filter_map(|s| {
            let domain = ScrapeDomain::from_key(s);
            if domain.is_none() {
                warn!(domain = s.trim(), "Ignoring unknown scrape domain");
            }
            domain
        })
        .collect()
}

// =============================================================================
// DATABASE CREDENTIALS
// =============================================================================

pub const DB_SERVER: &str = "DB_SERVER";
pub const DB_NAME: &str = "DB_NAME";
pub const DB_USERNAME: &str = "DB_USERNAME";
pub const DB_PASSWORD: &str = "DB_PASSWORD";

const REQUIRED_KEYS: [&str; 4] = [DB_SERVER, DB_NAME, DB_USERNAME, DB_PASSWORD];

const SETTINGS_TEMPLATE: &str = "\
DB_SERVER=your_server_name
DB_NAME=your_database_name
DB_USERNAME=your_username
DB_PASSWORD=your_password
";

/// Everything needed to open a database connection.
#[derive(Clone, PartialEq, Eq)]
pub struct DbSettings {
    /// Host, optionally with a port as `host:port` or `host,port`.
    pub server: String,
    pub database: String,
    pub username: String,
    pub password: String,
}

impl DbSettings {
    /// Build settings from a key lookup, reporting every missing key at once.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut values: HashMap<&'static str, String> = HashMap::new();
        let mut missing = Vec::new();

        for key in REQUIRED_KEYS {
            match lookup(key).map(|v| v.trim().to_string()) {
                Some(value) if !value.is_empty() => {
                    values.insert(key, value);
                }
                _ => missing.push(key),
            }
        }

        if !missing.is_empty() {
            return Err(ConfigError::MissingParameters(missing));
        }

        let mut take = |key: &str| values.remove(key).unwrap_or_default();
        Ok(DbSettings {
            server: take(DB_SERVER),
            database: take(DB_NAME),
            username: take(DB_USERNAME),
            password: take(DB_PASSWORD),
        })
    }

    /// Split the server into host and optional port. Accepts `host`,
    /// `host:port` and `host,port`.
    pub fn host_and_port(&self) -> (&str, Option<u16>) {
        let server = self.server.trim();
        for separator in [',', ':'] {
            if let Some((host, port)) = server.rsplit_once(separator) {
                if let Ok(port) = port.trim().parse() {
                    return (host.trim(), Some(port));
                }
            }
        }
        (server, None)
    }
}

impl fmt::Debug for DbSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbSettings")
            .field("server", &self.server)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"********")
            .finish()
    }
}

/// Source of database credentials. Called once per connection.
pub trait SettingsProvider: Send + Sync {
    fn db_settings(&self) -> Result<DbSettings, ConfigError>;
}

/// Reads credentials from a dotenv file without touching the process
/// environment. The file is re-read on every call and wins over process
/// variables, which only fill in keys the file does not set.
#[derive(Debug, Clone)]
pub struct EnvFileSettings {
    path: PathBuf,
}

impl EnvFileSettings {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a template settings file if none exists. Returns true when a
    /// template was written.
    pub fn ensure_template(&self) -> Result<bool, ConfigError> {
        if self.path.exists() {
            return Ok(false);
        }

        std::fs::write(&self.path, SETTINGS_TEMPLATE).map_err(|e| ConfigError::SettingsFile {
            path: self.path.display().to_string(),
            message: e.to_string(),
        })?;

        info!(
            path = %self.path.display(),
            "Created settings template, fill in the DB_* values before the first run"
        );
        Ok(true)
    }

    fn read_file(&self) -> Result<HashMap<String, String>, ConfigError> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }

        let to_error = |message: String| ConfigError::SettingsFile {
            path: self.path.display().to_string(),
            message,
        };

        let iter = dotenvy::from_path_iter(&self.path).map_err(|e| to_error(e.to_string()))?;
        iter.map(|item| item.map_err(|e| to_error(e.to_string())))
            .collect()
    }
}

impl SettingsProvider for EnvFileSettings {
    fn db_settings(&self) -> Result<DbSettings, ConfigError> {
        let file = self.read_file()?;
        DbSettings::from_lookup(|key| file.get(key).cloned().or_else(|| env::var(key).ok()))
    }
}

/// Fixed credentials, for tests and for embedding the engine in another
/// program that already has its own configuration story.
#[derive(Debug, Clone)]
pub struct StaticSettings(pub Result<DbSettings, Vec<&'static str>>);

impl SettingsProvider for StaticSettings {
    fn db_settings(&self) -> Result<DbSettings, ConfigError> {
        self.0.clone().map_err(ConfigError::MissingParameters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.base_url, "https://www.dsebd.org");
        assert_eq!(config.fetch_concurrency, 10);
        assert_eq!(config.page_timeout, Duration::from_secs(30));
        assert_eq!(config.unit_timeout, Duration::from_secs(10));
        assert_eq!(config.schedule_for(ScrapeDomain::PeRatio), Some("15:00"));
        assert!(config.is_enabled(ScrapeDomain::ShareHolding));
    }

    #[test]
    fn test_domain_list_parsing() {
        let domains = parse_domain_list("pe_ratio, SHARE_HOLDING,bogus,,");
        assert_eq!(domains, vec![ScrapeDomain::PeRatio, ScrapeDomain::ShareHolding]);
    }

    #[test]
    fn test_missing_parameters_are_all_reported() {
        let err = DbSettings::from_lookup(lookup(&[("DB_SERVER", "db"), ("DB_NAME", " ")]))
            .unwrap_err();
        match err {
            ConfigError::MissingParameters(keys) => {
                assert_eq!(keys, vec![DB_NAME, DB_USERNAME, DB_PASSWORD]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_host_and_port_variants() {
        let mut settings = DbSettings::from_lookup(lookup(&[
            ("DB_SERVER", "db.local,5433"),
            ("DB_NAME", "dse"),
            ("DB_USERNAME", "scraper"),
            ("DB_PASSWORD", "secret"),
        ]))
        .unwrap();
        assert_eq!(settings.host_and_port(), ("db.local", Some(5433)));

        settings.server = "db.local:5432".into();
        assert_eq!(settings.host_and_port(), ("db.local", Some(5432)));

        settings.server = "db.local".into();
        assert_eq!(settings.host_and_port(), ("db.local", None));
    }

    #[test]
    fn test_debug_redacts_password() {
        let settings = DbSettings {
            server: "db".into(),
            database: "dse".into(),
            username: "scraper".into(),
            password: "hunter2".into(),
        };
        let rendered = format!("{settings:?}");
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_env_file_template_and_read() {
        let dir = std::env::temp_dir().join(format!("dse-settings-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(".env");

        let provider = EnvFileSettings::new(&path);
        assert!(provider.ensure_template().unwrap());
        assert!(!provider.ensure_template().unwrap());

        std::fs::write(
            &path,
            "DB_SERVER=file-host\nDB_NAME=file-db\nDB_USERNAME=file-user\nDB_PASSWORD=file-pass\n",
        )
        .unwrap();
        let file = provider.read_file().unwrap();
        assert_eq!(file.get("DB_NAME").map(String::as_str), Some("file-db"));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
