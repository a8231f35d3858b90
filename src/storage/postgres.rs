// =============================================================================
// storage/postgres.rs — THE REAL DATABASE
// =============================================================================
//
// A PostgreSQL backend on a single sqlx `PgConnection` per session.
//
// Connecting walks an ordered list of strategies (TLS required, TLS
// preferred, plaintext) and keeps the first one that works. Only when every
// strategy has failed does the caller get an error, and that error lists
// each attempt so the operator can see which one came closest.
//
// Transactions are explicit BEGIN / COMMIT / ROLLBACK on the session's
// connection. Inserts are multi-row `INSERT ... VALUES (...), (...)` built
// with `QueryBuilder`, every value a typed bind, every identifier quoted.
// =============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgSslMode};
use sqlx::{Connection, Executor, Postgres, QueryBuilder, Row};
use tracing::{debug, info, warn};

use super::{StoragePort, StorageSession};
use crate::config::{DbSettings, SettingsProvider};
use crate::error::{ConfigError, StorageError, StorageStage};
use crate::models::{Field, InsertSpec, RawRecord, ScrapeUnit, UnitQuery};

/// PostgreSQL's hard limit on bind parameters in one statement.
pub const PG_MAX_PARAMS: usize = 65_535;

/// One way of opening a connection. Tried in order until one succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStrategy {
    TlsRequired,
    TlsPreferred,
    Plaintext,
}

impl ConnectStrategy {
    pub const DEFAULT_ORDER: [ConnectStrategy; 3] = [
        ConnectStrategy::TlsRequired,
        ConnectStrategy::TlsPreferred,
        ConnectStrategy::Plaintext,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            ConnectStrategy::TlsRequired => "tls-required",
            ConnectStrategy::TlsPreferred => "tls-preferred",
            ConnectStrategy::Plaintext => "plaintext",
        }
    }

    fn ssl_mode(&self) -> PgSslMode {
        match self {
            ConnectStrategy::TlsRequired => PgSslMode::Require,
            ConnectStrategy::TlsPreferred => PgSslMode::Prefer,
            ConnectStrategy::Plaintext => PgSslMode::Disable,
        }
    }
}

impl fmt::Display for ConnectStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

pub struct PostgresStorage {
    settings: Arc<dyn SettingsProvider>,
    strategies: Vec<ConnectStrategy>,
    connect_timeout: Duration,
}

impl PostgresStorage {
    pub fn new(settings: Arc<dyn SettingsProvider>) -> Self {
        Self {
            settings,
            strategies: ConnectStrategy::DEFAULT_ORDER.to_vec(),
            connect_timeout: Duration::from_secs(15),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn options(settings: &DbSettings, strategy: ConnectStrategy) -> PgConnectOptions {
        let (host, port) = settings.host_and_port();
        let options = PgConnectOptions::new()
            .host(host)
            .database(&settings.database)
            .username(&settings.username)
            .password(&settings.password)
            .ssl_mode(strategy.ssl_mode())
            .application_name("dse_scrape_engine");

        match port {
            Some(port) => options.port(port),
            None => options,
        }
    }
}

#[async_trait]
impl StoragePort for PostgresStorage {
    async fn connect(&self) -> Result<Box<dyn StorageSession>, StorageError> {
        let settings = self.settings.db_settings()?;
        let mut attempts = Vec::with_capacity(self.strategies.len());

        for strategy in &self.strategies {
            let options = Self::options(&settings, *strategy);
            match tokio::time::timeout(self.connect_timeout, PgConnection::connect_with(&options)).await {
                Ok(Ok(conn)) => {
                    info!(
                        server = %settings.server,
                        database = %settings.database,
                        strategy = %strategy,
                        "Connected to PostgreSQL"
                    );
                    return Ok(Box::new(PostgresSession {
                        conn: Some(conn),
                        strategy: *strategy,
                    }));
                }
                Ok(Err(e)) => {
                    warn!(strategy = %strategy, error = %e, "Connection strategy failed");
                    attempts.push(format!("{strategy}: {e}"));
                }
                Err(_) => {
                    warn!(strategy = %strategy, "Connection strategy timed out");
                    attempts.push(format!(
                        "{strategy}: timed out after {}s",
                        self.connect_timeout.as_secs()
                    ));
                }
            }
        }

        Err(ConfigError::NoConnectionStrategy { attempts }.into())
    }
}

struct PostgresSession {
    /// `None` once closed.
    conn: Option<PgConnection>,
    strategy: ConnectStrategy,
}

impl PostgresSession {
    fn conn(&mut self, stage: StorageStage) -> Result<&mut PgConnection, StorageError> {
        self.conn
            .as_mut()
            .ok_or_else(|| StorageError::statement(stage, "connection already closed"))
    }

    async fn simple(&mut self, stage: StorageStage, sql: &str) -> Result<(), StorageError> {
        let conn = self.conn(stage)?;
        conn.execute(sqlx::raw_sql(sql))
            .await
            .map_err(|e| StorageError::statement(stage, e))?;
        Ok(())
    }
}

#[async_trait]
impl StorageSession for PostgresSession {
    fn label(&self) -> &str {
        self.strategy.label()
    }

    fn max_params_per_statement(&self) -> usize {
        PG_MAX_PARAMS
    }

    async fn begin(&mut self) -> Result<(), StorageError> {
        self.simple(StorageStage::Begin, "BEGIN").await
    }

    async fn delete_all(&mut self, table: &str) -> Result<u64, StorageError> {
        let sql = format!("DELETE FROM {}", quote_ident(table));
        let conn = self.conn(StorageStage::Delete)?;
        let result = sqlx::query(&sql)
            .execute(conn)
            .await
            .map_err(|e| StorageError::statement(StorageStage::Delete, e))?;
        Ok(result.rows_affected())
    }

    async fn insert_rows(&mut self, spec: &InsertSpec, rows: &[RawRecord]) -> Result<u64, StorageError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(insert_prefix(spec));
        builder.push_values(rows, |mut values, row| {
            for field in row.fields() {
                match field {
                    Field::Text(v) => values.push_bind(v.clone()),
                    Field::Int(v) => values.push_bind(*v),
                    Field::Float(v) => values.push_bind(*v),
                    Field::Timestamp(v) => values.push_bind(*v),
                };
            }
        });

        let conn = self.conn(StorageStage::Insert)?;
        let result = builder
            .build()
            .execute(conn)
            .await
            .map_err(|e| StorageError::statement(StorageStage::Insert, e))?;

        debug!(table = spec.table, rows = rows.len(), "Inserted chunk");
        Ok(result.rows_affected())
    }

    async fn commit(&mut self) -> Result<(), StorageError> {
        self.simple(StorageStage::Commit, "COMMIT").await
    }

    async fn rollback(&mut self) -> Result<(), StorageError> {
        self.simple(StorageStage::Rollback, "ROLLBACK").await
    }

    async fn fetch_units(&mut self, query: &UnitQuery) -> Result<Vec<ScrapeUnit>, StorageError> {
        let sql = unit_query_sql(query);
        let conn = self.conn(StorageStage::Query)?;
        let rows = sqlx::query(&sql)
            .fetch_all(conn)
            .await
            .map_err(|e| StorageError::statement(StorageStage::Query, e))?;

        let mut units = Vec::with_capacity(rows.len());
        for row in rows {
            let value: Option<String> = row
                .try_get("unit")
                .map_err(|e| StorageError::statement(StorageStage::Query, e))?;
            if let Some(value) = value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
                units.push(ScrapeUnit::new(value));
            }
        }
        Ok(units)
    }

    async fn create_table(&mut self, spec: &InsertSpec) -> Result<(), StorageError> {
        let sql = create_table_sql(spec);
        let conn = self.conn(StorageStage::Schema)?;
        sqlx::query(&sql)
            .execute(conn)
            .await
            .map_err(|e| StorageError::statement(StorageStage::Schema, e))?;
        info!(table = spec.table, "Ensured table exists");
        Ok(())
    }

    async fn close(&mut self) -> Result<(), StorageError> {
        match self.conn.take() {
            Some(conn) => conn
                .close()
                .await
                .map_err(|e| StorageError::statement(StorageStage::Close, e)),
            None => Ok(()),
        }
    }
}

/// Double-quote an identifier, doubling any embedded quotes. Table names
/// keep their mixed case this way (`"Company_Information"`).
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn column_list(spec: &InsertSpec) -> String {
    spec.columns
        .iter()
        .map(|c| quote_ident(c.name))
        .collect::<Vec<_>>()
        .join(", ")
}

fn insert_prefix(spec: &InsertSpec) -> String {
    format!("INSERT INTO {} ({}) ", quote_ident(spec.table), column_list(spec))
}

fn create_table_sql(spec: &InsertSpec) -> String {
    let columns = spec
        .columns
        .iter()
        .map(|c| format!("{} {}", quote_ident(c.name), c.kind.sql_type()))
        .collect::<Vec<_>>()
        .join(", ");
    format!("CREATE TABLE IF NOT EXISTS {} ({})", quote_ident(spec.table), columns)
}

fn unit_query_sql(query: &UnitQuery) -> String {
    let column = quote_ident(query.column);
    let table = quote_ident(query.table);
    match query.order_by_latest {
        Some(order) => format!(
            "SELECT {column}::text AS unit FROM {table} GROUP BY {column} ORDER BY MAX({}) ASC",
            quote_ident(order)
        ),
        None => format!("SELECT DISTINCT {column}::text AS unit FROM {table}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticSettings;
    use crate::models::{Column, FieldKind};

    const SHARES: InsertSpec = InsertSpec {
        table: "Symbol_Share",
        columns: &[
            Column::new("company", FieldKind::Text),
            Column::new("total_share", FieldKind::Int),
            Column::new("Sponsor", FieldKind::Float),
            Column::new("scraping_date", FieldKind::Timestamp),
        ],
    };

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("pe_data"), "\"pe_data\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_insert_prefix() {
        assert_eq!(
            insert_prefix(&SHARES),
            "INSERT INTO \"Symbol_Share\" (\"company\", \"total_share\", \"Sponsor\", \"scraping_date\") "
        );
    }

    #[test]
    fn test_create_table_sql_uses_column_kinds() {
        assert_eq!(
            create_table_sql(&SHARES),
            "CREATE TABLE IF NOT EXISTS \"Symbol_Share\" (\"company\" TEXT, \"total_share\" BIGINT, \
             \"Sponsor\" DOUBLE PRECISION, \"scraping_date\" TIMESTAMP)"
        );
    }

    #[test]
    fn test_unit_query_sql() {
        let sectors = UnitQuery {
            table: "Sector_Information",
            column: "sector_code",
            order_by_latest: Some("last_updated"),
        };
        assert_eq!(
            unit_query_sql(&sectors),
            "SELECT \"sector_code\"::text AS unit FROM \"Sector_Information\" \
             GROUP BY \"sector_code\" ORDER BY MAX(\"last_updated\") ASC"
        );

        let companies = UnitQuery {
            table: "Company_Information",
            column: "company_symbol",
            order_by_latest: None,
        };
        assert_eq!(
            unit_query_sql(&companies),
            "SELECT DISTINCT \"company_symbol\"::text AS unit FROM \"Company_Information\""
        );
    }

    #[tokio::test]
    async fn test_missing_settings_fail_before_any_attempt() {
        let storage = PostgresStorage::new(Arc::new(StaticSettings(Err(vec!["DB_SERVER"]))));
        let err = storage.connect().await.err().unwrap();
        assert!(matches!(
            err,
            StorageError::Configuration(ConfigError::MissingParameters(ref keys)) if keys == &vec!["DB_SERVER"]
        ));
    }

    #[tokio::test]
    async fn test_every_strategy_is_tried_before_giving_up() {
        let settings = DbSettings {
            server: "127.0.0.1:1".into(),
            database: "dse".into(),
            username: "scraper".into(),
            password: "secret".into(),
        };
        let storage = PostgresStorage::new(Arc::new(StaticSettings(Ok(settings))))
            .with_connect_timeout(Duration::from_secs(2));

        let err = storage.connect().await.err().unwrap();
        match err {
            StorageError::Configuration(ConfigError::NoConnectionStrategy { attempts }) => {
                assert_eq!(attempts.len(), 3);
                assert!(attempts[0].starts_with("tls-required"));
                assert!(attempts[2].starts_with("plaintext"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
