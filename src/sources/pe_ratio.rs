// =============================================================================
// sources/pe_ratio.rs — THE DAILY PRICE/EARNINGS TABLE
// =============================================================================
//
// `latest_PE.php` is a single wide table (class `shares-table`): one header
// row of `th`, then one `td` row per instrument. Columns are located by
// header text rather than by position, so a reordered table still lands in
// the right place. Rows whose cell count does not match the header are
// skipped (they are the table's own sub-headings and footers).
//
// The whole page is one unit, and the rows are appended to `pe_data` with
// the run's timestamp, building up a daily history.
// =============================================================================

use async_trait::async_trait;
use chrono::{Local, NaiveDateTime};
use scraper::Html;
use tracing::{debug, warn};

use super::{selector, HttpFetcher, SourceAdapter, UnitSource};
use crate::circuit_breaker::CircuitBreaker;
use crate::config::Config;
use crate::error::{ConfigError, ScrapeError};
use crate::models::{Column, Destination, Field, FieldKind, InsertSpec, RawRecord, ScrapeUnit, WriteMode};
use crate::text_scanner::{collapse_whitespace, header_key, parse_integer, parse_numeric};

pub const PAGE: &str = "latest_PE.php";

pub const PE_DATA: InsertSpec = InsertSpec {
    table: "pe_data",
    columns: &[
        Column::new("SL", FieldKind::Int),
        Column::new("Trade_Price", FieldKind::Text),
        Column::new("Close_Price", FieldKind::Float),
        Column::new("YCP", FieldKind::Float),
        Column::new("PE_1_Basic", FieldKind::Float),
        Column::new("PE_2_Diluted", FieldKind::Float),
        Column::new("PE_3_Basic", FieldKind::Float),
        Column::new("PE_4_Diluted", FieldKind::Float),
        Column::new("PE_5", FieldKind::Float),
        Column::new("PE_6", FieldKind::Float),
        Column::new("DateTime", FieldKind::Timestamp),
    ],
};

/// Page header for each numeric `pe_data` column, in column order.
const FLOAT_HEADERS: [&str; 8] = [
    "Close Price",
    "YCP",
    "P/E 1*(Basic)",
    "P/E 2*(Diluted)",
    "P/E 3*(Basic)",
    "P/E 4*(Diluted)",
    "P/E 5*",
    "P/E 6*",
];

const SERIAL_HEADER: &str = "#";
const TRADE_CODE_HEADER: &str = "Trade Code";

pub struct PeRatioSource {
    http: HttpFetcher,
}

impl PeRatioSource {
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            http: HttpFetcher::new("pe_ratio", config, config.page_timeout)?,
        })
    }
}

#[async_trait]
impl SourceAdapter for PeRatioSource {
    fn name(&self) -> &'static str {
        "pe_ratio"
    }

    fn units(&self) -> UnitSource {
        UnitSource::WholePage(PAGE)
    }

    fn destination(&self) -> Destination {
        Destination {
            spec: PE_DATA,
            mode: WriteMode::Append,
        }
    }

    fn circuit_breaker(&self) -> Option<&CircuitBreaker> {
        Some(self.http.circuit_breaker())
    }

    async fn fetch_unit(&self, _unit: &ScrapeUnit) -> Result<Vec<RawRecord>, ScrapeError> {
        let url = self.http.page_url(PAGE, PAGE, &[])?;
        let html = self.http.get_html(PAGE, url).await?;
        parse_pe_table(&html, Local::now().naive_local())
    }
}

/// Parse the PE table into `pe_data` rows stamped with `now`.
///
/// Missing table, missing header row, or a header row without the serial
/// and trade-code columns are parse errors. Any other missing column just
/// leaves that field NULL.
pub fn parse_pe_table(html: &str, now: NaiveDateTime) -> Result<Vec<RawRecord>, ScrapeError> {
    let document = Html::parse_document(html);
    let table_selector = selector(PAGE, "table.shares-table")?;
    let row_selector = selector(PAGE, "tr")?;
    let th_selector = selector(PAGE, "th")?;
    let td_selector = selector(PAGE, "td")?;

    let table = document
        .select(&table_selector)
        .next()
        .ok_or_else(|| ScrapeError::parse(PAGE, "PE table not found"))?;

    let mut rows = table.select(&row_selector);
    let headers: Vec<String> = rows
        .next()
        .map(|header_row| {
            header_row
                .select(&th_selector)
                .map(|th| header_key(&th.text().collect::<String>()))
                .collect()
        })
        .unwrap_or_default();

    if headers.is_empty() {
        return Err(ScrapeError::parse(PAGE, "PE table headers not found"));
    }

    let position = |name: &str| {
        let key = header_key(name);
        headers.iter().position(|h| *h == key)
    };
    let serial = position(SERIAL_HEADER)
        .ok_or_else(|| ScrapeError::parse(PAGE, "serial (#) column not found"))?;
    let trade_code = position(TRADE_CODE_HEADER)
        .ok_or_else(|| ScrapeError::parse(PAGE, "Trade Code column not found"))?;
    let float_columns: Vec<Option<usize>> = FLOAT_HEADERS.iter().map(|h| position(h)).collect();

    for (header, column) in FLOAT_HEADERS.iter().zip(&float_columns) {
        if column.is_none() {
            warn!(header = *header, "PE column missing from page, storing NULL");
        }
    }

    let mut records = Vec::new();
    let mut skipped = 0_usize;
    for row in rows {
        let cells: Vec<String> = row
            .select(&td_selector)
            .map(|td| collapse_whitespace(&td.text().collect::<String>()))
            .collect();

        if cells.len() != headers.len() {
            skipped += 1;
            continue;
        }

        let cell = |index: Option<usize>| index.map(|i| cells[i].as_str()).unwrap_or_default();

        let mut fields = Vec::with_capacity(PE_DATA.columns.len());
        fields.push(Field::Int(parse_integer(cell(Some(serial)))));
        fields.push(Field::Text(
            Some(cell(Some(trade_code)).to_string()).filter(|code| !code.is_empty()),
        ));
        for column in &float_columns {
            fields.push(Field::Float(parse_numeric(cell(*column))));
        }
        fields.push(Field::Timestamp(Some(now)));

        records.push(RawRecord::new(fields));
    }

    debug!(rows = records.len(), skipped = skipped, "PE table parsed");
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PE_PAGE: &str = r#"
        <html><body>
        <table class="table table-bordered background-white shares-table fixedHeader">
          <thead>
            <tr>
              <th>#</th><th>Trade Code</th><th>Close Price</th><th>YCP</th>
              <th>P/E 1*(Basic)</th><th>P/E 2*(Diluted)</th><th>P/E 3*(Basic)</th>
              <th>P/E 4*(Diluted)</th><th>P/E 5*</th><th>P/E 6*</th>
            </tr>
          </thead>
          <tbody>
            <tr>
              <td>1</td><td>1JANATAMF</td><td>3.40</td><td>3.50</td>
              <td>n/a</td><td>n/a</td><td>-8.10</td><td>-8.10</td><td>5.23</td><td>1,234.50</td>
            </tr>
            <tr><td colspan="10">Note: P/E based on audited EPS</td></tr>
            <tr>
              <td>2</td><td>AAMRANET</td><td>52.60</td><td>53.20</td>
              <td>30.22</td><td>30.22</td><td>28.01</td><td>28.01</td><td></td><td>N/A</td>
            </tr>
          </tbody>
        </table>
        </body></html>
    "#;

    fn now() -> NaiveDateTime {
        chrono::NaiveDate::from_ymd_opt(2024, 6, 2)
            .and_then(|d| d.and_hms_opt(15, 3, 0))
            .unwrap()
    }

    #[test]
    fn test_parse_pe_table() {
        let records = parse_pe_table(PE_PAGE, now()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[0],
            RawRecord::new(vec![
                Field::Int(Some(1)),
                Field::text("1JANATAMF"),
                Field::Float(Some(3.4)),
                Field::Float(Some(3.5)),
                Field::Float(None),
                Field::Float(None),
                Field::Float(Some(-8.1)),
                Field::Float(Some(-8.1)),
                Field::Float(Some(5.23)),
                Field::Float(Some(1234.5)),
                Field::Timestamp(Some(now())),
            ])
        );
        assert_eq!(records[1].get(8), Some(&Field::Float(None)));
        assert_eq!(records[1].get(9), Some(&Field::Float(None)));
        PE_DATA.check_all(&records).unwrap();
    }

    #[test]
    fn test_columns_are_found_by_header_not_position() {
        let html = r#"
            <table class="shares-table">
              <tr><th>Trade Code</th><th>#</th><th>YCP</th></tr>
              <tr><td>ACI</td><td>7</td><td>210.5</td></tr>
            </table>
        "#;
        let records = parse_pe_table(html, now()).unwrap();
        assert_eq!(records[0].get(0), Some(&Field::Int(Some(7))));
        assert_eq!(records[0].get(1), Some(&Field::text("ACI")));
        assert_eq!(records[0].get(2), Some(&Field::Float(None)));
        assert_eq!(records[0].get(3), Some(&Field::Float(Some(210.5))));
    }

    #[test]
    fn test_missing_table_is_parse_error() {
        let err = parse_pe_table("<html><body><table><tr><td>x</td></tr></table></body></html>", now())
            .unwrap_err();
        assert!(err.to_string().contains("PE table not found"));
    }

    #[test]
    fn test_missing_trade_code_column_is_parse_error() {
        let html = r#"
            <table class="shares-table">
              <tr><th>#</th><th>Close Price</th></tr>
              <tr><td>1</td><td>3.4</td></tr>
            </table>
        "#;
        let err = parse_pe_table(html, now()).unwrap_err();
        assert!(err.to_string().contains("Trade Code"));
    }

    #[tokio::test]
    async fn test_fetch_unit_surfaces_http_errors() {
        let mut server = mockito::Server::new_async().await;
        let _page = server
            .mock("GET", "/latest_PE.php")
            .with_status(500)
            .create_async()
            .await;

        let config = Config {
            base_url: server.url(),
            ..Config::default()
        };
        let source = PeRatioSource::new(&config).unwrap();
        let err = source.fetch_unit(&ScrapeUnit::from(PAGE)).await.unwrap_err();
        assert!(matches!(err, ScrapeError::Network { .. }));
    }
}
