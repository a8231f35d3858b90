// =============================================================================
// sources/share_holding.rs — WHO OWNS HOW MUCH OF EACH COMPANY
// =============================================================================
//
// One unit per company symbol, one GET of `displayCompany.php?name={symbol}`
// per unit. The company page carries:
//
//   - cells styled `border:hidden;` holding "Sponsor/Director:", "Govt:",
//     "Institute:", "Foreign:" and "Public:" with the percentage on the last
//     line of the cell
//   - a `th` reading "Total No. of Outstanding Securities" whose next `td`
//     holds the share count
//
// When a label shows up more than once (the page lists several reporting
// dates), the last occurrence wins. A label that never shows up is stored
// as 0; a label whose value cannot be read is stored as NULL.
// =============================================================================

use async_trait::async_trait;
use chrono::{Local, NaiveDateTime};
use scraper::{ElementRef, Html};
use tracing::debug;

use super::company_listing::COMPANY_UNITS;
use super::{element_text, selector, HttpFetcher, SourceAdapter, UnitSource};
use crate::circuit_breaker::CircuitBreaker;
use crate::config::Config;
use crate::error::{ConfigError, ScrapeError};
use crate::models::{Column, Destination, Field, FieldKind, InsertSpec, RawRecord, ScrapeUnit, WriteMode};
use crate::text_scanner::{collapse_whitespace, parse_count, scan_share_cell, ShareHolder};

pub const PAGE: &str = "displayCompany.php";

const TOTAL_SECURITIES_HEADER: &str = "Total No. of Outstanding Securities";

pub const SYMBOL_SHARE: InsertSpec = InsertSpec {
    table: "Symbol_Share",
    columns: &[
        Column::new("company", FieldKind::Text),
        Column::new("total_share", FieldKind::Int),
        Column::new("Sponsor", FieldKind::Float),
        Column::new("Govt", FieldKind::Float),
        Column::new("Institute", FieldKind::Float),
        Column::new("Foreign_share", FieldKind::Float),
        Column::new("public_share", FieldKind::Float),
        Column::new("scraping_date", FieldKind::Timestamp),
    ],
};

pub struct ShareHoldingSource {
    http: HttpFetcher,
}

impl ShareHoldingSource {
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            http: HttpFetcher::new("share_holding", config, config.unit_timeout)?,
        })
    }
}

#[async_trait]
impl SourceAdapter for ShareHoldingSource {
    fn name(&self) -> &'static str {
        "share_holding"
    }

    fn units(&self) -> UnitSource {
        UnitSource::Storage(COMPANY_UNITS)
    }

    fn destination(&self) -> Destination {
        Destination {
            spec: SYMBOL_SHARE,
            mode: WriteMode::Append,
        }
    }

    fn circuit_breaker(&self) -> Option<&CircuitBreaker> {
        Some(self.http.circuit_breaker())
    }

    async fn fetch_unit(&self, unit: &ScrapeUnit) -> Result<Vec<RawRecord>, ScrapeError> {
        let company = unit.as_str();
        let url = self.http.page_url(company, PAGE, &[("name", company)])?;
        let html = self.http.get_html(company, url).await?;
        parse_share_holding(company, &html, Local::now().naive_local()).map(|record| vec![record])
    }
}

/// Build the single `Symbol_Share` row for one company page.
pub fn parse_share_holding(
    company: &str,
    html: &str,
    now: NaiveDateTime,
) -> Result<RawRecord, ScrapeError> {
    let document = Html::parse_document(html);

    let cells = selector(company, "td")?;
    let headers = selector(company, "th")?;

    // None = label never seen; Some(None) = seen but unreadable.
    let mut percents: [Option<Option<f64>>; 5] = [None; 5];
    for cell in document.select(&cells).filter(is_hidden_border) {
        if let Some(found) = scan_share_cell(&element_text(&cell)) {
            percents[found.holder.index()] = Some(found.percent);
        }
    }

    let total_header = document
        .select(&headers)
        .filter(|th| collapse_whitespace(&th.text().collect::<String>()).contains(TOTAL_SECURITIES_HEADER))
        .last();

    if total_header.is_none() && percents.iter().all(Option::is_none) {
        return Err(ScrapeError::parse(
            company,
            "neither share-holding cells nor outstanding securities found",
        ));
    }

    let total_share = total_header
        .and_then(|th| next_sibling_td(&th))
        .and_then(|td| parse_count(&td.text().collect::<String>()));

    debug!(
        company = company,
        total_share = ?total_share,
        labels_found = percents.iter().filter(|p| p.is_some()).count(),
        "Share-holding page parsed"
    );

    let mut fields = Vec::with_capacity(SYMBOL_SHARE.columns.len());
    fields.push(Field::text(company));
    fields.push(Field::Int(total_share));
    for holder in ShareHolder::ALL {
        fields.push(Field::Float(percents[holder.index()].unwrap_or(Some(0.0))));
    }
    fields.push(Field::Timestamp(Some(now)));

    Ok(RawRecord::new(fields))
}

fn is_hidden_border(cell: &ElementRef<'_>) -> bool {
    cell.value().attr("style").is_some_and(|style| {
        let style: String = style
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_ascii_lowercase();
        style.trim_end_matches(';') == "border:hidden"
    })
}

fn next_sibling_td<'a>(th: &ElementRef<'a>) -> Option<ElementRef<'a>> {
    th.next_siblings()
        .filter_map(ElementRef::wrap)
        .find(|sibling| sibling.value().name() == "td")
}
