// =============================================================================
// sources/company_listing.rs — EVERY LISTED COMPANY, ONE PAGE
// =============================================================================
//
// `company_listing.php` links every listed company with an `a.ab1` anchor
// whose href carries the trading code as `name=`. The whole page is one
// unit; the result fully replaces `Company_Information`, which in turn is
// the unit list for every per-company source.
// =============================================================================

use async_trait::async_trait;
use chrono::{Local, NaiveDateTime};

use super::{listing_links, HttpFetcher, SourceAdapter, UnitSource};
use crate::circuit_breaker::CircuitBreaker;
use crate::config::Config;
use crate::error::{ConfigError, ScrapeError};
use crate::models::{Column, Destination, Field, FieldKind, InsertSpec, RawRecord, ScrapeUnit, UnitQuery, WriteMode};

pub const PAGE: &str = "company_listing.php";

pub const COMPANY_INFORMATION: InsertSpec = InsertSpec {
    table: "Company_Information",
    columns: &[
        Column::new("company_symbol", FieldKind::Text),
        Column::new("company_name", FieldKind::Text),
        Column::new("isActive", FieldKind::Int),
        Column::new("last_updated", FieldKind::Timestamp),
    ],
};

/// Distinct company symbols, the unit list for per-company sources.
pub const COMPANY_UNITS: UnitQuery = UnitQuery {
    table: "Company_Information",
    column: "company_symbol",
    order_by_latest: None,
};

pub struct CompanyListingSource {
    http: HttpFetcher,
}

impl CompanyListingSource {
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            http: HttpFetcher::new("company_listing", config, config.page_timeout)?,
        })
    }
}

#[async_trait]
impl SourceAdapter for CompanyListingSource {
    fn name(&self) -> &'static str {
        "company_listing"
    }

    fn units(&self) -> UnitSource {
        UnitSource::WholePage(PAGE)
    }

    fn destination(&self) -> Destination {
        Destination {
            spec: COMPANY_INFORMATION,
            mode: WriteMode::Replace,
        }
    }

    fn circuit_breaker(&self) -> Option<&CircuitBreaker> {
        Some(self.http.circuit_breaker())
    }

    async fn fetch_unit(&self, _unit: &ScrapeUnit) -> Result<Vec<RawRecord>, ScrapeError> {
        let url = self.http.page_url(PAGE, PAGE, &[])?;
        let html = self.http.get_html(PAGE, url).await?;
        parse_company_listing(&html, Local::now().naive_local())
    }
}

/// One `(company_symbol, company_name, isActive = 1, last_updated)` row per
/// company link. A page without a single company link has changed shape and
/// is a parse error.
pub fn parse_company_listing(html: &str, now: NaiveDateTime) -> Result<Vec<RawRecord>, ScrapeError> {
    let links = listing_links(PAGE, html, "name")?;
    if links.is_empty() {
        return Err(ScrapeError::parse(PAGE, "no company links found"));
    }

    Ok(links
        .into_iter()
        .map(|link| {
            RawRecord::new(vec![
                Field::text(link.id),
                Field::text(link.text),
                Field::Int(Some(1)),
                Field::Timestamp(Some(now)),
            ])
        })
        .collect())
}
