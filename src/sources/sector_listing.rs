// =============================================================================
// sources/sector_listing.rs — THE INDUSTRY SECTORS
// =============================================================================
//
// `by_industrylisting.php` links each sector with an `a.ab1` anchor whose
// href carries `industryno=`. One page, one unit, full replace of
// `Sector_Information`. The sector codes stored here drive the
// sector-to-company run.
// =============================================================================

use async_trait::async_trait;
use chrono::{Local, NaiveDateTime};

use super::{listing_links, HttpFetcher, SourceAdapter, UnitSource};
use crate::circuit_breaker::CircuitBreaker;
use crate::config::Config;
use crate::error::{ConfigError, ScrapeError};
use crate::models::{Column, Destination, Field, FieldKind, InsertSpec, RawRecord, ScrapeUnit, UnitQuery, WriteMode};

pub const PAGE: &str = "by_industrylisting.php";

pub const SECTOR_INFORMATION: InsertSpec = InsertSpec {
    table: "Sector_Information",
    columns: &[
        Column::new("sector_code", FieldKind::Text),
        Column::new("sector_name", FieldKind::Text),
        Column::new("isActive", FieldKind::Int),
        Column::new("last_updated", FieldKind::Timestamp),
    ],
};

/// Sector codes, least recently updated first.
pub const SECTOR_UNITS: UnitQuery = UnitQuery {
    table: "Sector_Information",
    column: "sector_code",
    order_by_latest: Some("last_updated"),
};

pub struct SectorListingSource {
    http: HttpFetcher,
}

impl SectorListingSource {
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            http: HttpFetcher::new("sector_listing", config, config.page_timeout)?,
        })
    }
}

#[async_trait]
impl SourceAdapter for SectorListingSource {
    fn name(&self) -> &'static str {
        "sector_listing"
    }

    fn units(&self) -> UnitSource {
        UnitSource::WholePage(PAGE)
    }

    fn destination(&self) -> Destination {
        Destination {
            spec: SECTOR_INFORMATION,
            // Replaced, not appended: the sector list is the unit source
            // for the sector-company run and must hold each code once.
            mode: WriteMode::Replace,
        }
    }

    fn circuit_breaker(&self) -> Option<&CircuitBreaker> {
        Some(self.http.circuit_breaker())
    }

    async fn fetch_unit(&self, _unit: &ScrapeUnit) -> Result<Vec<RawRecord>, ScrapeError> {
        let url = self.http.page_url(PAGE, PAGE, &[])?;
        let html = self.http.get_html(PAGE, url).await?;
        parse_sector_listing(&html, Local::now().naive_local())
    }
}

/// One `(sector_code, sector_name, isActive = 1, last_updated)` row per
/// sector link.
pub fn parse_sector_listing(html: &str, now: NaiveDateTime) -> Result<Vec<RawRecord>, ScrapeError> {
    let links = listing_links(PAGE, html, "industryno")?;
    if links.is_empty() {
        return Err(ScrapeError::parse(PAGE, "no sector links found"));
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sector_listing() {
        let html = r#"
            <table>
              <tr><td><a class="ab1" href="companylistbyindustry.php?industryno=11">Bank</a></td></tr>
              <tr><td><a class="ab1" href="companylistbyindustry.php?industryno=12">
                  Cement
              </a></td></tr>
              <tr><td><a class="ab1" href="displayCompany.php?name=ACI">not a sector</a></td></tr>
            </table>
        "#;
        let now = chrono::NaiveDate::from_ymd_opt(2024, 6, 2)
            .and_then(|d| d.and_hms_opt(9, 30, 0))
            .unwrap();

        let records = parse_sector_listing(html, now).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].get(0), Some(&Field::text("12")));
        assert_eq!(records[1].get(1), Some(&Field::text("Cement")));
        SECTOR_INFORMATION.check_all(&records).unwrap();
    }

    #[test]
    fn test_sector_destination_replaces() {
        let config = Config::default();
        let source = SectorListingSource::new(&config).unwrap();
        assert_eq!(source.destination().replace_table(), Some("Sector_Information"));
        assert_eq!(source.units(), UnitSource::WholePage(PAGE));
    }
}
