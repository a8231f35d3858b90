// =============================================================================
// sources/sector_companies.rs — WHICH COMPANY SITS IN WHICH SECTOR
// =============================================================================
//
// One unit per sector code (read from `Sector_Information`), one GET of
// `companylistbyindustry.php?industryno={code}` per unit. Every `a.ab1`
// company link on that page becomes a `(sector_code, company,
// last_updated)` row. The whole membership table is replaced per run.
// =============================================================================

use async_trait::async_trait;
use chrono::{Local, NaiveDateTime};

use super::sector_listing::SECTOR_UNITS;
use super::{listing_links, HttpFetcher, SourceAdapter, UnitSource};
use crate::circuit_breaker::CircuitBreaker;
use crate::config::Config;
use crate::error::{ConfigError, ScrapeError};
use crate::models::{Column, Destination, Field, FieldKind, InsertSpec, RawRecord, ScrapeUnit, WriteMode};

pub const PAGE: &str = "companylistbyindustry.php";

pub const SECTOR_SYMBOL: InsertSpec = InsertSpec {
    table: "Sector_Symbol",
    columns: &[
        Column::new("sector_code", FieldKind::Text),
        Column::new("company", FieldKind::Text),
        Column::new("last_updated", FieldKind::Timestamp),
    ],
};

pub struct SectorCompaniesSource {
    http: HttpFetcher,
}

impl SectorCompaniesSource {
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            http: HttpFetcher::new("sector_companies", config, config.unit_timeout)?,
        })
    }
}

#[async_trait]
impl SourceAdapter for SectorCompaniesSource {
    fn name(&self) -> &'static str {
        "sector_companies"
    }

    fn units(&self) -> UnitSource {
        UnitSource::Storage(SECTOR_UNITS)
    }

    fn destination(&self) -> Destination {
        Destination {
            spec: SECTOR_SYMBOL,
            mode: WriteMode::Replace,
        }
    }

    fn circuit_breaker(&self) -> Option<&CircuitBreaker> {
        Some(self.http.circuit_breaker())
    }

    async fn fetch_unit(&self, unit: &ScrapeUnit) -> Result<Vec<RawRecord>, ScrapeError> {
        let code = unit.as_str();
        let url = self.http.page_url(code, PAGE, &[("industryno", code)])?;
        let html = self.http.get_html(code, url).await?;
        parse_sector_companies(code, &html, Local::now().naive_local())
    }
}

/// Membership rows for one sector. A sector page with no company links is
/// a legitimately empty sector, not an error.
pub fn parse_sector_companies(
    sector_code: &str,
    html: &str,
    now: NaiveDateTime,
) -> Result<Vec<RawRecord>, ScrapeError> {
    Ok(listing_links(sector_code, html, "name")?
        .into_iter()
        .map(|link| {
            RawRecord::new(vec![
                Field::text(sector_code),
                Field::text(link.id),
                Field::Timestamp(Some(now)),
            ])
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECTOR_PAGE: &str = r#"
        <table class="table table-bordered">
          <tr><td><a class="ab1" href="displayCompany.php?name=ABBANK">ABBANK</a></td></tr>
          <tr><td><a class="ab1" href="displayCompany.php?name=BANKASIA">BANKASIA</a></td></tr>
        </table>
    "#;

    fn now() -> NaiveDateTime {
        chrono::NaiveDate::from_ymd_opt(2024, 6, 2)
            .and_then(|d| d.and_hms_opt(15, 1, 0))
            .unwrap()
    }

    #[test]
    fn test_parse_sector_companies() {
        let records = parse_sector_companies("11", SECTOR_PAGE, now()).unwrap();
        assert_eq!(
            records,
            vec![
                RawRecord::new(vec![Field::text("11"), Field::text("ABBANK"), Field::Timestamp(Some(now()))]),
                RawRecord::new(vec![Field::text("11"), Field::text("BANKASIA"), Field::Timestamp(Some(now()))]),
            ]
        );
    }

    #[test]
    fn test_empty_sector_is_not_an_error() {
        let records = parse_sector_companies("99", "<table></table>", now()).unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_unit_sends_industry_number() {
        let mut server = mockito::Server::new_async().await;
        let page = server
            .mock("GET", "/companylistbyindustry.php")
            .match_query(mockito::Matcher::UrlEncoded("industryno".into(), "11".into()))
            .with_status(200)
            .with_body(SECTOR_PAGE)
            .create_async()
            .await;

        let config = Config {
            base_url: server.url(),
            ..Config::default()
        };
        let source = SectorCompaniesSource::new(&config).unwrap();
        let records = source.fetch_unit(&ScrapeUnit::from("11")).await.unwrap();

        assert_eq!(records.len(), 2);
        page.assert_async().await;
    }
}
