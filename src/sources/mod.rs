// =============================================================================
// sources/mod.rs — ONE ADAPTER PER DATA DOMAIN
// =============================================================================
//
// A source adapter knows three things about its domain:
//
//   1. where its units come from (a storage query, or "just the one page")
//   2. where its records go (table, columns, replace or append)
//   3. how to turn one unit into records (one GET, one parse)
//
// It knows nothing about concurrency, progress, transactions or schedules.
// The pipeline wires adapters into engines; the adapters just fetch.
//
// Every adapter splits its work into an async fetch (HttpFetcher) and a
// pure, synchronous parse function over the HTML string. The parse
// functions are where the selectors live, and they are what the tests
// poke at hardest.
// =============================================================================

pub mod company_listing;
pub mod pe_ratio;
pub mod sector_companies;
pub mod sector_listing;
pub mod share_holding;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;
use url::Url;

use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::config::Config;
use crate::error::{ConfigError, ScrapeError};
use crate::models::{Destination, RawRecord, ScrapeUnit, UnitQuery};
use crate::text_scanner::{collapse_whitespace, query_param};

pub use company_listing::CompanyListingSource;
pub use pe_ratio::PeRatioSource;
pub use sector_companies::SectorCompaniesSource;
pub use sector_listing::SectorListingSource;
pub use share_holding::ShareHoldingSource;

/// Where a run's units come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitSource {
    /// Read from storage at the start of every run.
    Storage(UnitQuery),
    /// A single page; the run has exactly one unit, named after the page.
    WholePage(&'static str),
}

#[async_trait]
pub trait SourceAdapter: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn units(&self) -> UnitSource;

    fn destination(&self) -> Destination;

    /// One network fetch for one unit. Whole-page adapters receive the page
    /// unit and may ignore it.
    async fn fetch_unit(&self, unit: &ScrapeUnit) -> Result<Vec<RawRecord>, ScrapeError>;

    /// The breaker watching this adapter's requests, if it has one.
    fn circuit_breaker(&self) -> Option<&CircuitBreaker> {
        None
    }
}

/// A reqwest client bound to the exchange's base URL, with a fixed timeout
/// and a circuit breaker shared by every fetch of one adapter.
pub struct HttpFetcher {
    client: reqwest::Client,
    base: Url,
    breaker: CircuitBreaker,
}

impl HttpFetcher {
    pub fn new(name: &str, config: &Config, timeout: Duration) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;

        // Url::join replaces the last path segment unless the base ends in '/'.
        let mut base = config.base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base = Url::parse(&base).map_err(|e| ConfigError::BaseUrl {
            url: config.base_url.clone(),
            message: e.to_string(),
        })?;

        let breaker = CircuitBreaker::new(
            name,
            config.circuit_breaker_failure_threshold,
            config.circuit_breaker_reset_timeout,
            config.circuit_breaker_success_threshold,
        );

        Ok(Self { client, base, breaker })
    }

    /// `{base}/{path}` with optional query parameters.
    pub fn page_url(&self, unit: &str, path: &str, query: &[(&str, &str)]) -> Result<Url, ScrapeError> {
        let mut url = self
            .base
            .join(path)
            .map_err(|e| ScrapeError::network(unit, format!("bad page path {path}: {e}")))?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// GET a page and return its body. Anything but 200 is a network error
    /// for this unit. Transport failures and 5xx responses count against the
    /// breaker, but the request is always sent: an open breaker is reported,
    /// not obeyed.
    pub async fn get_html(&self, unit: &str, url: Url) -> Result<String, ScrapeError> {
        if self.breaker.check() == CircuitState::Open {
            debug!(unit = unit, circuit = self.breaker.name(), "Circuit open, sending anyway");
        }

        debug!(unit = unit, url = %url, "GET");

        let response = match self.client.get(url.clone()).send().await {
            Ok(response) => response,
            Err(e) => {
                self.breaker.record_failure();
                return Err(ScrapeError::network(unit, e));
            }
        };

        let status = response.status();
        if status != StatusCode::OK {
            if status.is_server_error() {
                self.breaker.record_failure();
            } else {
                self.breaker.record_success();
            }
            return Err(ScrapeError::network(unit, format!("HTTP {status} from {url}")));
        }

        match response.text().await {
            Ok(body) => {
                self.breaker.record_success();
                Ok(body)
            }
            Err(e) => {
                self.breaker.record_failure();
                Err(ScrapeError::network(unit, e))
            }
        }
    }
}

/// Compile a CSS selector, reporting failure as a parse error for `unit`.
pub(crate) fn selector(unit: &str, css: &str) -> Result<Selector, ScrapeError> {
    Selector::parse(css).map_err(|e| ScrapeError::parse(unit, format!("invalid selector {css}: {e:?}")))
}

/// All text inside an element, one text node per line.
pub(crate) fn element_text(element: &ElementRef<'_>) -> String {
    element.text().collect::<Vec<_>>().join("\n")
}

/// A listing link: the identifier from its href plus its visible text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ListingLink {
    pub id: String,
    pub text: String,
}

/// Every `a.ab1` link whose href carries `param` and whose text is not
/// blank. The exchange uses this class for every company and sector link
/// on its listing pages.
pub(crate) fn listing_links(unit: &str, html: &str, param: &str) -> Result<Vec<ListingLink>, ScrapeError> {
    let document = Html::parse_document(html);
    let links = selector(unit, "a.ab1")?;

    Ok(document
        .select(&links)
        .filter_map(|a| {
            let id = query_param(a.value().attr("href")?, param)?;
            let text = collapse_whitespace(&a.text().collect::<String>());
            if text.is_empty() {
                return None;
            }
            Some(ListingLink { id, text })
        })
        .collect())
}
