// =============================================================================
// pipeline.rs — ADAPTER + COORDINATOR + GATEWAY = ONE SCRAPE JOB
// =============================================================================
//
// Every domain runs the same execute step:
//
//   units    <- storage query, or the single page the adapter scrapes
//   records  <- bounded fan-out of adapter.fetch_unit over the units
//   store    <- one transaction into the adapter's destination
//
// A cancelled fan-out never reaches the store. A unit list that comes back
// empty ends the run quietly with nothing stored.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::{Config, ScrapeDomain};
use crate::coordinator::FetchCoordinator;
use crate::engine::{RunContext, ScrapeEngine, ScrapeJob};
use crate::error::{ConfigError, ScrapeError};
use crate::metrics::MetricsCollector;
use crate::models::{InsertSpec, RunSummary, ScrapeUnit};
use crate::sources::{
    company_listing, pe_ratio, sector_companies, sector_listing, share_holding, CompanyListingSource,
    PeRatioSource, SectorCompaniesSource, SectorListingSource, ShareHoldingSource, SourceAdapter,
    UnitSource,
};
use crate::storage::StorageGateway;

/// The generic job: one adapter, one gateway, one fan-out policy.
pub struct TableScrapeJob<A: SourceAdapter> {
    adapter: A,
    gateway: StorageGateway,
    coordinator: FetchCoordinator,
    metrics: Option<Arc<MetricsCollector>>,
}

impl<A: SourceAdapter> TableScrapeJob<A> {
    pub fn new(adapter: A, gateway: StorageGateway, coordinator: FetchCoordinator) -> Self {
        Self {
            adapter,
            gateway,
            coordinator,
            metrics: None,
        }
    }

    /// Report breaker trips seen during each run to `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn breaker_trips(&self) -> u64 {
        self.adapter.circuit_breaker().map_or(0, |breaker| breaker.total_trips())
    }

    async fn units(&self) -> Result<Vec<ScrapeUnit>, ScrapeError> {
        match self.adapter.units() {
            UnitSource::Storage(query) => Ok(self.gateway.fetch_units(&query).await?),
            UnitSource::WholePage(page) => Ok(vec![ScrapeUnit::from(page)]),
        }
    }
}

#[async_trait]
impl<A: SourceAdapter> ScrapeJob for TableScrapeJob<A> {
    fn name(&self) -> &'static str {
        self.adapter.name()
    }

    async fn execute(&self, ctx: &RunContext) -> Result<RunSummary, ScrapeError> {
        let units = self.units().await?;
        if units.is_empty() {
            warn!(job = self.name(), "No units to scrape");
            ctx.progress.begin(0);
            return Ok(RunSummary::default());
        }

        info!(
            job = self.name(),
            units = units.len(),
            concurrency = self.coordinator.concurrency(),
            "Fetching units"
        );

        let trips_before = self.breaker_trips();
        let adapter = &self.adapter;
        let outcome = self
            .coordinator
            .run(
                units,
                move |unit: ScrapeUnit| async move { adapter.fetch_unit(&unit).await },
                &ctx.progress,
                &ctx.cancel,
            )
            .await;

        let trips = self.breaker_trips().saturating_sub(trips_before);
        if trips > 0 {
            warn!(job = self.name(), trips, "Circuit breaker tripped during the run");
            if let Some(metrics) = &self.metrics {
                metrics.add_circuit_breaker_trips(trips);
            }
        }

        if outcome.cancelled {
            info!(
                job = self.name(),
                completed = outcome.completed,
                total = outcome.total,
                "Run cancelled, skipping store"
            );
            return Err(ScrapeError::Cancelled);
        }

        let destination = self.adapter.destination();
        let stored = self
            .gateway
            .store(&outcome.records, &destination.spec, destination.replace_table())
            .await?;

        Ok(RunSummary {
            units_total: outcome.total,
            units_completed: outcome.completed,
            units_failed: outcome.failures.len(),
            records_stored: stored,
        })
    }
}

/// The table a domain writes to. `Sector_Information` is replaced on every
/// run rather than appended to, so each sector code appears once and the
/// sector-company fan-out sees no duplicate units.
pub fn destination_spec(domain: ScrapeDomain) -> InsertSpec {
    match domain {
        ScrapeDomain::CompanyListing => company_listing::COMPANY_INFORMATION,
        ScrapeDomain::SectorListing => sector_listing::SECTOR_INFORMATION,
        ScrapeDomain::SectorCompanies => sector_companies::SECTOR_SYMBOL,
        ScrapeDomain::ShareHolding => share_holding::SYMBOL_SHARE,
        ScrapeDomain::PeRatio => pe_ratio::PE_DATA,
    }
}

fn table_job<A: SourceAdapter>(
    adapter: A,
    gateway: &StorageGateway,
    coordinator: FetchCoordinator,
    metrics: &Arc<MetricsCollector>,
) -> Arc<dyn ScrapeJob> {
    Arc::new(TableScrapeJob::new(adapter, gateway.clone(), coordinator).with_metrics(metrics.clone()))
}

/// One engine per enabled domain, all sharing the gateway and metrics.
pub fn build_engines(
    config: &Config,
    gateway: StorageGateway,
    metrics: Arc<MetricsCollector>,
) -> Result<Vec<(ScrapeDomain, ScrapeEngine)>, ConfigError> {
    let coordinator = FetchCoordinator::new(config.fetch_concurrency);

    let mut engines = Vec::with_capacity(config.enabled_domains.len());
    for &domain in &config.enabled_domains {
        let job = match domain {
            ScrapeDomain::CompanyListing => {
                table_job(CompanyListingSource::new(config)?, &gateway, coordinator, &metrics)
            }
            ScrapeDomain::SectorListing => {
                table_job(SectorListingSource::new(config)?, &gateway, coordinator, &metrics)
            }
            ScrapeDomain::SectorCompanies => {
                table_job(SectorCompaniesSource::new(config)?, &gateway, coordinator, &metrics)
            }
            ScrapeDomain::ShareHolding => {
                table_job(ShareHoldingSource::new(config)?, &gateway, coordinator, &metrics)
            }
            ScrapeDomain::PeRatio => table_job(PeRatioSource::new(config)?, &gateway, coordinator, &metrics),
        };
        engines.push((domain, ScrapeEngine::new(job, metrics.clone())));
    }

    Ok(engines)
}
