// =============================================================================
// DSE SCRAPE ENGINE
// =============================================================================
//
// Scrape the Dhaka Stock Exchange's public pages on a daily schedule and
// store them as typed rows, one transaction per run.
//
//   Scheduler ──► ScrapeEngine ──► TableScrapeJob
//                                   ├─ SourceAdapter      (one per domain)
//                                   ├─ FetchCoordinator   (bounded fan-out)
//                                   └─ StorageGateway     (replace-and-store)
// =============================================================================

pub mod circuit_breaker;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod scheduler;
pub mod sources;
pub mod storage;
pub mod text_scanner;

pub use config::{Config, ScrapeDomain, StorageBackend};
pub use coordinator::{FetchCoordinator, FetchOutcome};
pub use engine::{CompletionCallback, ProgressCallback, ScrapeEngine, ScrapeJob};
pub use error::{ConfigError, ScrapeError, StorageError};
pub use metrics::MetricsCollector;
pub use models::{RunOutcome, RunReport};
pub use pipeline::{build_engines, TableScrapeJob};
pub use scheduler::Scheduler;
pub use storage::StorageGateway;
