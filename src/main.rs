// ██████╗ ███████╗███████╗
// ██╔══██╗██╔════╝██╔════╝
// ██║  ██║███████╗█████╗
// ██║  ██║╚════██║██╔══╝
// ██████╔╝███████║███████╗
// ╚═════╝ ╚══════╝╚══════╝
//
// S C R A P E   E N G I N E
//
// Five domains, one template: listings, sectors, memberships, share
// holdings and the daily PE table, scraped at market close and stored in
// one transaction apiece.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use dse_scrape_engine::config::{Config, EnvFileSettings, StorageBackend};
use dse_scrape_engine::engine::{CompletionCallback, ProgressCallback, ScrapeEngine};
use dse_scrape_engine::metrics::{self, MetricsCollector};
use dse_scrape_engine::pipeline::{build_engines, destination_spec};
use dse_scrape_engine::scheduler::Scheduler;
use dse_scrape_engine::storage::{MemoryStorage, PostgresStorage, StorageGateway, StoragePort};

fn print_banner() {
    let banner = r#"

    ╔══════════════════════════════════════════════════════════╗
    ║                                                          ║
    ║     ██████╗ ███████╗███████╗                             ║
    ║     ██╔══██╗██╔════╝██╔════╝                             ║
    ║     ██║  ██║███████╗█████╗                               ║
    ║     ██║  ██║╚════██║██╔══╝                               ║
    ║     ██████╔╝███████║███████╗                             ║
    ║     ╚═════╝ ╚══════╝╚══════╝   SCRAPE ENGINE             ║
    ║                                                          ║
    ║   Pages:   listings | sectors | holdings | PE table      ║
    ║   Fan-out: bounded buffer_unordered                      ║
    ║   Store:   one transaction, replace or append            ║
    ║                                                          ║
    ╚══════════════════════════════════════════════════════════╝

    "#;
    println!("{}", banner);
}

/// Progress and completion callbacks that just log.
fn logging_callbacks(engine: &ScrapeEngine) -> (ProgressCallback, CompletionCallback) {
    let name = engine.name();
    let progress: ProgressCallback = Arc::new(move |completed, total| {
        info!(job = name, "{}/{} processed", completed, total);
    });

    let completion: CompletionCallback = Arc::new(move || {
        info!(job = name, "✅ Run complete");
    });

    (progress, completion)
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(true)
        .init();

    print_banner();

    info!("📈 DSE SCRAPE ENGINE initializing...");

    let config = Arc::new(Config::from_env());
    info!(
        base_url = %config.base_url,
        backend = ?config.storage_backend,
        domains = config.enabled_domains.len(),
        "✅ Configuration loaded"
    );

    // ═══════════════════════════════════════════
    // STORAGE
    // ═══════════════════════════════════════════

    let port: Arc<dyn StoragePort> = match config.storage_backend {
        StorageBackend::Postgres => {
            let settings = EnvFileSettings::new(&config.settings_file);
            settings
                .ensure_template()
                .with_context(|| format!("preparing settings file {}", settings.path().display()))?;
            info!(settings = %settings.path().display(), "Using PostgreSQL storage");
            Arc::new(PostgresStorage::new(Arc::new(settings)))
        }
        StorageBackend::Memory => {
            warn!("Using in-memory storage, nothing survives a restart");
            Arc::new(MemoryStorage::new())
        }
    };
    let gateway = StorageGateway::new(port);

    match gateway.test_connection().await {
        Ok(label) => info!(strategy = %label, "✅ Storage reachable"),
        Err(e) => warn!(error = %e, "Storage not reachable yet, runs will fail until it is"),
    }

    if config.create_tables {
        for &domain in &config.enabled_domains {
            let spec = destination_spec(domain);
            if let Err(e) = gateway.ensure_table(&spec).await {
                error!(table = spec.table, error = %e, "Could not create table");
            }
        }
    }

    // ═══════════════════════════════════════════
    // ENGINES + SCHEDULERS
    // ═══════════════════════════════════════════

    let metrics_collector = Arc::new(MetricsCollector::new());
    let engines = build_engines(&config, gateway, metrics_collector.clone())
        .context("building scrape engines")?;

    let mut schedulers = Vec::new();
    for (domain, engine) in &engines {
        let (progress, completion) = logging_callbacks(engine);
        engine.set_callbacks(Some(progress), Some(completion));

        let Some(time) = config.schedule_for(*domain) else {
            info!(job = engine.name(), "No schedule, manual runs only");
            continue;
        };

        let trigger_engine = engine.clone();
        let scheduler = Scheduler::new(domain.key(), Arc::new(move || {
            trigger_engine.start_scraping();
        }))
        .with_poll_interval(config.scheduler_poll_interval);

        if scheduler.start(time) {
            schedulers.push(scheduler);
        } else {
            error!(job = engine.name(), time = time, "Schedule rejected");
        }
    }

    if config.run_on_start {
        info!("🚀 Running every engine once at startup");
        for (_, engine) in &engines {
            engine.start_scraping();
        }
    }

    // ═══════════════════════════════════════════
    // METRICS SERVER
    // ═══════════════════════════════════════════

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics_handle = if config.metrics_port != 0 {
        let metrics_for_server = metrics_collector.clone();
        let metrics_port = config.metrics_port;
        let mut metrics_shutdown = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            metrics::run_metrics_server(metrics_for_server, metrics_port, &mut metrics_shutdown).await;
            info!("📊 Metrics server: OFFLINE");
        }))
    } else {
        None
    };

    info!("═══════════════════════════════════════════════════════");
    info!("  🟢 DSE SCRAPE ENGINE ACTIVE");
    info!("  📡 {} engines, {} schedules", engines.len(), schedulers.len());
    for scheduler in &schedulers {
        if let (Some(time), Some(next)) = (scheduler.scheduled_time(), scheduler.next_run()) {
            info!("  ⏰ {} daily at {} (next: {})", scheduler.name(), time, next);
        }
    }
    info!("  ⚡ Press Ctrl+C for graceful shutdown");
    info!("═══════════════════════════════════════════════════════");

    match signal::ctrl_c().await {
        Ok(()) => warn!("🛑 Shutdown signal received!"),
        Err(err) => error!("❌ Signal listener error: {}", err),
    }

    for scheduler in &schedulers {
        scheduler.stop();
    }
    for (_, engine) in &engines {
        engine.stop_scraping();
    }
    let _ = shutdown_tx.send(true);

    info!("⏳ Waiting for running scrapes to finish (timeout: 10s)...");
    let drained = tokio::time::timeout(Duration::from_secs(10), async {
        for (_, engine) in &engines {
            engine.wait_idle().await;
        }
        if let Some(handle) = metrics_handle {
            let _ = handle.await;
        }
    })
    .await;

    if drained.is_err() {
        warn!("Shutdown timeout elapsed with work still in flight");
    }

    info!("💤 DSE SCRAPE ENGINE: OFFLINE");
    Ok(())
}
