// =============================================================================
// engine.rs — THE SINGLE-FLIGHT RUN TEMPLATE
// =============================================================================
//
// Every data domain runs through the same template:
//
//   start_scraping()  -> single-flight check -> spawn the run -> return
//   run               -> job.execute(ctx) under catch_unwind
//   finalize          -> build the RunReport, clear the running flag,
//                        fire the completion callback exactly once
//
// The domain-specific part is the `ScrapeJob`. It gets a `RunContext` with a
// progress reporter and a cancellation flag, and whatever it returns (or
// however it panics) is turned into a report. Nothing a job does can leave
// the engine stuck in the "running" state or escape as an error to whoever
// pressed the button.
// =============================================================================

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use parking_lot::RwLock;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::error::ScrapeError;
use crate::metrics::MetricsCollector;
use crate::models::{RunOutcome, RunReport, RunSummary};

/// `progress(completed, total)`; may fire many times per run.
pub type ProgressCallback = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Fires exactly once per run, whatever the outcome.
pub type CompletionCallback = Arc<dyn Fn() + Send + Sync>;

/// Cooperative stop request. Checked between units; never interrupts a
/// request that is already on the wire.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Per-run progress tracking. Forwards `(completed, total)` to the caller's
/// callback and keeps the latest counts so the engine can still fill in a
/// report when the job fails halfway through.
pub struct ProgressReporter {
    callback: Option<ProgressCallback>,
    metrics: Option<Arc<MetricsCollector>>,
    total: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
}

impl ProgressReporter {
    pub fn new(callback: Option<ProgressCallback>, metrics: Option<Arc<MetricsCollector>>) -> Self {
        Self {
            callback,
            metrics,
            total: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
        }
    }

    /// A reporter that only counts. Useful when driving the coordinator
    /// outside an engine.
    pub fn silent() -> Self {
        Self::new(None, None)
    }

    /// Announce the size of the run before any unit completes.
    pub fn begin(&self, total: usize) {
        self.total.store(total, Ordering::Relaxed);
        self.completed.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
    }

    pub fn report(&self, completed: usize, total: usize) {
        self.total.store(total, Ordering::Relaxed);
        self.completed.store(completed, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.increment_units_completed();
        }

        debug!(completed = completed, total = total, "{}/{} processed", completed, total);

        if let Some(callback) = &self.callback {
            callback(completed, total);
        }
    }

    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.increment_unit_failures();
        }
    }

    /// Latest counts as a summary with nothing stored.
    pub fn summary(&self) -> RunSummary {
        RunSummary {
            units_total: self.total.load(Ordering::Relaxed),
            units_completed: self.completed.load(Ordering::Relaxed),
            units_failed: self.failed.load(Ordering::Relaxed),
            records_stored: 0,
        }
    }
}

/// What a job gets to work with during one run.
pub struct RunContext {
    pub run_id: Uuid,
    pub progress: ProgressReporter,
    pub cancel: CancelFlag,
}

/// The domain-specific execute step of a run.
#[async_trait]
pub trait ScrapeJob: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Obtain units, fetch them, store the result. Errors and panics are
    /// caught by the engine.
    async fn execute(&self, ctx: &RunContext) -> Result<RunSummary, ScrapeError>;
}

#[derive(Clone, Default)]
struct Callbacks {
    progress: Option<ProgressCallback>,
    completion: Option<CompletionCallback>,
}

struct EngineInner {
    job: Arc<dyn ScrapeJob>,
    running: AtomicBool,
    cancel: CancelFlag,
    callbacks: RwLock<Callbacks>,
    last_report: RwLock<Option<RunReport>>,
    /// True from a successful start until the completion callback returns,
    /// or longer if that callback started the next run.
    busy: watch::Sender<bool>,
    metrics: Arc<MetricsCollector>,
}

/// A handle on one job's run lifecycle. Cheap to clone; all clones share the
/// same single-flight guard.
#[derive(Clone)]
pub struct ScrapeEngine {
    inner: Arc<EngineInner>,
}

impl ScrapeEngine {
    pub fn new(job: Arc<dyn ScrapeJob>, metrics: Arc<MetricsCollector>) -> Self {
        let (busy, _) = watch::channel(false);
        Self {
            inner: Arc::new(EngineInner {
                job,
                running: AtomicBool::new(false),
                cancel: CancelFlag::new(),
                callbacks: RwLock::new(Callbacks::default()),
                last_report: RwLock::new(None),
                busy,
                metrics,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.job.name()
    }

    /// Install (or clear) the callbacks. Takes effect from the next run.
    pub fn set_callbacks(
        &self,
        progress: Option<ProgressCallback>,
        completion: Option<CompletionCallback>,
    ) {
        *self.inner.callbacks.write() = Callbacks { progress, completion };
    }

    pub fn is_scraping(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Start a run in the background. Returns false (and logs a warning)
    /// when a run is already in progress, or when there is no tokio runtime
    /// to run it on.
    pub fn start_scraping(&self) -> bool {
        let name = self.name();

        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!(job = name, "Scraping already in progress");
            self.inner.metrics.increment_runs_rejected();
            return false;
        }

        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                self.inner.running.store(false, Ordering::Release);
                error!(job = name, error = %e, "Cannot start scraping outside a tokio runtime");
                return false;
            }
        };

        self.inner.cancel.reset();
        self.inner.busy.send_replace(true);
        self.inner.metrics.increment_runs_started();

        let run_id = Uuid::new_v4();
        let span = info_span!("scrape_run", job = name, run_id = %run_id);
        let inner = self.inner.clone();
        handle.spawn(inner.run(run_id).instrument(span));

        true
    }

    /// Ask the current run to stop after its in-flight units. Returns false
    /// when nothing is running.
    pub fn stop_scraping(&self) -> bool {
        if !self.is_scraping() {
            return false;
        }
        info!(job = self.name(), "Stop requested, no new units will be dispatched");
        self.inner.cancel.cancel();
        true
    }

    pub fn last_report(&self) -> Option<RunReport> {
        self.inner.last_report.read().clone()
    }

    /// Resolves once no run is in progress and the last completion callback
    /// has returned.
    pub async fn wait_idle(&self) {
        let mut busy = self.inner.busy.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = busy.wait_for(|busy| !*busy).await;
    }
}

impl EngineInner {
    async fn run(self: Arc<Self>, run_id: Uuid) {
        let started_at = Utc::now();
        let callbacks = self.callbacks.read().clone();

        let ctx = RunContext {
            run_id,
            progress: ProgressReporter::new(callbacks.progress.clone(), Some(self.metrics.clone())),
            cancel: self.cancel.clone(),
        };

        info!("Scraping started");

        let result = AssertUnwindSafe(self.job.execute(&ctx)).catch_unwind().await;

        let partial = ctx.progress.summary();
        let (summary, outcome) = match result {
            Ok(Ok(summary)) if summary.records_stored > 0 => (summary, RunOutcome::Succeeded),
            Ok(Ok(summary)) => (summary, RunOutcome::NothingToStore),
            Ok(Err(ScrapeError::Cancelled)) => (partial, RunOutcome::Cancelled),
            Ok(Err(e)) => {
                error!(error = %e, "Scraping failed");
                (partial, RunOutcome::Failed(e.to_string()))
            }
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                error!(reason = %reason, "Scraping panicked");
                (partial, RunOutcome::Panicked(reason))
            }
        };

        let report = RunReport {
            run_id,
            job: self.job.name(),
            started_at,
            finished_at: Utc::now(),
            units_total: summary.units_total,
            units_completed: summary.units_completed,
            units_failed: summary.units_failed,
            records_stored: summary.records_stored,
            outcome,
        };

        self.metrics.record_outcome(&report.outcome);
        self.metrics.add_records_stored(report.records_stored);

        info!(
            outcome = %report.outcome,
            units_total = report.units_total,
            units_completed = report.units_completed,
            units_failed = report.units_failed,
            records_stored = report.records_stored,
            duration_ms = report.duration_ms(),
            "Scraping finished"
        );

        *self.last_report.write() = Some(report);
        self.running.store(false, Ordering::Release);

        if let Some(completion) = callbacks.completion {
            if std::panic::catch_unwind(AssertUnwindSafe(|| completion())).is_err() {
                error!("Completion callback panicked");
            }
        }

        // The callback may have started another run; that run owns `busy` now.
        self.busy.send_if_modified(|busy| {
            if *busy && !self.running.load(Ordering::Acquire) {
                *busy = false;
                true
            } else {
                false
            }
        });
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
