// =============================================================================
// coordinator.rs — BOUNDED FAN-OUT, BUFFERED FAN-IN
// =============================================================================
//
// Given N units and a per-unit fetch function, keep at most `concurrency`
// fetches in flight, collect whatever comes back in arrival order, and tick
// the progress reporter once per finished unit.
//
// Rules of the road:
//   - a unit that errors, panics or returns nothing contributes zero records
//     but still counts as completed, exactly once
//   - progress goes 1, 2, ..., N with a constant total of N
//   - nothing is handed to storage until the whole fan-out has drained
//   - once the cancel flag is up, units that have not started are skipped
// =============================================================================

use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::stream::{self, StreamExt};
use futures::FutureExt;
use tracing::{debug, info, warn};

use crate::engine::{panic_message, CancelFlag, ProgressReporter};
use crate::error::ScrapeError;
use crate::models::ScrapeUnit;

/// Default number of in-flight unit fetches.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// A unit that produced an error or a panic instead of records.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitFailure {
    pub unit: ScrapeUnit,
    pub reason: String,
}

/// Everything the fan-out produced.
#[derive(Debug)]
pub struct FetchOutcome<T> {
    pub records: Vec<T>,
    pub total: usize,
    pub completed: usize,
    /// Units that returned at least one record.
    pub succeeded: usize,
    /// Units that returned an empty list.
    pub empty: usize,
    pub failures: Vec<UnitFailure>,
    /// The cancel flag was raised during the fan-out.
    pub cancelled: bool,
}

impl<T> FetchOutcome<T> {
    fn new(total: usize) -> Self {
        Self {
            records: Vec::new(),
            total,
            completed: 0,
            succeeded: 0,
            empty: 0,
            failures: Vec::new(),
            cancelled: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FetchCoordinator {
    concurrency: usize,
}

impl Default for FetchCoordinator {
    fn default() -> Self {
        Self::new(DEFAULT_CONCURRENCY)
    }
}

impl FetchCoordinator {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Fetch every unit with bounded concurrency.
    pub async fn run<T, F, Fut>(
        &self,
        units: Vec<ScrapeUnit>,
        fetch: F,
        progress: &ProgressReporter,
        cancel: &CancelFlag,
    ) -> FetchOutcome<T>
    where
        T: Send,
        F: Fn(ScrapeUnit) -> Fut + Sync,
        Fut: Future<Output = Result<Vec<T>, ScrapeError>> + Send,
    {
        let total = units.len();
        progress.begin(total);

        let mut outcome = FetchOutcome::new(total);
        if total == 0 {
            return outcome;
        }

        info!(
            units = total,
            concurrency = self.concurrency,
            "Fanning out over {} units",
            total
        );

        let fetch = &fetch;
        let mut results = stream::iter(units)
            .map(|unit| async move {
                if cancel.is_cancelled() {
                    return (unit, None);
                }
                let result = AssertUnwindSafe(fetch(unit.clone())).catch_unwind().await;
                (unit, Some(result))
            })
            .buffer_unordered(self.concurrency);

        while let Some((unit, result)) = results.next().await {
            let Some(result) = result else {
                continue;
            };

            outcome.completed += 1;

            match result {
                Ok(Ok(records)) if records.is_empty() => {
                    debug!(unit = %unit, "Unit returned no records");
                    outcome.empty += 1;
                }
                Ok(Ok(records)) => {
                    debug!(unit = %unit, records = records.len(), "Unit fetched");
                    outcome.succeeded += 1;
                    outcome.records.extend(records);
                }
                Ok(Err(e)) => {
                    warn!(unit = %unit, error = %e, "Unit failed, skipping");
                    progress.record_failure();
                    outcome.failures.push(UnitFailure {
                        unit,
                        reason: e.to_string(),
                    });
                }
                Err(panic) => {
                    let reason = panic_message(panic.as_ref());
                    warn!(unit = %unit, reason = %reason, "Unit panicked, skipping");
                    progress.record_failure();
                    outcome.failures.push(UnitFailure { unit, reason });
                }
            }

            progress.report(outcome.completed, total);
        }

        outcome.cancelled = cancel.is_cancelled();

        info!(
            total = total,
            completed = outcome.completed,
            succeeded = outcome.succeeded,
            empty = outcome.empty,
            failed = outcome.failures.len(),
            records = outcome.records.len(),
            cancelled = outcome.cancelled,
            "Fan-out drained"
        );

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn units(ids: &[&str]) -> Vec<ScrapeUnit> {
        ids.iter().map(|id| ScrapeUnit::from(*id)).collect()
    }

    fn recording_reporter() -> (ProgressReporter, Arc<Mutex<Vec<(usize, usize)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let reporter = ProgressReporter::new(
            Some(Arc::new(move |done, total| sink.lock().push((done, total)))),
            None,
        );
        (reporter, seen)
    }

    #[tokio::test]
    async fn test_failing_unit_is_isolated() {
        let (progress, seen) = recording_reporter();
        let outcome = FetchCoordinator::default()
            .run(
                units(&["1", "2", "3"]),
                |unit: ScrapeUnit| async move {
                    if unit.as_str() == "2" {
                        return Err(ScrapeError::network("2", "connection reset"));
                    }
                    Ok(vec![format!("{unit}-a"), format!("{unit}-b")])
                },
                &progress,
                &CancelFlag::new(),
            )
            .await;

        assert_eq!(outcome.records.len(), 4);
        assert_eq!(outcome.completed, 3);
        assert_eq!(outcome.succeeded, 2);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].unit.as_str(), "2");
        assert!(!outcome.cancelled);
        assert_eq!(seen.lock().last(), Some(&(3, 3)));
        assert_eq!(progress.summary().units_failed, 1);
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_with_constant_total() {
        let (progress, seen) = recording_reporter();
        let ids: Vec<String> = (0..25).map(|i| i.to_string()).collect();
        let unit_list: Vec<ScrapeUnit> = ids.iter().map(|id| ScrapeUnit::from(id.as_str())).collect();

        FetchCoordinator::new(4)
            .run(
                unit_list,
                |unit: ScrapeUnit| async move {
                    let n: u64 = unit.as_str().parse().unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis((n * 7) % 13)).await;
                    Ok(vec![n])
                },
                &progress,
                &CancelFlag::new(),
            )
            .await;

        let seen = seen.lock();
        let completed: Vec<usize> = seen.iter().map(|(done, _)| *done).collect();
        assert_eq!(completed, (1..=25).collect::<Vec<_>>());
        assert!(seen.iter().all(|(_, total)| *total == 25));
    }

    #[tokio::test]
    async fn test_concurrency_bound_is_respected() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let outcome = FetchCoordinator::new(3)
            .run(
                units(&["a", "b", "c", "d", "e", "f", "g", "h", "i", "j"]),
                |_unit: ScrapeUnit| {
                    let in_flight = in_flight.clone();
                    let peak = peak.clone();
                    async move {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        Ok(vec![()])
                    }
                },
                &ProgressReporter::silent(),
                &CancelFlag::new(),
            )
            .await;

        assert_eq!(outcome.completed, 10);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_panicking_and_empty_units_still_complete() {
        let (progress, seen) = recording_reporter();
        let outcome = FetchCoordinator::new(2)
            .run(
                units(&["ok", "boom", "empty"]),
                |unit: ScrapeUnit| async move {
                    match unit.as_str() {
                        "boom" => panic!("bad cell"),
                        "empty" => Ok(Vec::new()),
                        _ => Ok(vec![1_u8]),
                    }
                },
                &progress,
                &CancelFlag::new(),
            )
            .await;

        assert_eq!(outcome.completed, 3);
        assert_eq!(outcome.records, vec![1]);
        assert_eq!(outcome.empty, 1);
        assert_eq!(outcome.failures[0].reason, "bad cell");
        assert_eq!(seen.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_cancel_skips_units_not_yet_started() {
        let cancel = CancelFlag::new();
        let outcome = FetchCoordinator::new(1)
            .run(
                units(&["1", "2", "3", "4"]),
                |unit: ScrapeUnit| {
                    let cancel = cancel.clone();
                    async move {
                        cancel.cancel();
                        Ok(vec![unit])
                    }
                },
                &ProgressReporter::silent(),
                &cancel,
            )
            .await;

        assert!(outcome.cancelled);
        assert!(outcome.completed < 4);
        assert_eq!(outcome.total, 4);
    }

    #[tokio::test]
    async fn test_no_units_no_progress() {
        let (progress, seen) = recording_reporter();
        let outcome = FetchCoordinator::default()
            .run(
                Vec::new(),
                |_unit: ScrapeUnit| async move { Ok(vec![0_u8]) },
                &progress,
                &CancelFlag::new(),
            )
            .await;

        assert_eq!(outcome.completed, 0);
        assert!(seen.lock().is_empty());
    }
}
