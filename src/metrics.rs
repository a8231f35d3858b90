// ═══════════════════════════════════════════════════════════════
// METRICS COLLECTOR - How many runs, how many units, how many rows
// ═══════════════════════════════════════════════════════════════
//
// Atomic counters shared by every engine in the process, plus a tiny
// raw-TCP endpoint that answers any connection with a JSON snapshot.
// No routing, no framework: `curl localhost:9090` is the whole API.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{error, info};
use serde::Serialize;

use crate::models::RunOutcome;

/// The metrics snapshot - what gets serialized to JSON
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub runs_started: u64,
    pub runs_succeeded: u64,
    pub runs_failed: u64,
    pub runs_cancelled: u64,
    pub runs_rejected: u64,
    pub units_completed: u64,
    pub unit_failures: u64,
    pub records_stored: u64,
    pub circuit_breaker_trips: u64,
    pub uptime_seconds: u64,
    pub status: String,
}

/// Thread-safe atomic metrics collector
#[derive(Debug)]
pub struct MetricsCollector {
    runs_started: AtomicU64,
    runs_succeeded: AtomicU64,
    runs_failed: AtomicU64,
    runs_cancelled: AtomicU64,
    runs_rejected: AtomicU64,
    units_completed: AtomicU64,
    unit_failures: AtomicU64,
    records_stored: AtomicU64,
    circuit_breaker_trips: AtomicU64,
    start_time: Instant,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            runs_started: AtomicU64::new(0),
            runs_succeeded: AtomicU64::new(0),
            runs_failed: AtomicU64::new(0),
            runs_cancelled: AtomicU64::new(0),
            runs_rejected: AtomicU64::new(0),
            units_completed: AtomicU64::new(0),
            unit_failures: AtomicU64::new(0),
            records_stored: AtomicU64::new(0),
            circuit_breaker_trips: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn increment_runs_started(&self) {
        self.runs_started.fetch_add(1, Ordering::Relaxed);
    }

    /// A start request bounced off the single-flight guard.
    pub fn increment_runs_rejected(&self) {
        self.runs_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_units_completed(&self) {
        self.units_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_unit_failures(&self) {
        self.unit_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_records_stored(&self, count: u64) {
        self.records_stored.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_circuit_breaker_trips(&self, count: u64) {
        self.circuit_breaker_trips.fetch_add(count, Ordering::Relaxed);
    }

    /// Tally a finished run by its outcome.
    pub fn record_outcome(&self, outcome: &RunOutcome) {
        let counter = match outcome {
            outcome if outcome.is_success() => &self.runs_succeeded,
            RunOutcome::Cancelled => &self.runs_cancelled,
            _ => &self.runs_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a snapshot of all metrics (lock-free reads)
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            runs_started: self.runs_started.load(Ordering::Relaxed),
            runs_succeeded: self.runs_succeeded.load(Ordering::Relaxed),
            runs_failed: self.runs_failed.load(Ordering::Relaxed),
            runs_cancelled: self.runs_cancelled.load(Ordering::Relaxed),
            runs_rejected: self.runs_rejected.load(Ordering::Relaxed),
            units_completed: self.units_completed.load(Ordering::Relaxed),
            unit_failures: self.unit_failures.load(Ordering::Relaxed),
            records_stored: self.records_stored.load(Ordering::Relaxed),
            circuit_breaker_trips: self.circuit_breaker_trips.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            status: "operational".to_string(),
        }
    }
}

/// Serve JSON snapshots on `0.0.0.0:{port}` until the shutdown channel flips.
pub async fn run_metrics_server(
    metrics: Arc<MetricsCollector>,
    port: u16,
    shutdown: &mut watch::Receiver<bool>,
) {
    use tokio::net::TcpListener;
    use tokio::io::AsyncWriteExt;

    let listener = match TcpListener::bind(("0.0.0.0", port)).await {
        Ok(l) => l,
        Err(e) => {
            error!(port = port, "Failed to bind metrics server: {}", e);
            return;
        }
    };

    info!(port = port, "📊 Metrics server listening");

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((mut stream, _addr)) => {
                        let snapshot = metrics.snapshot();
                        let json = serde_json::to_string_pretty(&snapshot)
                            .unwrap_or_else(|_| "{}".to_string());

                        let response = format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            json.len(),
                            json,
                        );

                        let _ = stream.write_all(response.as_bytes()).await;
                    }
                    Err(e) => {
                        error!("Metrics server accept error: {}", e);
                    }
                }
            }
            _ = shutdown.changed() => {
                info!("Metrics server: shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcomes_land_in_the_right_bucket() {
        let metrics = MetricsCollector::new();
        metrics.record_outcome(&RunOutcome::Succeeded);
        metrics.record_outcome(&RunOutcome::NothingToStore);
        metrics.record_outcome(&RunOutcome::Cancelled);
        metrics.record_outcome(&RunOutcome::Failed("db".into()));
        metrics.record_outcome(&RunOutcome::Panicked("boom".into()));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.runs_succeeded, 2);
        assert_eq!(snapshot.runs_cancelled, 1);
        assert_eq!(snapshot.runs_failed, 2);
    }

    #[tokio::test]
    async fn test_metrics_server_serves_json_and_stops() {
        use tokio::io::AsyncReadExt;

        let metrics = Arc::new(MetricsCollector::new());
        metrics.add_records_stored(42);

        // Grab a free port, then hand it to the server.
        let port = {
            let scratch = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            scratch.local_addr().unwrap().port()
        };

        let (tx, mut rx) = watch::channel(false);
        let server = tokio::spawn({
            let metrics = metrics.clone();
            async move { run_metrics_server(metrics, port, &mut rx).await }
        });

        let mut body = String::new();
        for _ in 0..50 {
            if let Ok(mut stream) = tokio::net::TcpStream::connect(("127.0.0.1", port)).await {
                stream.read_to_string(&mut body).await.unwrap();
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(body.starts_with("HTTP/1.1 200 OK"));
        assert!(body.contains("\"records_stored\": 42"));

        tx.send(true).unwrap();
        server.await.unwrap();
    }
}
