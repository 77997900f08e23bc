use std::io;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, info};

use crate::jobs::JobStore;
use crate::orchestrator::{Orchestrator, SweepReport};

/// Totals across all sweep passes since the sweeper started.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweeperStats {
    pub runs: u64,
    pub requeued: u64,
    pub leases_expired: u64,
    pub failures_routed: u64,
    pub idempotency_pruned: u64,
}

impl SweeperStats {
    fn record(&mut self, report: SweepReport) {
        self.runs += 1;
        self.requeued += report.requeued as u64;
        self.leases_expired += report.leases_expired as u64;
        self.failures_routed += report.failures_routed as u64;
        self.idempotency_pruned += report.idempotency_pruned as u64;
    }
}

/// Handle to control and join the sweeper thread.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<SweeperStats>>,
}

impl SweeperHandle {
    pub fn stats(&self) -> SweeperStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Request shutdown and wait for the current pass to finish.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Periodic driver for lease expiry, failure routing, retry promotion and
/// idempotency pruning.
#[derive(Debug)]
pub struct Sweeper;

impl Sweeper {
    pub fn spawn<S>(orchestrator: Arc<Orchestrator<S>>, interval: Duration) -> io::Result<SweeperHandle>
    where
        S: JobStore + Send + Sync + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(SweeperStats::default()));
        let stats_clone = stats.clone();

        let join = thread::Builder::new()
            .name("orchestrator-sweeper".to_string())
            .spawn(move || sweeper_loop(&orchestrator, interval, shutdown_rx, &stats_clone))?;

        info!(interval_ms = interval.as_millis() as u64, "sweeper started");
        Ok(SweeperHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }
}

fn sweeper_loop<S: JobStore>(
    orchestrator: &Orchestrator<S>,
    interval: Duration,
    shutdown_rx: mpsc::Receiver<()>,
    stats: &Mutex<SweeperStats>,
) {
    loop {
        match shutdown_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }

        let report = orchestrator.run_sweeps();
        if let Ok(mut s) = stats.lock() {
            s.record(report);
        }
    }
    debug!("sweeper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use orchestrator_core::{JobStatus, ManualClock, SubmitJob, WorkerId};

    #[test]
    fn sweeper_requeues_due_retries_and_stops_on_shutdown() {
        let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
        let config = OrchestratorConfig {
            retry: orchestrator_core::RetryPolicy::fixed(Duration::from_secs(1)),
            ..OrchestratorConfig::default()
        };
        let orchestrator = Arc::new(Orchestrator::in_memory(&config, clock.clone()));

        let job = orchestrator
            .submit(SubmitJob {
                tenant_id: "acme".to_string(),
                model: "gpt-4o".to_string(),
                ..SubmitJob::default()
            })
            .unwrap()
            .job;
        let worker = WorkerId::parse("w-1").unwrap();
        orchestrator.lease(&worker).unwrap().unwrap();
        let failed = orchestrator
            .complete(
                &worker,
                job.id,
                crate::lease::Completion::Failed {
                    error_code: "TIMEOUT".to_string(),
                    error_message: "upstream timed out".to_string(),
                    tokens: 0,
                    cost_usd: 0.0,
                },
            )
            .unwrap();
        assert_eq!(failed.status, JobStatus::RetryScheduled);

        clock.advance(chrono::Duration::seconds(2));
        let handle = Sweeper::spawn(orchestrator.clone(), Duration::from_millis(10)).unwrap();

        let mut requeued = false;
        for _ in 0..200 {
            if orchestrator.get_job(job.id).unwrap().job.status == JobStatus::Queued {
                requeued = true;
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(requeued);
        assert!(handle.stats().runs >= 1);
        handle.shutdown();
    }
}
