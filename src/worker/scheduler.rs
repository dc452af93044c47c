//! Relay scheduler: start/stop control around the cycle runner.
//!
//! The scheduler provides:
//! - `start()`: arm a fixed interval; every tick spawns a tracked cycle
//! - `stop()`: cancel, flip to stopped, drain in-flight cycles (bounded)
//! - `run_once()`: one immediate cycle, independent of the armed schedule
//! - status queries (`is_running`, `next_run_time`, `last_run_time`)
//!
//! All mutable state sits behind one `std::sync::Mutex` that is never held
//! across an await point.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::SchedulerError;
use crate::pipeline::{CycleRunner, CycleSummary, MetricsSnapshot};

/// Default upper bound on how long `stop()` waits for in-flight cycles.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(30);

struct SchedulerState {
    running: bool,
    /// Handed to every cycle; replaced with a fresh token on stop.
    cancel: CancellationToken,
    ticker: Option<JoinHandle<()>>,
    next_run: Option<DateTime<Utc>>,
    last_run_start: Option<DateTime<Utc>>,
    last_run_end: Option<DateTime<Utc>>,
}

/// Snapshot returned by `Scheduler::status()`.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub last_run_end: Option<DateTime<Utc>>,
    pub in_flight: usize,
    pub interval_secs: u64,
    pub metrics: MetricsSnapshot,
}

pub struct Scheduler {
    runner: Arc<CycleRunner>,
    interval: Duration,
    interval_delta: chrono::Duration,
    stop_grace: Duration,
    state: Arc<Mutex<SchedulerState>>,
    tracker: TaskTracker,
}

fn lock(state: &Mutex<SchedulerState>) -> MutexGuard<'_, SchedulerState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

impl Scheduler {
    /// Create a stopped scheduler. `interval` must be non-zero.
    pub fn new(
        runner: Arc<CycleRunner>,
        interval: Duration,
        stop_grace: Duration,
    ) -> Result<Self, SchedulerError> {
        if interval.is_zero() {
            return Err(SchedulerError::InvalidInterval(interval));
        }
        let interval_delta = chrono::Duration::from_std(interval)
            .map_err(|_| SchedulerError::InvalidInterval(interval))?;

        Ok(Self {
            runner,
            interval,
            interval_delta,
            stop_grace,
            state: Arc::new(Mutex::new(SchedulerState {
                running: false,
                cancel: CancellationToken::new(),
                ticker: None,
                next_run: None,
                last_run_start: None,
                last_run_end: None,
            })),
            tracker: TaskTracker::new(),
        })
    }

    /// Arm the interval. Errors with `AlreadyRunning` if already started.
    pub fn start(&self) -> Result<(), SchedulerError> {
        let mut state = lock(&self.state);
        if state.running {
            return Err(SchedulerError::AlreadyRunning);
        }

        state.running = true;
        state.next_run = Utc::now().checked_add_signed(self.interval_delta);
        state.ticker = Some(spawn_ticker(
            Arc::clone(&self.runner),
            Arc::clone(&self.state),
            self.tracker.clone(),
            self.interval,
            self.interval_delta,
            state.cancel.clone(),
        ));

        info!(interval_secs = self.interval.as_secs(), "Scheduler started");
        Ok(())
    }

    /// Stop the schedule and wait (up to the grace period) for in-flight
    /// cycles. A no-op when already stopped. `is_running()` reports false
    /// as soon as this is called.
    pub async fn stop(&self) {
        let ticker = {
            let mut state = lock(&self.state);
            if !state.running {
                return;
            }
            state.running = false;
            state.next_run = None;
            state.cancel.cancel();
            state.cancel = CancellationToken::new();
            state.ticker.take()
        };

        if let Some(ticker) = ticker {
            ticker.abort();
        }

        let in_flight = self.tracker.len();
        if in_flight > 0 {
            info!(in_flight, "Waiting for in-flight cycles to finish");
        }

        self.tracker.close();
        if tokio::time::timeout(self.stop_grace, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                in_flight = self.tracker.len(),
                grace_secs = self.stop_grace.as_secs(),
                "Stop grace period elapsed with cycles still in flight"
            );
        }
        self.tracker.reopen();

        info!("Scheduler stopped");
    }

    /// Run one cycle now and return its summary. Works whether or not the
    /// schedule is armed and leaves the schedule untouched.
    pub async fn run_once(&self) -> CycleSummary {
        let cancel = lock(&self.state).cancel.clone();
        debug!("Manual cycle requested");
        self.tracker
            .track_future(execute_cycle(&self.runner, &self.state, &cancel))
            .await
    }

    pub fn is_running(&self) -> bool {
        lock(&self.state).running
    }

    /// When the next scheduled tick fires, if running.
    pub fn next_run_time(&self) -> Option<DateTime<Utc>> {
        lock(&self.state).next_run
    }

    /// Start time of the most recent cycle (scheduled or manual).
    pub fn last_run_time(&self) -> Option<DateTime<Utc>> {
        lock(&self.state).last_run_start
    }

    /// Cycles currently executing.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    pub fn status(&self) -> SchedulerStatus {
        let state = lock(&self.state);
        SchedulerStatus {
            running: state.running,
            next_run: state.next_run,
            last_run: state.last_run_start,
            last_run_end: state.last_run_end,
            in_flight: self.tracker.len(),
            interval_secs: self.interval.as_secs(),
            metrics: self.runner.metrics().snapshot(),
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        state.cancel.cancel();
        if let Some(ticker) = state.ticker.take() {
            ticker.abort();
        }
    }
}

/// Spawn the interval loop. The first tick is skipped so the first cycle
/// runs one interval after `start()`.
fn spawn_ticker(
    runner: Arc<CycleRunner>,
    state: Arc<Mutex<SchedulerState>>,
    tracker: TaskTracker,
    interval: Duration,
    interval_delta: chrono::Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            lock(&state).next_run = Utc::now().checked_add_signed(interval_delta);

            let runner = Arc::clone(&runner);
            let state = Arc::clone(&state);
            let cancel = cancel.clone();
            tracker.spawn(async move {
                execute_cycle(&runner, &state, &cancel).await;
            });
        }
        debug!("Scheduler ticker exited");
    })
}

async fn execute_cycle(
    runner: &CycleRunner,
    state: &Mutex<SchedulerState>,
    cancel: &CancellationToken,
) -> CycleSummary {
    lock(state).last_run_start = Some(Utc::now());
    let summary = runner.run_cycle(cancel).await;
    lock(state).last_run_end = Some(Utc::now());
    summary
}
