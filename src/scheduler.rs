//! Interval-driven auto-close scheduler.
//!
//! The scheduler owns a single timer task that runs the settlement sweep on a
//! fixed interval, plus counters for operator visibility. It deliberately
//! holds no sweep lock: a timer-driven sweep and a manually triggered one may
//! overlap, and the settlement layer's status compare-and-swap makes the
//! overlap harmless.

use crate::domain::TimeMs;
use crate::engine::{SettlementPipeline, SweepReport};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, Default)]
struct SweepStats {
    executions: u64,
    positions_closed: u64,
    last_run: Option<TimeMs>,
}

struct TimerHandle {
    task: JoinHandle<()>,
    stop: Arc<Notify>,
    interval_minutes: u64,
    // When the timer itself last fired. Kept apart from `SweepStats::last_run`
    // so a manual sweep does not shift the next-run estimate.
    last_tick: Arc<Mutex<Option<TimeMs>>>,
}

/// Cumulative sweep counters.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepCounters {
    pub executions: u64,
    pub positions_closed: u64,
}

/// Operator-facing scheduler snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub running: bool,
    pub interval_minutes: Option<u64>,
    pub last_run: Option<TimeMs>,
    pub next_run_estimate: Option<TimeMs>,
    pub stats: SweepCounters,
}

/// Periodically settles expired positions via the settlement pipeline.
pub struct AutoCloseScheduler {
    settlement: Arc<SettlementPipeline>,
    stats: Arc<Mutex<SweepStats>>,
    timer: Mutex<Option<TimerHandle>>,
}

impl AutoCloseScheduler {
    pub fn new(settlement: Arc<SettlementPipeline>) -> Self {
        Self {
            settlement,
            stats: Arc::new(Mutex::new(SweepStats::default())),
            timer: Mutex::new(None),
        }
    }

    /// Start the timer: one sweep immediately, then every `interval_minutes`.
    ///
    /// Returns false without touching the existing timer when already running.
    pub async fn start(&self, interval_minutes: u64) -> bool {
        let mut timer = self.timer.lock().await;
        if timer.is_some() {
            return false;
        }

        let stop = Arc::new(Notify::new());
        let last_tick = Arc::new(Mutex::new(None));
        let settlement = self.settlement.clone();
        let stats = self.stats.clone();
        let stop_signal = stop.clone();
        let tick_mark = last_tick.clone();

        let task = tokio::spawn(async move {
            let period = Duration::from_secs(interval_minutes.saturating_mul(60));
            let mut ticker = tokio::time::interval(period);
            // If a sweep overruns the period, run the late tick once rather
            // than bursting to catch up.
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = stop_signal.notified() => break,
                    // The first tick fires immediately.
                    _ = ticker.tick() => {
                        *tick_mark.lock().await = Some(TimeMs::now());
                        sweep_and_record(&settlement, &stats).await;
                    }
                }
            }
        });

        *timer = Some(TimerHandle {
            task,
            stop,
            interval_minutes,
            last_tick,
        });
        info!(interval_minutes, "auto-close scheduler started");
        true
    }

    /// Stop the timer, letting an in-flight sweep finish.
    ///
    /// Returns false when no timer was running.
    pub async fn stop(&self) -> bool {
        let handle = self.timer.lock().await.take();
        let Some(handle) = handle else {
            return false;
        };

        handle.stop.notify_one();
        if handle.task.await.is_err() {
            error!("auto-close timer task panicked");
        }
        info!("auto-close scheduler stopped");
        true
    }

    /// Run one sweep immediately, independent of the timer.
    ///
    /// # Errors
    /// Returns an error only when the open-position query fails; per-position
    /// settlement failures are counted inside the report.
    pub async fn run_once(&self) -> Result<SweepReport, sqlx::Error> {
        let report = self.settlement.run_sweep().await?;
        record(&self.stats, &report).await;
        Ok(report)
    }

    /// Current timer state and counters.
    pub async fn status(&self) -> SchedulerStatus {
        let stats = *self.stats.lock().await;
        let timer = self.timer.lock().await;

        let interval_minutes = timer.as_ref().map(|t| t.interval_minutes);
        let next_run_estimate = match &*timer {
            Some(t) => {
                let step = i64::try_from(t.interval_minutes.saturating_mul(60_000))
                    .unwrap_or(i64::MAX);
                t.last_tick
                    .lock()
                    .await
                    .map(|last| TimeMs::new(last.as_ms().saturating_add(step)))
            }
            None => None,
        };

        SchedulerStatus {
            running: timer.is_some(),
            interval_minutes,
            last_run: stats.last_run,
            next_run_estimate,
            stats: SweepCounters {
                executions: stats.executions,
                positions_closed: stats.positions_closed,
            },
        }
    }

    /// Zero the counters. The timer and `last_run` are untouched.
    pub async fn reset_stats(&self) {
        let mut stats = self.stats.lock().await;
        stats.executions = 0;
        stats.positions_closed = 0;
    }
}

async fn record(stats: &Mutex<SweepStats>, report: &SweepReport) {
    let mut stats = stats.lock().await;
    stats.executions += 1;
    stats.positions_closed += report.closed.len() as u64;
    stats.last_run = Some(TimeMs::now());
}

async fn sweep_and_record(settlement: &SettlementPipeline, stats: &Mutex<SweepStats>) {
    match settlement.run_sweep().await {
        Ok(report) => {
            if !report.closed.is_empty() || report.failed > 0 {
                info!(
                    examined = report.examined,
                    closed = report.closed.len(),
                    failed = report.failed,
                    "auto-close sweep finished"
                );
            }
            record(stats, &report).await;
        }
        Err(err) => {
            error!(error = %err, "auto-close sweep could not query open positions");
        }
    }
}
