//! Background thread that runs the overdue sweep on an interval.

use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info};

use crate::config::SweepConfig;
use crate::store::Store;
use crate::sweep::OverdueSweep;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Time between two ticks
    pub interval: Duration,
    /// Also send due-soon reminders on each tick
    pub remind_due_soon: bool,
    /// Run one tick right after start
    pub run_on_start: bool,
    /// Thread name, also used in logs
    pub name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from_sweep(&SweepConfig::default())
    }
}

impl SchedulerConfig {
    pub fn from_sweep(sweep: &SweepConfig) -> Self {
        Self {
            interval: sweep.interval(),
            remind_due_soon: sweep.remind_due_soon,
            run_on_start: true,
            name: "overdue-sweep".to_string(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_run_on_start(mut self, run: bool) -> Self {
        self.run_on_start = run;
        self
    }

    pub fn with_reminders(mut self, remind: bool) -> Self {
        self.remind_due_soon = remind;
        self
    }
}

/// Scheduler runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchedulerStats {
    pub runs: u64,
    pub orders_marked_overdue: u64,
    pub reminders_sent: u64,
    pub errors: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub uptime_secs: u64,
}

/// Outcome of one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub marked_overdue: usize,
    pub reminders_sent: usize,
    pub failed: bool,
}

enum Command {
    RunNow(mpsc::Sender<TickReport>),
    Shutdown,
}

/// Handle to control a running scheduler.
#[derive(Debug)]
pub struct SchedulerHandle {
    commands: mpsc::Sender<Command>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<SchedulerStats>>,
}

impl SchedulerHandle {
    /// Request graceful shutdown and wait for the current tick to finish.
    pub fn shutdown(mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }

    /// Current scheduler statistics.
    pub fn stats(&self) -> SchedulerStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Run a tick now and wait for it. `None` if the scheduler has stopped.
    pub fn run_now(&self) -> Option<TickReport> {
        let (reply, report) = mpsc::channel();
        self.commands.send(Command::RunNow(reply)).ok()?;
        report.recv().ok()
    }
}

pub struct SweepScheduler<S> {
    sweep: Arc<OverdueSweep<S>>,
}

impl<S: Store + 'static> SweepScheduler<S> {
    pub fn new(sweep: Arc<OverdueSweep<S>>) -> Self {
        Self { sweep }
    }

    /// Start the scheduler thread.
    pub fn spawn(self, config: SchedulerConfig) -> std::io::Result<SchedulerHandle> {
        let (commands_tx, commands_rx) = mpsc::channel::<Command>();
        let stats = Arc::new(Mutex::new(SchedulerStats::default()));
        let stats_clone = stats.clone();

        let join = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || scheduler_loop(&self.sweep, &config, &commands_rx, &stats_clone))?;

        Ok(SchedulerHandle {
            commands: commands_tx,
            join: Some(join),
            stats,
        })
    }
}

fn scheduler_loop<S: Store>(
    sweep: &OverdueSweep<S>,
    config: &SchedulerConfig,
    commands: &mpsc::Receiver<Command>,
    stats: &Mutex<SchedulerStats>,
) {
    info!(scheduler = %config.name, interval_secs = config.interval.as_secs(), "sweep scheduler started");
    let started = Instant::now();
    let mut next_tick = Instant::now();
    if !config.run_on_start {
        next_tick += config.interval;
    }

    loop {
        let wait = next_tick.saturating_duration_since(Instant::now());
        match commands.recv_timeout(wait) {
            Ok(Command::Shutdown) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Ok(Command::RunNow(reply)) => {
                let report = tick(sweep, config, stats, started);
                let _ = reply.send(report);
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                tick(sweep, config, stats, started);
                next_tick = Instant::now() + config.interval;
            }
        }
    }

    info!(scheduler = %config.name, "sweep scheduler stopped");
}

fn tick<S: Store>(
    sweep: &OverdueSweep<S>,
    config: &SchedulerConfig,
    stats: &Mutex<SchedulerStats>,
    started: Instant,
) -> TickReport {
    let now = Utc::now();
    let mut report = TickReport::default();

    match sweep.sweep(now) {
        Ok(marked) => report.marked_overdue = marked,
        Err(err) => {
            error!(scheduler = %config.name, error = %err, "overdue sweep failed");
            report.failed = true;
        }
    }
    if config.remind_due_soon {
        match sweep.remind_due_soon(now) {
            Ok(sent) => report.reminders_sent = sent,
            Err(err) => {
                error!(scheduler = %config.name, error = %err, "due-soon reminders failed");
                report.failed = true;
            }
        }
    }
    debug!(scheduler = %config.name, ?report, "tick finished");

    let mut s = stats.lock().unwrap_or_else(PoisonError::into_inner);
    s.runs += 1;
    s.orders_marked_overdue += report.marked_overdue as u64;
    s.reminders_sent += report.reminders_sent as u64;
    if report.failed {
        s.errors += 1;
    }
    s.last_run_at = Some(now);
    s.uptime_secs = started.elapsed().as_secs();
    report
}
