//! Background consolidation worker.
//!
//! A long-lived tokio task wakes on a fixed interval, checks system load,
//! and walks today's shard of users through [`EntityResolver::consolidate_user`].
//! Users are sharded by day of month so the whole population is covered
//! over a few days without ever sweeping everyone at once. Operators can
//! force a cycle (or a single user) at any time via [`ConsolidationWorker::run_now`],
//! which bypasses the load gate.
//!
//! Each cycle is time-boxed. Users that do not fit in the budget are
//! deferred and picked up first in the next cycle, whatever their shard.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use aico_config::SchedulerConfig;
use aico_core::{unix_timestamp, ConsolidationState, GraphStore, RunReport, RunStatus};
use chrono::{Datelike, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::resolver::EntityResolver;

/// Where the worker currently is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerPhase {
    /// No cycle due.
    Idle,
    /// A cycle is due but held back (load gate).
    Scheduled,
    /// Walking users.
    Running,
    /// Cycle finished; everything eligible was processed or deferred.
    /// Transient: the worker returns to `Idle` to await the next trigger.
    Completed,
    /// Cycle aborted before per-user processing began. Cleared to
    /// `Scheduled` by the next trigger.
    Failed,
}

/// One-minute load average per core. Abstracted so tests can script load.
pub trait LoadProbe: Send + Sync {
    fn load_per_core(&self) -> f32;
}

/// Reads /proc/loadavg and divides by the core count. Errors read as an
/// idle machine rather than blocking consolidation forever.
pub struct SystemLoadProbe;

impl LoadProbe for SystemLoadProbe {
    fn load_per_core(&self) -> f32 {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1) as f32;
        let load = std::fs::read_to_string("/proc/loadavg")
            .ok()
            .and_then(|s| {
                s.split_whitespace()
                    .next()
                    .and_then(|first| first.parse::<f32>().ok())
            })
            .unwrap_or(0.0);
        load / cores
    }
}

/// Stable shard assignment for a user id.
pub fn shard_for_user(user_id: &str, shard_count: u32) -> u32 {
    let mut hasher = DefaultHasher::new();
    user_id.hash(&mut hasher);
    (hasher.finish() % u64::from(shard_count.max(1))) as u32
}

/// Which shard a tick-triggered cycle covers today.
pub fn todays_shard(shard_count: u32) -> u32 {
    Utc::now().day() % shard_count.max(1)
}

enum WorkerCommand {
    /// Run a cycle immediately, skipping the load gate. With a user id,
    /// only that user is processed; without one, every known user is.
    RunNow { user_id: Option<String> },
    Shutdown,
}

/// State shared between the worker loop and its observers. Per-user
/// scheduling records live in the graph store, not here, so they survive
/// worker restarts.
struct WorkerShared {
    phase: Mutex<SchedulerPhase>,
    reports: Mutex<Vec<RunReport>>,
    deferred: Mutex<Vec<String>>,
}

impl WorkerShared {
    fn new() -> Self {
        Self {
            phase: Mutex::new(SchedulerPhase::Idle),
            reports: Mutex::new(Vec::new()),
            deferred: Mutex::new(Vec::new()),
        }
    }

    fn set_phase(&self, phase: SchedulerPhase) {
        if let Ok(mut guard) = self.phase.lock() {
            *guard = phase;
        }
    }
}

struct WorkerInner {
    resolver: Arc<EntityResolver>,
    probe: Arc<dyn LoadProbe>,
    config: SchedulerConfig,
    shared: Arc<WorkerShared>,
}

impl WorkerInner {
    /// Runs one consolidation cycle. `only_user` restricts the cycle to a
    /// single user; `gated` applies the shard filter and the load gate
    /// (tick-triggered cycles are gated, operator-triggered ones are not).
    async fn run_cycle(&self, only_user: Option<String>, gated: bool) {
        if gated {
            let load = self.probe.load_per_core();
            if load > self.config.max_load_per_core {
                warn!(
                    load_per_core = load,
                    max = self.config.max_load_per_core,
                    "system busy, consolidation cycle held back"
                );
                self.shared.set_phase(SchedulerPhase::Scheduled);
                return;
            }
        }
        self.shared.set_phase(SchedulerPhase::Running);

        let users = match self.eligible_users(&only_user, gated) {
            Ok(users) => users,
            Err(err) => {
                error!(error = %err, "could not list users, aborting cycle");
                self.shared.set_phase(SchedulerPhase::Failed);
                return;
            }
        };

        let mut report = RunReport {
            started_at: unix_timestamp(),
            ..RunReport::default()
        };
        let started = Instant::now();
        let budget = Duration::from_secs(self.config.run_time_budget_secs);
        let mut deferred: Vec<String> = Vec::new();

        for (i, user_id) in users.iter().enumerate() {
            if started.elapsed() >= budget {
                deferred.extend(users[i..].iter().cloned());
                warn!(
                    remaining = users.len() - i,
                    "time budget exhausted, deferring the rest of the cycle"
                );
                break;
            }
            match self.resolver.consolidate_user(user_id).await {
                Ok(metrics) => {
                    report.users_succeeded += 1;
                    report.entities_processed += metrics.nodes_in;
                    report.merges += metrics.groups_merged;
                    report.degraded |= metrics.degraded;
                    self.record_state(user_id, RunStatus::Succeeded);
                }
                Err(err) => {
                    // One bad user never aborts the cycle.
                    error!(user_id, error = %err, "consolidation failed for user");
                    report.users_failed += 1;
                    self.record_state(
                        user_id,
                        RunStatus::Failed {
                            error: err.to_string(),
                        },
                    );
                }
            }
        }

        report.users_deferred = deferred.len();
        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            succeeded = report.users_succeeded,
            failed = report.users_failed,
            deferred = report.users_deferred,
            merges = report.merges,
            "consolidation cycle finished"
        );

        if let Ok(mut guard) = self.shared.deferred.lock() {
            *guard = deferred;
        }
        self.shared.set_phase(SchedulerPhase::Completed);
        if let Ok(mut guard) = self.shared.reports.lock() {
            guard.push(report);
        }
        // Terminal phase hands back to Idle until the next trigger.
        self.shared.set_phase(SchedulerPhase::Idle);
    }

    /// Deferred carryover first, then today's shard (or everyone for an
    /// ungated full run).
    fn eligible_users(
        &self,
        only_user: &Option<String>,
        gated: bool,
    ) -> anyhow::Result<Vec<String>> {
        if let Some(user_id) = only_user {
            return Ok(vec![user_id.clone()]);
        }
        let mut users: Vec<String> = match self.shared.deferred.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(_) => Vec::new(),
        };
        let shard = todays_shard(self.config.shard_count);
        for user_id in self.resolver.store().list_users()? {
            if users.contains(&user_id) {
                continue;
            }
            if !gated || shard_for_user(&user_id, self.config.shard_count) == shard {
                users.push(user_id);
            }
        }
        debug!(count = users.len(), shard, "cycle user list assembled");
        Ok(users)
    }

    fn record_state(&self, user_id: &str, status: RunStatus) {
        let state = ConsolidationState {
            user_id: user_id.to_string(),
            shard: shard_for_user(user_id, self.config.shard_count),
            last_run_at: Some(unix_timestamp()),
            last_status: status,
        };
        if let Err(err) = self.resolver.store().put_consolidation_state(&state) {
            error!(user_id, error = %err, "failed to persist consolidation state");
        }
    }
}

/// Handle to the background consolidation loop.
pub struct ConsolidationWorker {
    command_tx: mpsc::Sender<WorkerCommand>,
    handle: Option<JoinHandle<()>>,
    shared: Arc<WorkerShared>,
    store: Arc<dyn GraphStore>,
}

impl ConsolidationWorker {
    pub fn spawn(
        resolver: Arc<EntityResolver>,
        probe: Arc<dyn LoadProbe>,
        config: SchedulerConfig,
    ) -> Self {
        let (command_tx, mut command_rx) = mpsc::channel(16);
        let shared = Arc::new(WorkerShared::new());
        let store = resolver.store().clone();
        let inner = WorkerInner {
            resolver,
            probe,
            config: config.clone(),
            shared: shared.clone(),
        };

        let handle = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(config.trigger_interval_secs.max(1)));
            // The first tick completes immediately; skip it so spawning the
            // worker does not kick off a cycle.
            ticker.tick().await;
            info!(
                interval_secs = config.trigger_interval_secs,
                shards = config.shard_count,
                "consolidation worker started"
            );
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        inner.shared.set_phase(SchedulerPhase::Scheduled);
                        inner.run_cycle(None, true).await;
                    }
                    command = command_rx.recv() => {
                        match command {
                            Some(WorkerCommand::RunNow { user_id }) => {
                                inner.run_cycle(user_id, false).await;
                            }
                            Some(WorkerCommand::Shutdown) | None => {
                                info!("consolidation worker shutting down");
                                break;
                            }
                        }
                    }
                }
            }
        });

        Self {
            command_tx,
            handle: Some(handle),
            shared,
            store,
        }
    }

    /// Operator trigger. Runs a full cycle, or a single user's
    /// consolidation, outside the schedule and without the load gate.
    pub async fn run_now(&self, user_id: Option<String>) -> anyhow::Result<()> {
        self.command_tx
            .send(WorkerCommand::RunNow { user_id })
            .await
            .map_err(|_| anyhow::anyhow!("consolidation worker is gone"))
    }

    pub fn phase(&self) -> SchedulerPhase {
        self.shared
            .phase
            .lock()
            .map(|guard| *guard)
            .unwrap_or(SchedulerPhase::Failed)
    }

    /// Report of the most recently finished cycle, if any.
    pub fn last_report(&self) -> Option<RunReport> {
        self.shared
            .reports
            .lock()
            .ok()
            .and_then(|guard| guard.last().cloned())
    }

    /// Reads the user's persisted scheduling record from the graph store.
    pub fn state_of(&self, user_id: &str) -> Option<ConsolidationState> {
        self.store.consolidation_state(user_id).ok().flatten()
    }

    pub async fn shutdown(mut self) {
        let _ = self.command_tx.send(WorkerCommand::Shutdown).await;
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                error!(error = %err, "consolidation worker task panicked");
            }
        }
    }
}
