//! Scheduler and dispatch: the declared job table drives typed queues
//! consumed by per-queue workers.
//!
//! The dispatcher ticks every second, re-reading the catalog so operator
//! edits apply within one tick. Queued runs carry their enqueue instant;
//! a run that outlives its queue's TTL is dropped and counted instead of
//! executed. Hard time limits cancel the run at its next suspension point.

pub mod cron;
pub mod jobs;

pub use jobs::{default_catalog, JobSpec, QueueName, RunState, Schedule};

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SettingsHandle;
use crate::live::LiveLoop;
use crate::metrics::Metrics;
use crate::store::{FrameAggregator, TickStore};
use crate::upstream::payload::normalize_prematch_odds;
use crate::upstream::ApiFootballClient;

const FIXTURE_HORIZON_DAYS: i64 = 7;
const PREMATCH_WINDOW_HOURS: i64 = 24;
const FINALIZER_DELAY_MIN: i64 = 30;

/// Everything a job body can touch.
pub struct JobContext {
    store: Arc<TickStore>,
    live: Arc<LiveLoop>,
    frames: Arc<FrameAggregator>,
    client: ApiFootballClient,
    settings: SettingsHandle,
    /// Job names currently executing; a name runs on at most one worker at
    /// a time even though every queue has a pool.
    running: Mutex<HashSet<String>>,
}

/// Releases the running-set entry even when the run's future is dropped by
/// a hard-timeout cancellation.
struct RunningGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    name: &'a str,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(self.name);
    }
}

impl JobContext {
    pub fn new(
        store: Arc<TickStore>,
        live: Arc<LiveLoop>,
        frames: Arc<FrameAggregator>,
        client: ApiFootballClient,
        settings: SettingsHandle,
    ) -> Self {
        Self {
            store,
            live,
            frames,
            client,
            settings,
            running: Mutex::new(HashSet::new()),
        }
    }

    pub async fn execute(&self, job_name: &str) -> Result<()> {
        if !self.running.lock().insert(job_name.to_string()) {
            debug!(job = job_name, "previous run still active, skipping");
            return Ok(());
        }
        let _guard = RunningGuard {
            set: &self.running,
            name: job_name,
        };
        self.execute_inner(job_name).await
    }

    async fn execute_inner(&self, job_name: &str) -> Result<()> {
        match job_name {
            "live_trigger" => {
                let report = self.live.trigger().await?;
                if report.pulls_submitted > 0 {
                    debug!(
                        live = report.live_fixtures,
                        pulls = report.pulls_submitted,
                        failed = report.pulls_failed,
                        "live trigger done"
                    );
                }
                Ok(())
            }
            "frame_maker" => {
                self.frames.run_cycle(Utc::now())?;
                Ok(())
            }
            "fixture_poll" => self.poll_fixtures().await,
            "prematch_snapshot" => self.snapshot_prematch().await,
            "finalizer" => self.finalize_finished().await,
            "weekly_refresh" => {
                // Dimension rows ride along with fixture payloads, so a full
                // horizon re-poll refreshes league/team/venue names.
                self.poll_fixtures().await
            }
            "retention_maintenance" => {
                self.store.run_retention(Utc::now())?;
                Ok(())
            }
            other => anyhow::bail!("unknown job {other:?}"),
        }
    }

    /// Refresh upcoming fixtures over the configured horizon.
    async fn poll_fixtures(&self) -> Result<()> {
        let settings = self.settings.load();
        let leagues: Vec<Option<i64>> = if settings.enabled_leagues.is_empty() {
            vec![None]
        } else {
            settings.enabled_leagues.iter().map(|id| Some(*id)).collect()
        };

        let mut stored = 0usize;
        for day in 0..FIXTURE_HORIZON_DAYS {
            let date = (Utc::now() + chrono::Duration::days(day)).date_naive();
            for league in &leagues {
                let records = match self.client.fixtures_by_date(date, *league).await {
                    Ok(records) => records,
                    Err(e) => {
                        warn!(date = %date, error = %e, "fixture poll page failed");
                        continue;
                    }
                };
                for record in records {
                    let league_name = record.league.name.clone();
                    let league_country = record.league.country.clone();
                    let home_name = record.teams.home.name.clone();
                    let away_name = record.teams.away.name.clone();
                    let venue = record.fixture.venue.clone();

                    let fixture = match record.into_fixture() {
                        Ok(fixture) => fixture,
                        Err(e) => {
                            warn!(error = %e, "skipping malformed fixture record");
                            continue;
                        }
                    };
                    self.store.upsert_league(
                        fixture.league_id,
                        league_name.as_deref(),
                        league_country.as_deref(),
                    )?;
                    self.store
                        .upsert_team(fixture.home_team_id, home_name.as_deref())?;
                    self.store
                        .upsert_team(fixture.away_team_id, away_name.as_deref())?;
                    if let Some(venue) = venue {
                        if let Some(id) = venue.id {
                            self.store
                                .upsert_venue(id, venue.name.as_deref(), venue.city.as_deref())?;
                        }
                    }
                    self.store.upsert_fixture(&fixture)?;
                    stored += 1;
                }
            }
        }
        info!(fixtures = stored, "fixture poll complete");
        Ok(())
    }

    /// One price per (bookmaker, market, outcome) for fixtures kicking off
    /// inside the prematch window.
    async fn snapshot_prematch(&self) -> Result<()> {
        let upcoming = self.store.fixtures_kicking_off_within(
            Utc::now(),
            chrono::Duration::hours(PREMATCH_WINDOW_HOURS),
        )?;
        let mut captured = 0usize;
        for fixture in upcoming {
            let records = match self.client.prematch_odds(fixture.id).await {
                Ok(records) => records,
                Err(e) => {
                    warn!(fixture_id = fixture.id, error = %e, "prematch pull failed");
                    continue;
                }
            };
            let rows = normalize_prematch_odds(fixture.id, records, Utc::now(), fixture.date);
            let outcome = self.store.snapshot_prematch_odds(&rows)?;
            captured += outcome.inserted;
        }
        info!(rows = captured, "prematch snapshot complete");
        Ok(())
    }

    /// One final events + statistics pull for fixtures that finished at
    /// least `FINALIZER_DELAY_MIN` ago and were never finalized.
    async fn finalize_finished(&self) -> Result<()> {
        let finished = self.store.finished_unfinalized(
            Utc::now(),
            chrono::Duration::minutes(FINALIZER_DELAY_MIN),
        )?;
        for fixture in finished {
            if let Err(e) = self.client.fixture_events(fixture.id).await {
                warn!(fixture_id = fixture.id, error = %e, "final events pull failed");
            }
            match self.client.fixture_statistics(fixture.id).await {
                Ok(records) => {
                    let stats = crate::upstream::payload::normalize_stats(
                        fixture.id,
                        records,
                        Utc::now(),
                    );
                    self.store.store_final_statistics(fixture.id, &stats)?;
                    self.live.forget_fixture(fixture.id);
                    info!(fixture_id = fixture.id, "fixture finalized");
                }
                Err(e) => {
                    warn!(fixture_id = fixture.id, error = %e, "final stats pull failed");
                }
            }
        }
        Ok(())
    }
}

struct QueuedRun {
    run_id: String,
    job: JobSpec,
    attempt: u32,
    enqueued_at: Instant,
}

pub struct Scheduler {
    store: Arc<TickStore>,
    metrics: Arc<Metrics>,
    senders: HashMap<QueueName, mpsc::Sender<QueuedRun>>,
    depths: HashMap<QueueName, Arc<AtomicUsize>>,
}

impl Scheduler {
    /// Spawn queue workers and the dispatcher tick. Returns the running
    /// scheduler handle for the operator surface.
    pub fn spawn(
        store: Arc<TickStore>,
        ctx: Arc<JobContext>,
        metrics: Arc<Metrics>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let mut senders = HashMap::new();
        let mut depths = HashMap::new();

        for queue in QueueName::ALL {
            let (tx, rx) = mpsc::channel::<QueuedRun>(queue.max_depth());
            let shared_rx = Arc::new(tokio::sync::Mutex::new(rx));
            let depth = Arc::new(AtomicUsize::new(0));
            depths.insert(queue, depth.clone());

            for worker_id in 0..queue.worker_count() {
                tokio::spawn(queue_worker(
                    queue,
                    worker_id,
                    shared_rx.clone(),
                    tx.clone(),
                    depth.clone(),
                    ctx.clone(),
                    store.clone(),
                    metrics.clone(),
                    shutdown.clone(),
                ));
            }
            senders.insert(queue, tx);
        }

        let scheduler = Arc::new(Self {
            store: store.clone(),
            metrics,
            senders,
            depths,
        });

        let dispatcher = scheduler.clone();
        let mut dispatcher_shutdown = shutdown;
        tokio::spawn(async move {
            info!("dispatcher started (1s tick)");
            let mut last_fired: HashMap<String, DateTime<Utc>> = HashMap::new();
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Err(e) = dispatcher.dispatch_due(&mut last_fired) {
                            warn!(error = %e, "dispatch tick failed");
                        }
                    }
                    _ = dispatcher_shutdown.changed() => {
                        info!("dispatcher stopping, no new dispatches");
                        return;
                    }
                }
            }
        });

        scheduler
    }

    fn dispatch_due(&self, last_fired: &mut HashMap<String, DateTime<Utc>>) -> Result<()> {
        let now = Utc::now();
        for job in self.store.list_jobs()? {
            // Disabled jobs neither run nor accumulate backlog.
            if !job.enabled {
                last_fired.remove(&job.name);
                continue;
            }
            let schedule = match job.schedule() {
                Ok(schedule) => schedule,
                Err(e) => {
                    warn!(job = %job.name, error = %e, "unschedulable job");
                    continue;
                }
            };
            if !schedule.is_due(last_fired.get(&job.name).copied(), now) {
                continue;
            }
            self.enqueue(job.clone(), 1);
            last_fired.insert(job.name, now);
        }
        Ok(())
    }

    fn enqueue(&self, job: JobSpec, attempt: u32) {
        let queue = job.queue;
        let run = QueuedRun {
            run_id: Uuid::new_v4().to_string(),
            job,
            attempt,
            enqueued_at: Instant::now(),
        };
        let _ = self
            .store
            .record_job_run(&run.run_id, &run.job.name, RunState::Pending, attempt, None);
        match self.senders.get(&queue).map(|tx| tx.try_send(run)) {
            Some(Ok(())) => {
                if let Some(depth) = self.depths.get(&queue) {
                    depth.fetch_add(1, Ordering::Relaxed);
                }
            }
            Some(Err(mpsc::error::TrySendError::Full(run))) => {
                self.metrics.queue_full_dropped.fetch_add(1, Ordering::Relaxed);
                let _ = self.store.record_job_run(
                    &run.run_id,
                    &run.job.name,
                    RunState::Cancelled,
                    run.attempt,
                    Some("queue full"),
                );
                warn!(queue = queue.as_str(), job = %run.job.name, "queue full, run dropped");
            }
            _ => {}
        }
    }

    pub fn queue_depths(&self) -> Vec<(&'static str, usize)> {
        QueueName::ALL
            .iter()
            .map(|queue| {
                (
                    queue.as_str(),
                    self.depths
                        .get(queue)
                        .map(|d| d.load(Ordering::Relaxed))
                        .unwrap_or(0),
                )
            })
            .collect()
    }
}

#[allow(clippy::too_many_arguments)]
async fn queue_worker(
    queue: QueueName,
    worker_id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<QueuedRun>>>,
    retry_tx: mpsc::Sender<QueuedRun>,
    depth: Arc<AtomicUsize>,
    ctx: Arc<JobContext>,
    store: Arc<TickStore>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut memory = MemoryProbe::new();
    let memory_cap = queue.worker_memory_cap_bytes();

    loop {
        // Pool workers take turns on the shared receiver; the lock is held
        // only while waiting for the next run, never while executing one.
        let run = {
            let mut rx = rx.lock().await;
            tokio::select! {
                run = rx.recv() => match run {
                    Some(run) => run,
                    None => return,
                },
                _ = shutdown.changed() => {
                    // Drain what is already queued, then stop.
                    while let Ok(run) = rx.try_recv() {
                        depth.fetch_sub(1, Ordering::Relaxed);
                        let _ = store.record_job_run(
                            &run.run_id,
                            &run.job.name,
                            RunState::Cancelled,
                            run.attempt,
                            Some("shutdown"),
                        );
                    }
                    return;
                }
            }
        };
        depth.fetch_sub(1, Ordering::Relaxed);

        if exceeds_memory_cap(memory.rss_bytes(), memory_cap) {
            metrics.queue_memory_dropped.fetch_add(1, Ordering::Relaxed);
            let _ = store.record_job_run(
                &run.run_id,
                &run.job.name,
                RunState::Cancelled,
                run.attempt,
                Some("worker memory cap"),
            );
            warn!(
                queue = queue.as_str(),
                worker_id,
                cap_bytes = memory_cap,
                job = %run.job.name,
                "worker over its memory cap, refusing run"
            );
            continue;
        }

        if run.enqueued_at.elapsed() > queue.message_ttl() {
            metrics.queue_ttl_dropped.fetch_add(1, Ordering::Relaxed);
            let _ = store.record_job_run(
                &run.run_id,
                &run.job.name,
                RunState::Cancelled,
                run.attempt,
                Some("ttl expired"),
            );
            continue;
        }

        let _ = store.record_job_run(
            &run.run_id,
            &run.job.name,
            RunState::Running,
            run.attempt,
            None,
        );
        let hard_limit = Duration::from_secs(run.job.hard_limit_secs.max(1));
        let soft_limit = Duration::from_secs(run.job.soft_limit_secs.max(1));
        let started = Instant::now();

        let result = tokio::time::timeout(hard_limit, ctx.execute(&run.job.name)).await;
        let elapsed = started.elapsed();
        if elapsed > soft_limit {
            warn!(
                job = %run.job.name,
                elapsed_secs = elapsed.as_secs(),
                soft_limit_secs = soft_limit.as_secs(),
                "job exceeded its soft time limit"
            );
        }

        match result {
            Ok(Ok(())) => {
                let _ = store.record_job_run(
                    &run.run_id,
                    &run.job.name,
                    RunState::Succeeded,
                    run.attempt,
                    None,
                );
            }
            Ok(Err(e)) => {
                warn!(job = %run.job.name, attempt = run.attempt, error = %e, "job failed");
                let _ = store.record_job_run(
                    &run.run_id,
                    &run.job.name,
                    RunState::Failed,
                    run.attempt,
                    Some(&e.to_string()),
                );
                // Retries are fresh PENDING runs with exponential backoff.
                if run.attempt <= run.job.retry_limit {
                    schedule_retry(run, retry_tx.clone(), depth.clone(), store.clone());
                }
            }
            Err(_) => {
                warn!(
                    job = %run.job.name,
                    hard_limit_secs = hard_limit.as_secs(),
                    "job hit its hard time limit"
                );
                let _ = store.record_job_run(
                    &run.run_id,
                    &run.job.name,
                    RunState::TimedOut,
                    run.attempt,
                    Some("hard time limit"),
                );
            }
        }
    }
}

/// Process RSS probe backing the per-worker memory cap. Each worker owns
/// one so refreshes stay off any shared lock.
struct MemoryProbe {
    system: sysinfo::System,
    pid: Option<sysinfo::Pid>,
}

impl MemoryProbe {
    fn new() -> Self {
        Self {
            system: sysinfo::System::new(),
            pid: sysinfo::get_current_pid().ok(),
        }
    }

    fn rss_bytes(&mut self) -> Option<u64> {
        let pid = self.pid?;
        if !self.system.refresh_process(pid) {
            return None;
        }
        self.system.process(pid).map(|p| p.memory())
    }
}

/// An unreadable probe never blocks work; only a confirmed reading above
/// the cap does.
fn exceeds_memory_cap(rss: Option<u64>, cap_bytes: u64) -> bool {
    rss.is_some_and(|rss| rss > cap_bytes)
}

fn schedule_retry(
    run: QueuedRun,
    tx: mpsc::Sender<QueuedRun>,
    depth: Arc<AtomicUsize>,
    store: Arc<TickStore>,
) {
    let backoff = Duration::from_secs(2u64.saturating_pow(run.attempt.min(6)));
    tokio::spawn(async move {
        tokio::time::sleep(backoff).await;
        let next = QueuedRun {
            run_id: Uuid::new_v4().to_string(),
            job: run.job,
            attempt: run.attempt + 1,
            enqueued_at: Instant::now(),
        };
        let _ = store.record_job_run(
            &next.run_id,
            &next.job.name,
            RunState::Pending,
            next.attempt,
            None,
        );
        if tx.try_send(next).is_ok() {
            depth.fetch_add(1, Ordering::Relaxed);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::memory_store;

    #[test]
    fn queue_ttls_and_depths_are_per_class() {
        assert!(QueueName::Live.message_ttl() < QueueName::Maintenance.message_ttl());
        assert!(QueueName::Live.max_depth() < QueueName::Fixtures.max_depth());
    }

    #[test]
    fn every_queue_has_a_worker_pool_with_a_memory_cap() {
        for queue in QueueName::ALL {
            assert!(queue.worker_count() >= 2, "{} has no pool", queue.as_str());
            assert!(queue.worker_memory_cap_bytes() > 0);
        }
        assert!(
            QueueName::Live.worker_memory_cap_bytes()
                < QueueName::Maintenance.worker_memory_cap_bytes()
        );
    }

    #[test]
    fn memory_cap_gate_blocks_only_confirmed_readings() {
        let cap = 512 * 1024 * 1024;
        assert!(!exceeds_memory_cap(None, cap));
        assert!(!exceeds_memory_cap(Some(cap), cap));
        assert!(exceeds_memory_cap(Some(cap + 1), cap));
    }

    #[test]
    fn running_guard_releases_its_name_on_drop() {
        let set = Mutex::new(HashSet::new());
        assert!(set.lock().insert("live_trigger".to_string()));
        {
            let _guard = RunningGuard {
                set: &set,
                name: "live_trigger",
            };
        }
        assert!(!set.lock().contains("live_trigger"));
    }

    #[test]
    fn default_catalog_covers_required_jobs() {
        let names: Vec<String> = default_catalog().into_iter().map(|j| j.name).collect();
        for required in [
            "fixture_poll",
            "live_trigger",
            "prematch_snapshot",
            "frame_maker",
            "finalizer",
            "weekly_refresh",
            "retention_maintenance",
        ] {
            assert!(names.contains(&required.to_string()), "missing {required}");
        }
    }

    #[test]
    fn disabled_job_is_never_dispatched() {
        let store = memory_store();
        store.seed_jobs_if_missing().unwrap();
        store.update_job("live_trigger", Some(false), None).unwrap();
        let jobs = store.list_jobs().unwrap();
        let live = jobs.iter().find(|j| j.name == "live_trigger").unwrap();
        assert!(!live.enabled);
    }
}
