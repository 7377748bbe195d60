//! Live ingestion loop.
//!
//! Driven by the scheduler's `live_trigger` job. Each trigger refreshes the
//! in-play fixture set with one live-fixtures call, computes which
//! (fixture, kind) pairs are due, and runs the pulls through a bounded
//! worker pool. Every pull is permit-gated by the global rate governor;
//! batches land in one transaction with their change note.

use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::{AppConfig, SettingsHandle};
use crate::metrics::Metrics;
use crate::models::{Fixture, PullKind};
use crate::store::TickStore;
use crate::upstream::payload::{normalize_events, normalize_live_odds, normalize_stats};
use crate::upstream::{ApiFootballClient, UpstreamError};

#[derive(Default)]
struct LoopState {
    last_pulled: HashMap<(i64, PullKind), Instant>,
    consecutive_failures: HashMap<(i64, PullKind), u32>,
    cooldown_until: HashMap<(i64, PullKind), Instant>,
}

impl LoopState {
    fn forget_fixture(&mut self, fixture_id: i64) {
        self.last_pulled.retain(|(id, _), _| *id != fixture_id);
        self.consecutive_failures.retain(|(id, _), _| *id != fixture_id);
        self.cooldown_until.retain(|(id, _), _| *id != fixture_id);
    }
}

enum PullError {
    Upstream(UpstreamError),
    Storage(anyhow::Error),
}

impl std::fmt::Display for PullError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PullError::Upstream(e) => write!(f, "{e}"),
            PullError::Storage(e) => write!(f, "storage failed: {e}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TriggerReport {
    pub live_fixtures: usize,
    pub pulls_submitted: usize,
    pub pulls_failed: usize,
    pub fixtures_closed: usize,
}

pub struct LiveLoop {
    store: Arc<TickStore>,
    client: ApiFootballClient,
    settings: SettingsHandle,
    metrics: Arc<Metrics>,
    pool: Arc<Semaphore>,
    consec_fail_limit: u32,
    cooldown: Duration,
    state: Mutex<LoopState>,
}

impl LiveLoop {
    pub fn new(
        cfg: &AppConfig,
        store: Arc<TickStore>,
        client: ApiFootballClient,
        settings: SettingsHandle,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            client,
            settings,
            metrics,
            pool: Arc::new(Semaphore::new(cfg.live_concurrency.max(1))),
            consec_fail_limit: cfg.consec_fail_limit,
            cooldown: cfg.cooldown,
            state: Mutex::new(LoopState::default()),
        }
    }

    /// One trigger cycle. With no live or imminent fixtures this is O(1)
    /// and issues zero upstream calls.
    pub async fn trigger(self: &Arc<Self>) -> Result<TriggerReport> {
        let mut report = TriggerReport::default();
        let now = Utc::now();

        if self.store.live_candidate_count(now)? == 0 {
            debug!("no live or imminent fixtures, skipping trigger");
            return Ok(report);
        }

        report.fixtures_closed = self.refresh_live_statuses().await?;

        // Snapshot the hot-reloadable settings once per trigger.
        let settings = self.settings.load();
        let live: Vec<Fixture> = self
            .store
            .live_fixtures(now)?
            .into_iter()
            .filter(|f| settings.league_enabled(f.league_id))
            .collect();
        report.live_fixtures = live.len();
        if live.is_empty() {
            return Ok(report);
        }

        // Due pairs ordered by staleness, most stale first.
        let mono_now = Instant::now();
        let mut plan: Vec<(i64, PullKind, Duration)> = Vec::new();
        {
            let state = self.state.lock();
            for fixture in &live {
                for kind in [PullKind::Odds, PullKind::Events, PullKind::Stats] {
                    let key = (fixture.id, kind);
                    if let Some(until) = state.cooldown_until.get(&key) {
                        if *until > mono_now {
                            continue;
                        }
                    }
                    let staleness = state
                        .last_pulled
                        .get(&key)
                        .map(|last| mono_now.duration_since(*last))
                        .unwrap_or(Duration::MAX);
                    if staleness >= settings.interval(kind) {
                        plan.push((fixture.id, kind, staleness));
                    }
                }
            }
        }
        plan.sort_by(|a, b| b.2.cmp(&a.2));
        report.pulls_submitted = plan.len();

        let mut tasks = tokio::task::JoinSet::new();
        for (fixture_id, kind, _) in plan {
            let this = self.clone();
            tasks.spawn(async move {
                let permit = this.pool.acquire().await;
                let started = Instant::now();
                let result = match permit {
                    Ok(_permit) => this.pull_one(fixture_id, kind).await,
                    Err(_) => Err(PullError::Storage(anyhow::anyhow!("worker pool closed"))),
                };
                (fixture_id, kind, started.elapsed(), result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let Ok((fixture_id, kind, latency, result)) = joined else {
                continue;
            };
            match result {
                Ok(()) => {
                    self.metrics
                        .record_pull_latency_ms(latency.as_millis() as u64);
                    self.metrics.pulls_completed.fetch_add(1, Ordering::Relaxed);
                    let mut state = self.state.lock();
                    state.last_pulled.insert((fixture_id, kind), Instant::now());
                    state.consecutive_failures.remove(&(fixture_id, kind));
                }
                Err(e) => {
                    report.pulls_failed += 1;
                    self.metrics.pulls_failed.fetch_add(1, Ordering::Relaxed);
                    self.note_failure(fixture_id, kind, &e);
                }
            }
        }

        Ok(report)
    }

    /// A rate stall skips the cycle for that pair; other failures count
    /// toward the cooldown trip.
    fn note_failure(&self, fixture_id: i64, kind: PullKind, error: &PullError) {
        if matches!(error, PullError::Upstream(UpstreamError::RateStalled { .. })) {
            debug!(fixture_id, kind = kind.as_str(), "pull skipped, rate budget stalled");
            return;
        }
        let mut state = self.state.lock();
        let fails = state
            .consecutive_failures
            .entry((fixture_id, kind))
            .or_insert(0);
        *fails += 1;
        warn!(
            fixture_id,
            kind = kind.as_str(),
            failures = *fails,
            error = %error,
            "live pull failed"
        );
        if *fails >= self.consec_fail_limit {
            state
                .cooldown_until
                .insert((fixture_id, kind), Instant::now() + self.cooldown);
            state.consecutive_failures.remove(&(fixture_id, kind));
            warn!(
                fixture_id,
                kind = kind.as_str(),
                cooldown_secs = self.cooldown.as_secs(),
                "pull pair placed on cooldown"
            );
        }
    }

    async fn pull_one(&self, fixture_id: i64, kind: PullKind) -> Result<(), PullError> {
        let ts = Utc::now();
        match kind {
            PullKind::Odds => {
                let records = self
                    .client
                    .live_odds(fixture_id)
                    .await
                    .map_err(PullError::Upstream)?;
                let minute = self
                    .store
                    .fixture(fixture_id)
                    .ok()
                    .flatten()
                    .and_then(|f| f.status_elapsed);
                let ticks = normalize_live_odds(fixture_id, records, ts, minute);
                self.store
                    .insert_odds_ticks(&ticks)
                    .map_err(PullError::Storage)?;
            }
            PullKind::Events => {
                let records = self
                    .client
                    .fixture_events(fixture_id)
                    .await
                    .map_err(PullError::Upstream)?;
                let ticks = normalize_events(fixture_id, records, ts);
                self.store
                    .insert_event_ticks(&ticks)
                    .map_err(PullError::Storage)?;
            }
            PullKind::Stats => {
                let records = self
                    .client
                    .fixture_statistics(fixture_id)
                    .await
                    .map_err(PullError::Upstream)?;
                let ticks = normalize_stats(fixture_id, records, ts);
                self.store
                    .insert_stat_ticks(&ticks)
                    .map_err(PullError::Storage)?;
            }
        }
        Ok(())
    }

    /// Sync in-play fixture state from the provider's live feed. Detects
    /// live → terminal transitions, closes those fixtures out and emits
    /// their `fixture_closed` notes. Returns how many closed.
    async fn refresh_live_statuses(self: &Arc<Self>) -> Result<usize> {
        let records = match self.client.fixtures_live().await {
            Ok(records) => records,
            Err(e) => {
                // The loop's availability does not hinge on one refresh.
                warn!(error = %e, "live fixture refresh failed");
                return Ok(0);
            }
        };

        let mut closed = 0usize;
        for record in records {
            let fixture = match record.into_fixture() {
                Ok(fixture) => fixture,
                Err(e) => {
                    warn!(error = %e, "skipping malformed live fixture record");
                    continue;
                }
            };
            let transition = self.store.upsert_fixture(&fixture)?;
            if let Some((old, new)) = transition {
                info!(
                    fixture_id = fixture.id,
                    from = old.as_str(),
                    to = new.as_str(),
                    "fixture status transition"
                );
                if old.is_live() && new.is_terminal_inactive() {
                    self.store.emit_fixture_closed(fixture.id, new)?;
                    self.state.lock().forget_fixture(fixture.id);
                    closed += 1;
                }
            }
        }
        Ok(closed)
    }

    /// Drop per-fixture scheduling state, e.g. after an external close-out.
    pub fn forget_fixture(&self, fixture_id: i64) {
        self.state.lock().forget_fixture(fixture_id);
    }
}
