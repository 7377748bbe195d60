//! Frame materialization: per-(fixture, minute) summaries composed from raw
//! ticks.
//!
//! A frame row is a pure function of the window's ticks and the fixture row,
//! so re-materializing the same window writes an identical row. The
//! aggregator advances a watermark past each materialized bucket; ticks
//! arriving behind it are late and never integrated.

use anyhow::Result;
use chrono::{DateTime, Duration, DurationRound, Utc};
use parking_lot::Mutex;
use rusqlite::{params, OptionalExtension};
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::metrics::Metrics;
use crate::models::{FixtureStatus, LiveFrame, OddsTick};
use crate::store::{from_ms, to_ms, TickStore};

/// 1X2 market id in the bet-def seed.
const MARKET_1X2: i64 = 1;
fn bucket_len() -> Duration {
    Duration::seconds(60)
}

impl TickStore {
    /// Compose and upsert the frame for `(fixture_id, bucket_start)`.
    /// Returns `None` when the window holds no odds or event ticks.
    pub fn materialize_frame(
        &self,
        fixture_id: i64,
        bucket_start: DateTime<Utc>,
    ) -> Result<Option<LiveFrame>> {
        let bucket_end = bucket_start + bucket_len();
        let odds = self.odds_ticks_between(fixture_id, bucket_start, bucket_end)?;
        let events = self.event_ticks_between(fixture_id, bucket_start, bucket_end)?;
        if odds.is_empty() && events.is_empty() {
            return Ok(None);
        }
        let Some(fixture) = self.fixture(fixture_id)? else {
            warn!(fixture_id, "frame window references unknown fixture");
            return Ok(None);
        };

        let (avg_home, delta_home) = outcome_summary(&odds, "1");
        let (avg_draw, _) = outcome_summary(&odds, "X");
        let (avg_away, delta_away) = outcome_summary(&odds, "2");

        let mut goals = 0;
        let mut cards = 0;
        let mut subs = 0;
        for event in &events {
            match event.event_type.as_str() {
                "Goal" => goals += 1,
                "Card" => cards += 1,
                "subst" => subs += 1,
                _ => {}
            }
        }

        let frame = LiveFrame {
            fixture_id,
            bucket_start,
            home_team_id: fixture.home_team_id,
            away_team_id: fixture.away_team_id,
            status: fixture.status,
            status_elapsed: fixture.status_elapsed,
            home_goals: fixture.home_goals,
            away_goals: fixture.away_goals,
            avg_home_odd: avg_home,
            avg_draw_odd: avg_draw,
            avg_away_odd: avg_away,
            home_odd_delta: delta_home,
            away_odd_delta: delta_away,
            goals_in_bucket: goals,
            cards_in_bucket: cards,
            subs_in_bucket: subs,
            odds_ticks_in_bucket: odds.len() as i32,
            event_ticks_in_bucket: events.len() as i32,
        };

        let conn = self.lock();
        conn.execute(
            "INSERT OR REPLACE INTO match_live_frame
                 (fixture_id, bucket_start, home_team_id, away_team_id, status_short,
                  status_elapsed, home_goals, away_goals, avg_home_odd, avg_draw_odd,
                  avg_away_odd, home_odd_delta, away_odd_delta, goals_in_bucket,
                  cards_in_bucket, subs_in_bucket, odds_ticks_in_bucket, event_ticks_in_bucket)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            params![
                frame.fixture_id,
                to_ms(frame.bucket_start),
                frame.home_team_id,
                frame.away_team_id,
                frame.status.as_str(),
                frame.status_elapsed,
                frame.home_goals,
                frame.away_goals,
                frame.avg_home_odd,
                frame.avg_draw_odd,
                frame.avg_away_odd,
                frame.home_odd_delta,
                frame.away_odd_delta,
                frame.goals_in_bucket,
                frame.cards_in_bucket,
                frame.subs_in_bucket,
                frame.odds_ticks_in_bucket,
                frame.event_ticks_in_bucket,
            ],
        )?;
        Ok(Some(frame))
    }

    /// Materialized frames for one fixture with bucket_start inside `[from, to)`.
    pub fn frames(
        &self,
        fixture_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<LiveFrame>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT fixture_id, bucket_start, home_team_id, away_team_id, status_short,
                    status_elapsed, home_goals, away_goals, avg_home_odd, avg_draw_odd,
                    avg_away_odd, home_odd_delta, away_odd_delta, goals_in_bucket,
                    cards_in_bucket, subs_in_bucket, odds_ticks_in_bucket, event_ticks_in_bucket
             FROM match_live_frame
             WHERE fixture_id = ?1 AND bucket_start >= ?2 AND bucket_start < ?3
             ORDER BY bucket_start ASC",
        )?;
        let rows = stmt
            .query_map(params![fixture_id, to_ms(from), to_ms(to)], |row| {
                let status_raw: String = row.get(4)?;
                Ok(LiveFrame {
                    fixture_id: row.get(0)?,
                    bucket_start: from_ms(row.get(1)?),
                    home_team_id: row.get(2)?,
                    away_team_id: row.get(3)?,
                    status: FixtureStatus::parse(&status_raw).unwrap_or(FixtureStatus::Tbd),
                    status_elapsed: row.get(5)?,
                    home_goals: row.get(6)?,
                    away_goals: row.get(7)?,
                    avg_home_odd: row.get(8)?,
                    avg_draw_odd: row.get(9)?,
                    avg_away_odd: row.get(10)?,
                    home_odd_delta: row.get(11)?,
                    away_odd_delta: row.get(12)?,
                    goals_in_bucket: row.get(13)?,
                    cards_in_bucket: row.get(14)?,
                    subs_in_bucket: row.get(15)?,
                    odds_ticks_in_bucket: row.get(16)?,
                    event_ticks_in_bucket: row.get(17)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn frame_row_raw(&self, fixture_id: i64, bucket_start: DateTime<Utc>) -> Result<Option<String>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT fixture_id || '|' || bucket_start || '|' || home_team_id || '|' ||
                        away_team_id || '|' || status_short || '|' ||
                        COALESCE(status_elapsed, -1) || '|' || home_goals || '|' || away_goals ||
                        '|' || COALESCE(avg_home_odd, -1) || '|' || COALESCE(avg_draw_odd, -1) ||
                        '|' || COALESCE(avg_away_odd, -1) || '|' || COALESCE(home_odd_delta, 0) ||
                        '|' || COALESCE(away_odd_delta, 0) || '|' || goals_in_bucket || '|' ||
                        cards_in_bucket || '|' || subs_in_bucket || '|' || odds_ticks_in_bucket ||
                        '|' || event_ticks_in_bucket
                 FROM match_live_frame WHERE fixture_id = ?1 AND bucket_start = ?2",
                params![fixture_id, to_ms(bucket_start)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row)
    }
}

/// Average price and close-minus-open delta for one 1X2 outcome.
fn outcome_summary(odds: &[OddsTick], outcome: &str) -> (Option<f64>, Option<f64>) {
    let mut sum = 0.0;
    let mut count = 0usize;
    let mut open = None;
    let mut close = None;
    for tick in odds {
        if tick.bet_market_id != MARKET_1X2 || tick.bet_value != outcome {
            continue;
        }
        sum += tick.odd_value;
        count += 1;
        if open.is_none() {
            open = Some(tick.odd_value);
        }
        close = Some(tick.odd_value);
    }
    if count == 0 {
        return (None, None);
    }
    let delta = match (open, close) {
        (Some(open), Some(close)) => Some(close - open),
        _ => None,
    };
    (Some(sum / count as f64), delta)
}

/// Drives frame materialization on the 1-minute cadence.
pub struct FrameAggregator {
    store: Arc<TickStore>,
    metrics: Arc<Metrics>,
    // Guards concurrent materialization of the same (fixture, bucket), e.g.
    // a scheduled cycle racing an explicit re-materialization.
    in_flight: Mutex<HashSet<(i64, i64)>>,
}

impl FrameAggregator {
    pub fn new(store: Arc<TickStore>, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            metrics,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Materialize the most recently closed minute for every fixture with
    /// activity in it. Skipped windows are never chased past the fence.
    pub fn run_cycle(&self, now: DateTime<Utc>) -> Result<usize> {
        let bucket_start = now.duration_trunc(bucket_len())? - bucket_len();
        let bucket_end = bucket_start + bucket_len();

        // Always the latest closed minute: a slow cycle skips forward rather
        // than chasing history; anything older than the fence is reachable
        // only through an explicit materialize call.
        let lag = (now - bucket_end).num_seconds().max(0);
        self.metrics.frames_lag_seconds.store(lag, Ordering::Relaxed);

        let fixtures = self
            .store
            .fixtures_with_ticks_between(bucket_start, bucket_end)?;
        let mut materialized = 0usize;
        for fixture_id in fixtures {
            match self.materialize(fixture_id, bucket_start) {
                Ok(Some(_)) => materialized += 1,
                Ok(None) => {}
                Err(e) => warn!(fixture_id, error = %e, "frame materialization failed"),
            }
        }

        // Late ticks behind this boundary are dropped at the write path.
        self.store.set_frame_watermark_ms(to_ms(bucket_end))?;

        if materialized > 0 {
            debug!(
                bucket_start = %bucket_start,
                fixtures = materialized,
                "frame cycle complete"
            );
        }
        Ok(materialized)
    }

    /// Explicit (re-)materialization of one window, used by operators and
    /// tests; the only path that touches windows older than the fence.
    pub fn materialize(
        &self,
        fixture_id: i64,
        bucket_start: DateTime<Utc>,
    ) -> Result<Option<LiveFrame>> {
        let key = (fixture_id, to_ms(bucket_start));
        if !self.in_flight.lock().insert(key) {
            return Ok(None);
        }
        let result = self.store.materialize_frame(fixture_id, bucket_start);
        self.in_flight.lock().remove(&key);
        result
    }

}
