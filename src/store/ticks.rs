//! Batch write and window read paths for the raw tick tables.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::sync::atomic::Ordering;

use crate::models::{BridgeMessageType, EventTick, FixtureStatus, OddsTick, PrematchOdd, StatTick};
use crate::store::{from_ms, to_ms, TickStore};

/// Result of one batch insert. `deduped` rows hit the natural key,
/// `dropped` rows failed validation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertOutcome {
    pub inserted: usize,
    pub deduped: usize,
    pub dropped: usize,
}

/// Per-batch cache of fixture statuses so validation does one lookup per
/// distinct fixture.
struct FixtureStatusCache(HashMap<i64, Option<FixtureStatus>>);

impl FixtureStatusCache {
    fn new() -> Self {
        Self(HashMap::new())
    }

    fn get(&mut self, conn: &Connection, fixture_id: i64) -> Result<Option<FixtureStatus>> {
        if let Some(cached) = self.0.get(&fixture_id) {
            return Ok(*cached);
        }
        let status: Option<String> = conn
            .query_row(
                "SELECT status_short FROM fixture WHERE id = ?1",
                params![fixture_id],
                |row| row.get(0),
            )
            .optional()?;
        let status = status.as_deref().and_then(FixtureStatus::parse);
        self.0.insert(fixture_id, status);
        Ok(status)
    }
}

enum Validation {
    Ok,
    Drop,
}

impl TickStore {
    fn validate_reference(
        &self,
        conn: &Connection,
        cache: &mut FixtureStatusCache,
        fixture_id: i64,
        ts: DateTime<Utc>,
        kind: &'static str,
    ) -> Result<Validation> {
        match cache.get(conn, fixture_id)? {
            None => {
                self.metrics().record_validation_drop(kind, "unknown_fixture");
                Ok(Validation::Drop)
            }
            Some(status) if status.is_terminal_inactive() => {
                self.metrics().record_validation_drop(kind, "terminal_fixture");
                Ok(Validation::Drop)
            }
            Some(_) => {
                if to_ms(ts) < self.frame_watermark_ms() {
                    self.metrics().late_ticks_dropped.fetch_add(1, Ordering::Relaxed);
                    return Ok(Validation::Drop);
                }
                Ok(Validation::Ok)
            }
        }
    }

    /// Bulk append odds ticks. Duplicate natural keys are silently dropped;
    /// rows with a non-positive price, an unknown or terminal fixture, or an
    /// instant behind the frame watermark never land. One `odds_update` note
    /// per fixture rides in the same transaction.
    pub fn insert_odds_ticks(&self, batch: &[OddsTick]) -> Result<InsertOutcome> {
        if batch.is_empty() {
            return Ok(InsertOutcome::default());
        }
        let outcome = self.with_txn(|conn| {
            let mut outcome = InsertOutcome::default();
            let mut cache = FixtureStatusCache::new();
            let mut written: HashMap<i64, Vec<&OddsTick>> = HashMap::new();

            let mut stmt = conn.prepare_cached(
                "INSERT OR IGNORE INTO live_odds_tick
                     (fixture_id, bookmaker_id, bet_market_id, bet_value, odd_value, ts, match_minute)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;

            for tick in batch {
                if tick.odd_value <= 0.0 {
                    self.metrics().record_validation_drop("odds", "non_positive_price");
                    outcome.dropped += 1;
                    continue;
                }
                if let Validation::Drop =
                    self.validate_reference(conn, &mut cache, tick.fixture_id, tick.ts, "odds")?
                {
                    outcome.dropped += 1;
                    continue;
                }
                let changes = stmt.execute(params![
                    tick.fixture_id,
                    tick.bookmaker_id,
                    tick.bet_market_id,
                    tick.bet_value,
                    tick.odd_value,
                    to_ms(tick.ts),
                    tick.match_minute,
                ])?;
                if changes > 0 {
                    outcome.inserted += 1;
                    written.entry(tick.fixture_id).or_default().push(tick);
                } else {
                    outcome.deduped += 1;
                }
            }
            drop(stmt);

            for (fixture_id, rows) in written {
                let ts = rows.last().map(|t| t.ts).unwrap_or_else(Utc::now);
                Self::append_note(
                    conn,
                    fixture_id,
                    BridgeMessageType::OddsUpdate,
                    ts,
                    &serde_json::json!({ "count": rows.len(), "rows": rows }),
                )?;
            }
            Ok(outcome)
        })?;
        if outcome.inserted > 0 {
            self.outbox_notify.notify_waiters();
        }
        Ok(outcome)
    }

    pub fn insert_event_ticks(&self, batch: &[EventTick]) -> Result<InsertOutcome> {
        if batch.is_empty() {
            return Ok(InsertOutcome::default());
        }
        let outcome = self.with_txn(|conn| {
            let mut outcome = InsertOutcome::default();
            let mut cache = FixtureStatusCache::new();
            let mut written: HashMap<i64, Vec<&EventTick>> = HashMap::new();

            let mut stmt = conn.prepare_cached(
                "INSERT OR IGNORE INTO live_event_tick
                     (fixture_id, ts, match_minute, match_minute_extra, event_type,
                      event_detail, team_id, player_id, assist_player_id, comments)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;

            for tick in batch {
                if let Validation::Drop =
                    self.validate_reference(conn, &mut cache, tick.fixture_id, tick.ts, "events")?
                {
                    outcome.dropped += 1;
                    continue;
                }
                let changes = stmt.execute(params![
                    tick.fixture_id,
                    to_ms(tick.ts),
                    tick.match_minute,
                    tick.match_minute_extra,
                    tick.event_type,
                    tick.event_detail,
                    tick.team_id,
                    tick.player_id,
                    tick.assist_player_id,
                    tick.comments,
                ])?;
                if changes > 0 {
                    outcome.inserted += 1;
                    written.entry(tick.fixture_id).or_default().push(tick);
                } else {
                    outcome.deduped += 1;
                }
            }
            drop(stmt);

            for (fixture_id, rows) in written {
                let ts = rows.last().map(|t| t.ts).unwrap_or_else(Utc::now);
                Self::append_note(
                    conn,
                    fixture_id,
                    BridgeMessageType::EventUpdate,
                    ts,
                    &serde_json::json!({ "count": rows.len(), "rows": rows }),
                )?;
            }
            Ok(outcome)
        })?;
        if outcome.inserted > 0 {
            self.outbox_notify.notify_waiters();
        }
        Ok(outcome)
    }

    pub fn insert_stat_ticks(&self, batch: &[StatTick]) -> Result<InsertOutcome> {
        if batch.is_empty() {
            return Ok(InsertOutcome::default());
        }
        let outcome = self.with_txn(|conn| {
            let mut outcome = InsertOutcome::default();
            let mut cache = FixtureStatusCache::new();
            let mut written: HashMap<i64, Vec<&StatTick>> = HashMap::new();

            let mut stmt = conn.prepare_cached(
                "INSERT OR IGNORE INTO live_stat_tick
                     (fixture_id, team_id, ts, shots_on_goal, shots_off_goal, total_shots,
                      blocked_shots, shots_inside_box, shots_outside_box, fouls, corner_kicks,
                      offsides, ball_possession, yellow_cards, red_cards, goalkeeper_saves,
                      total_passes, passes_accurate, passes_percentage)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                         ?16, ?17, ?18, ?19)",
            )?;

            for tick in batch {
                if !(0..=100).contains(&tick.ball_possession) {
                    self.metrics()
                        .record_validation_drop("stats", "possession_out_of_range");
                    outcome.dropped += 1;
                    continue;
                }
                if let Validation::Drop =
                    self.validate_reference(conn, &mut cache, tick.fixture_id, tick.ts, "stats")?
                {
                    outcome.dropped += 1;
                    continue;
                }
                let changes = stmt.execute(params![
                    tick.fixture_id,
                    tick.team_id,
                    to_ms(tick.ts),
                    tick.shots_on_goal,
                    tick.shots_off_goal,
                    tick.total_shots,
                    tick.blocked_shots,
                    tick.shots_inside_box,
                    tick.shots_outside_box,
                    tick.fouls,
                    tick.corner_kicks,
                    tick.offsides,
                    tick.ball_possession,
                    tick.yellow_cards,
                    tick.red_cards,
                    tick.goalkeeper_saves,
                    tick.total_passes,
                    tick.passes_accurate,
                    tick.passes_percentage,
                ])?;
                if changes > 0 {
                    outcome.inserted += 1;
                    written.entry(tick.fixture_id).or_default().push(tick);
                } else {
                    outcome.deduped += 1;
                }
            }
            drop(stmt);

            for (fixture_id, rows) in written {
                let ts = rows.last().map(|t| t.ts).unwrap_or_else(Utc::now);
                Self::append_note(
                    conn,
                    fixture_id,
                    BridgeMessageType::StatsUpdate,
                    ts,
                    &serde_json::json!({ "count": rows.len(), "rows": rows }),
                )?;
            }
            Ok(outcome)
        })?;
        if outcome.inserted > 0 {
            self.outbox_notify.notify_waiters();
        }
        Ok(outcome)
    }

    /// Append prematch snapshots. No change note: prematch rows are not a
    /// live topic.
    pub fn snapshot_prematch_odds(&self, batch: &[PrematchOdd]) -> Result<InsertOutcome> {
        if batch.is_empty() {
            return Ok(InsertOutcome::default());
        }
        self.with_txn(|conn| {
            let mut outcome = InsertOutcome::default();
            let mut stmt = conn.prepare_cached(
                "INSERT OR IGNORE INTO prematch_odds
                     (fixture_id, bookmaker_id, bet_market_id, bet_value, odd_value,
                      snapshot_ts, hours_before_match)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for row in batch {
                if row.odd_value <= 0.0 {
                    self.metrics()
                        .record_validation_drop("prematch", "non_positive_price");
                    outcome.dropped += 1;
                    continue;
                }
                let changes = stmt.execute(params![
                    row.fixture_id,
                    row.bookmaker_id,
                    row.bet_market_id,
                    row.bet_value,
                    row.odd_value,
                    to_ms(row.snapshot_ts),
                    row.hours_before_match,
                ])?;
                if changes > 0 {
                    outcome.inserted += 1;
                } else {
                    outcome.deduped += 1;
                }
            }
            Ok(outcome)
        })
    }

    // -- reads --------------------------------------------------------------

    /// Odds ticks for one fixture with `from <= ts < to`, ascending.
    pub fn odds_ticks_between(
        &self,
        fixture_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<OddsTick>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT fixture_id, bookmaker_id, bet_market_id, bet_value, odd_value, ts, match_minute
             FROM live_odds_tick
             WHERE fixture_id = ?1 AND ts >= ?2 AND ts < ?3
             ORDER BY ts ASC, rowid ASC",
        )?;
        let rows = stmt
            .query_map(params![fixture_id, to_ms(from), to_ms(to)], |row| {
                Ok(OddsTick {
                    fixture_id: row.get(0)?,
                    bookmaker_id: row.get(1)?,
                    bet_market_id: row.get(2)?,
                    bet_value: row.get(3)?,
                    odd_value: row.get(4)?,
                    ts: from_ms(row.get(5)?),
                    match_minute: row.get(6)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn event_ticks_between(
        &self,
        fixture_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<EventTick>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT fixture_id, ts, match_minute, match_minute_extra, event_type, event_detail,
                    team_id, player_id, assist_player_id, comments
             FROM live_event_tick
             WHERE fixture_id = ?1 AND ts >= ?2 AND ts < ?3
             ORDER BY ts ASC, rowid ASC",
        )?;
        let rows = stmt
            .query_map(params![fixture_id, to_ms(from), to_ms(to)], |row| {
                Ok(EventTick {
                    fixture_id: row.get(0)?,
                    ts: from_ms(row.get(1)?),
                    match_minute: row.get(2)?,
                    match_minute_extra: row.get(3)?,
                    event_type: row.get(4)?,
                    event_detail: row.get(5)?,
                    team_id: row.get(6)?,
                    player_id: row.get(7)?,
                    assist_player_id: row.get(8)?,
                    comments: row.get(9)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn stat_ticks_between(
        &self,
        fixture_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<StatTick>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT fixture_id, team_id, ts, shots_on_goal, shots_off_goal, total_shots,
                    blocked_shots, shots_inside_box, shots_outside_box, fouls, corner_kicks,
                    offsides, ball_possession, yellow_cards, red_cards, goalkeeper_saves,
                    total_passes, passes_accurate, passes_percentage
             FROM live_stat_tick
             WHERE fixture_id = ?1 AND ts >= ?2 AND ts < ?3
             ORDER BY ts ASC, rowid ASC",
        )?;
        let rows = stmt
            .query_map(params![fixture_id, to_ms(from), to_ms(to)], |row| {
                Ok(StatTick {
                    fixture_id: row.get(0)?,
                    team_id: row.get(1)?,
                    ts: from_ms(row.get(2)?),
                    shots_on_goal: row.get(3)?,
                    shots_off_goal: row.get(4)?,
                    total_shots: row.get(5)?,
                    blocked_shots: row.get(6)?,
                    shots_inside_box: row.get(7)?,
                    shots_outside_box: row.get(8)?,
                    fouls: row.get(9)?,
                    corner_kicks: row.get(10)?,
                    offsides: row.get(11)?,
                    ball_possession: row.get(12)?,
                    yellow_cards: row.get(13)?,
                    red_cards: row.get(14)?,
                    goalkeeper_saves: row.get(15)?,
                    total_passes: row.get(16)?,
                    passes_accurate: row.get(17)?,
                    passes_percentage: row.get(18)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Fixtures that had odds or event activity inside `[from, to)`.
    pub fn fixtures_with_ticks_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<i64>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT DISTINCT fixture_id FROM (
                 SELECT fixture_id FROM live_odds_tick WHERE ts >= ?1 AND ts < ?2
                 UNION
                 SELECT fixture_id FROM live_event_tick WHERE ts >= ?1 AND ts < ?2
             ) ORDER BY fixture_id",
        )?;
        let rows = stmt
            .query_map(params![to_ms(from), to_ms(to)], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
