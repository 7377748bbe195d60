//! Retention and compression maintenance for the raw tick tables.
//!
//! Mirrors the declared hypertable discipline: rows older than the compress
//! horizon are folded per (fixture, segment, day) into `tick_chunk` blobs
//! ordered by instant descending, then removed from the raw table. Chunks
//! and derived frames past the per-kind delete horizon are dropped. Runs as
//! a scheduled maintenance job, never on the write path.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Serialize;
use tracing::info;

use crate::store::{to_ms, TickStore};

/// Outbox rows older than this are unreachable for catch-up.
pub fn outbox_horizon() -> chrono::Duration {
    chrono::Duration::hours(1)
}

const COMPRESS_AFTER_DAYS: i64 = 7;
const ODDS_DELETE_DAYS: i64 = 30;
const EVENTS_DELETE_DAYS: i64 = 90;
const STATS_DELETE_DAYS: i64 = 60;
const FRAMES_DELETE_DAYS: i64 = 90;

#[derive(Debug, Clone, Default, Serialize)]
pub struct RetentionReport {
    pub compressed_rows: usize,
    pub deleted_rows: usize,
    pub deleted_chunks: usize,
    pub deleted_frames: usize,
    pub trimmed_outbox: usize,
}

struct KindSpec {
    kind: &'static str,
    table: &'static str,
    delete_days: i64,
    /// SQL expression for the chunk segment key, matching the declared
    /// segment-by columns of the compressed table.
    segment_expr: &'static str,
    /// Row-as-JSON expression, ordered into the chunk by ts desc.
    row_json_expr: &'static str,
}

const KINDS: [KindSpec; 3] = [
    KindSpec {
        kind: "odds",
        table: "live_odds_tick",
        delete_days: ODDS_DELETE_DAYS,
        segment_expr: "bookmaker_id || ':' || bet_market_id",
        row_json_expr: "json_object('bet_value', bet_value, 'odd_value', odd_value, \
                        'ts', ts, 'match_minute', match_minute)",
    },
    KindSpec {
        kind: "events",
        table: "live_event_tick",
        delete_days: EVENTS_DELETE_DAYS,
        segment_expr: "''",
        row_json_expr: "json_object('event_type', event_type, 'event_detail', event_detail, \
                        'ts', ts, 'match_minute', match_minute, 'team_id', team_id, \
                        'player_id', player_id, 'assist_player_id', assist_player_id)",
    },
    KindSpec {
        kind: "stats",
        table: "live_stat_tick",
        delete_days: STATS_DELETE_DAYS,
        segment_expr: "CAST(team_id AS TEXT)",
        row_json_expr: "json_object('team_id', team_id, 'ts', ts, \
                        'ball_possession', ball_possession, 'total_shots', total_shots, \
                        'shots_on_goal', shots_on_goal, 'corner_kicks', corner_kicks, \
                        'fouls', fouls, 'yellow_cards', yellow_cards, 'red_cards', red_cards, \
                        'total_passes', total_passes, 'passes_accurate', passes_accurate, \
                        'passes_percentage', passes_percentage)",
    },
];

impl TickStore {
    /// One full maintenance pass: compress, delete, trim, optimize.
    pub fn run_retention(&self, now: DateTime<Utc>) -> Result<RetentionReport> {
        let mut report = RetentionReport::default();
        let compress_cutoff = to_ms(now - chrono::Duration::days(COMPRESS_AFTER_DAYS));

        for spec in &KINDS {
            let delete_cutoff = to_ms(now - chrono::Duration::days(spec.delete_days));
            let delete_day = day_of(delete_cutoff);

            let folded = self.with_txn(|conn| {
                // Fold everything older than the compress horizon into
                // per-(fixture, segment, day) chunks, newest instants first.
                // json_group_array keeps the order of the sorted subquery.
                conn.execute(
                    &format!(
                        "INSERT OR REPLACE INTO tick_chunk
                             (kind, fixture_id, segment, day, row_count, payload)
                         SELECT '{kind}', fixture_id, {segment} AS segment,
                                date(ts / 1000, 'unixepoch') AS day,
                                COUNT(*), json_group_array({row_json})
                         FROM (SELECT * FROM {table} WHERE ts < ?1 ORDER BY ts DESC)
                         GROUP BY fixture_id, segment, day",
                        kind = spec.kind,
                        table = spec.table,
                        segment = spec.segment_expr,
                        row_json = spec.row_json_expr,
                    ),
                    params![compress_cutoff],
                )?;
                let removed = conn.execute(
                    &format!("DELETE FROM {} WHERE ts < ?1", spec.table),
                    params![compress_cutoff],
                )?;
                Ok(removed)
            })?;
            report.compressed_rows += folded;

            // Past the delete horizon nothing survives, compressed or raw.
            let conn = self.lock();
            report.deleted_chunks += conn.execute(
                "DELETE FROM tick_chunk WHERE kind = ?1 AND day < ?2",
                params![spec.kind, delete_day],
            )?;
            report.deleted_rows += conn.execute(
                &format!("DELETE FROM {} WHERE ts < ?1", spec.table),
                params![delete_cutoff],
            )?;
        }

        {
            let conn = self.lock();
            report.deleted_frames = conn.execute(
                "DELETE FROM match_live_frame WHERE bucket_start < ?1",
                params![to_ms(now - chrono::Duration::days(FRAMES_DELETE_DAYS))],
            )?;
            report.trimmed_outbox = conn.execute(
                "DELETE FROM bridge_outbox WHERE ts < ?1",
                params![to_ms(now - outbox_horizon())],
            )?;
        }

        self.optimize()?;
        info!(
            compressed = report.compressed_rows,
            deleted = report.deleted_rows,
            chunks = report.deleted_chunks,
            frames = report.deleted_frames,
            outbox = report.trimmed_outbox,
            "retention maintenance complete"
        );
        Ok(report)
    }

    pub fn chunk_count(&self, kind: &str) -> Result<usize> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM tick_chunk WHERE kind = ?1",
            params![kind],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

fn day_of(ts_ms: i64) -> String {
    crate::store::from_ms(ts_ms).format("%Y-%m-%d").to_string()
}
