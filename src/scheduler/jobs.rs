//! Persisted job catalog and run ledger.
//!
//! The catalog is the single source of truth for what runs when. It is
//! seeded on first boot and edited only through the operator surface; the
//! dispatcher re-reads it every tick so edits apply within a second.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::scheduler::cron::CronExpr;
use crate::store::{to_ms, TickStore};

/// Workload classes with dedicated queues and worker pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    Live,
    Fixtures,
    Prematch,
    Frames,
    Finalizer,
    Maintenance,
}

impl QueueName {
    pub const ALL: [QueueName; 6] = [
        QueueName::Live,
        QueueName::Fixtures,
        QueueName::Prematch,
        QueueName::Frames,
        QueueName::Finalizer,
        QueueName::Maintenance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Live => "live",
            QueueName::Fixtures => "fixtures",
            QueueName::Prematch => "prematch",
            QueueName::Frames => "frames",
            QueueName::Finalizer => "finalizer",
            QueueName::Maintenance => "maintenance",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "live" => QueueName::Live,
            "fixtures" => QueueName::Fixtures,
            "prematch" => QueueName::Prematch,
            "frames" => QueueName::Frames,
            "finalizer" => QueueName::Finalizer,
            "maintenance" => QueueName::Maintenance,
            _ => return None,
        })
    }

    /// Message TTL: a queued run older than this is dropped, not executed.
    pub fn message_ttl(&self) -> Duration {
        match self {
            QueueName::Live => Duration::from_secs(25),
            QueueName::Frames => Duration::from_secs(55),
            _ => Duration::from_secs(600),
        }
    }

    pub fn max_depth(&self) -> usize {
        match self {
            QueueName::Live | QueueName::Frames => 8,
            _ => 64,
        }
    }

    /// Dedicated workers consuming this queue.
    pub fn worker_count(&self) -> usize {
        match self {
            QueueName::Fixtures | QueueName::Prematch => 3,
            _ => 2,
        }
    }

    /// Per-worker memory ceiling: a worker refuses to start a run while
    /// process RSS sits above this.
    pub fn worker_memory_cap_bytes(&self) -> u64 {
        match self {
            QueueName::Live | QueueName::Frames => 512 * 1024 * 1024,
            _ => 1024 * 1024 * 1024,
        }
    }
}

/// `Cron(expr)` or `Every(seconds)`.
#[derive(Debug, Clone, PartialEq)]
pub enum Schedule {
    Cron(CronExpr),
    Every(Duration),
}

impl Schedule {
    pub fn parse(kind: &str, spec: &str) -> Result<Self> {
        match kind {
            "cron" => Ok(Schedule::Cron(CronExpr::parse(spec)?)),
            "interval" => {
                let secs: u64 = spec.parse()?;
                if secs == 0 {
                    bail!("interval spec must be positive");
                }
                Ok(Schedule::Every(Duration::from_secs(secs)))
            }
            other => bail!("unknown schedule kind {other:?}"),
        }
    }

    /// Whether a job last fired at `last` is due at `now`.
    pub fn is_due(&self, last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match self {
            Schedule::Every(interval) => match last {
                None => true,
                Some(last) => (now - last).to_std().map_or(true, |gap| gap >= *interval),
            },
            Schedule::Cron(cron) => {
                let anchor = last.unwrap_or(now - chrono::Duration::minutes(1));
                cron.next_after(anchor).is_some_and(|next| next <= now)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub kind: String,
    pub spec: String,
    pub queue: QueueName,
    pub priority: i32,
    pub enabled: bool,
    pub soft_limit_secs: u64,
    pub hard_limit_secs: u64,
    pub retry_limit: u32,
}

impl JobSpec {
    pub fn schedule(&self) -> Result<Schedule> {
        Schedule::parse(&self.kind, &self.spec)
    }
}

/// The required catalog, seeded on first boot.
pub fn default_catalog() -> Vec<JobSpec> {
    let job = |name: &str, kind: &str, spec: &str, queue, priority, soft, hard, retry| JobSpec {
        name: name.to_string(),
        kind: kind.to_string(),
        spec: spec.to_string(),
        queue,
        priority,
        enabled: true,
        soft_limit_secs: soft,
        hard_limit_secs: hard,
        retry_limit: retry,
    };
    vec![
        job("fixture_poll", "cron", "0 */6 * * *", QueueName::Fixtures, 5, 1500, 1800, 2),
        job("live_trigger", "interval", "30", QueueName::Live, 1, 20, 25, 0),
        job("prematch_snapshot", "cron", "0 */2 * * *", QueueName::Prematch, 5, 1500, 1800, 2),
        job("frame_maker", "interval", "60", QueueName::Frames, 2, 50, 55, 0),
        job("finalizer", "interval", "300", QueueName::Finalizer, 5, 240, 280, 1),
        job("weekly_refresh", "cron", "0 2 * * 0", QueueName::Maintenance, 8, 1500, 1800, 2),
        job("retention_maintenance", "cron", "0 3 * * *", QueueName::Maintenance, 9, 1500, 1800, 1),
    ]
}

/// Job-run lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Pending => "PENDING",
            RunState::Running => "RUNNING",
            RunState::Succeeded => "SUCCEEDED",
            RunState::Failed => "FAILED",
            RunState::TimedOut => "TIMED_OUT",
            RunState::Cancelled => "CANCELLED",
        }
    }
}

impl TickStore {
    pub fn seed_jobs_if_missing(&self) -> Result<()> {
        let now = to_ms(Utc::now());
        self.with_txn(|conn| {
            for job in default_catalog() {
                conn.execute(
                    "INSERT OR IGNORE INTO job
                         (name, kind, spec, queue, priority, enabled,
                          soft_limit_secs, hard_limit_secs, retry_limit, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        job.name,
                        job.kind,
                        job.spec,
                        job.queue.as_str(),
                        job.priority,
                        job.enabled,
                        job.soft_limit_secs,
                        job.hard_limit_secs,
                        job.retry_limit,
                        now,
                    ],
                )?;
            }
            Ok(())
        })
    }

    pub fn list_jobs(&self) -> Result<Vec<JobSpec>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT name, kind, spec, queue, priority, enabled,
                    soft_limit_secs, hard_limit_secs, retry_limit
             FROM job ORDER BY priority ASC, name ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let queue_raw: String = row.get(3)?;
                Ok(JobSpec {
                    name: row.get(0)?,
                    kind: row.get(1)?,
                    spec: row.get(2)?,
                    queue: QueueName::parse(&queue_raw).unwrap_or(QueueName::Maintenance),
                    priority: row.get(4)?,
                    enabled: row.get(5)?,
                    soft_limit_secs: row.get(6)?,
                    hard_limit_secs: row.get(7)?,
                    retry_limit: row.get(8)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Operator edit: enabled flag and/or schedule. The new schedule is
    /// validated before it lands.
    pub fn update_job(
        &self,
        name: &str,
        enabled: Option<bool>,
        kind_and_spec: Option<(&str, &str)>,
    ) -> Result<bool> {
        if let Some((kind, spec)) = kind_and_spec {
            Schedule::parse(kind, spec)?;
        }
        let conn = self.lock();
        let mut changed = 0;
        if let Some(enabled) = enabled {
            changed += conn.execute(
                "UPDATE job SET enabled = ?1, updated_at = ?2 WHERE name = ?3",
                params![enabled, to_ms(Utc::now()), name],
            )?;
        }
        if let Some((kind, spec)) = kind_and_spec {
            changed += conn.execute(
                "UPDATE job SET kind = ?1, spec = ?2, updated_at = ?3 WHERE name = ?4",
                params![kind, spec, to_ms(Utc::now()), name],
            )?;
        }
        Ok(changed > 0)
    }

    pub fn record_job_run(
        &self,
        run_id: &str,
        job_name: &str,
        state: RunState,
        attempt: u32,
        error: Option<&str>,
    ) -> Result<()> {
        let now = to_ms(Utc::now());
        let conn = self.lock();
        conn.execute(
            "INSERT INTO job_run (run_id, job_name, state, attempt, queued_at, started_at, finished_at, error)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL, NULL, NULL)
             ON CONFLICT(run_id) DO UPDATE SET
                 state = excluded.state,
                 attempt = excluded.attempt,
                 started_at = CASE WHEN excluded.state = 'RUNNING'
                                   THEN ?5 ELSE job_run.started_at END,
                 finished_at = CASE WHEN excluded.state IN
                                    ('SUCCEEDED', 'FAILED', 'TIMED_OUT', 'CANCELLED')
                                    THEN ?5 ELSE job_run.finished_at END,
                 error = ?6",
            params![run_id, job_name, state.as_str(), attempt, now, error],
        )?;
        Ok(())
    }

    pub fn job_run_state(&self, run_id: &str) -> Result<Option<String>> {
        use rusqlite::OptionalExtension;
        let conn = self.lock();
        let state = conn
            .query_row(
                "SELECT state FROM job_run WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::memory_store;
    use chrono::TimeZone;

    #[test]
    fn catalog_seeds_once() {
        let store = memory_store();
        store.seed_jobs_if_missing().unwrap();
        store.seed_jobs_if_missing().unwrap();
        let jobs = store.list_jobs().unwrap();
        assert_eq!(jobs.len(), 7);
        assert!(jobs.iter().any(|j| j.name == "live_trigger"));
        assert!(jobs.iter().all(|j| j.enabled));
        // Every seeded schedule parses.
        for job in &jobs {
            job.schedule().unwrap();
        }
    }

    #[test]
    fn interval_due_logic() {
        let every_30 = Schedule::parse("interval", "30").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 9, 14, 12, 0, 0).unwrap();
        assert!(every_30.is_due(None, now));
        assert!(!every_30.is_due(Some(now - chrono::Duration::seconds(10)), now));
        assert!(every_30.is_due(Some(now - chrono::Duration::seconds(30)), now));
    }

    #[test]
    fn cron_due_logic() {
        let daily_3 = Schedule::parse("cron", "0 3 * * *").unwrap();
        let three_am = Utc.with_ymd_and_hms(2024, 9, 14, 3, 0, 30).unwrap();
        assert!(daily_3.is_due(Some(three_am - chrono::Duration::hours(24)), three_am));
        assert!(!daily_3.is_due(Some(three_am), three_am + chrono::Duration::hours(1)));
    }

    #[test]
    fn job_update_validates_schedule() {
        let store = memory_store();
        store.seed_jobs_if_missing().unwrap();
        assert!(store
            .update_job("live_trigger", None, Some(("interval", "not-a-number")))
            .is_err());
        assert!(store
            .update_job("live_trigger", Some(false), Some(("interval", "10")))
            .unwrap());
        let job = store
            .list_jobs()
            .unwrap()
            .into_iter()
            .find(|j| j.name == "live_trigger")
            .unwrap();
        assert!(!job.enabled);
        assert_eq!(job.spec, "10");
    }

    #[test]
    fn run_states_progress() {
        let store = memory_store();
        store.record_job_run("r1", "live_trigger", RunState::Pending, 1, None).unwrap();
        store.record_job_run("r1", "live_trigger", RunState::Running, 1, None).unwrap();
        store
            .record_job_run("r1", "live_trigger", RunState::TimedOut, 1, Some("hard limit"))
            .unwrap();
        assert_eq!(store.job_run_state("r1").unwrap().unwrap(), "TIMED_OUT");
    }
}
