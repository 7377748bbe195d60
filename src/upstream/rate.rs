//! Global upstream rate governor.
//!
//! Every upstream call acquires a permit against three rolling windows:
//! 1 second, 60 seconds and 24 hours. The per-second ceiling is hard (never
//! more than `max_rps` permits in any rolling second); the burst allowance
//! widens only the per-minute window so short spikes inside the second
//! budget are not smoothed away.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::RateLimits;
use crate::upstream::error::UpstreamError;

const SECOND: Duration = Duration::from_secs(1);
const MINUTE: Duration = Duration::from_secs(60);
const DAY: Duration = Duration::from_secs(86_400);

/// Remaining budget per window, surfaced by `/health`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RateBudget {
    pub per_second_remaining: u32,
    pub per_minute_remaining: u32,
    pub per_day_remaining: u32,
}

#[derive(Clone)]
pub struct RateGovernor {
    limits: RateLimits,
    // Permit grant instants, ascending. Bounded by max_rpd entries.
    grants: Arc<Mutex<VecDeque<Instant>>>,
}

impl RateGovernor {
    pub fn new(limits: RateLimits) -> Self {
        let capacity = limits.max_rpd as usize;
        Self {
            limits,
            grants: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(8192)))),
        }
    }

    /// Acquire one permit, waiting until a slot frees in every window.
    /// Fails with `RateStalled` if no permit is available within the
    /// configured permit timeout.
    pub async fn acquire(&self) -> Result<(), UpstreamError> {
        let started = Instant::now();
        let deadline = started + self.limits.permit_timeout;

        loop {
            let now = Instant::now();
            let wait = {
                let mut grants = self.grants.lock();
                while let Some(front) = grants.front() {
                    if now.duration_since(*front) >= DAY {
                        grants.pop_front();
                    } else {
                        break;
                    }
                }
                match self.next_free_slot(&grants, now) {
                    None => {
                        grants.push_back(now);
                        return Ok(());
                    }
                    Some(wait) => wait,
                }
            };

            let wake = now + wait;
            if wake > deadline {
                return Err(UpstreamError::RateStalled {
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            tokio::time::sleep_until(wake).await;
        }
    }

    /// How long until every violated window frees one slot, or `None` if a
    /// permit can be granted right now.
    fn next_free_slot(&self, grants: &VecDeque<Instant>, now: Instant) -> Option<Duration> {
        let mut wait: Option<Duration> = None;

        let windows = [
            (SECOND, self.limits.max_rps),
            (MINUTE, self.limits.max_rpm.saturating_add(self.limits.burst)),
            (DAY, self.limits.max_rpd),
        ];

        for (window, limit) in windows {
            let in_window = count_in_window(grants, now, window);
            if in_window >= limit {
                // The (in_window - limit + 1)-th newest grant inside the
                // window must age out before the next permit.
                let idx = grants.len() - in_window as usize;
                let oldest_relevant = grants[idx];
                let until_free = (oldest_relevant + window).saturating_duration_since(now);
                let until_free = until_free.max(Duration::from_millis(1));
                wait = Some(wait.map_or(until_free, |w: Duration| w.max(until_free)));
            }
        }

        wait
    }

    pub fn budget(&self) -> RateBudget {
        let now = Instant::now();
        let grants = self.grants.lock();
        let rps_used = count_in_window(&grants, now, SECOND);
        let rpm_used = count_in_window(&grants, now, MINUTE);
        let rpd_used = count_in_window(&grants, now, DAY);
        RateBudget {
            per_second_remaining: self.limits.max_rps.saturating_sub(rps_used),
            per_minute_remaining: self.limits.max_rpm.saturating_sub(rpm_used),
            per_day_remaining: self.limits.max_rpd.saturating_sub(rpd_used),
        }
    }
}

fn count_in_window(grants: &VecDeque<Instant>, now: Instant, window: Duration) -> u32 {
    // Grants are ascending; everything after the partition point is inside
    // the window.
    let cutoff = now.checked_sub(window);
    match cutoff {
        None => grants.len() as u32,
        Some(cutoff) => {
            let (a, b) = grants.as_slices();
            let in_a = a.len() - a.partition_point(|&g| g <= cutoff);
            let in_b = b.len() - b.partition_point(|&g| g <= cutoff);
            (in_a + in_b) as u32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(max_rps: u32, max_rpm: u32, max_rpd: u32, timeout: Duration) -> RateLimits {
        RateLimits {
            max_rps,
            max_rpm,
            max_rpd,
            burst: 0,
            permit_timeout: timeout,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn never_more_than_max_rps_in_any_rolling_second() {
        let gov = RateGovernor::new(limits(6, 1000, 10_000, Duration::from_secs(30)));
        let mut grant_times: Vec<Instant> = Vec::new();

        for _ in 0..30 {
            gov.acquire().await.unwrap();
            grant_times.push(Instant::now());
        }

        for (i, t) in grant_times.iter().enumerate() {
            let in_second = grant_times[..=i]
                .iter()
                .filter(|g| t.duration_since(**g) < Duration::from_secs(1))
                .count();
            assert!(in_second <= 6, "rolling second held {in_second} permits");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sixty_pulls_complete_under_ceiling_without_stall() {
        // Mirrors the burst-of-60 scenario: max_rps=6, permit timeout 15s.
        let gov = RateGovernor::new(limits(6, 1000, 10_000, Duration::from_secs(15)));
        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..60 {
            let gov = gov.clone();
            tasks.spawn(async move { gov.acquire().await });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap().expect("no pull should stall");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalls_when_day_budget_exhausted() {
        let gov = RateGovernor::new(limits(100, 1000, 3, Duration::from_millis(200)));
        for _ in 0..3 {
            gov.acquire().await.unwrap();
        }
        let err = gov.acquire().await.unwrap_err();
        assert!(matches!(err, UpstreamError::RateStalled { .. }));
        // The caller is expected to back off, not busy-loop; the budget
        // frees once the rolling day moves on.
        tokio::time::advance(Duration::from_secs(86_401)).await;
        gov.acquire().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn minute_window_frees_after_rollover() {
        let gov = RateGovernor::new(limits(10, 5, 1000, Duration::from_secs(90)));
        for _ in 0..5 {
            gov.acquire().await.unwrap();
        }
        let before = Instant::now();
        gov.acquire().await.unwrap();
        // Sixth permit had to wait for the minute window.
        assert!(Instant::now().duration_since(before) >= Duration::from_secs(59));
    }

    #[tokio::test(start_paused = true)]
    async fn budget_reports_remaining() {
        let gov = RateGovernor::new(limits(6, 100, 7500, Duration::from_secs(15)));
        gov.acquire().await.unwrap();
        gov.acquire().await.unwrap();
        let budget = gov.budget();
        assert_eq!(budget.per_second_remaining, 4);
        assert_eq!(budget.per_minute_remaining, 98);
        assert_eq!(budget.per_day_remaining, 7498);
    }
}
