//! Process configuration.
//!
//! Static config is read once from the environment in `main`. The ingest
//! settings (enabled leagues, per-kind pull intervals) are hot-reloadable:
//! they live behind an `ArcSwap` snapshot that the operator surface replaces
//! atomically, and every live-loop trigger reads the current snapshot.

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::env;
use std::sync::Arc;
use std::time::Duration;

use crate::models::PullKind;

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

/// Upstream rate budget ceilings. The per-second ceiling is a hard limit;
/// the burst allowance widens the per-minute window only.
#[derive(Debug, Clone)]
pub struct RateLimits {
    pub max_rps: u32,
    pub max_rpm: u32,
    pub max_rpd: u32,
    pub burst: u32,
    pub permit_timeout: Duration,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            max_rps: 6,
            max_rpm: 100,
            max_rpd: 7500,
            burst: 2,
            permit_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub upstream_key: String,
    pub upstream_base_url: String,
    pub db_path: String,
    pub bus_dsn: Option<String>,
    pub config_path: Option<String>,
    pub bind_addr: String,
    pub rate: RateLimits,
    pub retry: RetryPolicy,
    pub request_timeout: Duration,
    pub trigger_interval: Duration,
    pub live_concurrency: usize,
    pub consec_fail_limit: u32,
    pub cooldown: Duration,
    pub drain_timeout: Duration,
    pub fatal_after: Duration,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let upstream_key = env::var("UPSTREAM_KEY").unwrap_or_default();

        Ok(Self {
            upstream_key,
            upstream_base_url: env::var("UPSTREAM_BASE_URL")
                .unwrap_or_else(|_| "https://v3.football.api-sports.io".to_string()),
            db_path: env::var("DB_DSN").unwrap_or_else(|_| "./footybrain.db".to_string()),
            bus_dsn: env::var("BUS_DSN").ok().filter(|v| !v.trim().is_empty()),
            config_path: env::var("FOOTY_CONFIG").ok().filter(|v| !v.trim().is_empty()),
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8000".to_string()),
            rate: RateLimits {
                max_rps: env_parse("UPSTREAM_MAX_RPS", 6),
                max_rpm: env_parse("UPSTREAM_MAX_RPM", 100),
                max_rpd: env_parse("UPSTREAM_MAX_RPD", 7500),
                burst: env_parse("UPSTREAM_BURST", 2),
                permit_timeout: Duration::from_secs(env_parse("UPSTREAM_PERMIT_TIMEOUT_SECS", 15)),
            },
            retry: RetryPolicy {
                attempts: env_parse("UPSTREAM_RETRY_ATTEMPTS", 3),
                base_delay: Duration::from_millis(env_parse("UPSTREAM_RETRY_DELAY_MS", 1000)),
                max_backoff: Duration::from_secs(env_parse("UPSTREAM_MAX_BACKOFF_SECS", 30)),
            },
            request_timeout: Duration::from_secs(env_parse("UPSTREAM_REQUEST_TIMEOUT_SECS", 30)),
            trigger_interval: Duration::from_secs(env_parse("LIVE_TRIGGER_SECS", 30)),
            live_concurrency: env_parse("LIVE_WORKER_CONCURRENCY", 5),
            consec_fail_limit: env_parse("LIVE_CONSEC_FAIL_LIMIT", 5),
            cooldown: Duration::from_secs(env_parse("LIVE_COOLDOWN_SECS", 600)),
            drain_timeout: Duration::from_secs(env_parse("DRAIN_TIMEOUT_SECS", 30)),
            fatal_after: Duration::from_secs(env_parse("FATAL_AFTER_SECS", 600)),
        })
    }

    /// Key with everything but the last four characters hidden, for startup logs.
    pub fn masked_key(&self) -> String {
        let key = self.upstream_key.trim();
        if key.len() <= 4 {
            return "****".to_string();
        }
        format!("{}{}", "*".repeat(key.len() - 4), &key[key.len() - 4..])
    }
}

/// Runtime-editable ingestion settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestSettings {
    /// Leagues the live loop ingests. Empty set means all leagues.
    #[serde(default)]
    pub enabled_leagues: BTreeSet<i64>,
    pub odds_interval_secs: u64,
    pub events_interval_secs: u64,
    pub stats_interval_secs: u64,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            enabled_leagues: BTreeSet::new(),
            odds_interval_secs: 10,
            events_interval_secs: 5,
            stats_interval_secs: 15,
        }
    }
}

impl IngestSettings {
    pub fn league_enabled(&self, league_id: i64) -> bool {
        self.enabled_leagues.is_empty() || self.enabled_leagues.contains(&league_id)
    }

    pub fn interval(&self, kind: PullKind) -> Duration {
        let secs = match kind {
            PullKind::Odds => self.odds_interval_secs,
            PullKind::Events => self.events_interval_secs,
            PullKind::Stats => self.stats_interval_secs,
        };
        Duration::from_secs(secs.max(1))
    }
}

/// Shared handle to the current settings snapshot.
#[derive(Clone)]
pub struct SettingsHandle {
    inner: Arc<ArcSwap<IngestSettings>>,
}

impl SettingsHandle {
    pub fn new(settings: IngestSettings) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(settings)),
        }
    }

    pub fn load(&self) -> Arc<IngestSettings> {
        self.inner.load_full()
    }

    pub fn store(&self, settings: IngestSettings) {
        self.inner.store(Arc::new(settings));
    }

    /// Seed from a JSON config file if one is present, else defaults.
    pub fn from_file(path: Option<&str>) -> anyhow::Result<Self> {
        let settings = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)?;
                serde_json::from_str(&raw)?
            }
            None => IngestSettings::default(),
        };
        Ok(Self::new(settings))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_league_set_enables_everything() {
        let settings = IngestSettings::default();
        assert!(settings.league_enabled(39));
        assert!(settings.league_enabled(203));
    }

    #[test]
    fn explicit_league_set_filters() {
        let mut settings = IngestSettings::default();
        settings.enabled_leagues.insert(39);
        assert!(settings.league_enabled(39));
        assert!(!settings.league_enabled(203));
    }

    #[test]
    fn intervals_per_kind() {
        let settings = IngestSettings::default();
        assert_eq!(settings.interval(PullKind::Odds), Duration::from_secs(10));
        assert_eq!(settings.interval(PullKind::Events), Duration::from_secs(5));
        assert_eq!(settings.interval(PullKind::Stats), Duration::from_secs(15));
    }

    #[test]
    fn settings_swap_is_visible_to_clones() {
        let handle = SettingsHandle::new(IngestSettings::default());
        let other = handle.clone();
        let mut updated = IngestSettings::default();
        updated.odds_interval_secs = 3;
        handle.store(updated.clone());
        assert_eq!(*other.load(), updated);
    }

    #[test]
    fn masked_key_hides_all_but_tail() {
        let mut cfg = AppConfig::from_env().unwrap();
        cfg.upstream_key = "65ded8ae3bf506066acc2e2343b6eec9".to_string();
        let masked = cfg.masked_key();
        assert!(masked.ends_with("eec9"));
        assert!(!masked.contains("65ded8"));
    }
}
