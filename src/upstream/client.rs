//! Typed client over the provider's HTTP endpoints.
//!
//! Every call is permit-gated through the shared `RateGovernor`, carries a
//! per-request deadline, and retries transient failures with exponential
//! backoff. A 429 is treated as explicit back-pressure: the client sleeps
//! `max(Retry-After, current backoff)` and then re-permits. Non-429 4xx
//! fail immediately; parse failures are never retried.

use chrono::NaiveDate;
use rand::Rng;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{AppConfig, RetryPolicy};
use crate::metrics::Metrics;
use crate::upstream::error::UpstreamError;
use crate::upstream::payload::{
    Envelope, EventRecord, FixtureRecord, LiveOddsRecord, PrematchOddsRecord, StatsRecord,
};
use crate::upstream::rate::RateGovernor;

/// Longest response-body prefix kept when capturing a malformed payload.
const ERROR_BODY_CAPTURE: usize = 512;
const MAX_PAGES: u32 = 50;

#[derive(Clone)]
pub struct ApiFootballClient {
    http: reqwest::Client,
    base_url: String,
    governor: RateGovernor,
    retry: RetryPolicy,
    metrics: Arc<Metrics>,
}

impl ApiFootballClient {
    pub fn new(
        cfg: &AppConfig,
        governor: RateGovernor,
        metrics: Arc<Metrics>,
    ) -> anyhow::Result<Self> {
        use anyhow::Context;

        let mut headers = reqwest::header::HeaderMap::new();
        let mut key_value: reqwest::header::HeaderValue = cfg
            .upstream_key
            .parse()
            .context("invalid UPSTREAM_KEY header value")?;
        // Keep the shared secret out of any Debug output.
        key_value.set_sensitive(true);
        headers.insert("x-apisports-key", key_value);

        let http = reqwest::Client::builder()
            .timeout(cfg.request_timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .default_headers(headers)
            .build()
            .context("failed to build upstream HTTP client")?;

        Ok(Self {
            http,
            base_url: cfg.upstream_base_url.trim_end_matches('/').to_string(),
            governor,
            retry: cfg.retry.clone(),
            metrics,
        })
    }

    // -- capabilities -------------------------------------------------------

    /// Fixtures scheduled on a date, optionally narrowed to one league.
    /// Follows pagination; every page is a separate permit-gated request.
    pub async fn fixtures_by_date(
        &self,
        date: NaiveDate,
        league: Option<i64>,
    ) -> Result<Vec<FixtureRecord>, UpstreamError> {
        let date = date.format("%Y-%m-%d").to_string();
        let mut query: Vec<(String, String)> = vec![("date".to_string(), date)];
        if let Some(league) = league {
            query.push(("league".to_string(), league.to_string()));
        }
        self.get_all_pages::<FixtureRecord>("/fixtures", query).await
    }

    /// Fixtures currently in play, with live score and elapsed minute.
    pub async fn fixtures_live(&self) -> Result<Vec<FixtureRecord>, UpstreamError> {
        let env = self
            .get_envelope::<FixtureRecord>(
                "/fixtures",
                &[("live".to_string(), "all".to_string())],
            )
            .await?;
        Ok(env.response)
    }

    pub async fn live_odds(&self, fixture: i64) -> Result<Vec<LiveOddsRecord>, UpstreamError> {
        let env = self
            .get_envelope::<LiveOddsRecord>(
                "/odds/live",
                &[("fixture".to_string(), fixture.to_string())],
            )
            .await?;
        Ok(env.response)
    }

    pub async fn prematch_odds(
        &self,
        fixture: i64,
    ) -> Result<Vec<PrematchOddsRecord>, UpstreamError> {
        let env = self
            .get_envelope::<PrematchOddsRecord>(
                "/odds",
                &[("fixture".to_string(), fixture.to_string())],
            )
            .await?;
        Ok(env.response)
    }

    pub async fn fixture_events(&self, fixture: i64) -> Result<Vec<EventRecord>, UpstreamError> {
        let env = self
            .get_envelope::<EventRecord>(
                "/fixtures/events",
                &[("fixture".to_string(), fixture.to_string())],
            )
            .await?;
        Ok(env.response)
    }

    pub async fn fixture_statistics(
        &self,
        fixture: i64,
    ) -> Result<Vec<StatsRecord>, UpstreamError> {
        let env = self
            .get_envelope::<StatsRecord>(
                "/fixtures/statistics",
                &[("fixture".to_string(), fixture.to_string())],
            )
            .await?;
        Ok(env.response)
    }

    // -- transport ----------------------------------------------------------

    async fn get_all_pages<T: DeserializeOwned>(
        &self,
        path: &str,
        mut query: Vec<(String, String)>,
    ) -> Result<Vec<T>, UpstreamError> {
        let mut out = Vec::new();
        for page in 1..=MAX_PAGES {
            if page > 1 {
                query.retain(|(k, _)| k != "page");
                query.push(("page".to_string(), page.to_string()));
            }
            let env = self.get_envelope::<T>(path, &query).await?;
            out.extend(env.response);
            let paging = env.paging.unwrap_or_default();
            if paging.total <= paging.current || paging.total == 0 {
                break;
            }
        }
        Ok(out)
    }

    async fn get_envelope<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(String, String)],
    ) -> Result<Envelope<T>, UpstreamError> {
        let url = format!("{}{}", self.base_url, path);
        let mut attempt: u32 = 0;
        let mut last_error = String::new();

        while attempt < self.retry.attempts {
            self.governor.acquire().await.inspect_err(|_| {
                self.metrics
                    .rate_stalled
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            })?;

            let result = self.http.get(&url).query(query).send().await;
            let backoff = self.backoff_for(attempt);

            match result {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let body = resp.text().await.map_err(|e| {
                            UpstreamError::Malformed(format!("body read failed: {e}"))
                        })?;
                        return serde_json::from_str::<Envelope<T>>(&body).map_err(|e| {
                            self.metrics
                                .upstream_malformed
                                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                            let capture: String = body.chars().take(ERROR_BODY_CAPTURE).collect();
                            debug!(path, payload = %capture, "malformed upstream payload");
                            UpstreamError::Malformed(format!("{path}: {e}"))
                        });
                    }

                    if status == StatusCode::TOO_MANY_REQUESTS {
                        let retry_after = resp
                            .headers()
                            .get(reqwest::header::RETRY_AFTER)
                            .and_then(|v| v.to_str().ok())
                            .and_then(|v| v.parse::<u64>().ok())
                            .map(Duration::from_secs)
                            .unwrap_or(backoff);
                        let pause = retry_after.max(backoff);
                        warn!(path, pause_ms = pause.as_millis() as u64, "upstream 429, backing off");
                        tokio::time::sleep(pause).await;
                        attempt += 1;
                        last_error = "429 Too Many Requests".to_string();
                        continue;
                    }

                    if status.is_server_error() {
                        last_error = format!("HTTP {status}");
                        attempt += 1;
                        if attempt < self.retry.attempts {
                            tokio::time::sleep(backoff).await;
                        }
                        continue;
                    }

                    // Any other 4xx is a hard rejection.
                    let body = resp.text().await.unwrap_or_default();
                    self.metrics
                        .upstream_rejected
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    return Err(UpstreamError::Rejected {
                        status: status.as_u16(),
                        body: body.chars().take(ERROR_BODY_CAPTURE).collect(),
                    });
                }
                Err(e) => {
                    last_error = e.to_string();
                    attempt += 1;
                    if attempt < self.retry.attempts {
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        self.metrics
            .upstream_unavailable
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Err(UpstreamError::Unavailable {
            attempts: self.retry.attempts,
            last_error,
        })
    }

    /// Exponential backoff with a small jitter so concurrent pulls spread out.
    fn backoff_for(&self, attempt: u32) -> Duration {
        let base = self.retry.base_delay.as_millis() as u64;
        let exp = base.saturating_mul(1u64 << attempt.min(10));
        let jitter = rand::thread_rng().gen_range(0..250);
        Duration::from_millis(exp + jitter).min(self.retry.max_backoff)
    }
}
