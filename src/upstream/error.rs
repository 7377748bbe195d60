use thiserror::Error;

/// Failure surface of the upstream client.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// No rate permit became available before the permit timeout.
    #[error("rate budget stalled after {waited_ms}ms")]
    RateStalled { waited_ms: u64 },

    /// Retries exhausted on transient failures (network, timeout, 5xx).
    #[error("upstream unavailable after {attempts} attempts: {last_error}")]
    Unavailable { attempts: u32, last_error: String },

    /// Non-429 4xx response; not retried.
    #[error("upstream rejected request with status {status}: {body}")]
    Rejected { status: u16, body: String },

    /// Response body did not match the expected shape; not retried.
    #[error("malformed upstream payload: {0}")]
    Malformed(String),
}

impl UpstreamError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            UpstreamError::RateStalled { .. } | UpstreamError::Unavailable { .. }
        )
    }
}
