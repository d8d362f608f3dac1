use std::time::Duration;

/// Error taxonomy for the trading core.
///
/// Fallback and rejection decisions are made over these variants, so they
/// stay distinct: a `NotFound` is terminal and never retried against a
/// secondary provider, while `UpstreamUnavailable` and `RateLimited` are.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Symbol or instrument unknown to the upstream universe. Terminal.
    #[error("not found: {0}")]
    NotFound(String),

    /// Rate budget exhausted beyond the bounded wait. The caller decides
    /// whether to fall back, retry later, or surface.
    #[error("rate limited on {provider}, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Duration,
    },

    /// Transport failure, 5xx, or malformed payload. Triggers the fallback
    /// provider before surfacing.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Ledger rejection: the open would drive cash below zero.
    #[error("insufficient funds: need ${required:.2}, have ${available:.2}")]
    InsufficientFunds { required: f64, available: f64 },

    /// Ledger rejection: position-size or daily-loss limit.
    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    /// Malformed trade request (e.g. stop-loss on the wrong side of entry).
    #[error("invalid order: {0}")]
    InvalidOrder(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("decode error: {0}")]
    Decode(String),
}

impl CoreError {
    /// Whether a fallback provider should be attempted after this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::UpstreamUnavailable(_)
                | CoreError::RateLimited { .. }
                | CoreError::Http(_)
                | CoreError::Decode(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
