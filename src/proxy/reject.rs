//! Rejection path for denied requests.
//!
//! Denied requests are held for a random time before the 429 goes out, so
//! that hammering the proxy costs the client more than waiting would. The
//! delay is `base + |N(range, stddev)|`; with the defaults (100ms, 500ms,
//! 100ms) that is usually between 100ms and 1100ms.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use std::time::Duration;

use crate::config::TarpitConfig;

/// Body returned with every rate limited response.
pub const RATE_LIMITED_BODY: &str =
    r#"{"error":"rate limit exceeded; please wait 1sec and try again"}"#;

/// Randomized delay applied before answering a denied request.
#[derive(Debug, Clone)]
pub struct Tarpit {
    enabled: bool,
    base: Duration,
    range: Duration,
    stddev: Duration,
}

impl Tarpit {
    /// Create a tarpit from configuration.
    pub fn new(config: &TarpitConfig) -> Self {
        Self {
            enabled: config.enabled,
            base: Duration::from_millis(config.base_ms),
            range: Duration::from_millis(config.range_ms),
            stddev: Duration::from_millis(config.stddev_ms),
        }
    }

    /// A tarpit that answers immediately.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            base: Duration::ZERO,
            range: Duration::ZERO,
            stddev: Duration::ZERO,
        }
    }

    /// Sample a delay from the thread-local RNG.
    pub fn sample_delay(&self) -> Duration {
        self.sample_delay_with(&mut rand::thread_rng())
    }

    /// Sample a delay from `rng`.
    pub fn sample_delay_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        if !self.enabled {
            return Duration::ZERO;
        }

        let mean = self.range.as_secs_f64();
        let jitter = match Normal::new(mean, self.stddev.as_secs_f64()) {
            Ok(normal) => normal.sample(rng).abs(),
            Err(_) => mean,
        };
        self.base + Duration::from_secs_f64(jitter)
    }

    /// Wait out the tarpit delay, then build the 429 response.
    ///
    /// Only the calling task sleeps; dropping the future (client gone)
    /// abandons the wait.
    pub async fn reject(&self, retry_after: Duration) -> Response {
        let delay = self.sample_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        rate_limited_response(retry_after)
    }
}

/// The fixed 429 response, with a `Retry-After` hint in whole seconds.
pub fn rate_limited_response(retry_after: Duration) -> Response {
    let secs = retry_after.as_millis().div_ceil(1000).max(1);
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
        RATE_LIMITED_BODY,
    )
        .into_response();
    if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
        response.headers_mut().insert(header::RETRY_AFTER, value);
    }
    response
}
