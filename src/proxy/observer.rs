//! Extension points for telemetry.
//!
//! The proxy calls a [`ProxyObserver`] at each stage of a request. The
//! engine itself never depends on a telemetry backend; wiring one up means
//! implementing this trait.

use axum::http::{Method, StatusCode};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::forward::ForwardError;
use crate::ratelimit::{Admission, RateLimitKey, RequestClass};

/// Hooks invoked around admission and forwarding. All methods default to
/// doing nothing.
pub trait ProxyObserver: Send + Sync {
    /// Called once the rate limit key is known, before the bucket is checked.
    fn before_admission(&self, _key: &RateLimitKey, _class: RequestClass) {}

    /// Called with the bucket's decision.
    fn after_decision(&self, _key: &RateLimitKey, _admission: &Admission) {}

    /// Called right before the downstream request is sent.
    fn before_dispatch(&self, _method: &Method, _target: &str, _forwarded_for: &str) {}

    /// Called when downstream response headers have arrived.
    fn after_response(&self, _status: StatusCode, _elapsed: Duration) {}

    /// Called when the downstream request could not be built or sent.
    fn on_forward_error(&self, _error: &ForwardError) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ProxyObserver for NoopObserver {}

/// Observer that emits structured `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl ProxyObserver for TracingObserver {
    fn before_admission(&self, key: &RateLimitKey, class: RequestClass) {
        debug!(key = %key, class = class.as_str(), "Checking admission");
    }

    fn after_decision(&self, key: &RateLimitKey, admission: &Admission) {
        match admission {
            Admission::Admitted => debug!(key = %key, "Request admitted"),
            Admission::Denied { retry_after } => info!(
                key = %key,
                retry_after_ms = retry_after.as_millis() as u64,
                "Rate limit exceeded"
            ),
        }
    }

    fn before_dispatch(&self, method: &Method, target: &str, forwarded_for: &str) {
        debug!(
            method = %method,
            target = %target,
            forwarded_for = %forwarded_for,
            "Dispatching downstream request"
        );
    }

    fn after_response(&self, status: StatusCode, elapsed: Duration) {
        info!(
            status = status.as_u16(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Downstream responded"
        );
    }

    fn on_forward_error(&self, error: &ForwardError) {
        warn!(error = %error, "Downstream request failed");
    }
}
