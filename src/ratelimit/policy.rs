//! Admission policy: which key and which limits apply to a request.
//!
//! Requests are split into two classes. `GET` is a read and gets a large
//! burst with a fast drain; every other method shares the stricter limits.
//! Buckets are still keyed per method, so `POST` and `PUT` from the same
//! client drain independently under the same parameters.

use axum::http::{HeaderMap, HeaderName, Method};
use std::net::SocketAddr;
use std::time::Duration;

use super::bucket::LeakyBucket;
use super::key::RateLimitKey;
use crate::config::{ClassLimitConfig, RateLimitingConfig};

/// The forwarding chain header.
pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Request class used to pick bucket parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestClass {
    /// `GET` requests
    Read,
    /// Every other method
    Other,
}

impl RequestClass {
    /// Classify a request method.
    pub fn from_method(method: &Method) -> Self {
        if *method == Method::GET {
            RequestClass::Read
        } else {
            RequestClass::Other
        }
    }

    /// Name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestClass::Read => "read",
            RequestClass::Other => "other",
        }
    }
}

/// Parameters a new bucket is built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketParams {
    /// Maximum burst
    pub capacity: u64,
    /// Units drained per period
    pub drain_amount: u64,
    /// Length of one drain period
    pub drain_period: Duration,
}

impl BucketParams {
    /// Build an empty bucket with these parameters.
    pub fn build(&self) -> LeakyBucket {
        LeakyBucket::new(self.capacity, self.drain_amount, self.drain_period)
    }
}

impl From<ClassLimitConfig> for BucketParams {
    fn from(limits: ClassLimitConfig) -> Self {
        Self {
            capacity: limits.burst,
            drain_amount: limits.drain_amount,
            drain_period: limits.drain_period(),
        }
    }
}

/// Stateless mapping from a request to its rate limit key and parameters.
#[derive(Debug, Clone)]
pub struct AdmissionPolicy {
    read: BucketParams,
    other: BucketParams,
    trust_forwarded_for: bool,
}

impl AdmissionPolicy {
    /// Create a policy from rate limiting configuration.
    pub fn new(config: &RateLimitingConfig) -> Self {
        Self {
            read: config.read.into(),
            other: config.other.into(),
            trust_forwarded_for: config.trust_forwarded_for,
        }
    }

    /// Bucket parameters for a request class.
    pub fn params_for(&self, class: RequestClass) -> BucketParams {
        match class {
            RequestClass::Read => self.read,
            RequestClass::Other => self.other,
        }
    }

    /// Compute the key and bucket parameters for a request.
    pub fn key_for(
        &self,
        method: &Method,
        headers: &HeaderMap,
        peer: SocketAddr,
    ) -> (RateLimitKey, BucketParams) {
        let identity = self.client_identity(headers, peer);
        let params = self.params_for(RequestClass::from_method(method));
        (RateLimitKey::new(method.as_str(), identity), params)
    }

    /// Determine the client identity.
    ///
    /// With `trust_forwarded_for`, a non-empty `X-Forwarded-For` chain is the
    /// identity; otherwise the transport peer IP (without port) is.
    pub fn client_identity(&self, headers: &HeaderMap, peer: SocketAddr) -> String {
        if self.trust_forwarded_for {
            if let Some(chain) = forwarded_chain(headers) {
                return chain;
            }
        }
        peer.ip().to_string()
    }
}

/// The full `X-Forwarded-For` chain, all header lines joined in order.
///
/// Returns `None` when the header is absent or empty. Bytes that are not
/// valid UTF-8 are replaced rather than dropping the hop.
pub fn forwarded_chain(headers: &HeaderMap) -> Option<String> {
    forwarded_chain_bytes(headers).map(|raw| String::from_utf8_lossy(&raw).into_owned())
}

/// The raw `X-Forwarded-For` chain, header lines trimmed and joined with `", "`.
pub fn forwarded_chain_bytes(headers: &HeaderMap) -> Option<Vec<u8>> {
    let mut chain = Vec::new();
    for value in headers.get_all(X_FORWARDED_FOR) {
        let part = value.as_bytes().trim_ascii();
        if part.is_empty() {
            continue;
        }
        if !chain.is_empty() {
            chain.extend_from_slice(b", ");
        }
        chain.extend_from_slice(part);
    }

    if chain.is_empty() {
        None
    } else {
        Some(chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn peer() -> SocketAddr {
        "192.168.1.20:54321".parse().unwrap()
    }

    fn trusting_policy() -> AdmissionPolicy {
        let mut config = RateLimitingConfig::default();
        config.trust_forwarded_for = true;
        AdmissionPolicy::new(&config)
    }

    #[test]
    fn test_get_is_read_class() {
        assert_eq!(RequestClass::from_method(&Method::GET), RequestClass::Read);
        assert_eq!(RequestClass::from_method(&Method::POST), RequestClass::Other);
        assert_eq!(RequestClass::from_method(&Method::HEAD), RequestClass::Other);
        assert_eq!(RequestClass::from_method(&Method::DELETE), RequestClass::Other);
    }

    #[test]
    fn test_default_class_params() {
        let policy = AdmissionPolicy::new(&RateLimitingConfig::default());

        let read = policy.params_for(RequestClass::Read);
        assert_eq!(read.capacity, 50);
        assert_eq!(read.drain_amount, 8);
        assert_eq!(read.drain_period, Duration::from_secs(1));

        let other = policy.params_for(RequestClass::Other);
        assert_eq!(other.capacity, 10);
        assert_eq!(other.drain_amount, 1);
    }

    #[test]
    fn test_identity_strips_port() {
        let policy = AdmissionPolicy::new(&RateLimitingConfig::default());
        let headers = HeaderMap::new();

        assert_eq!(policy.client_identity(&headers, peer()), "192.168.1.20");
    }

    #[test]
    fn test_forwarded_for_ignored_unless_trusted() {
        let policy = AdmissionPolicy::new(&RateLimitingConfig::default());
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("203.0.113.7"));

        assert_eq!(policy.client_identity(&headers, peer()), "192.168.1.20");
    }

    #[test]
    fn test_forwarded_for_used_when_trusted() {
        let policy = trusting_policy();
        let mut headers = HeaderMap::new();
        headers.append(X_FORWARDED_FOR, HeaderValue::from_static("203.0.113.7"));
        headers.append(X_FORWARDED_FOR, HeaderValue::from_static(" 10.0.0.1 "));

        assert_eq!(
            policy.client_identity(&headers, peer()),
            "203.0.113.7, 10.0.0.1"
        );
    }

    #[test]
    fn test_non_utf8_forwarded_for_keeps_every_hop() {
        let policy = trusting_policy();
        let mut headers = HeaderMap::new();
        headers.append(X_FORWARDED_FOR, HeaderValue::from_bytes(b"caf\xe9.example").unwrap());
        headers.append(X_FORWARDED_FOR, HeaderValue::from_static("10.0.0.1"));

        assert_eq!(
            forwarded_chain_bytes(&headers).unwrap(),
            b"caf\xe9.example, 10.0.0.1".to_vec()
        );
        assert_eq!(
            policy.client_identity(&headers, peer()),
            "caf\u{FFFD}.example, 10.0.0.1"
        );
    }

    #[test]
    fn test_empty_forwarded_for_falls_back_to_peer() {
        let policy = trusting_policy();
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static(""));

        assert_eq!(policy.client_identity(&headers, peer()), "192.168.1.20");
    }

    #[test]
    fn test_key_uses_method_verbatim() {
        let policy = AdmissionPolicy::new(&RateLimitingConfig::default());
        let headers = HeaderMap::new();

        let (post_key, post_params) = policy.key_for(&Method::POST, &headers, peer());
        let (put_key, put_params) = policy.key_for(&Method::PUT, &headers, peer());

        assert_eq!(post_key, RateLimitKey::new("POST", "192.168.1.20"));
        assert_ne!(post_key, put_key);
        assert_eq!(post_params, put_params);
    }
}
